//! binding of the real libc implementations behind the interposed symbols

use libc::{c_char, c_int, c_void, mode_t, size_t, sockaddr, socklen_t, ssize_t};
use once_cell::sync::OnceCell;
use std::ffi::CStr;
use std::marker::PhantomData;
use std::mem;
use tracing::{debug, error, warn};

use crate::errors::ResolveError;
use crate::types::Hook;

const SYSTEM_C_LIBRARY: &CStr = c"libc.so.6";

pub type OpenFn = unsafe extern "C" fn(*const c_char, c_int, mode_t) -> c_int;
pub type Open2Fn = unsafe extern "C" fn(*const c_char, c_int) -> c_int;
pub type OpenAtFn = unsafe extern "C" fn(c_int, *const c_char, c_int, mode_t) -> c_int;
pub type OpenAt2Fn = unsafe extern "C" fn(c_int, *const c_char, c_int) -> c_int;
pub type SendFn = unsafe extern "C" fn(c_int, *const c_void, size_t, c_int) -> ssize_t;
pub type SendToFn =
    unsafe extern "C" fn(c_int, *const c_void, size_t, c_int, *const sockaddr, socklen_t) -> ssize_t;
pub type ReadFn = unsafe extern "C" fn(c_int, *mut c_void, size_t) -> ssize_t;
pub type WriteFn = unsafe extern "C" fn(c_int, *const c_void, size_t) -> ssize_t;
pub type CloseFn = unsafe extern "C" fn(c_int) -> c_int;
pub type Dup2Fn = unsafe extern "C" fn(c_int, c_int) -> c_int;
pub type Dup3Fn = unsafe extern "C" fn(c_int, c_int, c_int) -> c_int;

pub static REAL_OPEN: RealFn<OpenFn> = RealFn::new(c"open");
pub static REAL_OPEN64: RealFn<OpenFn> = RealFn::new(c"open64");
pub static REAL_OPEN_2: RealFn<Open2Fn> = RealFn::new(c"__open_2");
pub static REAL_OPEN64_2: RealFn<Open2Fn> = RealFn::new(c"__open64_2");
pub static REAL_OPENAT: RealFn<OpenAtFn> = RealFn::new(c"openat");
pub static REAL_OPENAT64: RealFn<OpenAtFn> = RealFn::new(c"openat64");
pub static REAL_OPENAT_2: RealFn<OpenAt2Fn> = RealFn::new(c"__openat_2");
pub static REAL_OPENAT64_2: RealFn<OpenAt2Fn> = RealFn::new(c"__openat64_2");
pub static REAL_SEND: RealFn<SendFn> = RealFn::new(c"send");
pub static REAL_SENDTO: RealFn<SendToFn> = RealFn::new(c"sendto");
pub static REAL_READ: RealFn<ReadFn> = RealFn::new(c"read");
pub static REAL_WRITE: RealFn<WriteFn> = RealFn::new(c"write");
pub static REAL_CLOSE: RealFn<CloseFn> = RealFn::new(c"close");
pub static REAL_DUP2: RealFn<Dup2Fn> = RealFn::new(c"dup2");
pub static REAL_DUP3: RealFn<Dup3Fn> = RealFn::new(c"dup3");

/// process-lifetime binding of one symbol to its next definition
///
/// written at most once under a one-time guard, read lock-free afterwards
pub struct RealFn<F> {
    symbol: &'static CStr,
    cell: OnceCell<usize>,
    _phantom: PhantomData<F>,
}

impl<F: Copy> RealFn<F> {
    pub const fn new(symbol: &'static CStr) -> Self {
        Self {
            symbol,
            cell: OnceCell::new(),
            _phantom: PhantomData,
        }
    }

    pub fn symbol(&self) -> &'static str {
        self.symbol.to_str().unwrap_or("<non-utf8>")
    }

    pub fn is_resolved(&self) -> bool {
        self.cell.get().is_some()
    }

    /// eager resolution during library setup (recommended)
    pub fn init(&self) -> Result<F, ResolveError> {
        let addr = *self
            .cell
            .get_or_try_init(|| resolve_next(self.symbol).map(|ptr| ptr as usize))?;

        debug_assert_eq!(mem::size_of::<F>(), mem::size_of::<usize>());
        // safety: F is the function pointer type of this symbol
        Ok(unsafe { mem::transmute_copy::<usize, F>(&addr) })
    }

    /// the real function, resolving on first use; aborts when unresolvable
    pub fn get(&self) -> F {
        match self.init() {
            Ok(f) => f,
            Err(e) => fatal(e),
        }
    }
}

// safety: only the resolved address is shared, and it never changes once set
unsafe impl<F> Send for RealFn<F> {}
unsafe impl<F> Sync for RealFn<F> {}

fn fatal(err: ResolveError) -> ! {
    error!(pid = std::process::id(), error = %err, "cannot forward intercepted call, aborting");
    eprintln!("libfaultinj: {}", err);
    std::process::abort()
}

/// finds the next definition of `symbol` after this library
///
/// `RTLD_NEXT` first; if that only finds the injector's own definition,
/// fall back to asking the already loaded C library directly
pub fn resolve_next(symbol: &CStr) -> Result<*mut c_void, ResolveError> {
    let name = symbol.to_string_lossy();

    let ptr = unsafe { libc::dlsym(libc::RTLD_NEXT, symbol.as_ptr()) };
    debug!(
        pid = std::process::id(),
        address = ?ptr,
        "looked up {} with RTLD_NEXT", name
    );
    if !ptr.is_null() && !is_own_symbol(ptr) {
        return Ok(ptr);
    }
    if !ptr.is_null() {
        debug!(
            pid = std::process::id(),
            "RTLD_NEXT returned our own {}, trying the C library", name
        );
    }

    let handle = unsafe {
        libc::dlopen(
            SYSTEM_C_LIBRARY.as_ptr(),
            libc::RTLD_LAZY | libc::RTLD_NOLOAD,
        )
    };
    if handle.is_null() {
        return Err(ResolveError::NotFound {
            symbol: name.into_owned(),
            reason: dl_error(),
        });
    }

    // RTLD_NOLOAD only hands back a reference, no dlclose needed
    let ptr = unsafe { libc::dlsym(handle, symbol.as_ptr()) };
    if ptr.is_null() {
        Err(ResolveError::NotFound {
            symbol: name.into_owned(),
            reason: dl_error(),
        })
    } else if is_own_symbol(ptr) {
        Err(ResolveError::SelfReference {
            symbol: name.into_owned(),
        })
    } else {
        debug!(pid = std::process::id(), address = ?ptr, "found {} in C library", name);
        Ok(ptr)
    }
}

// true when `ptr` lives in the same loaded object as this function
fn is_own_symbol(ptr: *mut c_void) -> bool {
    let marker = is_own_symbol as *const () as *const c_void;
    unsafe {
        let mut theirs: libc::Dl_info = mem::zeroed();
        let mut ours: libc::Dl_info = mem::zeroed();
        if libc::dladdr(ptr, &mut theirs) == 0 || libc::dladdr(marker, &mut ours) == 0 {
            return false;
        }
        theirs.dli_fbase == ours.dli_fbase
    }
}

fn dl_error() -> String {
    let msg = unsafe { libc::dlerror() };
    if msg.is_null() {
        "symbol not found".to_string()
    } else {
        unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
    }
}

/// resolves every real function up front, before the host can fork
///
/// a missing symbol is only reported here; it becomes fatal when a call
/// actually needs it
pub fn init_real_functions() -> Vec<(Hook, Result<(), ResolveError>)> {
    fn report<F: Copy>(real: &RealFn<F>) -> Result<(), ResolveError> {
        let result = real.init().map(|_| ());
        match &result {
            Ok(()) => debug!(
                pid = std::process::id(),
                "real {} function pointer stored during init",
                real.symbol()
            ),
            Err(e) => warn!(pid = std::process::id(), error = %e, "real {} unavailable", real.symbol()),
        }
        result
    }

    Hook::ALL
        .into_iter()
        .map(|hook| {
            let result = match hook {
                Hook::Open => report(&REAL_OPEN),
                Hook::Open64 => report(&REAL_OPEN64),
                Hook::Open2 => report(&REAL_OPEN_2),
                Hook::Open64_2 => report(&REAL_OPEN64_2),
                Hook::OpenAt => report(&REAL_OPENAT),
                Hook::OpenAt64 => report(&REAL_OPENAT64),
                Hook::OpenAt2 => report(&REAL_OPENAT_2),
                Hook::OpenAt64_2 => report(&REAL_OPENAT64_2),
                Hook::Send => report(&REAL_SEND),
                Hook::SendTo => report(&REAL_SENDTO),
                Hook::Read => report(&REAL_READ),
                Hook::Write => report(&REAL_WRITE),
                Hook::Close => report(&REAL_CLOSE),
                Hook::Dup2 => report(&REAL_DUP2),
                Hook::Dup3 => report(&REAL_DUP3),
            };
            (hook, result)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    #[test]
    fn resolves_libc_open_and_send() {
        assert!(!resolve_next(c"open").unwrap().is_null());
        assert!(!resolve_next(c"send").unwrap().is_null());
    }

    #[test]
    fn unknown_symbol_is_an_error() {
        let err = resolve_next(c"libfaultinj_definitely_not_a_symbol").unwrap_err();
        assert!(matches!(err, ResolveError::NotFound { .. }));
    }

    #[test]
    fn real_fn_resolves_once() {
        static REAL_FSYNC: RealFn<unsafe extern "C" fn(c_int) -> c_int> = RealFn::new(c"fsync");
        assert!(!REAL_FSYNC.is_resolved());
        let first = REAL_FSYNC.get();
        assert!(REAL_FSYNC.is_resolved());
        assert_eq!(first as usize, REAL_FSYNC.get() as usize);
        assert_eq!(REAL_FSYNC.symbol(), "fsync");
    }

    #[test]
    fn concurrent_first_use_agrees() {
        static REAL_GETPID: RealFn<unsafe extern "C" fn() -> libc::pid_t> =
            RealFn::new(c"getpid");
        let addrs: Vec<usize> = (0..8)
            .map(|_| std::thread::spawn(|| REAL_GETPID.get() as usize))
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect();
        assert!(addrs.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn real_open_reaches_the_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("real-open.txt");
        std::fs::write(&path, b"contents").unwrap();
        let c_path = CString::new(path.to_str().unwrap()).unwrap();

        let fd = unsafe { (REAL_OPEN.get())(c_path.as_ptr(), libc::O_RDONLY, 0) };
        assert!(fd >= 0);
        let mut buf = [0u8; 8];
        let n = unsafe { (REAL_READ.get())(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        assert_eq!(n, 8);
        assert_eq!(&buf, b"contents");
        assert_eq!(unsafe { (REAL_CLOSE.get())(fd) }, 0);

        let fd = unsafe {
            (REAL_OPENAT64.get())(libc::AT_FDCWD, c_path.as_ptr(), libc::O_RDONLY, 0)
        };
        assert!(fd >= 0);
        let copy = unsafe { (REAL_DUP2.get())(fd, fd + 100) };
        assert_eq!(copy, fd + 100);
        unsafe {
            (REAL_CLOSE.get())(copy);
            (REAL_CLOSE.get())(fd);
        }
    }

    #[test]
    fn eager_init_reports_every_hook() {
        let report = init_real_functions();
        assert_eq!(report.len(), Hook::ALL.len());
        assert!(report
            .iter()
            .filter(|(hook, _)| {
                matches!(
                    hook,
                    Hook::Open | Hook::Send | Hook::SendTo | Hook::Read | Hook::Write | Hook::Close
                )
            })
            .all(|(_, result)| result.is_ok()));
    }
}
