//! the capability set behind the exported entry points
//!
//! [`RealOps`] forwards to libc, [`FaultingOps`] wraps any backend with the
//! fault policy. The exported symbols always go through [`INTERPOSER`].

use libc::{c_char, c_int, c_void, mode_t, size_t, sockaddr, socklen_t, ssize_t};
use nix::errno::Errno;
use std::ffi::CStr;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use tracing::{debug, info};

use crate::config::{ConfigSource, EnvSource, FaultConfig};
use crate::net;
use crate::policy::{contained, decide, taint_for, Action, CallContext};
use crate::resolver::{
    REAL_CLOSE, REAL_DUP2, REAL_DUP3, REAL_OPEN, REAL_OPEN64, REAL_OPEN64_2, REAL_OPENAT,
    REAL_OPENAT64, REAL_OPENAT64_2, REAL_OPENAT_2, REAL_OPEN_2, REAL_READ, REAL_SEND,
    REAL_SENDTO, REAL_WRITE,
};
use crate::state::{InterceptStats, StatsSnapshot, Taint, TaintedFds, DEBUG_ENABLED};
use crate::types::{Hook, OperationKind};

/// a component providing the intercepted file and socket operations
///
/// # Safety
/// every method has the contract of the libc function it stands for
pub trait IoOps {
    /// `hook` picks the open-family variant; the fortified ones ignore `mode`
    unsafe fn open(&self, hook: Hook, path: *const c_char, flags: c_int, mode: mode_t) -> c_int;

    unsafe fn openat(
        &self,
        hook: Hook,
        dirfd: c_int,
        path: *const c_char,
        flags: c_int,
        mode: mode_t,
    ) -> c_int;

    unsafe fn send(&self, fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t;

    unsafe fn sendto(
        &self,
        fd: c_int,
        buf: *const c_void,
        len: size_t,
        flags: c_int,
        addr: *const sockaddr,
        addrlen: socklen_t,
    ) -> ssize_t;

    unsafe fn read(&self, fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t;

    unsafe fn write(&self, fd: c_int, buf: *const c_void, count: size_t) -> ssize_t;

    unsafe fn close(&self, fd: c_int) -> c_int;

    unsafe fn dup2(&self, oldfd: c_int, newfd: c_int) -> c_int;

    unsafe fn dup3(&self, oldfd: c_int, newfd: c_int, flags: c_int) -> c_int;
}

/// the unmodified operations, via the resolved libc handles
#[derive(Debug, Clone, Copy, Default)]
pub struct RealOps;

impl IoOps for RealOps {
    unsafe fn open(&self, hook: Hook, path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
        match hook {
            Hook::Open2 => (REAL_OPEN_2.get())(path, flags),
            Hook::Open64_2 => (REAL_OPEN64_2.get())(path, flags),
            Hook::Open64 => (REAL_OPEN64.get())(path, flags, mode),
            _ => (REAL_OPEN.get())(path, flags, mode),
        }
    }

    unsafe fn openat(
        &self,
        hook: Hook,
        dirfd: c_int,
        path: *const c_char,
        flags: c_int,
        mode: mode_t,
    ) -> c_int {
        match hook {
            Hook::OpenAt2 => (REAL_OPENAT_2.get())(dirfd, path, flags),
            Hook::OpenAt64_2 => (REAL_OPENAT64_2.get())(dirfd, path, flags),
            Hook::OpenAt64 => (REAL_OPENAT64.get())(dirfd, path, flags, mode),
            _ => (REAL_OPENAT.get())(dirfd, path, flags, mode),
        }
    }

    unsafe fn send(&self, fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
        (REAL_SEND.get())(fd, buf, len, flags)
    }

    unsafe fn sendto(
        &self,
        fd: c_int,
        buf: *const c_void,
        len: size_t,
        flags: c_int,
        addr: *const sockaddr,
        addrlen: socklen_t,
    ) -> ssize_t {
        (REAL_SENDTO.get())(fd, buf, len, flags, addr, addrlen)
    }

    unsafe fn read(&self, fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
        (REAL_READ.get())(fd, buf, count)
    }

    unsafe fn write(&self, fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
        (REAL_WRITE.get())(fd, buf, count)
    }

    unsafe fn close(&self, fd: c_int) -> c_int {
        (REAL_CLOSE.get())(fd)
    }

    unsafe fn dup2(&self, oldfd: c_int, newfd: c_int) -> c_int {
        (REAL_DUP2.get())(oldfd, newfd)
    }

    unsafe fn dup3(&self, oldfd: c_int, newfd: c_int, flags: c_int) -> c_int {
        (REAL_DUP3.get())(oldfd, newfd, flags)
    }
}

/// the process-wide policy-wrapped operations used by the exported symbols
pub static INTERPOSER: FaultingOps<RealOps, EnvSource> = FaultingOps::new(RealOps, EnvSource);

/// statistics of the exported entry points
pub fn stats_snapshot() -> StatsSnapshot {
    INTERPOSER.stats().snapshot()
}

/// operations that consult the fault policy before reaching `backend`
pub struct FaultingOps<B, C> {
    backend: B,
    source: C,
    stats: InterceptStats,
    fds: TaintedFds,
}

impl<B: IoOps, C: ConfigSource> FaultingOps<B, C> {
    pub const fn new(backend: B, source: C) -> Self {
        Self {
            backend,
            source,
            stats: InterceptStats::new(),
            fds: TaintedFds::new(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn source(&self) -> &C {
        &self.source
    }

    pub fn stats(&self) -> &InterceptStats {
        &self.stats
    }

    /// descriptors currently marked for read/write faults
    pub fn fds(&self) -> &TaintedFds {
        &self.fds
    }

    fn snapshot(&self, hook: Hook, call_num: u64) -> FaultConfig {
        let config = self.source.snapshot();
        // first few calls are always logged to show the injector is live
        if DEBUG_ENABLED.load(Ordering::Relaxed) || call_num < 5 {
            debug!(
                pid = std::process::id(),
                hook = %hook,
                call_num,
                open_error = ?config.open_error,
                send_delay = ?config.send_delay,
                descriptors_armed = config.descriptors.is_armed(),
                "fault state"
            );
        }
        config
    }

    fn open_action(&self, hook: Hook, path: *const c_char, call_num: u64) -> (Action, Taint) {
        contained(OperationKind::Open, (Action::PassThrough, Taint::default()), || {
            let config = self.snapshot(hook, call_num);
            // a null path is the real function's EFAULT to report
            if path.is_null() {
                return (Action::PassThrough, Taint::default());
            }

            let path = unsafe { CStr::from_ptr(path) };
            let taint = taint_for(path, &config);
            let action = if config.open_error.is_some() {
                decide(&CallContext::Open { path }, &config)
            } else {
                Action::PassThrough
            };
            if let Action::FailWith(errno) = action {
                info!(
                    pid = std::process::id(),
                    hook = %hook,
                    path = %path.to_string_lossy(),
                    errno = errno.get(),
                    "[FAULT] INJECTED: {} error {}",
                    hook,
                    errno
                );
            }
            (action, taint)
        })
    }

    fn send_action(
        &self,
        hook: Hook,
        fd: c_int,
        dest: Option<SocketAddr>,
        call_num: u64,
    ) -> Action {
        contained(OperationKind::Send, Action::PassThrough, || {
            let config = self.snapshot(hook, call_num);
            if config.send_delay.is_none() {
                return Action::PassThrough;
            }

            // connection-mode sockets ignore the destination argument
            let peer = match dest {
                Some(dest) if !net::is_connection_mode(fd) => Some(dest),
                _ => net::peer_address(fd),
            };
            let action = decide(&CallContext::Send { peer }, &config);
            if let Action::DelayThenPassThrough(delay) = action {
                info!(
                    pid = std::process::id(),
                    hook = %hook,
                    peer = ?peer,
                    delay_ms = delay.as_millis() as u64,
                    "[FAULT] DELAYING: {} by {:?}",
                    hook,
                    delay
                );
            }
            action
        })
    }

    fn descriptor_action(&self, hook: Hook, fd: c_int, call_num: u64) -> Action {
        // untouched descriptors never pay for a configuration read
        let taint = self.fds.taint_of(fd);
        if taint.is_clean() {
            return Action::PassThrough;
        }

        let kind = hook.kind();
        contained(kind, Action::PassThrough, || {
            let config = self.snapshot(hook, call_num);
            let ctx = match kind {
                OperationKind::Write => CallContext::Write { taint },
                _ => CallContext::Read { taint },
            };
            let action = decide(&ctx, &config);
            if action != Action::PassThrough {
                info!(
                    pid = std::process::id(),
                    hook = %hook,
                    fd,
                    action = ?action,
                    "[FAULT] DESCRIPTOR: {} on fd {}",
                    hook,
                    fd
                );
            }
            action
        })
    }

    fn track_open(&self, hook: Hook, fd: c_int, taint: Taint) {
        if fd < 0 {
            return;
        }
        // also clears marks left behind by closes that bypassed the hook
        if self.fds.set(fd, taint) && !taint.is_clean() {
            debug!(hook = %hook, fd, taint = ?taint, "descriptor marked");
        }
    }

    fn track_dup(&self, hook: Hook, oldfd: c_int, newfd: c_int) {
        if newfd < 0 {
            return;
        }
        let taint = self.fds.inherit(oldfd, newfd);
        if !taint.is_clean() {
            debug!(hook = %hook, oldfd, newfd, taint = ?taint, "descriptor mark copied");
        }
    }

    // carries out a decided action; `forward` is the pass-through call
    fn execute<R>(
        &self,
        kind: OperationKind,
        action: Action,
        failure: R,
        forward: impl FnOnce() -> R,
    ) -> R {
        let stats = self.stats.for_kind(kind);
        match action {
            Action::PassThrough => forward(),
            Action::FailWith(errno) => {
                stats.record_fault();
                Errno::set_raw(errno.get());
                failure
            }
            Action::DelayThenPassThrough(delay) => {
                stats.record_delay();
                std::thread::sleep(delay);
                forward()
            }
            Action::DelayThenFail(delay, errno) => {
                stats.record_delay();
                std::thread::sleep(delay);
                stats.record_fault();
                Errno::set_raw(errno.get());
                failure
            }
        }
    }
}

impl<B: IoOps, C: ConfigSource> IoOps for FaultingOps<B, C> {
    unsafe fn open(&self, hook: Hook, path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
        let call_num = self.stats.open.record_call();
        let (action, taint) = self.open_action(hook, path, call_num);
        let fd = self.execute(OperationKind::Open, action, -1, || {
            self.backend.open(hook, path, flags, mode)
        });
        self.track_open(hook, fd, taint);
        fd
    }

    unsafe fn openat(
        &self,
        hook: Hook,
        dirfd: c_int,
        path: *const c_char,
        flags: c_int,
        mode: mode_t,
    ) -> c_int {
        let call_num = self.stats.open.record_call();
        let (action, taint) = self.open_action(hook, path, call_num);
        let fd = self.execute(OperationKind::Open, action, -1, || {
            self.backend.openat(hook, dirfd, path, flags, mode)
        });
        self.track_open(hook, fd, taint);
        fd
    }

    unsafe fn send(&self, fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
        let call_num = self.stats.send.record_call();
        let action = self.send_action(Hook::Send, fd, None, call_num);
        self.execute(OperationKind::Send, action, -1, || {
            self.backend.send(fd, buf, len, flags)
        })
    }

    unsafe fn sendto(
        &self,
        fd: c_int,
        buf: *const c_void,
        len: size_t,
        flags: c_int,
        addr: *const sockaddr,
        addrlen: socklen_t,
    ) -> ssize_t {
        let call_num = self.stats.send.record_call();
        let dest = net::sockaddr_to_std(addr, addrlen);
        let action = self.send_action(Hook::SendTo, fd, dest, call_num);
        self.execute(OperationKind::Send, action, -1, || {
            self.backend.sendto(fd, buf, len, flags, addr, addrlen)
        })
    }

    unsafe fn read(&self, fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
        let call_num = self.stats.read.record_call();
        let action = self.descriptor_action(Hook::Read, fd, call_num);
        self.execute(OperationKind::Read, action, -1, || {
            self.backend.read(fd, buf, count)
        })
    }

    unsafe fn write(&self, fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
        let call_num = self.stats.write.record_call();
        let action = self.descriptor_action(Hook::Write, fd, call_num);
        self.execute(OperationKind::Write, action, -1, || {
            self.backend.write(fd, buf, count)
        })
    }

    unsafe fn close(&self, fd: c_int) -> c_int {
        self.stats.close.record_call();
        // forgotten first so a racing open of the same number keeps its mark
        if self.fds.forget(fd) {
            debug!(fd, "descriptor unmarked");
        }
        self.backend.close(fd)
    }

    unsafe fn dup2(&self, oldfd: c_int, newfd: c_int) -> c_int {
        self.stats.dup.record_call();
        let rc = self.backend.dup2(oldfd, newfd);
        self.track_dup(Hook::Dup2, oldfd, rc);
        rc
    }

    unsafe fn dup3(&self, oldfd: c_int, newfd: c_int, flags: c_int) -> c_int {
        self.stats.dup.record_call();
        let rc = self.backend.dup3(oldfd, newfd, flags);
        self.track_dup(Hook::Dup3, oldfd, rc);
        rc
    }
}
