use libc::c_int;
use std::cell::Cell;
use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use crate::types::OperationKind;

// verbose per-call logging, set from LIBFAULTINJ_DEBUG at load time
pub static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

// reentrancy guard: calls the injector makes itself go straight to libc
thread_local! {
    static IN_INTERCEPT: Cell<bool> = const { Cell::new(false) };
}

/// held for the duration of one intercepted call on this thread
pub struct InterceptGuard {
    // tied to the thread that set the flag
    _not_send: PhantomData<*const ()>,
}

impl InterceptGuard {
    /// `None` when this thread is already intercepting, or when its
    /// thread-local storage has been torn down
    pub fn enter() -> Option<Self> {
        IN_INTERCEPT
            .try_with(|flag| {
                if flag.get() {
                    None
                } else {
                    flag.set(true);
                    Some(Self {
                        _not_send: PhantomData,
                    })
                }
            })
            .ok()
            .flatten()
    }
}

impl Drop for InterceptGuard {
    fn drop(&mut self) {
        let _ = IN_INTERCEPT.try_with(|flag| flag.set(false));
    }
}

pub fn is_in_intercept() -> bool {
    IN_INTERCEPT.try_with(|flag| flag.get()).unwrap_or(true)
}

/// atomic counter with ergonomic API
#[derive(Debug)]
pub struct AtomicCounter {
    value: AtomicU64,
}

impl AtomicCounter {
    pub const fn new(initial: u64) -> Self {
        Self {
            value: AtomicU64::new(initial),
        }
    }

    #[inline]
    pub fn increment(&self) -> u64 {
        self.value.fetch_add(1, Ordering::Relaxed)
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// per-operation counters
#[derive(Debug)]
pub struct FunctionStats {
    pub calls: AtomicCounter,
    pub faults: AtomicCounter,
    pub delays: AtomicCounter,
}

impl FunctionStats {
    pub const fn new() -> Self {
        Self {
            calls: AtomicCounter::new(0),
            faults: AtomicCounter::new(0),
            delays: AtomicCounter::new(0),
        }
    }

    /// returns the call number, starting at 0
    #[inline]
    pub fn record_call(&self) -> u64 {
        self.calls.increment()
    }

    #[inline]
    pub fn record_fault(&self) {
        self.faults.increment();
    }

    #[inline]
    pub fn record_delay(&self) {
        self.delays.increment();
    }

    pub fn snapshot(&self) -> FunctionSnapshot {
        FunctionSnapshot {
            calls: self.calls.get(),
            faults: self.faults.get(),
            delays: self.delays.get(),
        }
    }
}

impl Default for FunctionStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FunctionSnapshot {
    pub calls: u64,
    pub faults: u64,
    pub delays: u64,
}

/// in-memory statistics for one interposer, never persisted
#[derive(Debug, Default)]
pub struct InterceptStats {
    pub open: FunctionStats,
    pub send: FunctionStats,
    pub read: FunctionStats,
    pub write: FunctionStats,
    pub close: FunctionStats,
    pub dup: FunctionStats,
}

impl InterceptStats {
    pub const fn new() -> Self {
        Self {
            open: FunctionStats::new(),
            send: FunctionStats::new(),
            read: FunctionStats::new(),
            write: FunctionStats::new(),
            close: FunctionStats::new(),
            dup: FunctionStats::new(),
        }
    }

    pub fn for_kind(&self, kind: OperationKind) -> &FunctionStats {
        match kind {
            OperationKind::Open => &self.open,
            OperationKind::Send => &self.send,
            OperationKind::Read => &self.read,
            OperationKind::Write => &self.write,
            OperationKind::Close => &self.close,
            OperationKind::Dup => &self.dup,
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            open: self.open.snapshot(),
            send: self.send.snapshot(),
            read: self.read.snapshot(),
            write: self.write.snapshot(),
            close: self.close.snapshot(),
            dup: self.dup.snapshot(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub open: FunctionSnapshot,
    pub send: FunctionSnapshot,
    pub read: FunctionSnapshot,
    pub write: FunctionSnapshot,
    pub close: FunctionSnapshot,
    pub dup: FunctionSnapshot,
}

/// which descriptor faults a file descriptor is subject to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Taint {
    /// opened through the error trigger path
    pub error: bool,
    /// opened through the delay trigger path
    pub delay: bool,
}

impl Taint {
    pub fn is_clean(self) -> bool {
        !self.error && !self.delay
    }
}

/// a lock-guarded set of descriptor numbers
///
/// lookups take the read lock only; a poisoned lock is still usable since
/// every update leaves the set consistent
#[derive(Debug, Default)]
pub struct FdSet(RwLock<BTreeSet<c_int>>);

impl FdSet {
    pub const fn new() -> Self {
        Self(RwLock::new(BTreeSet::new()))
    }

    pub fn contains(&self, fd: c_int) -> bool {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&fd)
    }

    /// adds or removes `fd`; returns whether the set changed
    pub fn set(&self, fd: c_int, present: bool) -> bool {
        if self.contains(fd) == present {
            return false;
        }
        let mut fds = self.0.write().unwrap_or_else(PoisonError::into_inner);
        if present {
            fds.insert(fd)
        } else {
            fds.remove(&fd)
        }
    }

    pub fn len(&self) -> usize {
        self.0.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// descriptors opened through a trigger path, tracked across close and dup
#[derive(Debug, Default)]
pub struct TaintedFds {
    pub error: FdSet,
    pub delay: FdSet,
}

impl TaintedFds {
    pub const fn new() -> Self {
        Self {
            error: FdSet::new(),
            delay: FdSet::new(),
        }
    }

    pub fn taint_of(&self, fd: c_int) -> Taint {
        Taint {
            error: self.error.contains(fd),
            delay: self.delay.contains(fd),
        }
    }

    /// records `taint` for `fd`, replacing whatever a reused number carried
    pub fn set(&self, fd: c_int, taint: Taint) -> bool {
        let error = self.error.set(fd, taint.error);
        let delay = self.delay.set(fd, taint.delay);
        error || delay
    }

    pub fn forget(&self, fd: c_int) -> bool {
        self.set(fd, Taint::default())
    }

    /// `newfd` becomes a copy of `oldfd`
    pub fn inherit(&self, oldfd: c_int, newfd: c_int) -> Taint {
        let taint = self.taint_of(oldfd);
        if oldfd != newfd {
            self.set(newfd, taint);
        }
        taint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_blocks_nested_entry() {
        assert!(!is_in_intercept());
        let outer = InterceptGuard::enter();
        assert!(outer.is_some());
        assert!(is_in_intercept());
        assert!(InterceptGuard::enter().is_none());
        drop(outer);
        assert!(!is_in_intercept());
        assert!(InterceptGuard::enter().is_some());
    }

    #[test]
    fn guard_is_per_thread() {
        let _held = InterceptGuard::enter().unwrap();
        let other = std::thread::spawn(|| InterceptGuard::enter().is_some())
            .join()
            .unwrap();
        assert!(other);
    }

    #[test]
    fn taint_follows_set_forget_and_inherit() {
        let fds = TaintedFds::new();
        assert!(fds.taint_of(3).is_clean());

        let both = Taint {
            error: true,
            delay: true,
        };
        assert!(fds.set(3, both));
        assert!(!fds.set(3, both));
        assert_eq!(fds.taint_of(3), both);

        assert_eq!(fds.inherit(3, 9), both);
        assert_eq!(fds.taint_of(9), both);

        // a clean source overwrites the copy target
        fds.inherit(4, 9);
        assert!(fds.taint_of(9).is_clean());

        assert!(fds.forget(3));
        assert!(!fds.forget(3));
        assert!(fds.error.is_empty() && fds.delay.is_empty());
    }

    #[test]
    fn partial_taint_only_touches_its_set() {
        let fds = TaintedFds::new();
        fds.set(
            5,
            Taint {
                error: false,
                delay: true,
            },
        );
        assert_eq!(fds.error.len(), 0);
        assert_eq!(fds.delay.len(), 1);
        assert!(fds.inherit(5, 5).delay);
        assert_eq!(fds.delay.len(), 1);
    }

    #[test]
    fn stats_count_per_kind() {
        let stats = InterceptStats::new();
        assert_eq!(stats.for_kind(OperationKind::Open).record_call(), 0);
        assert_eq!(stats.for_kind(OperationKind::Open).record_call(), 1);
        stats.for_kind(OperationKind::Open).record_fault();
        stats.for_kind(OperationKind::Send).record_call();
        stats.for_kind(OperationKind::Send).record_delay();

        let snapshot = stats.snapshot();
        assert_eq!(
            snapshot.open,
            FunctionSnapshot {
                calls: 2,
                faults: 1,
                delays: 0
            }
        );
        assert_eq!(
            snapshot.send,
            FunctionSnapshot {
                calls: 1,
                faults: 0,
                delays: 1
            }
        );
    }
}
