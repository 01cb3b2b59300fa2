use std::ffi::{CStr, OsString};
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;
use tracing::error;

use crate::config::FaultConfig;
use crate::matcher::path_matches;
use crate::state::Taint;
use crate::types::{ErrorCode, OperationKind};

/// what an interceptor does with one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    PassThrough,
    FailWith(ErrorCode),
    DelayThenPassThrough(Duration),
    /// a delayed descriptor that also fails; the real call is never made
    DelayThenFail(Duration, ErrorCode),
}

/// the target of one intercepted call
#[derive(Debug, Clone, Copy)]
pub enum CallContext<'a> {
    Open { path: &'a CStr },
    Send { peer: Option<SocketAddr> },
    Read { taint: Taint },
    Write { taint: Taint },
}

impl CallContext<'_> {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Open { .. } => OperationKind::Open,
            Self::Send { .. } => OperationKind::Send,
            Self::Read { .. } => OperationKind::Read,
            Self::Write { .. } => OperationKind::Write,
        }
    }
}

pub fn decide(ctx: &CallContext<'_>, config: &FaultConfig) -> Action {
    match ctx {
        CallContext::Open { path } => match &config.open_error {
            Some(fault) if path_matches(&fault.path, path) && fault.likelihood.roll() => {
                Action::FailWith(fault.errno)
            }
            _ => Action::PassThrough,
        },
        CallContext::Send { peer } => match (&config.send_delay, peer) {
            (Some(fault), Some(peer)) if !fault.delay.is_zero() && fault.trigger.matches(peer) => {
                Action::DelayThenPassThrough(fault.delay)
            }
            _ => Action::PassThrough,
        },
        CallContext::Read { taint } | CallContext::Write { taint } => {
            descriptor_action(ctx.kind(), *taint, config)
        }
    }
}

fn descriptor_action(kind: OperationKind, taint: Taint, config: &FaultConfig) -> Action {
    let Some(fault) = config.descriptors.for_kind(kind) else {
        return Action::PassThrough;
    };
    let delay = fault.delay.filter(|d| taint.delay && !d.is_zero());
    let errno = fault
        .errno
        .filter(|_| taint.error && config.descriptors.likelihood.roll());

    match (delay, errno) {
        (Some(delay), Some(errno)) => Action::DelayThenFail(delay, errno),
        (Some(delay), None) => Action::DelayThenPassThrough(delay),
        (None, Some(errno)) => Action::FailWith(errno),
        (None, None) => Action::PassThrough,
    }
}

/// which descriptor faults a descriptor opened through `path` is marked for
pub fn taint_for(path: &CStr, config: &FaultConfig) -> Taint {
    let matches = |trigger: &Option<OsString>| {
        trigger
            .as_deref()
            .is_some_and(|trigger| path_matches(trigger, path))
    };
    Taint {
        error: matches(&config.descriptors.error_path),
        delay: matches(&config.descriptors.delay_path),
    }
}

/// runs the fault logic for one call, degrading any panic to `fallback`
///
/// covers configuration parsing as well as the decision, so nothing
/// unwinds into the C caller
pub fn contained<T>(kind: OperationKind, fallback: T, f: impl FnOnce() -> T) -> T {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
        error!(
            pid = std::process::id(),
            operation = %kind,
            "fault logic panicked, passing call through"
        );
        fallback
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DescriptorFault, DescriptorFaults, OpenErrorFault, SendDelayFault};
    use crate::matcher::PeerTrigger;
    use crate::types::Probability;
    use std::ffi::CString;

    fn open_fault(path: &str, errno: i32) -> FaultConfig {
        FaultConfig {
            open_error: Some(OpenErrorFault {
                path: OsString::from(path),
                errno: ErrorCode::new(errno).unwrap(),
                likelihood: Probability::ALWAYS,
            }),
            ..Default::default()
        }
    }

    fn send_fault(trigger: &str, ms: u64) -> FaultConfig {
        FaultConfig {
            send_delay: Some(SendDelayFault {
                trigger: PeerTrigger::parse(trigger),
                delay: Duration::from_millis(ms),
            }),
            ..Default::default()
        }
    }

    fn descriptor_fault(errno: Option<i32>, delay_ms: Option<u64>) -> FaultConfig {
        let fault = DescriptorFault {
            errno: errno.and_then(ErrorCode::new),
            delay: delay_ms.map(Duration::from_millis),
        };
        FaultConfig {
            descriptors: DescriptorFaults {
                error_path: Some(OsString::from("/tmp/data")),
                delay_path: Some(OsString::from("/tmp/slow")),
                read: fault,
                write: fault,
                likelihood: Probability::ALWAYS,
            },
            ..Default::default()
        }
    }

    const ERROR_ONLY: Taint = Taint {
        error: true,
        delay: false,
    };
    const BOTH: Taint = Taint {
        error: true,
        delay: true,
    };

    #[test]
    fn disarmed_config_passes_everything() {
        let config = FaultConfig::default();
        let path = CString::new("/etc/hostname").unwrap();
        assert_eq!(
            decide(&CallContext::Open { path: &path }, &config),
            Action::PassThrough
        );
        let peer = Some("127.0.0.1:80".parse().unwrap());
        assert_eq!(
            decide(&CallContext::Send { peer }, &config),
            Action::PassThrough
        );
    }

    #[test]
    fn open_on_trigger_fails_with_configured_errno() {
        let config = open_fault("/tmp/x", libc::ENOMEM);
        let hit = CString::new("/tmp/x").unwrap();
        let miss = CString::new("/tmp/y").unwrap();

        assert_eq!(
            decide(&CallContext::Open { path: &hit }, &config),
            Action::FailWith(ErrorCode::new(libc::ENOMEM).unwrap())
        );
        assert_eq!(
            decide(&CallContext::Open { path: &miss }, &config),
            Action::PassThrough
        );
    }

    #[test]
    fn open_decision_is_repeatable() {
        let config = open_fault("/tmp/x", libc::EIO);
        let hit = CString::new("/tmp/x").unwrap();
        let first = decide(&CallContext::Open { path: &hit }, &config);
        for _ in 0..100 {
            assert_eq!(decide(&CallContext::Open { path: &hit }, &config), first);
        }
    }

    #[test]
    fn zero_likelihood_never_fails() {
        let mut config = open_fault("/tmp/x", libc::EIO);
        if let Some(fault) = config.open_error.as_mut() {
            fault.likelihood = Probability::ZERO;
        }
        let hit = CString::new("/tmp/x").unwrap();
        for _ in 0..100 {
            assert_eq!(
                decide(&CallContext::Open { path: &hit }, &config),
                Action::PassThrough
            );
        }
    }

    #[test]
    fn send_to_matching_peer_is_delayed() {
        let config = send_fault("127.0.0.1", 250);
        let peer = Some("127.0.0.1:5555".parse().unwrap());
        assert_eq!(
            decide(&CallContext::Send { peer }, &config),
            Action::DelayThenPassThrough(Duration::from_millis(250))
        );
    }

    #[test]
    fn send_to_other_or_unknown_peer_passes() {
        let config = send_fault("127.0.0.1", 250);
        let other = Some("10.1.2.3:5555".parse().unwrap());
        assert_eq!(
            decide(&CallContext::Send { peer: other }, &config),
            Action::PassThrough
        );
        assert_eq!(
            decide(&CallContext::Send { peer: None }, &config),
            Action::PassThrough
        );
    }

    #[test]
    fn open_fault_does_not_touch_sends_and_vice_versa() {
        let mut config = open_fault("127.0.0.1", libc::EIO);
        config.send_delay = send_fault("/tmp/x", 10).send_delay;

        let peer = Some("127.0.0.1:80".parse().unwrap());
        assert_eq!(
            decide(&CallContext::Send { peer }, &config),
            Action::PassThrough
        );
        let path = CString::new("/tmp/x").unwrap();
        assert_eq!(
            decide(&CallContext::Open { path: &path }, &config),
            Action::PassThrough
        );
    }

    #[test]
    fn clean_descriptors_are_never_faulted() {
        let config = descriptor_fault(Some(libc::EIO), Some(10));
        let clean = Taint::default();
        assert_eq!(
            decide(&CallContext::Read { taint: clean }, &config),
            Action::PassThrough
        );
        assert_eq!(
            decide(&CallContext::Write { taint: clean }, &config),
            Action::PassThrough
        );
    }

    #[test]
    fn tainted_descriptor_gets_what_its_taint_allows() {
        let eio = ErrorCode::new(libc::EIO).unwrap();
        let config = descriptor_fault(Some(libc::EIO), Some(10));

        assert_eq!(
            decide(&CallContext::Read { taint: ERROR_ONLY }, &config),
            Action::FailWith(eio)
        );
        assert_eq!(
            decide(&CallContext::Write { taint: BOTH }, &config),
            Action::DelayThenFail(Duration::from_millis(10), eio)
        );

        let delay_only = Taint {
            error: false,
            delay: true,
        };
        assert_eq!(
            decide(&CallContext::Read { taint: delay_only }, &config),
            Action::DelayThenPassThrough(Duration::from_millis(10))
        );
    }

    #[test]
    fn tainted_descriptor_without_per_operation_fault_passes() {
        let config = descriptor_fault(None, None);
        assert_eq!(
            decide(&CallContext::Read { taint: BOTH }, &config),
            Action::PassThrough
        );
    }

    #[test]
    fn taint_follows_the_trigger_paths() {
        let config = descriptor_fault(None, None);
        let data = CString::new("/tmp/data").unwrap();
        let slow = CString::new("/tmp/slow").unwrap();
        let other = CString::new("/tmp/data/x").unwrap();

        assert_eq!(taint_for(&data, &config), ERROR_ONLY);
        assert!(taint_for(&slow, &config).delay);
        assert!(taint_for(&other, &config).is_clean());
        assert!(taint_for(&data, &FaultConfig::default()).is_clean());
    }

    #[test]
    fn contained_returns_the_result_or_the_fallback() {
        assert_eq!(
            contained(OperationKind::Open, Action::PassThrough, || Action::FailWith(
                ErrorCode::new(libc::EACCES).unwrap()
            )),
            Action::FailWith(ErrorCode::new(libc::EACCES).unwrap())
        );
        let fallback = contained(OperationKind::Send, Action::PassThrough, || -> Action {
            panic!("bad configuration")
        });
        assert_eq!(fallback, Action::PassThrough);
    }
}
