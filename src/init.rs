use std::sync::atomic::Ordering;
use tracing::{debug, info, info_span, warn};

use crate::config::{debug_requested, FaultConfig, DEBUG_VAR, LOG_VAR};
use crate::resolver::init_real_functions;
use crate::state::{InterceptGuard, DEBUG_ENABLED};

// initialize tracing subscriber, leaving any subscriber the host set up alone
pub fn init_tracing(debug: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let fallback = if debug { "faultinj=debug" } else { "faultinj=warn" };
    let filter = EnvFilter::try_from_env(LOG_VAR).unwrap_or_else(|_| EnvFilter::new(fallback));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_thread_ids(true)
                .with_target(false),
        )
        .try_init();
}

// public initialization function for tests or manual initialization
pub fn init_fault_injector() {
    let debug = debug_requested();
    DEBUG_ENABLED.store(debug, Ordering::Relaxed);
    init_tracing(debug);

    let current_pid = std::process::id();
    let _span = info_span!("init", pid = current_pid).entered();
    // the lookups below may open files or log; keep them out of the hooks
    let _guard = InterceptGuard::enter();

    info!(version = crate::VERSION, "fault injector loaded");
    if debug {
        info!("debug mode enabled via {} environment variable", DEBUG_VAR);
    }

    debug!("initializing real function pointers");
    let failed = init_real_functions()
        .into_iter()
        .filter(|(_, result)| result.is_err())
        .count();
    if failed > 0 {
        warn!(failed, "some real functions are unavailable; calls to them will abort");
    }

    let config = FaultConfig::load();
    info!(
        open_error = ?config.open_error,
        send_delay = ?config.send_delay,
        descriptors = ?config.descriptors,
        disarmed = config.is_disarmed(),
        "initial fault configuration"
    );
}

// automatic initialization via constructor (disabled during tests)
#[cfg(not(test))]
#[ctor::ctor]
fn auto_init_fault_injector() {
    init_fault_injector();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_init_resolves_and_can_repeat() {
        init_fault_injector();
        init_fault_injector();
        assert!(crate::resolver::REAL_OPEN.is_resolved());
        assert!(crate::resolver::REAL_SEND.is_resolved());
        assert!(crate::resolver::REAL_DUP3.is_resolved());
        assert!(!crate::VERSION.is_empty());
        assert!(!crate::state::is_in_intercept());
    }
}
