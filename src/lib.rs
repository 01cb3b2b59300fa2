// module organization
pub mod config;
pub mod errors;
pub mod init;
#[cfg(not(test))]
mod intercept;
pub mod matcher;
pub mod net;
pub mod ops;
pub mod policy;
pub mod resolver;
pub mod state;
pub mod types;


pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// re-export key types and functions for external use
pub use config::{ConfigSource, DescriptorFault, DescriptorFaults, EnvSource, FaultConfig, FixedSource};
pub use errors::{ConfigError, ResolveError};
pub use init::init_fault_injector;
pub use matcher::PeerTrigger;
pub use ops::{stats_snapshot, FaultingOps, IoOps, RealOps};
pub use policy::{decide, taint_for, Action, CallContext};
pub use state::{StatsSnapshot, Taint, TaintedFds};
pub use types::{ErrorCode, Hook, OperationKind, Probability};
