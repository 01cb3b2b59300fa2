use std::ffi::{OsStr, OsString};
use std::time::Duration;
use tracing::debug;

use crate::errors::ConfigError;
use crate::matcher::PeerTrigger;
use crate::types::{ErrorCode, OperationKind, Probability};

pub const ERROR_PATH_VAR: &str = "LIBFAULTINJ_ERROR_PATH";
pub const ERROR_OPEN_ERRNO_VAR: &str = "LIBFAULTINJ_ERROR_OPEN_ERRNO";
pub const ERROR_READ_ERRNO_VAR: &str = "LIBFAULTINJ_ERROR_READ_ERRNO";
pub const ERROR_WRITE_ERRNO_VAR: &str = "LIBFAULTINJ_ERROR_WRITE_ERRNO";
pub const ERROR_LIKELIHOOD_VAR: &str = "LIBFAULTINJ_ERROR_LIKELIHOOD_PCT";
pub const DELAY_PATH_VAR: &str = "LIBFAULTINJ_DELAY_PATH";
pub const DELAY_SEND_MS_VAR: &str = "LIBFAULTINJ_DELAY_SEND_MS";
pub const DELAY_READ_MS_VAR: &str = "LIBFAULTINJ_DELAY_READ_MS";
pub const DELAY_WRITE_MS_VAR: &str = "LIBFAULTINJ_DELAY_WRITE_MS";
pub const DEBUG_VAR: &str = "LIBFAULTINJ_DEBUG";
pub const LOG_VAR: &str = "LIBFAULTINJ_LOG";

/// forced open() failure for one literal path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenErrorFault {
    pub path: OsString,
    pub errno: ErrorCode,
    pub likelihood: Probability,
}

/// sleep before forwarding sends to a matching peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendDelayFault {
    pub trigger: PeerTrigger,
    pub delay: Duration,
}

/// error and delay for one descriptor operation, each independently optional
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorFault {
    pub errno: Option<ErrorCode>,
    pub delay: Option<Duration>,
}

/// faults for reads and writes on descriptors opened through a trigger path
///
/// `error_path` and `delay_path` mark descriptors at open time; the per
/// operation errno and delay are looked up when the descriptor is used
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorFaults {
    pub error_path: Option<OsString>,
    pub delay_path: Option<OsString>,
    pub read: DescriptorFault,
    pub write: DescriptorFault,
    pub likelihood: Probability,
}

impl DescriptorFaults {
    pub fn for_kind(&self, kind: OperationKind) -> Option<&DescriptorFault> {
        match kind {
            OperationKind::Read => Some(&self.read),
            OperationKind::Write => Some(&self.write),
            _ => None,
        }
    }

    /// whether a descriptor opened now could see any fault
    pub fn is_armed(&self) -> bool {
        let errors = self.read.errno.is_some() || self.write.errno.is_some();
        let delays = self.read.delay.is_some() || self.write.delay.is_some();
        (self.error_path.is_some() && errors) || (self.delay_path.is_some() && delays)
    }
}

/// immutable view of the fault configuration at one point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultConfig {
    pub open_error: Option<OpenErrorFault>,
    pub send_delay: Option<SendDelayFault>,
    pub descriptors: DescriptorFaults,
}

impl FaultConfig {
    /// reads the process environment; cheap enough to run on every call
    pub fn load() -> Self {
        Self::from_lookup(|name| std::env::var_os(name))
    }

    /// parses the recognised variables through `lookup`
    ///
    /// a fault whose variables are malformed or incomplete is left disarmed;
    /// parsing never fails as a whole.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let likelihood = parse_likelihood(&lookup);
        let open_error = parse_open_error(&lookup, likelihood).unwrap_or_else(|e| {
            debug!(error = %e, "open error fault disarmed");
            None
        });
        let send_delay = parse_send_delay(&lookup).unwrap_or_else(|e| {
            debug!(error = %e, "send delay fault disarmed");
            None
        });
        let descriptors = DescriptorFaults {
            error_path: non_empty(&lookup, ERROR_PATH_VAR),
            delay_path: non_empty(&lookup, DELAY_PATH_VAR),
            read: parse_descriptor_fault(&lookup, ERROR_READ_ERRNO_VAR, DELAY_READ_MS_VAR),
            write: parse_descriptor_fault(&lookup, ERROR_WRITE_ERRNO_VAR, DELAY_WRITE_MS_VAR),
            likelihood,
        };

        Self {
            open_error,
            send_delay,
            descriptors,
        }
    }

    pub fn is_disarmed(&self) -> bool {
        self.open_error.is_none() && self.send_delay.is_none() && !self.descriptors.is_armed()
    }
}

/// where interceptors get their configuration from
pub trait ConfigSource {
    fn snapshot(&self) -> FaultConfig;
}

/// re-reads the environment on every call so mid-process changes are seen
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSource;

impl ConfigSource for EnvSource {
    fn snapshot(&self) -> FaultConfig {
        FaultConfig::load()
    }
}

/// a configuration fixed at construction
#[derive(Debug, Clone, Default)]
pub struct FixedSource(pub FaultConfig);

impl ConfigSource for FixedSource {
    fn snapshot(&self) -> FaultConfig {
        self.0.clone()
    }
}

// empty values count as unset so `VAR=` disarms like `unset VAR`
fn non_empty<F>(lookup: &F, name: &str) -> Option<OsString>
where
    F: Fn(&str) -> Option<OsString>,
{
    lookup(name).filter(|value| !value.is_empty())
}

fn to_str<'a>(var: &'static str, value: &'a OsStr) -> Result<&'a str, ConfigError> {
    value.to_str().ok_or(ConfigError::NotUnicode { var })
}

fn parse_integer(var: &'static str, value: &OsStr) -> Result<i64, ConfigError> {
    let raw = to_str(var, value)?.trim();
    raw.parse::<i64>().map_err(|_| ConfigError::InvalidInteger {
        var,
        value: raw.to_string(),
    })
}

fn parse_errno(var: &'static str, value: &OsStr) -> Result<ErrorCode, ConfigError> {
    let value = parse_integer(var, value)?;
    i32::try_from(value)
        .ok()
        .and_then(ErrorCode::new)
        .ok_or(ConfigError::OutOfRange { var, value })
}

// zero means no delay
fn parse_delay(var: &'static str, value: &OsStr) -> Result<Option<Duration>, ConfigError> {
    let value = parse_integer(var, value)?;
    let millis = u64::try_from(value).map_err(|_| ConfigError::OutOfRange { var, value })?;
    Ok((millis > 0).then(|| Duration::from_millis(millis)))
}

fn parse_open_error<F>(
    lookup: &F,
    likelihood: Probability,
) -> Result<Option<OpenErrorFault>, ConfigError>
where
    F: Fn(&str) -> Option<OsString>,
{
    let path = non_empty(lookup, ERROR_PATH_VAR);
    let errno = non_empty(lookup, ERROR_OPEN_ERRNO_VAR);

    match (path, errno) {
        // a path alone only marks descriptors for read and write faults
        (None, None) | (Some(_), None) => Ok(None),
        (None, Some(_)) => Err(ConfigError::MissingCompanion {
            var: ERROR_OPEN_ERRNO_VAR,
            companion: ERROR_PATH_VAR,
        }),
        (Some(path), Some(raw_errno)) => Ok(Some(OpenErrorFault {
            path,
            errno: parse_errno(ERROR_OPEN_ERRNO_VAR, &raw_errno)?,
            likelihood,
        })),
    }
}

// a bad likelihood keeps faults armed at 100%, matching an unset value
fn parse_likelihood<F>(lookup: &F) -> Probability
where
    F: Fn(&str) -> Option<OsString>,
{
    let Some(raw) = non_empty(lookup, ERROR_LIKELIHOOD_VAR) else {
        return Probability::ALWAYS;
    };

    let parsed = to_str(ERROR_LIKELIHOOD_VAR, &raw).and_then(|s| {
        s.trim()
            .parse::<f64>()
            .ok()
            .and_then(|pct| Probability::from_percentage(pct).ok())
            .ok_or_else(|| ConfigError::InvalidProbability {
                var: ERROR_LIKELIHOOD_VAR,
                value: s.to_string(),
            })
    });

    parsed.unwrap_or_else(|e| {
        debug!(error = %e, "using default error likelihood");
        Probability::ALWAYS
    })
}

fn parse_send_delay<F>(lookup: &F) -> Result<Option<SendDelayFault>, ConfigError>
where
    F: Fn(&str) -> Option<OsString>,
{
    let trigger = non_empty(lookup, DELAY_PATH_VAR);
    let delay = non_empty(lookup, DELAY_SEND_MS_VAR);

    match (trigger, delay) {
        // a trigger alone may still mark descriptors for read and write delays
        (None, None) | (Some(_), None) => Ok(None),
        (None, Some(_)) => Err(ConfigError::MissingCompanion {
            var: DELAY_SEND_MS_VAR,
            companion: DELAY_PATH_VAR,
        }),
        (Some(raw_trigger), Some(raw_delay)) => {
            let Some(delay) = parse_delay(DELAY_SEND_MS_VAR, &raw_delay)? else {
                return Ok(None);
            };
            let trigger = PeerTrigger::parse(to_str(DELAY_PATH_VAR, &raw_trigger)?);
            Ok(Some(SendDelayFault { trigger, delay }))
        }
    }
}

fn parse_descriptor_fault<F>(
    lookup: &F,
    errno_var: &'static str,
    delay_var: &'static str,
) -> DescriptorFault
where
    F: Fn(&str) -> Option<OsString>,
{
    let errno = match non_empty(lookup, errno_var).map(|raw| parse_errno(errno_var, &raw)) {
        Some(Ok(errno)) => Some(errno),
        Some(Err(e)) => {
            debug!(error = %e, "descriptor error fault disarmed");
            None
        }
        None => None,
    };
    let delay = match non_empty(lookup, delay_var).map(|raw| parse_delay(delay_var, &raw)) {
        Some(Ok(delay)) => delay,
        Some(Err(e)) => {
            debug!(error = %e, "descriptor delay fault disarmed");
            None
        }
        None => None,
    };

    DescriptorFault { errno, delay }
}

/// whether `LIBFAULTINJ_DEBUG` asks for verbose logging
pub fn debug_requested() -> bool {
    match std::env::var(DEBUG_VAR) {
        Ok(v) => !matches!(v.trim(), "" | "0" | "false"),
        Err(_) => false,
    }
}
