use libc::c_int;
use std::fmt;
use std::str::FromStr;

// probability scaled from 0.0-100.0 to 0-10000 for 0.01% precision
const PROBABILITY_SCALE_FACTOR: u32 = 100;
const PROBABILITY_RANGE: u32 = 10000;

// errno values above this are reserved for kernel-internal codes
const MAX_ERRNO: c_int = 4095;

/// the two families of operations the injector understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Open,
    Send,
    Read,
    Write,
    Close,
    Dup,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Send => "send",
            Self::Read => "read",
            Self::Write => "write",
            Self::Close => "close",
            Self::Dup => "dup",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// exported entry points, one per interposed libc symbol
///
/// the `*2` variants are glibc's fortified open entry points, which take no
/// mode argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    Open,
    Open64,
    Open2,
    Open64_2,
    OpenAt,
    OpenAt64,
    OpenAt2,
    OpenAt64_2,
    Send,
    SendTo,
    Read,
    Write,
    Close,
    Dup2,
    Dup3,
}

impl Hook {
    pub const ALL: [Hook; 15] = [
        Self::Open,
        Self::Open64,
        Self::Open2,
        Self::Open64_2,
        Self::OpenAt,
        Self::OpenAt64,
        Self::OpenAt2,
        Self::OpenAt64_2,
        Self::Send,
        Self::SendTo,
        Self::Read,
        Self::Write,
        Self::Close,
        Self::Dup2,
        Self::Dup3,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Open64 => "open64",
            Self::Open2 => "__open_2",
            Self::Open64_2 => "__open64_2",
            Self::OpenAt => "openat",
            Self::OpenAt64 => "openat64",
            Self::OpenAt2 => "__openat_2",
            Self::OpenAt64_2 => "__openat64_2",
            Self::Send => "send",
            Self::SendTo => "sendto",
            Self::Read => "read",
            Self::Write => "write",
            Self::Close => "close",
            Self::Dup2 => "dup2",
            Self::Dup3 => "dup3",
        }
    }

    pub fn kind(self) -> OperationKind {
        match self {
            Self::Open
            | Self::Open64
            | Self::Open2
            | Self::Open64_2
            | Self::OpenAt
            | Self::OpenAt64
            | Self::OpenAt2
            | Self::OpenAt64_2 => OperationKind::Open,
            Self::Send | Self::SendTo => OperationKind::Send,
            Self::Read => OperationKind::Read,
            Self::Write => OperationKind::Write,
            Self::Close => OperationKind::Close,
            Self::Dup2 | Self::Dup3 => OperationKind::Dup,
        }
    }

    pub fn variants() -> &'static [&'static str] {
        &[
            "open",
            "open64",
            "__open_2",
            "__open64_2",
            "openat",
            "openat64",
            "__openat_2",
            "__openat64_2",
            "send",
            "sendto",
            "read",
            "write",
            "close",
            "dup2",
            "dup3",
        ]
    }
}

impl FromStr for Hook {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|hook| hook.as_str() == s)
            .ok_or_else(|| {
                format!(
                    "unknown hook name: {}. valid options: {}",
                    s,
                    Self::variants().join(", ")
                )
            })
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Probability(u32); // 0-10000 for 0.01% precision

impl Probability {
    pub const ZERO: Self = Self(0);
    pub const ALWAYS: Self = Self(PROBABILITY_RANGE);

    pub fn from_percentage(pct: f64) -> Result<Self, &'static str> {
        if !(0.0..=100.0).contains(&pct) {
            return Err("probability must be 0.0-100.0");
        }
        Ok(Self((pct * PROBABILITY_SCALE_FACTOR as f64).round() as u32))
    }

    pub fn to_percentage(self) -> f64 {
        self.0 as f64 / PROBABILITY_SCALE_FACTOR as f64
    }

    pub fn scaled(self) -> u32 {
        self.0
    }

    pub fn is_certain(self) -> bool {
        self.0 >= PROBABILITY_RANGE
    }

    pub fn should_fire(self, random: u32) -> bool {
        random < self.0
    }

    /// draws once; a certain probability never consumes randomness
    pub fn roll(self) -> bool {
        self.is_certain() || self.should_fire(fastrand::u32(0..PROBABILITY_RANGE))
    }
}

impl Default for Probability {
    fn default() -> Self {
        Self::ALWAYS
    }
}

impl fmt::Display for Probability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}%", self.to_percentage())
    }
}

/// a positive errno value as delivered through the C error channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(c_int);

impl ErrorCode {
    pub fn new(code: c_int) -> Option<Self> {
        (1..=MAX_ERRNO).contains(&code).then_some(Self(code))
    }

    pub fn get(self) -> c_int {
        self.0
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, nix::errno::Errno::from_raw(self.0).desc())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probability_from_percentage() {
        let p = Probability::from_percentage(25.0).unwrap();
        assert_eq!(p.scaled(), 2500);
        assert_eq!(p.to_percentage(), 25.0);
        assert!(!p.is_certain());
    }

    #[test]
    fn probability_validation() {
        assert!(Probability::from_percentage(101.0).is_err());
        assert!(Probability::from_percentage(-1.0).is_err());
        assert!(Probability::from_percentage(0.0).is_ok());
        assert!(Probability::from_percentage(100.0).unwrap().is_certain());
    }

    #[test]
    fn probability_rolls() {
        assert!(Probability::ALWAYS.roll());
        assert!(!Probability::ZERO.roll());
        assert!(Probability::from_percentage(50.0).unwrap().should_fire(4999));
        assert!(!Probability::from_percentage(50.0).unwrap().should_fire(5000));
    }

    #[test]
    fn hook_parsing() {
        assert_eq!(Hook::from_str("open64").unwrap(), Hook::Open64);
        assert_eq!(Hook::from_str("sendto").unwrap(), Hook::SendTo);
        assert_eq!(Hook::from_str("__openat64_2").unwrap(), Hook::OpenAt64_2);
        assert!(Hook::from_str("read").is_err());
    }

    #[test]
    fn hook_kinds() {
        assert_eq!(Hook::OpenAt64.kind(), OperationKind::Open);
        assert_eq!(Hook::SendTo.kind(), OperationKind::Send);
        assert_eq!(Hook::Open2.kind(), OperationKind::Open);
        assert_eq!(Hook::Dup3.kind(), OperationKind::Dup);
        assert!(Hook::ALL
            .iter()
            .zip(Hook::variants())
            .all(|(hook, name)| hook.as_str() == *name));
        assert_eq!(Hook::ALL.len(), Hook::variants().len());
    }

    #[test]
    fn error_code_range() {
        assert_eq!(ErrorCode::new(libc::ENOMEM).map(ErrorCode::get), Some(12));
        assert!(ErrorCode::new(0).is_none());
        assert!(ErrorCode::new(-5).is_none());
        assert!(ErrorCode::new(5000).is_none());
    }
}
