//! trigger matching
//!
//! paths are compared as literal bytes against the argument exactly as the
//! caller passed it. peers are compared on their canonical IP address, and
//! on the port too when the trigger names one.

use std::ffi::{CStr, OsStr};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::ffi::OsStrExt;

/// literal equality between a configured trigger path and an open() argument
pub fn path_matches(trigger: &OsStr, candidate: &CStr) -> bool {
    trigger.as_bytes() == candidate.to_bytes()
}

/// peer selector parsed from the delay trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerTrigger {
    /// `127.0.0.1:8080`, `[::1]:80`
    Socket(SocketAddr),
    /// `127.0.0.1`, any port
    Ip(IpAddr),
    /// placeholder such as `none`; never matches
    Never(String),
}

impl PeerTrigger {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let Ok(addr) = raw.parse::<SocketAddr>() {
            Self::Socket(SocketAddr::new(addr.ip().to_canonical(), addr.port()))
        } else if let Ok(ip) = raw.parse::<IpAddr>() {
            Self::Ip(ip.to_canonical())
        } else {
            Self::Never(raw.to_string())
        }
    }

    pub fn matches(&self, peer: &SocketAddr) -> bool {
        let peer_ip = peer.ip().to_canonical();
        match self {
            Self::Socket(addr) => addr.ip() == peer_ip && addr.port() == peer.port(),
            Self::Ip(ip) => *ip == peer_ip,
            Self::Never(_) => false,
        }
    }
}

impl fmt::Display for PeerTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket(addr) => write!(f, "{}", addr),
            Self::Ip(ip) => write!(f, "{}", ip),
            Self::Never(token) => write!(f, "{} (never matches)", token),
        }
    }
}
