use std::fmt;
use std::str::FromStr;

use thiserror::Error as ThisError;

#[derive(Debug, ThisError, PartialEq)]
#[error("invalid server version {0:?}")]
pub struct InvalidVersion(String);

/// A `major.minor.patch` server version, ordered numerically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Version {
        Version {
            major,
            minor,
            patch,
        }
    }

    /// Reported when the server never told us its version; every versioned
    /// feature compares as unsupported.
    pub const UNKNOWN: Version = Version::new(0, 0, 0);
}

impl FromStr for Version {
    type Err = InvalidVersion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().splitn(3, '.');
        let mut next = || -> Result<u32, InvalidVersion> {
            parts
                .next()
                .unwrap_or("0")
                .parse()
                .map_err(|_| InvalidVersion(s.to_string()))
        };

        Ok(Version::new(next()?, next()?, next()?))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerRole {
    #[default]
    Master,
    Replica,
    Sentinel,
}

impl ServerRole {
    fn parse(s: &str) -> Option<ServerRole> {
        match s {
            "master" => Some(ServerRole::Master),
            // Older servers report "slave" in INFO.
            "slave" | "replica" => Some(ServerRole::Replica),
            "sentinel" => Some(ServerRole::Sentinel),
            _ => None,
        }
    }
}

/// What a connected server is known to support, derived once from its
/// reported version and role. Derivation is a pure version comparison; no
/// feature is ever probed by trial and error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Features {
    /// CLIENT SETNAME / CLIENT GETNAME.
    pub client_name: bool,
    /// CLIENT KILL.
    pub client_kill: bool,
    /// PEXPIRE and friends.
    pub millisecond_expiry: bool,
    /// SET with NX/XX modifiers.
    pub set_conditional: bool,
    /// EVAL / EVALSHA.
    pub scripting: bool,
    /// EXPIRE replaces an existing expiry.
    pub expire_overwrite: bool,
    /// GETDEL.
    pub getdel: bool,
    /// RESP3 `>`-marked push frames.
    pub push_frames: bool,
}

impl Features {
    pub fn derive(version: Version, role: ServerRole) -> Features {
        let at_least = |v: Version| version >= v;
        // Sentinels speak a command subset; nothing data-related applies.
        let data = role != ServerRole::Sentinel;

        Features {
            client_name: at_least(Version::new(2, 6, 9)),
            client_kill: at_least(Version::new(2, 6, 9)),
            millisecond_expiry: data && at_least(Version::new(2, 6, 0)),
            set_conditional: data && at_least(Version::new(2, 6, 12)),
            scripting: data && at_least(Version::new(2, 6, 0)),
            expire_overwrite: data && at_least(Version::new(2, 1, 3)),
            getdel: data && at_least(Version::new(6, 2, 0)),
            push_frames: at_least(Version::new(6, 0, 0)),
        }
    }
}

/// Extracts `redis_version` and `role` from an INFO payload. Missing or
/// unparseable fields fall back to defaults rather than failing the
/// handshake.
pub fn parse_info(payload: &str) -> (Version, ServerRole) {
    let mut version = Version::UNKNOWN;
    let mut role = ServerRole::default();

    for line in payload.lines() {
        if let Some(value) = line.strip_prefix("redis_version:") {
            if let Ok(parsed) = value.trim().parse() {
                version = parsed;
            }
        } else if let Some(value) = line.strip_prefix("role:") {
            if let Some(parsed) = ServerRole::parse(value.trim()) {
                role = parsed;
            }
        }
    }

    (version, role)
}
