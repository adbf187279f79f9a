//! Role definitions and protocol constants.

use std::fmt;
use std::str::FromStr;

/// Control token a robot sends as its first frame.
pub const ROBOT: &str = "ROBOT";
/// Control token a client sends as its first frame.
pub const CLIENT: &str = "CLIENT";
/// Acknowledgment sent to an accepted robot.
pub const ROBOT_OK: &str = "ROBOT_OK";
/// Acknowledgment sent to an accepted client.
pub const CLIENT_OK: &str = "CLIENT_OK";
/// Sent to the robot once both roles are registered.
pub const READY: &str = "READY";
/// Prefix of the free-text error message. The text follows after one space.
pub const ERROR_PREFIX: &str = "ERROR";

/// HTTP path answered as a liveness probe instead of being upgraded.
pub const HEALTH_PATH: &str = "/health";
/// Body returned by the liveness probe.
pub const HEALTH_BODY: &str = "OK\n";

/// One of the two participant kinds in a signaling session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The media-producing peer; receives `READY`.
    Robot,
    /// The remote operator peer.
    Client,
}

impl Role {
    /// The control token that declares this role.
    #[must_use]
    pub const fn token(self) -> &'static str {
        match self {
            Self::Robot => ROBOT,
            Self::Client => CLIENT,
        }
    }

    /// The acknowledgment the server sends back for this role.
    #[must_use]
    pub const fn ack(self) -> &'static str {
        match self {
            Self::Robot => ROBOT_OK,
            Self::Client => CLIENT_OK,
        }
    }

    /// The role on the other end of the relay.
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Robot => Self::Client,
            Self::Client => Self::Robot,
        }
    }

    /// Lowercase label, used for logs and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Robot => "robot",
            Self::Client => "client",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing a role label fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role {0:?} (expected \"robot\" or \"client\")")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("robot") {
            Ok(Self::Robot)
        } else if s.eq_ignore_ascii_case("client") {
            Ok(Self::Client)
        } else {
            Err(UnknownRole(s.to_string()))
        }
    }
}
