use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Access levels attached to schema paths and presented by callers with
/// every write. Ordering matters: an operation is allowed when the caller's
/// level is >= the level the schema requires.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    #[default]
    User = 0,
    Admin = 1,
    Service = 2,
    Developer = 3,
    Internal = 4,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::User => "user",
            AccessLevel::Admin => "admin",
            AccessLevel::Service => "service",
            AccessLevel::Developer => "developer",
            AccessLevel::Internal => "internal",
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("invalid access level '{attempted}'. Valid values are: user, admin, service, developer, internal")]
pub struct AccessLevelParseError {
    attempted: String,
}

impl FromStr for AccessLevel {
    type Err = AccessLevelParseError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        match source {
            "user" => Ok(AccessLevel::User),
            "admin" => Ok(AccessLevel::Admin),
            "service" => Ok(AccessLevel::Service),
            "developer" => Ok(AccessLevel::Developer),
            "internal" => Ok(AccessLevel::Internal),
            _ => Err(AccessLevelParseError {
                attempted: source.to_owned(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering() {
        assert!(AccessLevel::User < AccessLevel::Admin);
        assert!(AccessLevel::Admin < AccessLevel::Service);
        assert!(AccessLevel::Service < AccessLevel::Developer);
        assert!(AccessLevel::Developer < AccessLevel::Internal);
    }

    #[test]
    fn parse_round_trip() {
        for level in [
            AccessLevel::User,
            AccessLevel::Admin,
            AccessLevel::Service,
            AccessLevel::Developer,
            AccessLevel::Internal,
        ] {
            assert_eq!(level.as_str().parse::<AccessLevel>().unwrap(), level);
        }
        assert!("root".parse::<AccessLevel>().is_err());
    }
}
