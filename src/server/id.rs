//! Server identity and liveness status types.

use std::fmt;
use std::str::FromStr;

use crate::utils::CohortError;

use serde::{Deserialize, Serialize};

/// Generation-qualified identifier of a cluster member. Re-enlisting at the
/// same index bumps the generation, so references to an old incarnation
/// never match the new one.
#[derive(
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
)]
pub struct ServerId {
    /// Slot index in the directory. Index 0 is never allocated.
    pub index: u32,

    /// Incarnation counter of the slot.
    pub generation: u32,
}

impl ServerId {
    /// The zero value, meaning "no server".
    pub const INVALID: ServerId = ServerId {
        index: 0,
        generation: 0,
    };

    pub fn new(index: u32, generation: u32) -> Self {
        ServerId { index, generation }
    }

    /// Returns true if this ID could name an allocated server.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.index != 0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

impl FromStr for ServerId {
    type Err = CohortError;

    /// Parses the `index.generation` form produced by `Display`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (index, generation) = s.trim().split_once('.').ok_or_else(|| {
            CohortError::msg(format!("malformed server ID '{}'", s))
        })?;
        Ok(ServerId {
            index: index.parse()?,
            generation: generation.parse()?,
        })
    }
}

/// Liveness status of a directory entry.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum ServerStatus {
    /// Enlisted and believed alive.
    Up,

    /// Some member hinted it is down; not yet confirmed.
    Suspect,

    /// Failure confirmed; about to be removed.
    Down,
}

impl ServerStatus {
    /// Up and Suspect servers are still cluster members.
    #[inline]
    pub fn is_member(&self) -> bool {
        *self != ServerStatus::Down
    }
}

#[cfg(test)]
mod id_tests {
    use super::*;

    #[test]
    fn id_display_parse() -> Result<(), CohortError> {
        let id = ServerId::new(3, 7);
        assert_eq!(format!("{}", id), "3.7");
        assert_eq!("3.7".parse::<ServerId>()?, id);
        assert!("37".parse::<ServerId>().is_err());
        assert!("a.7".parse::<ServerId>().is_err());
        Ok(())
    }

    #[test]
    fn id_validity() {
        assert!(!ServerId::INVALID.is_valid());
        assert!(!ServerId::default().is_valid());
        assert!(ServerId::new(1, 1).is_valid());
    }

    #[test]
    fn id_ordering() {
        assert!(ServerId::new(1, 2) < ServerId::new(2, 1));
        assert!(ServerId::new(1, 1) < ServerId::new(1, 2));
    }
}
