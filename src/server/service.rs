//! Service capability flags advertised by enlisting servers.

use std::fmt;
use std::str::FromStr;

use crate::utils::CohortError;

use fixedbitset::FixedBitSet;

use serde::{Deserialize, Serialize};

/// A role a server may provide to the cluster.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum ServiceType {
    /// Master storage: owns in-memory data and a log.
    Master,

    /// Backup storage: keeps replicas of masters' log segments.
    Backup,

    /// Keeps a local copy of the server list.
    Membership,

    /// Answers liveness pings.
    Ping,
}

/// Number of distinct service types.
pub const NUM_SERVICES: usize = 4;

impl ServiceType {
    /// All service types, in bit order.
    pub const ALL: [ServiceType; NUM_SERVICES] = [
        ServiceType::Master,
        ServiceType::Backup,
        ServiceType::Membership,
        ServiceType::Ping,
    ];

    #[inline]
    fn bit(&self) -> usize {
        match self {
            Self::Master => 0,
            Self::Backup => 1,
            Self::Membership => 2,
            Self::Ping => 3,
        }
    }

    /// Lower-case name used in service mask strings.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Backup => "backup",
            Self::Membership => "membership",
            Self::Ping => "ping",
        }
    }

    /// Parse command line string into ServiceType enum.
    pub fn parse_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "master" => Some(Self::Master),
            "backup" => Some(Self::Backup),
            "membership" => Some(Self::Membership),
            "ping" => Some(Self::Ping),
            _ => None,
        }
    }
}

/// Compact set of `ServiceType`s. Immutable once attached to a server entry.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMask(FixedBitSet);

impl ServiceMask {
    /// Creates an empty mask.
    pub fn new() -> Self {
        ServiceMask(FixedBitSet::with_capacity(NUM_SERVICES))
    }

    /// Creates a mask containing every service type.
    pub fn all() -> Self {
        Self::from_services(&ServiceType::ALL)
    }

    /// Creates a mask from a slice of service types.
    pub fn from_services(services: &[ServiceType]) -> Self {
        let mut mask = Self::new();
        for &service in services {
            mask.set(service);
        }
        mask
    }

    /// Adds a service to the mask.
    #[inline]
    pub fn set(&mut self, service: ServiceType) {
        self.0.set(service.bit(), true);
    }

    /// Returns true if the mask contains given service.
    #[inline]
    pub fn has(&self, service: ServiceType) -> bool {
        self.0.contains(service.bit())
    }

    /// Returns true if the two masks share at least one service.
    #[inline]
    pub fn intersects(&self, other: &ServiceMask) -> bool {
        !self.0.is_disjoint(&other.0)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.count_ones(..) == 0
    }

    /// Allows `for service in mask.iter()`.
    pub fn iter(&self) -> impl Iterator<Item = ServiceType> + '_ {
        ServiceType::ALL.into_iter().filter(|s| self.has(*s))
    }
}

impl Default for ServiceMask {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for ServiceMask {
    type Err = CohortError;

    /// Parses a comma-separated list of service names, e.g.,
    /// `"master,backup"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut mask = Self::new();
        for name in s.split(',').filter(|n| !n.trim().is_empty()) {
            let service = ServiceType::parse_name(name).ok_or_else(|| {
                CohortError::msg(format!("unrecognized service '{}'", name))
            })?;
            mask.set(service);
        }
        Ok(mask)
    }
}

impl fmt::Display for ServiceMask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(|s| s.name()).collect();
        write!(f, "{}", names.join(","))
    }
}

// Implement `Debug` trait manually for better trace printing.
impl fmt::Debug for ServiceMask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{{}}}", self)
    }
}

#[cfg(test)]
mod service_tests {
    use super::*;

    #[test]
    fn mask_set_has() {
        let mut mask = ServiceMask::new();
        assert!(mask.is_empty());
        mask.set(ServiceType::Backup);
        assert!(mask.has(ServiceType::Backup));
        assert!(!mask.has(ServiceType::Master));
        assert!(!mask.is_empty());
    }

    #[test]
    fn mask_intersects() {
        let backup = ServiceMask::from_services(&[ServiceType::Backup]);
        let both = ServiceMask::from_services(&[
            ServiceType::Master,
            ServiceType::Backup,
        ]);
        let ping = ServiceMask::from_services(&[ServiceType::Ping]);
        assert!(backup.intersects(&both));
        assert!(!backup.intersects(&ping));
        assert!(ServiceMask::all().intersects(&ping));
        assert!(!ServiceMask::new().intersects(&ServiceMask::all()));
    }

    #[test]
    fn mask_parse_display() -> Result<(), CohortError> {
        let mask: ServiceMask = "Backup, master".parse()?;
        assert_eq!(
            mask,
            ServiceMask::from_services(&[
                ServiceType::Master,
                ServiceType::Backup
            ])
        );
        assert_eq!(format!("{}", mask), "master,backup");
        assert_eq!(format!("{:?}", mask), "{master,backup}");
        assert!("backup,disk".parse::<ServiceMask>().is_err());
        assert!("".parse::<ServiceMask>()?.is_empty());
        Ok(())
    }
}
