//! NAT Classification Types
//!
//! Binding (mapping) and filtering behavior are each classified as one of the
//! RFC 4787 dependency types; together they name the classic RFC 3489 NAT
//! categories.

use std::fmt;
use std::net::SocketAddrV4;

/// Dependency classification for NAT binding or filtering behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DependencyType {
    /// Endpoint independent
    Independent,
    /// Depends on the remote address only
    AddressDependent,
    /// Depends on the remote port only
    PortDependent,
    /// Depends on both remote address and port
    AddressAndPortDependent,
    /// Could not be determined
    #[default]
    Undetermined,
}

impl DependencyType {
    /// Classify binding behavior from the four mapped addresses
    ///
    /// Slots are ordered by probe: same address and port, same address and
    /// other port, other address and same port, other address and port. Only
    /// ports are compared.
    #[must_use]
    pub fn from_mappings(mapped: &[Option<SocketAddrV4>; 4]) -> Self {
        let [Some(m0), Some(m1), Some(m2), Some(_)] = mapped else {
            return Self::Undetermined;
        };

        let (p0, p1, p2) = (m0.port(), m1.port(), m2.port());
        if p0 == p1 && p0 == p2 {
            Self::Independent
        } else if p0 == p2 {
            Self::PortDependent
        } else if p0 == p1 {
            Self::AddressDependent
        } else {
            Self::AddressAndPortDependent
        }
    }

    /// Classify filtering behavior from the two sub-probe outcomes
    #[must_use]
    pub fn from_filters(address: FilterState, port: FilterState) -> Self {
        use FilterState::{Dependent, Independent};

        match (address, port) {
            (Independent, Independent) => Self::Independent,
            (Independent, Dependent) => Self::PortDependent,
            (Dependent, Independent) => Self::AddressDependent,
            (Dependent, Dependent) => Self::AddressAndPortDependent,
            _ => Self::Undetermined,
        }
    }
}

impl fmt::Display for DependencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let abbrev = match self {
            Self::Independent => "I",
            Self::AddressDependent => "AD",
            Self::PortDependent => "PD",
            Self::AddressAndPortDependent => "APD",
            Self::Undetermined => "UNDEF",
        };
        f.write_str(abbrev)
    }
}

/// Tri-state result of one filtering sub-probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterState {
    /// Sub-probe still outstanding
    #[default]
    Unknown,
    /// Response never arrived
    Dependent,
    /// Response arrived from the changed endpoint
    Independent,
}

/// Outcome of a discovery run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// Discovery finished
    Ok,
    /// Server host name did not resolve
    HostNotFound,
    /// The first probe was never answered
    UdpBlocked,
    /// A later binding probe was never answered
    NbIncomplete,
}

impl ResultCode {
    /// Numeric code as printed by the CLI
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::HostNotFound => -1,
            Self::UdpBlocked => -2,
            Self::NbIncomplete => -3,
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Named NAT category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatType {
    /// No response to the first probe
    UdpBlocked,
    /// Mapped address equals a local address
    Open,
    /// Behind a NAT but classification is incomplete
    NattedUnknown,
    /// Endpoint-independent binding and filtering
    FullCone,
    /// Independent binding, port-dependent filtering
    PortOnlyRestrictedCone,
    /// Independent binding, address-dependent filtering
    AddressRestrictedCone,
    /// Independent binding, address-and-port-dependent filtering
    PortRestrictedCone,
    /// Any dependent binding
    Symmetric,
}

impl NatType {
    /// Derive the category from discovery results
    ///
    /// `natted` is `None` when NAT presence was never established.
    #[must_use]
    pub fn classify(
        natted: Option<bool>,
        answered: bool,
        binding: DependencyType,
        filter: DependencyType,
    ) -> Self {
        match natted {
            None if !answered => return Self::UdpBlocked,
            Some(false) => return Self::Open,
            _ => {}
        }

        if binding == DependencyType::Undetermined || filter == DependencyType::Undetermined {
            return Self::NattedUnknown;
        }

        if binding != DependencyType::Independent {
            return Self::Symmetric;
        }

        match filter {
            DependencyType::Independent => Self::FullCone,
            DependencyType::PortDependent => Self::PortOnlyRestrictedCone,
            DependencyType::AddressDependent => Self::AddressRestrictedCone,
            _ => Self::PortRestrictedCone,
        }
    }

    /// Human readable name
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::UdpBlocked => "UDP blocked",
            Self::Open => "Open to internet",
            Self::NattedUnknown => "Natted (details not available)",
            Self::FullCone => "Full cone",
            Self::PortOnlyRestrictedCone => "Port-only-restricted cone",
            Self::AddressRestrictedCone => "Address-restricted cone",
            Self::PortRestrictedCone => "Port-restricted cone",
            Self::Symmetric => "Symmetric",
        }
    }
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
