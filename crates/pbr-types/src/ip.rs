//! Address family and IP prefix types with safe parsing.

use crate::ParseError;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Address family of a prefix or kernel rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Family {
    Ipv4,
    Ipv6,
}

impl Family {
    /// Byte width of an address of this family on the wire.
    pub const fn addr_len(&self) -> usize {
        match self {
            Family::Ipv4 => 4,
            Family::Ipv6 => 16,
        }
    }

    /// Largest valid prefix length for this family.
    pub const fn max_prefix_len(&self) -> u8 {
        match self {
            Family::Ipv4 => 32,
            Family::Ipv6 => 128,
        }
    }

    /// Family of an address.
    pub const fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::Ipv4,
            IpAddr::V6(_) => Family::Ipv6,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::Ipv4 => write!(f, "IPv4"),
            Family::Ipv6 => write!(f, "IPv6"),
        }
    }
}

/// An IP prefix in CIDR notation (e.g. 10.0.0.0/24 or 2001:db8::/32).
///
/// The address is stored exactly as given; two prefixes compare equal
/// only on exact address and length equality, not merely on covering
/// the same network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpPrefix {
    address: IpAddr,
    prefix_len: u8,
}

impl IpPrefix {
    /// Creates a new prefix, rejecting lengths beyond the family maximum.
    pub fn new(address: IpAddr, prefix_len: u8) -> Result<Self, ParseError> {
        let family = Family::of(&address);
        if prefix_len > family.max_prefix_len() {
            return Err(ParseError::InvalidPrefix(format!(
                "prefix length {} exceeds maximum {} for {}",
                prefix_len,
                family.max_prefix_len(),
                family
            )));
        }

        Ok(IpPrefix {
            address,
            prefix_len,
        })
    }

    pub const fn address(&self) -> IpAddr {
        self.address
    }

    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub const fn family(&self) -> Family {
        match self.address {
            IpAddr::V4(_) => Family::Ipv4,
            IpAddr::V6(_) => Family::Ipv6,
        }
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for IpPrefix {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_str, len_str) = s
            .rsplit_once('/')
            .ok_or_else(|| ParseError::InvalidPrefix(s.to_string()))?;

        let address: IpAddr = addr_str
            .parse()
            .map_err(|_| ParseError::InvalidAddress(addr_str.to_string()))?;
        let prefix_len: u8 = len_str
            .parse()
            .map_err(|_| ParseError::InvalidPrefix(s.to_string()))?;

        IpPrefix::new(address, prefix_len)
    }
}

impl Serialize for IpPrefix {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IpPrefix {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_family_widths() {
        assert_eq!(Family::Ipv4.addr_len(), 4);
        assert_eq!(Family::Ipv6.addr_len(), 16);
        assert_eq!(Family::Ipv4.max_prefix_len(), 32);
        assert_eq!(Family::Ipv6.max_prefix_len(), 128);
    }

    #[test]
    fn test_prefix_parse() {
        let prefix: IpPrefix = "10.0.0.0/24".parse().unwrap();
        assert_eq!(prefix.family(), Family::Ipv4);
        assert_eq!(prefix.prefix_len(), 24);

        let v6: IpPrefix = "2001:db8::/32".parse().unwrap();
        assert_eq!(v6.family(), Family::Ipv6);
        assert_eq!(v6.prefix_len(), 32);
    }

    #[test]
    fn test_prefix_display_round_trip() {
        let prefix: IpPrefix = "192.168.0.0/16".parse().unwrap();
        assert_eq!(prefix.to_string(), "192.168.0.0/16");
        assert_eq!(prefix.to_string().parse::<IpPrefix>().unwrap(), prefix);
    }

    #[test]
    fn test_invalid_prefix_length() {
        assert!("10.0.0.0/33".parse::<IpPrefix>().is_err());
        assert!("2001:db8::/129".parse::<IpPrefix>().is_err());
    }

    #[test]
    fn test_missing_length() {
        assert!("10.0.0.0".parse::<IpPrefix>().is_err());
    }

    #[test]
    fn test_exact_equality_not_network_equality() {
        // Same covered network, different written address: distinct values.
        let a: IpPrefix = "10.0.0.0/24".parse().unwrap();
        let b: IpPrefix = "10.0.0.1/24".parse().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_serde_string_form() {
        let prefix: IpPrefix = "10.1.0.0/16".parse().unwrap();
        let json = serde_json::to_string(&prefix).unwrap();
        assert_eq!(json, "\"10.1.0.0/16\"");
        let back: IpPrefix = serde_json::from_str(&json).unwrap();
        assert_eq!(back, prefix);
    }
}
