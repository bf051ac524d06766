//! Address Classifier
//!
//! Recognizes an address string as a Fibre Channel WWPN, an Ethernet MAC or
//! an iSCSI IQN and normalizes it to one canonical textual form, so that
//! addresses coming from the config file, from the host and from drivers can
//! be compared directly.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

// =============================================================================
// Address Kind
// =============================================================================

/// The addressing scheme an address belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressKind {
    Wwpn,
    Mac,
    Iqn,
}

impl fmt::Display for AddressKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressKind::Wwpn => write!(f, "WWPN"),
            AddressKind::Mac => write!(f, "MAC"),
            AddressKind::Iqn => write!(f, "IQN"),
        }
    }
}

// =============================================================================
// Normalization
// =============================================================================

/// Collect hex digits split by any of `separators`, checking group layout.
///
/// `layouts` lists the accepted (group count, digits per group) pairs for
/// separated input; bare input must have exactly `digits` hex characters.
fn hex_groups(
    input: &str,
    separators: &[char],
    layouts: &[(usize, usize)],
    digits: usize,
) -> Option<String> {
    let s = input.trim().to_ascii_lowercase();
    let s = s.strip_prefix("0x").unwrap_or(&s);

    let hex: String = if s.contains(separators) {
        let parts: Vec<&str> = s.split(separators).collect();
        let layout_ok = layouts
            .iter()
            .any(|(count, width)| parts.len() == *count && parts.iter().all(|p| p.len() == *width));
        if !layout_ok {
            return None;
        }
        parts.concat()
    } else {
        s.to_string()
    };

    if hex.len() != digits || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    let pairs: Vec<&str> = (0..digits)
        .step_by(2)
        .map(|i| &hex[i..i + 2])
        .collect();
    Some(pairs.join(":"))
}

/// Normalize a WWPN to lowercase colon form (`10:00:00:00:c9:95:2f:de`).
///
/// Accepts colon or dash separated pairs, bare hex and an optional `0x` prefix.
pub fn standardize_wwpn(wwpn: &str) -> Option<String> {
    hex_groups(wwpn, &[':', '-'], &[(8, 2)], 16)
}

/// Normalize a MAC address to lowercase colon form (`08:00:27:05:37:71`).
///
/// Accepts colon or dash separated pairs, dotted quads (`0800.2705.3771`)
/// and bare hex.
pub fn standardize_mac(mac: &str) -> Option<String> {
    hex_groups(mac, &[':', '-', '.'], &[(6, 2), (3, 4)], 12)
}

fn iqn_regex() -> &'static Regex {
    static IQN: OnceLock<Regex> = OnceLock::new();
    IQN.get_or_init(|| {
        Regex::new(r"^iqn\.\d{4}-\d{2}\.[^\s]+$").expect("IQN pattern is valid")
    })
}

/// Check if a string is a syntactically valid iSCSI qualified name
pub fn is_iqn(value: &str) -> bool {
    iqn_regex().is_match(value.trim())
}

pub fn is_wwpn(value: &str) -> bool {
    standardize_wwpn(value).is_some()
}

pub fn is_mac(value: &str) -> bool {
    standardize_mac(value).is_some()
}

// =============================================================================
// Address
// =============================================================================

/// A normalized SAN address
///
/// Ordering groups addresses by kind, then by canonical text.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Address {
    Wwpn(String),
    Mac(String),
    Iqn(String),
}

impl Address {
    /// Classify and normalize `value`, trying WWPN, then MAC, then IQN.
    pub fn parse(value: &str) -> Option<Self> {
        if let Some(wwpn) = standardize_wwpn(value) {
            return Some(Address::Wwpn(wwpn));
        }
        if let Some(mac) = standardize_mac(value) {
            return Some(Address::Mac(mac));
        }
        if is_iqn(value) {
            return Some(Address::Iqn(value.trim().to_string()));
        }
        None
    }

    pub fn wwpn(value: &str) -> Option<Self> {
        standardize_wwpn(value).map(Address::Wwpn)
    }

    pub fn mac(value: &str) -> Option<Self> {
        standardize_mac(value).map(Address::Mac)
    }

    pub fn iqn(value: &str) -> Option<Self> {
        is_iqn(value).then(|| Address::Iqn(value.trim().to_string()))
    }

    pub fn kind(&self) -> AddressKind {
        match self {
            Address::Wwpn(_) => AddressKind::Wwpn,
            Address::Mac(_) => AddressKind::Mac,
            Address::Iqn(_) => AddressKind::Iqn,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Address::Wwpn(s) | Address::Mac(s) | Address::Iqn(s) => s,
        }
    }

    pub fn is_wwpn(&self) -> bool {
        matches!(self, Address::Wwpn(_))
    }

    pub fn is_mac(&self) -> bool {
        matches!(self, Address::Mac(_))
    }

    pub fn is_iqn(&self) -> bool {
        matches!(self, Address::Iqn(_))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Address {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::parse(s).ok_or_else(|| {
            crate::error::Error::InvalidArgument(format!("{} is not a valid WWPN/MAC/IQN", s))
        })
    }
}

impl TryFrom<String> for Address {
    type Error = crate::error::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(addr: Address) -> Self {
        match addr {
            Address::Wwpn(s) | Address::Mac(s) | Address::Iqn(s) => s,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wwpn_variants_normalize_to_one_form() {
        let canonical = "10:00:00:00:c9:95:2f:de";
        for variant in [
            "10:00:00:00:c9:95:2f:de",
            "10:00:00:00:C9:95:2F:DE",
            "10-00-00-00-c9-95-2f-de",
            "10000000c9952fde",
            "0x10000000c9952fde",
            "  10:00:00:00:c9:95:2f:de ",
        ] {
            assert_eq!(standardize_wwpn(variant).as_deref(), Some(canonical), "{}", variant);
        }
    }

    #[test]
    fn test_invalid_wwpns_rejected() {
        for bad in [
            "",
            "10:00:00:00:c9:95:2f",
            "10:00:00:00:c9:95:2f:de:01",
            "10:00:00:00:c9:95:2f:dg",
            "100:00:00:00:c9:95:2f:d",
            "iqn.1994-05.com.redhat:host1",
        ] {
            assert!(standardize_wwpn(bad).is_none(), "{}", bad);
        }
    }

    #[test]
    fn test_mac_variants() {
        let canonical = "08:00:27:05:37:71";
        assert_eq!(standardize_mac("08:00:27:05:37:71").as_deref(), Some(canonical));
        assert_eq!(standardize_mac("08-00-27-05-37-71").as_deref(), Some(canonical));
        assert_eq!(standardize_mac("0800.2705.3771").as_deref(), Some(canonical));
        assert_eq!(standardize_mac("080027053771").as_deref(), Some(canonical));
        assert!(standardize_mac("08:00:27:05:37").is_none());
        assert!(standardize_mac("0800.27053771").is_none());
    }

    #[test]
    fn test_iqn_syntax() {
        assert!(is_iqn("iqn.1994-05.com.redhat:st05"));
        assert!(is_iqn("iqn.2001-05.com.equallogic:0-8a0906-lun1"));
        assert!(!is_iqn("iqn.com.redhat"));
        assert!(!is_iqn("eui.02004567a425678d"));
        assert!(!is_iqn("st05_01"));
    }

    #[test]
    fn test_address_classification_order() {
        assert_eq!(
            Address::parse("10000000c9952fde"),
            Some(Address::Wwpn("10:00:00:00:c9:95:2f:de".into()))
        );
        assert_eq!(
            Address::parse("08:00:27:05:37:71"),
            Some(Address::Mac("08:00:27:05:37:71".into()))
        );
        assert_eq!(
            Address::parse("iqn.1994-05.com.redhat:st05").map(|a| a.kind()),
            Some(AddressKind::Iqn)
        );
        assert_eq!(Address::parse("not-an-address"), None);
    }

    #[test]
    fn test_address_serializes_as_plain_string() {
        let addr = Address::parse("10-00-00-00-c9-95-2f-de").unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"10:00:00:00:c9:95:2f:de\"");

        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
