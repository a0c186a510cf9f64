//! Hardware (MAC) addresses and the address sets compared by the
//! failover logic.

use std::{collections::BTreeSet, fmt::Display, str::FromStr};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HwAddrParseError {
    #[error("hardware address {0:?} does not consist of 6 octets")]
    WrongLength(String),
    #[error("hardware address {input:?} contains invalid octet {octet:?}")]
    InvalidOctet { input: String, octet: String },
}

/// An EUI-48 address as used by Ethernet interfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HwAddr(pub [u8; 6]);

impl HwAddr {
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }
}

impl FromStr for HwAddr {
    type Err = HwAddrParseError;

    /// Accepts `00:1a:2B:3c:4d:5e` and `00-1A-2B-3C-4D-5E`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let separator = if s.contains('-') { '-' } else { ':' };
        let parts: Vec<&str> = s.split(separator).collect();
        if parts.len() != 6 {
            return Err(HwAddrParseError::WrongLength(s.into()));
        }
        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(&parts) {
            if part.is_empty() || part.len() > 2 || !part.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(HwAddrParseError::InvalidOctet {
                    input: s.into(),
                    octet: (*part).into(),
                });
            }
            *octet = u8::from_str_radix(part, 16).expect("checked to be hex digits");
        }
        Ok(Self(octets))
    }
}

impl Display for HwAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

pub type AddressSet = BTreeSet<HwAddr>;

fn fmt_set(set: &AddressSet, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str("{")?;
    for (i, addr) in set.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{addr}")?;
    }
    f.write_str("}")
}

/// The addresses of this host's own interfaces. Computed once at
/// startup and never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity(AddressSet);

impl LocalIdentity {
    /// Returns `None` for an empty set: comparing against no local
    /// addresses would make every host look remote.
    pub fn new(addresses: AddressSet) -> Option<Self> {
        if addresses.is_empty() {
            None
        } else {
            Some(Self(addresses))
        }
    }

    pub fn addresses(&self) -> &AddressSet {
        &self.0
    }

    pub fn contains(&self, addr: &HwAddr) -> bool {
        self.0.contains(addr)
    }
}

impl Display for LocalIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt_set(&self.0, f)
    }
}

/// The addresses that answered one probe of the master's network
/// identity. Empty if nothing replied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MasterProbeResult(AddressSet);

impl MasterProbeResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn addresses(&self) -> &AddressSet {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<HwAddr> for MasterProbeResult {
    fn from_iter<T: IntoIterator<Item = HwAddr>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Display for MasterProbeResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt_set(&self.0, f)
    }
}
