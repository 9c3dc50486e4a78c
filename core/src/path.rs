//! BIP-32/44 derivation paths, enumeration strategy and page arithmetic.

use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{BridgeError, Result};

/// Hardened-derivation flag bit.
pub const HARDENED: u32 = 0x8000_0000;

/// Largest index a single path component may carry (hardened or not).
pub const MAX_CHILD_INDEX: u32 = 0x7fff_ffff;

/// Paths used for address enumeration need purpose/coin/account/change/index.
pub const MIN_ENUMERATION_DEPTH: usize = 5;

/// Deepest path the device apps accept.
pub const MAX_DEPTH: usize = 10;

/// Addresses per page.
pub const PAGE_SIZE: u32 = 5;

/// Position of the account component in a BIP-44 path.
const ACCOUNT_SLOT: usize = 2;

/// Number of leading components that are implicitly hardened in the
/// plain-index convention (`44,714,0,0,0`).
const IMPLICIT_HARDENED: usize = 3;

/// A derivation path as the device expects it: raw u32 components with the
/// hardened bit set where applicable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DerivationPath(Vec<u32>);

impl DerivationPath {
    pub fn new(components: Vec<u32>) -> Self {
        Self(components)
    }

    /// Build from plain indices where the first three (purpose, coin,
    /// account) are hardened implicitly.
    pub fn from_plain_indices(indices: &[u32]) -> Result<Self> {
        check_depth(indices.len(), || format!("{indices:?}"))?;
        let mut components = Vec::with_capacity(indices.len());
        for (position, index) in indices.iter().enumerate() {
            if *index > MAX_CHILD_INDEX {
                return Err(BridgeError::InvalidPath(format!(
                    "component {position} out of range: {index}"
                )));
            }
            if position < IMPLICIT_HARDENED {
                components.push(index | HARDENED);
            } else {
                components.push(*index);
            }
        }
        Ok(Self(components))
    }

    /// Parse a comma-separated plain-index list (`44,714,0,0,0`).
    pub fn parse_plain_list(list: &str) -> Result<Self> {
        let indices = list
            .split(',')
            .map(|segment| {
                segment
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| BridgeError::InvalidPath(list.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::from_plain_indices(&indices)
    }

    pub fn components(&self) -> &[u32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Plain indices with the hardened bit stripped.
    pub fn plain_indices(&self) -> Vec<u32> {
        self.0.iter().map(|c| c & MAX_CHILD_INDEX).collect()
    }

    /// Comma-separated plain indices, the form Cosmos-family frames expect.
    pub fn to_plain_list(&self) -> String {
        self.plain_indices()
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn require_depth(&self, min: usize) -> Result<()> {
        if self.0.len() < min {
            return Err(BridgeError::InvalidPath(format!(
                "{self} has {} components, need at least {min}",
                self.0.len()
            )));
        }
        Ok(())
    }

    /// Plain value of the last component.
    pub fn last_index(&self) -> Option<u32> {
        self.0.last().map(|c| c & MAX_CHILD_INDEX)
    }

    /// Copy of this path with the last component replaced, keeping its
    /// hardened flag. `None` if the path is empty or `index` is out of range.
    pub fn with_last_index(&self, index: u64) -> Option<Self> {
        let index = u32::try_from(index).ok().filter(|i| *i <= MAX_CHILD_INDEX)?;
        let mut components = self.0.clone();
        let last = components.last_mut()?;
        *last = (*last & HARDENED) | index;
        Some(Self(components))
    }

    /// Append a non-hardened child. `None` if `index` is out of range or the
    /// path is already at [`MAX_DEPTH`].
    pub fn child(&self, index: u64) -> Option<Self> {
        let index = u32::try_from(index).ok().filter(|i| *i <= MAX_CHILD_INDEX)?;
        if self.0.len() >= MAX_DEPTH {
            return None;
        }
        let mut components = self.0.clone();
        components.push(index);
        Some(Self(components))
    }

    /// Count byte followed by big-endian components (Ethereum app layout).
    pub fn to_bytes_be(&self) -> Result<Vec<u8>> {
        self.encode(u32::to_be_bytes)
    }

    /// Count byte followed by little-endian components (Binance-Chain app layout).
    pub fn to_bytes_le(&self) -> Result<Vec<u8>> {
        self.encode(u32::to_le_bytes)
    }

    fn encode(&self, component_bytes: fn(u32) -> [u8; 4]) -> Result<Vec<u8>> {
        let count = check_depth(self.0.len(), || self.to_string())?;
        let mut out = Vec::with_capacity(1 + self.0.len() * 4);
        out.push(count);
        for component in &self.0 {
            out.extend_from_slice(&component_bytes(*component));
        }
        Ok(out)
    }

    /// `m/`-prefixed BIP-32 form.
    pub fn to_bip32_string(&self) -> String {
        format!("m/{self}")
    }
}

/// Ledger form: no `m/` prefix, `'` marks hardened components.
impl fmt::Display for DerivationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, component) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            let index = component & MAX_CHILD_INDEX;
            if component & HARDENED != 0 {
                write!(f, "{index}'")?;
            } else {
                write!(f, "{index}")?;
            }
        }
        Ok(())
    }
}

impl FromStr for DerivationPath {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let body = trimmed
            .strip_prefix("m/")
            .or_else(|| trimmed.strip_prefix("M/"))
            .unwrap_or(trimmed);
        if body.is_empty() || body == "m" {
            return Err(BridgeError::InvalidPath(s.to_string()));
        }

        let mut components = Vec::new();
        for segment in body.split('/') {
            let (digits, hardened) = match segment
                .strip_suffix('\'')
                .or_else(|| segment.strip_suffix('h'))
                .or_else(|| segment.strip_suffix('H'))
            {
                Some(digits) => (digits, true),
                None => (segment, false),
            };
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(BridgeError::InvalidPath(s.to_string()));
            }
            let index: u32 = digits
                .parse()
                .map_err(|_| BridgeError::InvalidPath(s.to_string()))?;
            if index > MAX_CHILD_INDEX {
                return Err(BridgeError::InvalidPath(s.to_string()));
            }
            components.push(if hardened { index | HARDENED } else { index });
        }
        check_depth(components.len(), || s.to_string())?;
        Ok(Self(components))
    }
}

/// Component count as the single count byte the apps expect.
fn check_depth(depth: usize, describe: impl FnOnce() -> String) -> Result<u8> {
    if depth > MAX_DEPTH {
        return Err(BridgeError::InvalidPath(format!(
            "{} has {depth} components, the device accepts at most {MAX_DEPTH}",
            describe()
        )));
    }
    // depth <= MAX_DEPTH
    Ok(depth as u8)
}

impl Serialize for DerivationPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DerivationPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Split a path string into plain numeric indices, dropping the `m` marker and
/// hardening markers. Fails if a segment is not numeric or there are fewer
/// than `min_len` segments.
pub fn to_index_array(path: &str, min_len: usize) -> Result<Vec<u32>> {
    let parsed: DerivationPath = path.parse()?;
    parsed.require_depth(min_len)?;
    Ok(parsed.plain_indices())
}

/// How a base path is enumerated into a page of addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enumeration {
    /// Ledger-Live: one hardened account per slot, fixed `0/0` suffix.
    FixedAccount,
    /// Sequential non-hardened children under the base path.
    Legacy,
}

/// Per-chain path rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathCodec {
    canonical: DerivationPath,
}

impl PathCodec {
    /// `canonical` is the chain's Ledger-Live template, e.g. `44'/60'/0'/0/0`.
    pub fn new(canonical: DerivationPath) -> Self {
        Self { canonical }
    }

    pub fn canonical(&self) -> &DerivationPath {
        &self.canonical
    }

    /// True only for the exact canonical Ledger-Live path.
    pub fn is_fixed_account_path(&self, base: &DerivationPath) -> bool {
        *base == self.canonical
    }

    pub fn enumeration(&self, base: &DerivationPath) -> Enumeration {
        if self.is_fixed_account_path(base) {
            Enumeration::FixedAccount
        } else {
            Enumeration::Legacy
        }
    }

    /// Path of the `index`-th address under `base`. `None` once the index
    /// no longer fits in a path component, which callers treat as end of page.
    pub fn path_for_index(&self, base: &DerivationPath, index: u64) -> Option<DerivationPath> {
        match self.enumeration(base) {
            Enumeration::FixedAccount => {
                let index = u32::try_from(index).ok().filter(|i| *i <= MAX_CHILD_INDEX)?;
                let mut components = base.components().to_vec();
                *components.get_mut(ACCOUNT_SLOT)? = index | HARDENED;
                Some(DerivationPath::new(components))
            }
            Enumeration::Legacy => base.child(index),
        }
    }
}

/// 1-based page counter with a fixed page size.
#[derive(Debug, Clone)]
pub struct Pager {
    page: u32,
    per_page: u32,
}

impl Pager {
    pub fn new(per_page: u32) -> Self {
        Self { page: 0, per_page }
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn per_page(&self) -> u32 {
        self.per_page
    }

    pub fn first(&mut self) -> Range<u64> {
        self.page = 0;
        self.advance(1)
    }

    pub fn next(&mut self) -> Range<u64> {
        self.advance(1)
    }

    pub fn previous(&mut self) -> Range<u64> {
        self.advance(-1)
    }

    fn advance(&mut self, delta: i64) -> Range<u64> {
        let page = (i64::from(self.page) + delta).max(1);
        self.page = u32::try_from(page).unwrap_or(u32::MAX);
        let from = u64::from(self.page - 1) * u64::from(self.per_page);
        from..from + u64::from(self.per_page)
    }
}

impl Default for Pager {
    fn default() -> Self {
        Self::new(PAGE_SIZE)
    }
}
