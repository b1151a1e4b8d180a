//! Fallback target selection.
//!
//! When an ingress handshake fails with replayable bytes, or an advanced
//! layer rejects a request, the listener's fallback table decides where
//! those bytes go and whether a PROXY protocol preamble announces the
//! original client. H2-shaped failures take a different road entirely:
//! the captured request is replayed over a cached H2C transport
//! (`lm_transport::h2c`).

use crate::address::Address;
use std::collections::HashMap;

/// One fallback destination.
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackEntry {
    pub target: Address,
    /// PROXY protocol version to emit downstream: 0 none, 1 text,
    /// 2 binary.
    pub xver: u8,
}

/// Per-listener fallback table: an optional default plus per-path
/// overrides (the path comes from the failed WS/gRPC request).
#[derive(Debug, Clone, Default)]
pub struct FallbackTable {
    pub default: Option<FallbackEntry>,
    pub by_path: HashMap<String, FallbackEntry>,
}

impl FallbackTable {
    pub fn with_default(target: Address, xver: u8) -> Self {
        Self {
            default: Some(FallbackEntry { target, xver }),
            by_path: HashMap::new(),
        }
    }

    pub fn insert_path(&mut self, path: impl Into<String>, target: Address, xver: u8) {
        self.by_path
            .insert(path.into(), FallbackEntry { target, xver });
    }

    pub fn is_empty(&self) -> bool {
        self.default.is_none() && self.by_path.is_empty()
    }

    /// Select the fallback for a failed ingress. Path-specific entries
    /// win over the default; no entry means the connection just closes.
    pub fn check(&self, path: Option<&str>) -> Option<&FallbackEntry> {
        if let Some(p) = path {
            if let Some(e) = self.by_path.get(p) {
                return Some(e);
            }
        }
        self.default.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Network;

    fn addr(s: &str) -> Address {
        Address::parse(Network::Tcp, s).unwrap()
    }

    #[test]
    fn path_entry_wins_over_default() {
        let mut t = FallbackTable::with_default(addr("127.0.0.1:8080"), 0);
        t.insert_path("/secret", addr("127.0.0.1:9090"), 2);

        let def = t.check(None).unwrap();
        assert_eq!(def.target, addr("127.0.0.1:8080"));
        assert_eq!(def.xver, 0);

        let hit = t.check(Some("/secret")).unwrap();
        assert_eq!(hit.target, addr("127.0.0.1:9090"));
        assert_eq!(hit.xver, 2);

        let miss = t.check(Some("/other")).unwrap();
        assert_eq!(miss.target, addr("127.0.0.1:8080"));
    }

    #[test]
    fn empty_table_means_close() {
        let t = FallbackTable::default();
        assert!(t.is_empty());
        assert!(t.check(Some("/x")).is_none());
    }
}
