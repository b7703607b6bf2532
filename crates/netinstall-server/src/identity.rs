//! Boot identities: which vendor class identifier each assigned address
//! declared in its boot request.
//!
//! The block-transfer server looks the requesting address up here to decide
//! which boot file to serve. Entries are never removed.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use tokio::sync::RwLock;

/// Vendor class identifier declared by the device at each assigned address.
#[derive(Debug, Default)]
pub struct BootIdentityTable {
    entries: RwLock<HashMap<Ipv4Addr, String>>,
}

impl BootIdentityTable {
    /// Creates a new, empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or overwrite) the identifier declared for `addr`.
    pub async fn record(&self, addr: Ipv4Addr, identifier: impl Into<String>) {
        self.entries.write().await.insert(addr, identifier.into());
    }

    pub async fn lookup(&self, addr: Ipv4Addr) -> Option<String> {
        self.entries.read().await.get(&addr).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_and_overwrite() {
        let table = BootIdentityTable::new();
        let addr = Ipv4Addr::new(192, 168, 88, 20);
        assert!(table.lookup(addr).await.is_none());

        table.record(addr, "mmips").await;
        assert_eq!(table.lookup(addr).await.as_deref(), Some("mmips"));

        table.record(addr, "arm64").await;
        assert_eq!(table.lookup(addr).await.as_deref(), Some("arm64"));
        assert_eq!(table.len().await, 1);
    }
}
