//! Bandwidth quota gate — post-paid rolling windows against the store.
//!
//! The gate is advisory: a store failure degrades to allow, so transient
//! storage trouble never halts forwarding.

use std::sync::Arc;

use pairlink_core::types::code;

use crate::store::Store;

pub const DAILY_QUOTA_BYTES: i64 = 500 * 1024 * 1024;
pub const MONTHLY_QUOTA_BYTES: i64 = 10 * 1024 * 1024 * 1024;

#[derive(Clone)]
pub struct QuotaGate {
    store: Arc<dyn Store>,
}

impl QuotaGate {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Returns the breach code if a quota is exceeded. Daily takes
    /// precedence over monthly; store errors fail open.
    pub fn check(&self, token: &str) -> Option<&'static str> {
        let daily = match self.store.get_daily_usage(token) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "quota check failed, allowing");
                return None;
            }
        };
        if daily >= DAILY_QUOTA_BYTES {
            return Some(code::DAILY_QUOTA_EXCEEDED);
        }

        let monthly = match self.store.get_monthly_usage(token) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "quota check failed, allowing");
                return None;
            }
        };
        if monthly >= MONTHLY_QUOTA_BYTES {
            return Some(code::MONTHLY_QUOTA_EXCEEDED);
        }

        None
    }

    /// Append a ledger sample for a forwarded frame.
    pub fn record(&self, token: &str, bytes: i64) -> Result<(), crate::store::StoreError> {
        self.store.record_bytes(token, bytes)
    }

    pub fn daily_usage(&self, token: &str) -> Option<i64> {
        match self.store.get_daily_usage(token) {
            Ok(n) => Some(n),
            Err(e) => {
                tracing::warn!(error = %e, "daily usage lookup failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{SqliteStore, StoreError, TokenInfo};

    fn gate() -> (QuotaGate, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        (QuotaGate::new(store.clone()), store)
    }

    #[test]
    fn under_quota_allows() {
        let (gate, store) = gate();
        store.create_token("t").unwrap();
        store.record_bytes("t", 1024).unwrap();
        assert_eq!(gate.check("t"), None);
    }

    #[test]
    fn daily_breach_reported_first() {
        let (gate, store) = gate();
        store.create_token("t").unwrap();
        store.record_bytes("t", DAILY_QUOTA_BYTES).unwrap();
        // This also pushes monthly usage past nothing close to its cap,
        // so the daily code must win.
        assert_eq!(gate.check("t"), Some(code::DAILY_QUOTA_EXCEEDED));
    }

    #[test]
    fn record_appends_to_ledger() {
        let (gate, store) = gate();
        store.create_token("t").unwrap();
        gate.record("t", 123).unwrap();
        assert_eq!(gate.daily_usage("t"), Some(123));
    }

    /// Store that fails every read. Quota checks must degrade to allow.
    struct BrokenStore;

    impl Store for BrokenStore {
        fn create_token(&self, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Poisoned)
        }
        fn delete_token(&self, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Poisoned)
        }
        fn token_exists(&self, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::Poisoned)
        }
        fn list_tokens(&self) -> Result<Vec<TokenInfo>, StoreError> {
            Err(StoreError::Poisoned)
        }
        fn record_bytes(&self, _: &str, _: i64) -> Result<(), StoreError> {
            Err(StoreError::Poisoned)
        }
        fn get_daily_usage(&self, _: &str) -> Result<i64, StoreError> {
            Err(StoreError::Poisoned)
        }
        fn get_monthly_usage(&self, _: &str) -> Result<i64, StoreError> {
            Err(StoreError::Poisoned)
        }
        fn prune_ledger(&self, _: u32) -> Result<u64, StoreError> {
            Err(StoreError::Poisoned)
        }
    }

    #[test]
    fn store_failure_fails_open() {
        let gate = QuotaGate::new(Arc::new(BrokenStore));
        assert_eq!(gate.check("t"), None);
        assert_eq!(gate.daily_usage("t"), None);
    }
}
