//! Idempotency layer: per-key distributed locking plus at-most-once result
//! caching, keyed by the merchant-supplied idempotency key.
//!
//! Concurrent callers for the same key observe exactly one execution: the
//! first acquires the lock and stores a result; the rest either hit the cache
//! on retry or back off without producing a duplicate mutation.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::debug;

use acquira_core::constants::{
    IDEMPOTENCY_ENTRY_TTL_SECS, IDEMPOTENCY_LOCK_RETRIES, IDEMPOTENCY_LOCK_RETRY_DELAY_MS,
    IDEMPOTENCY_LOCK_TTL_SECS,
};
use acquira_core::error::GatewayError;
use acquira_core::records::IdempotencyEntry;
use acquira_core::types::{new_prefixed_id, now_ts};
use acquira_store::GatewayDb;

/// Outcome of a lock-acquisition attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum LockOutcome {
    /// This caller holds the lock and must run the operation.
    Acquired,
    /// Another caller already finished; here is its serialized response.
    CachedResult(String),
}

/// Hash a request payload so key reuse with a different body is detectable.
pub fn request_fingerprint(payload: &str) -> String {
    hex::encode(Sha256::digest(payload.as_bytes()))
}

pub struct IdempotencyStore {
    db: Arc<GatewayDb>,
    /// Distinguishes this process's locks; useful in logs, not for safety.
    owner: String,
}

impl IdempotencyStore {
    pub fn new(db: Arc<GatewayDb>) -> Self {
        Self { db, owner: new_prefixed_id("idm_") }
    }

    /// Cached result for `key`, if a completed execution with the same
    /// payload exists. A differing payload is a conflict.
    pub fn get_cached(&self, key: &str, fingerprint: &str) -> Result<Option<String>, GatewayError> {
        let now = now_ts();
        match self.db.get_idempotency(key)? {
            Some(entry) if entry.expires_at > now => {
                if let Some(json) = &entry.response_json {
                    self.check_fingerprint(&entry, fingerprint)?;
                    return Ok(Some(json.clone()));
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Acquire the per-key lock, retrying on contention. Abandons the wait
    /// early when the competing execution stores its result.
    pub async fn acquire_lock(
        &self,
        key: &str,
        fingerprint: &str,
    ) -> Result<LockOutcome, GatewayError> {
        for attempt in 0..=IDEMPOTENCY_LOCK_RETRIES {
            let now = now_ts();
            let current = self.db.get_idempotency(key)?;

            match &current {
                Some(entry) if entry.expires_at > now => {
                    if let Some(json) = &entry.response_json {
                        self.check_fingerprint(entry, fingerprint)?;
                        return Ok(LockOutcome::CachedResult(json.clone()));
                    }
                    let lock_live = entry.lock_expires_at.map(|t| t > now).unwrap_or(false);
                    if lock_live {
                        // Someone else is executing; wait and re-check.
                        if attempt < IDEMPOTENCY_LOCK_RETRIES {
                            tokio::time::sleep(Duration::from_millis(
                                IDEMPOTENCY_LOCK_RETRY_DELAY_MS,
                            ))
                            .await;
                        }
                        continue;
                    }
                    // Stale lock; take it over atomically.
                    if self.db.cas_idempotency(key, Some(entry), &self.lock_entry(key, fingerprint, now))? {
                        debug!(key, owner = %self.owner, "took over stale idempotency lock");
                        return Ok(LockOutcome::Acquired);
                    }
                }
                Some(entry) => {
                    // Entry expired wholesale; replace it.
                    if self.db.cas_idempotency(key, Some(entry), &self.lock_entry(key, fingerprint, now))? {
                        return Ok(LockOutcome::Acquired);
                    }
                }
                None => {
                    if self.db.cas_idempotency(key, None, &self.lock_entry(key, fingerprint, now))? {
                        debug!(key, owner = %self.owner, "idempotency lock acquired");
                        return Ok(LockOutcome::Acquired);
                    }
                }
            }
            // CAS raced; loop immediately with fresh state.
        }
        Err(GatewayError::IdempotencyInFlight)
    }

    /// Store the serialized response and clear the lock. The entry lives for
    /// 24 hours.
    pub fn store_result(
        &self,
        key: &str,
        response_json: &str,
        fingerprint: &str,
    ) -> Result<(), GatewayError> {
        let now = now_ts();
        let entry = IdempotencyEntry {
            key: key.to_string(),
            lock_owner: None,
            lock_expires_at: None,
            response_json: Some(response_json.to_string()),
            request_fingerprint: Some(fingerprint.to_string()),
            created_at: now,
            expires_at: now + IDEMPOTENCY_ENTRY_TTL_SECS,
        };
        self.db.put_idempotency(&entry)
    }

    /// Drop the lock without storing a result (the operation failed before
    /// producing a cacheable response). Only the owner's lock is released.
    pub fn release_lock(&self, key: &str) -> Result<(), GatewayError> {
        if let Some(entry) = self.db.get_idempotency(key)? {
            if entry.response_json.is_none() && entry.lock_owner.as_deref() == Some(self.owner.as_str()) {
                self.db.remove_idempotency(key)?;
            }
        }
        Ok(())
    }

    fn lock_entry(&self, key: &str, fingerprint: &str, now: i64) -> IdempotencyEntry {
        IdempotencyEntry {
            key: key.to_string(),
            lock_owner: Some(self.owner.clone()),
            lock_expires_at: Some(now + IDEMPOTENCY_LOCK_TTL_SECS),
            response_json: None,
            request_fingerprint: Some(fingerprint.to_string()),
            created_at: now,
            expires_at: now + IDEMPOTENCY_ENTRY_TTL_SECS,
        }
    }

    fn check_fingerprint(
        &self,
        entry: &IdempotencyEntry,
        fingerprint: &str,
    ) -> Result<(), GatewayError> {
        match &entry.request_fingerprint {
            Some(stored) if stored != fingerprint => Err(GatewayError::IdempotencyPayloadMismatch),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> IdempotencyStore {
        IdempotencyStore::new(Arc::new(GatewayDb::open_temporary().unwrap()))
    }

    #[tokio::test]
    async fn first_caller_acquires_then_result_is_cached() {
        let s = store();
        let fp = request_fingerprint("{\"amount\":\"100.00\"}");

        assert_eq!(s.acquire_lock("key-1", &fp).await.unwrap(), LockOutcome::Acquired);
        s.store_result("key-1", "{\"payment_id\":\"pay_x\"}", &fp).unwrap();

        match s.acquire_lock("key-1", &fp).await.unwrap() {
            LockOutcome::CachedResult(json) => assert_eq!(json, "{\"payment_id\":\"pay_x\"}"),
            other => panic!("expected cached result, got {other:?}"),
        }
        assert_eq!(
            s.get_cached("key-1", &fp).unwrap().as_deref(),
            Some("{\"payment_id\":\"pay_x\"}")
        );
    }

    #[tokio::test]
    async fn same_key_different_payload_is_a_conflict() {
        let s = store();
        let fp_a = request_fingerprint("body-a");
        let fp_b = request_fingerprint("body-b");

        assert_eq!(s.acquire_lock("key-2", &fp_a).await.unwrap(), LockOutcome::Acquired);
        s.store_result("key-2", "{}", &fp_a).unwrap();

        let err = s.acquire_lock("key-2", &fp_b).await.unwrap_err();
        assert!(matches!(err, GatewayError::IdempotencyPayloadMismatch));
    }

    #[tokio::test]
    async fn concurrent_acquirers_admit_exactly_one() {
        let db = Arc::new(GatewayDb::open_temporary().unwrap());
        let fp = request_fingerprint("payload");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let db = Arc::clone(&db);
            let fp = fp.clone();
            handles.push(tokio::spawn(async move {
                let s = IdempotencyStore::new(db);
                matches!(s.acquire_lock("key-3", &fp).await, Ok(LockOutcome::Acquired))
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1, "exactly one caller may hold the lock");
    }

    #[tokio::test]
    async fn release_allows_reacquisition() {
        let s = store();
        let fp = request_fingerprint("p");
        assert_eq!(s.acquire_lock("key-4", &fp).await.unwrap(), LockOutcome::Acquired);
        s.release_lock("key-4").unwrap();
        assert_eq!(s.acquire_lock("key-4", &fp).await.unwrap(), LockOutcome::Acquired);
    }

    #[tokio::test]
    async fn waiter_exhausts_retries_while_lock_is_held() {
        let db = Arc::new(GatewayDb::open_temporary().unwrap());
        let holder = IdempotencyStore::new(Arc::clone(&db));
        let waiter = IdempotencyStore::new(db);
        let fp = request_fingerprint("p");

        assert_eq!(holder.acquire_lock("key-5", &fp).await.unwrap(), LockOutcome::Acquired);
        let err = waiter.acquire_lock("key-5", &fp).await.unwrap_err();
        assert!(matches!(err, GatewayError::IdempotencyInFlight));
    }
}
