//! At-most-once client bookkeeping: (client_id, call_id) → reply cell.
//!
//! The first submission for a key reserves an entry; every retry that
//! arrives while the entry is pending or completed-OK is answered from the
//! entry's reply cell, so any two completed submissions with the same key
//! observe the identical reply. Entries are reaped by TTL or capacity
//! pressure.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use tokio::sync::watch;

use crate::protocol::ClientId;
use crate::protocol::ClientReply;
use crate::Result;
use crate::TransportError;

pub type CacheKey = (ClientId, u64);

/// One reservation in the retry cache. Clones share the reply cell.
#[derive(Clone)]
pub struct CacheEntry {
    inner: Arc<CacheEntryInner>,
}

struct CacheEntryInner {
    key: CacheKey,
    failed: AtomicBool,
    reply_tx: watch::Sender<Option<ClientReply>>,
}

impl CacheEntry {
    fn new(key: CacheKey) -> Self {
        let (reply_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(CacheEntryInner {
                key,
                failed: AtomicBool::new(false),
                reply_tx,
            }),
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.inner.key
    }

    pub fn is_done(&self) -> bool {
        self.inner.reply_tx.borrow().is_some()
    }

    pub fn is_failed(&self) -> bool {
        self.inner.failed.load(Ordering::Acquire)
    }

    pub fn is_completed_ok(&self) -> bool {
        self.is_done() && !self.is_failed()
    }

    /// Completes the entry from an apply-loop result; a non-success reply
    /// marks the entry failed so a later retry may re-execute.
    pub fn update_result(&self, reply: ClientReply) {
        if !reply.success {
            self.inner.failed.store(true, Ordering::Release);
        }
        let _ = self.inner.reply_tx.send(Some(reply));
    }

    /// Fails the entry before it ever reached the log.
    pub fn fail_with_reply(&self, reply: ClientReply) {
        self.inner.failed.store(true, Ordering::Release);
        let _ = self.inner.reply_tx.send(Some(reply));
    }

    /// Resolves once the entry completes; replayed replies are clones of
    /// the one stored reply.
    pub async fn reply(&self) -> Result<ClientReply> {
        let mut rx = self.inner.reply_tx.subscribe();
        let value = rx
            .wait_for(|r| r.is_some())
            .await
            .map_err(|e| TransportError::ChannelClosed(e.to_string()))?;
        Ok(value.clone().expect("guarded by wait_for"))
    }

    /// Immediate read of a completed reply.
    pub fn completed_reply(&self) -> Option<ClientReply> {
        self.inner.reply_tx.borrow().clone()
    }
}

pub struct CacheQueryResult {
    pub entry: CacheEntry,
    /// True when a prior attempt is pending or completed OK; the caller
    /// must answer from the entry instead of re-executing.
    pub is_retry: bool,
}

pub struct RetryCache {
    cache: Cache<CacheKey, CacheEntry>,
}

impl RetryCache {
    pub fn new(expiry: Duration, capacity: u64) -> Self {
        Self {
            cache: Cache::builder()
                .time_to_live(expiry)
                .max_capacity(capacity)
                .build(),
        }
    }

    /// Looks up the key for a new client submission. Failed entries do not
    /// count as retries; they are replaced with a fresh reservation.
    pub fn query(&self, client_id: ClientId, call_id: u64) -> CacheQueryResult {
        let key = (client_id, call_id);
        if let Some(entry) = self.cache.get(&key) {
            if !entry.is_failed() {
                return CacheQueryResult { entry, is_retry: true };
            }
        }
        let entry = CacheEntry::new(key.clone());
        self.cache.insert(key, entry.clone());
        CacheQueryResult { entry, is_retry: false }
    }

    /// Apply-path lookup; creates the entry when this peer never saw the
    /// original submission (follower replay after a snapshot, leader
    /// change).
    pub fn get_or_create(&self, client_id: ClientId, call_id: u64) -> CacheEntry {
        let key = (client_id, call_id);
        if let Some(entry) = self.cache.get(&key) {
            if entry.is_failed() {
                // A failed reservation must not swallow the new result.
                let fresh = CacheEntry::new(key.clone());
                self.cache.insert(key, fresh.clone());
                return fresh;
            }
            return entry;
        }
        let entry = CacheEntry::new(key.clone());
        self.cache.insert(key, entry.clone());
        entry
    }

    pub fn get(&self, client_id: &ClientId, call_id: u64) -> Option<CacheEntry> {
        self.cache.get(&(client_id.clone(), call_id))
    }
}
