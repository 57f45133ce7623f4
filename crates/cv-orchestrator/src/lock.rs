//! Per-conversation serialization lock.
//!
//! One `tokio::sync::Mutex` keyed by conversation id, created lazily and
//! shared through an `Arc`, so any number of callers may queue for the same
//! conversation and run the append pipeline one at a time, in arrival order.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct ConversationLocks {
    locks: SyncMutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the append lock for `conversation_id`, waiting for any
    /// in-flight append on the same conversation to finish first.
    pub async fn acquire(&self, conversation_id: i64) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock();
            locks
                .entry(conversation_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        mutex.lock_owned().await
    }

    /// Drops the entry for conversations that will never be appended to
    /// again. Safe to call any time since a new entry is recreated lazily.
    pub fn forget(&self, conversation_id: i64) {
        self.locks.lock().remove(&conversation_id);
    }

    pub fn tracked_count(&self) -> usize {
        self.locks.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn serializes_same_conversation() {
        let locks = Arc::new(ConversationLocks::new());
        let counter = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let locks = locks.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire(1).await;
                let before = counter.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                assert_eq!(counter.load(Ordering::SeqCst), before + 1);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn different_conversations_do_not_block_each_other() {
        let locks = ConversationLocks::new();
        let _g1 = locks.acquire(1).await;
        // Must not deadlock: conversation 2's lock is independent.
        let _g2 = locks.acquire(2).await;
    }
}
