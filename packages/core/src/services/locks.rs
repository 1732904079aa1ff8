//! Tree Locks
//!
//! Mutating operations on one tree are serialized through an async mutex keyed
//! by the tree's top-most ancestor. Operations that add or remove a root also
//! take the key of the root-level sibling group, whose `sequence` values they
//! shift. Keys are always acquired in sorted order, so two operations that
//! need overlapping key sets cannot deadlock.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// What a lock protects
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockKey {
    /// The sibling group of all roots
    RootLevel,
    /// Every node below (and including) the root with this id
    Tree(String),
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKey::RootLevel => f.write_str("<root level>"),
            LockKey::Tree(root) => write!(f, "tree '{}'", root),
        }
    }
}

/// Keys held by one operation; dropping it releases them all
#[derive(Debug)]
pub struct TreeGuard {
    keys: Vec<LockKey>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl TreeGuard {
    pub fn keys(&self) -> &[LockKey] {
        &self.keys
    }

    /// Whether the held keys cover `wanted`
    pub fn covers(&self, wanted: &BTreeSet<LockKey>) -> bool {
        wanted.iter().all(|key| self.keys.contains(key))
    }
}

/// Table of keyed async mutexes
#[derive(Debug, Default)]
pub struct TreeLocks {
    locks: Mutex<HashMap<LockKey, Arc<Mutex<()>>>>,
}

impl TreeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire every key of `keys`, in sorted order
    pub async fn acquire(&self, keys: BTreeSet<LockKey>) -> TreeGuard {
        let mutexes: Vec<(LockKey, Arc<Mutex<()>>)> = {
            let mut locks = self.locks.lock().await;
            // Entries nobody holds or waits on can go
            locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
            keys.into_iter()
                .map(|key| {
                    let mutex = locks.entry(key.clone()).or_default().clone();
                    (key, mutex)
                })
                .collect()
        };

        let mut guards = Vec::with_capacity(mutexes.len());
        let mut held = Vec::with_capacity(mutexes.len());
        for (key, mutex) in mutexes {
            guards.push(mutex.lock_owned().await);
            held.push(key);
        }
        tracing::debug!("Acquired lock(s): {:?}", held);

        TreeGuard {
            keys: held,
            _guards: guards,
        }
    }

    /// Number of keys currently tracked
    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn keys(list: &[LockKey]) -> BTreeSet<LockKey> {
        list.iter().cloned().collect()
    }

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = Arc::new(TreeLocks::new());
        let guard = locks.acquire(keys(&[LockKey::Tree("a".into())])).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks.acquire(keys(&[LockKey::Tree("a".into())])).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_disjoint_keys_do_not_block() {
        let locks = TreeLocks::new();
        let _a = locks.acquire(keys(&[LockKey::Tree("a".into())])).await;
        let b = tokio::time::timeout(
            Duration::from_millis(200),
            locks.acquire(keys(&[LockKey::Tree("b".into()), LockKey::RootLevel])),
        )
        .await
        .unwrap();
        assert_eq!(b.keys(), &[LockKey::RootLevel, LockKey::Tree("b".into())]);
        assert!(b.covers(&keys(&[LockKey::RootLevel])));
        assert!(!b.covers(&keys(&[LockKey::Tree("a".into())])));
    }

    #[tokio::test]
    async fn test_overlapping_sets_do_not_deadlock() {
        let locks = Arc::new(TreeLocks::new());
        let mut tasks = Vec::new();
        for i in 0..20 {
            let locks = locks.clone();
            tasks.push(tokio::spawn(async move {
                let set = if i % 2 == 0 {
                    keys(&[LockKey::Tree("x".into()), LockKey::Tree("y".into())])
                } else {
                    keys(&[LockKey::Tree("y".into()), LockKey::RootLevel, LockKey::Tree("x".into())])
                };
                let _guard = locks.acquire(set).await;
                tokio::task::yield_now().await;
            }));
        }
        let all = futures::future::join_all(tasks);
        for result in tokio::time::timeout(Duration::from_secs(5), all).await.unwrap() {
            result.unwrap();
        }
    }

    #[tokio::test]
    async fn test_released_entries_are_pruned() {
        let locks = TreeLocks::new();
        drop(locks.acquire(keys(&[LockKey::Tree("a".into())])).await);
        drop(locks.acquire(keys(&[LockKey::Tree("b".into())])).await);
        // Acquiring prunes entries left by released guards
        assert_eq!(locks.len().await, 1);
    }
}
