//! The scoped cache itself.
//!
//! Values live in per-context slots. A lookup walks from the asking context
//! towards the root and returns the first hit; a miss runs the creator once
//! and stores the result at the asking context only. Ancestors and siblings
//! never see it.
use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use serde::Serialize;
use tracing::{debug, trace};

use crate::context::ContextTree;
use crate::errors::{CacheError, Result};
use crate::policy::{CacheOptions, Inheritance, ScopePolicy};

type Creator<K, V, E> = Box<dyn Fn(&K) -> std::result::Result<V, E> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Contexts that own a slot, empty or not.
    pub contexts: usize,
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

struct State<Id, K, V> {
    slots: HashMap<Id, HashMap<K, V>>,
    hits: u64,
    misses: u64,
}

impl<Id, K, V> State<Id, K, V>
where
    Id: Copy + Eq + Hash + Debug,
    K: Eq + Hash,
    V: Clone,
{
    /// Walk `context` and its ancestors. Returns the distance to the context
    /// holding `key` and a clone of the value, or `Err(id)` when the chain
    /// loops back to `id`.
    fn lookup<T>(
        &mut self,
        tree: &T,
        context: Id,
        key: &K,
    ) -> std::result::Result<Option<(usize, V)>, Id>
    where
        T: ContextTree<Id = Id> + ?Sized,
    {
        let mut visited = HashSet::new();
        let mut cur = Some(context);
        let mut depth = 0;
        while let Some(id) = cur {
            if !visited.insert(id) {
                return Err(id);
            }
            let slot = self.slots.entry(id).or_default();
            if let Some(value) = slot.get(key) {
                return Ok(Some((depth, value.clone())));
            }
            cur = tree.parent(id);
            depth += 1;
        }
        Ok(None)
    }
}

/// Lazily populated cache keyed by (context, key).
///
/// One lock guards the whole cache and stays held while the creator runs, so
/// concurrent callers never create the same (context, key) twice. A creator
/// that calls back into its own cache gets [`CacheError::Reentrant`] instead
/// of a deadlock. A creator that hands work to another thread which then uses
/// the cache will still deadlock; that is not detected.
pub struct ScopedCache<Id, K, V, E = Infallible> {
    creator: Creator<K, V, E>,
    options: CacheOptions,
    state: Mutex<State<Id, K, V>>,
    creating: Mutex<Option<ThreadId>>,
}

impl<Id, K, V> ScopedCache<Id, K, V, Infallible>
where
    Id: Copy + Eq + Hash + Debug,
    K: Eq + Hash,
    V: Clone,
{
    /// Cache with the default (and only supported) policies.
    pub fn new<F>(creator: F) -> Self
    where
        F: Fn(&K) -> V + Send + Sync + 'static,
    {
        Self::build(Box::new(move |key: &K| Ok::<V, Infallible>(creator(key))), CacheOptions::default())
    }

    /// Cache with explicit policies. Fails unless the pair is supported.
    pub fn configure<F>(creator: F, scope: ScopePolicy, inheritance: Inheritance) -> Result<Self>
    where
        F: Fn(&K) -> V + Send + Sync + 'static,
    {
        Self::with_options(
            move |key: &K| Ok(creator(key)),
            CacheOptions::new(scope, inheritance),
        )
    }
}

impl<Id, K, V, E> ScopedCache<Id, K, V, E>
where
    Id: Copy + Eq + Hash + Debug,
    K: Eq + Hash,
    V: Clone,
{
    /// Default policies with a creator that may fail.
    pub fn fallible<F>(creator: F) -> Self
    where
        F: Fn(&K) -> std::result::Result<V, E> + Send + Sync + 'static,
    {
        Self::build(Box::new(creator), CacheOptions::default())
    }

    pub fn with_options<F>(creator: F, options: CacheOptions) -> Result<Self>
    where
        F: Fn(&K) -> std::result::Result<V, E> + Send + Sync + 'static,
    {
        options.validate()?;
        Ok(Self::build(Box::new(creator), options))
    }

    fn build(creator: Creator<K, V, E>, options: CacheOptions) -> Self {
        Self {
            creator,
            options,
            state: Mutex::new(State {
                slots: HashMap::new(),
                hits: 0,
                misses: 0,
            }),
            creating: Mutex::new(None),
        }
    }

    pub fn scope(&self) -> ScopePolicy {
        self.options.scope
    }

    pub fn inheritance(&self) -> Inheritance {
        self.options.inheritance
    }

    /// Nearest cached value for `key` seen from `context`, creating it at
    /// `context` if no ancestor has one.
    ///
    /// A creator error is returned as [`CacheError::Creator`] and nothing is
    /// stored, so the next call tries again.
    pub fn get<T>(
        &self,
        tree: &T,
        context: Id,
        key: K,
    ) -> std::result::Result<V, CacheError<E>>
    where
        T: ContextTree<Id = Id> + ?Sized,
    {
        let me = self.enter(context)?;
        let mut state = lock(&self.state);

        match state.lookup(tree, context, &key) {
            Ok(Some((depth, value))) => {
                state.hits += 1;
                trace!(context = ?context, depth, "cache hit");
                return Ok(value);
            }
            Ok(None) => state.misses += 1,
            Err(id) => return Err(cyclic(id)),
        }

        debug!(context = ?context, "cache miss, running creator");
        let value = {
            let _guard = CreatingGuard::enter(&self.creating, me);
            (self.creator)(&key).map_err(CacheError::Creator)?
        };
        state
            .slots
            .entry(context)
            .or_default()
            .insert(key, value.clone());
        Ok(value)
    }

    /// Same walk as [`get`](Self::get), but a miss returns `None` instead of
    /// running the creator.
    pub fn peek<T>(
        &self,
        tree: &T,
        context: Id,
        key: &K,
    ) -> std::result::Result<Option<V>, CacheError<E>>
    where
        T: ContextTree<Id = Id> + ?Sized,
    {
        self.enter(context)?;
        let mut state = lock(&self.state);
        match state.lookup(tree, context, key) {
            Ok(found) => Ok(found.map(|(_, value)| value)),
            Err(id) => Err(cyclic(id)),
        }
    }

    pub fn stats(&self) -> CacheStats {
        let state = lock(&self.state);
        CacheStats {
            contexts: state.slots.len(),
            entries: state.slots.values().map(HashMap::len).sum(),
            hits: state.hits,
            misses: state.misses,
        }
    }

    /// Refuse calls made by the thread that is currently running the creator.
    fn enter(&self, context: Id) -> std::result::Result<ThreadId, CacheError<E>> {
        let me = thread::current().id();
        if *lock(&self.creating) == Some(me) {
            return Err(CacheError::Reentrant {
                context: format!("{context:?}"),
            });
        }
        Ok(me)
    }
}

fn cyclic<Id: Debug, E>(id: Id) -> CacheError<E> {
    CacheError::CyclicContext {
        context: format!("{id:?}"),
    }
}

// Entries are only inserted after the creator returns, so a panic inside it
// leaves the maps consistent and a poisoned lock is safe to reuse.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Marks the current thread as running the creator until dropped.
struct CreatingGuard<'a> {
    slot: &'a Mutex<Option<ThreadId>>,
}

impl<'a> CreatingGuard<'a> {
    fn enter(slot: &'a Mutex<Option<ThreadId>>, me: ThreadId) -> Self {
        *lock(slot) = Some(me);
        Self { slot }
    }
}

impl Drop for CreatingGuard<'_> {
    fn drop(&mut self) {
        *lock(self.slot) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextArena, ContextId};
    use pretty_assertions::assert_eq;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, OnceLock};

    fn counting() -> (Arc<AtomicUsize>, ScopedCache<ContextId, String, Arc<String>>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let cache = ScopedCache::new(move |key: &String| {
            let n = c.fetch_add(1, Ordering::SeqCst);
            Arc::new(format!("{key}#{n}"))
        });
        (calls, cache)
    }

    #[test]
    fn repeated_lookups_hit_the_same_value() {
        let mut arena = ContextArena::new();
        let root = arena.root("root");
        let (calls, cache) = counting();

        let first = cache.get(&arena, root, "x".into()).unwrap();
        for _ in 0..5 {
            let again = cache.get(&arena, root, "x".into()).unwrap();
            assert!(Arc::ptr_eq(&first, &again));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            cache.stats(),
            CacheStats { contexts: 1, entries: 1, hits: 5, misses: 1 }
        );
    }

    #[test]
    fn descendants_inherit_ancestor_values() {
        let mut arena = ContextArena::new();
        let root = arena.root("root");
        let child = arena.child(root, "child").unwrap();
        let grandchild = arena.child(child, "grandchild").unwrap();
        let (calls, cache) = counting();

        let at_root = cache.get(&arena, root, "x".into()).unwrap();
        let at_grandchild = cache.get(&arena, grandchild, "x".into()).unwrap();
        assert!(Arc::ptr_eq(&at_root, &at_grandchild));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // The walk touched every slot on the way up but stored nothing new.
        assert_eq!(cache.stats().contexts, 3);
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn child_value_is_hidden_from_parent_and_siblings() {
        let mut arena = ContextArena::new();
        let root = arena.root("root");
        let left = arena.child(root, "left").unwrap();
        let right = arena.child(root, "right").unwrap();
        let (calls, cache) = counting();

        let l = cache.get(&arena, left, "x".into()).unwrap();
        assert_eq!(cache.peek(&arena, root, &"x".to_string()).unwrap(), None);
        assert_eq!(cache.peek(&arena, right, &"x".to_string()).unwrap(), None);

        let r = cache.get(&arena, right, "x".into()).unwrap();
        let top = cache.get(&arena, root, "x".into()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!Arc::ptr_eq(&l, &r));
        assert!(!Arc::ptr_eq(&l, &top));

        // left keeps shadowing the value later created at root
        let l_again = cache.get(&arena, left, "x".into()).unwrap();
        assert!(Arc::ptr_eq(&l, &l_again));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn creator_error_stores_nothing() {
        let mut arena = ContextArena::new();
        let root = arena.root("root");
        let attempts = Arc::new(AtomicUsize::new(0));
        let a = attempts.clone();
        let cache: ScopedCache<ContextId, u32, u32, String> = ScopedCache::fallible(move |key: &u32| {
            if a.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(format!("cannot build {key}"))
            } else {
                Ok(key * 10)
            }
        });

        match cache.get(&arena, root, 4) {
            Err(CacheError::Creator(msg)) => assert_eq!(msg, "cannot build 4"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(cache.peek(&arena, root, &4).unwrap(), None);
        assert_eq!(cache.get(&arena, root, 4).unwrap(), 40);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn reentrant_creator_is_refused() {
        type Cache = ScopedCache<u32, &'static str, u32, String>;
        let tree: HashMap<u32, u32> = [(2, 1)].into_iter().collect();
        let handle: Arc<OnceLock<Arc<Cache>>> = Arc::new(OnceLock::new());

        let inner = handle.clone();
        let inner_tree = tree.clone();
        let cache: Arc<Cache> = Arc::new(Cache::fallible(move |key: &&'static str| {
            if *key == "loop" {
                let cache = inner.get().ok_or("cache not set")?;
                return cache
                    .get(&inner_tree, 1, "other")
                    .map_err(|e| e.to_string());
            }
            Ok(7)
        }));
        assert!(handle.set(cache.clone()).is_ok());

        match cache.get(&tree, 2, "loop") {
            Err(CacheError::Creator(msg)) => assert!(msg.contains("re-entrant"), "{msg}"),
            other => panic!("unexpected {other:?}"),
        }
        // guard was released
        assert_eq!(cache.get(&tree, 2, "plain").unwrap(), 7);
    }

    #[test]
    fn cycle_in_host_tree_is_reported() {
        let tree: HashMap<u32, u32> = [(1, 2), (2, 3), (3, 1)].into_iter().collect();
        let cache: ScopedCache<u32, u8, u8> = ScopedCache::new(|k: &u8| *k);
        match cache.get(&tree, 1, 9) {
            Err(CacheError::CyclicContext { context }) => assert_eq!(context, "1"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn panicking_creator_leaves_cache_usable() {
        let mut arena = ContextArena::new();
        let root = arena.root("root");
        let cache: ScopedCache<ContextId, &'static str, usize> = ScopedCache::new(|k: &&str| {
            if *k == "boom" {
                panic!("creator blew up");
            }
            k.len()
        });

        let result = panic::catch_unwind(AssertUnwindSafe(|| cache.get(&arena, root, "boom")));
        assert!(result.is_err());
        assert_eq!(cache.get(&arena, root, "fine").unwrap(), 4);
        assert_eq!(cache.peek(&arena, root, &"boom").unwrap(), None);
    }
}
