//! Hierarchical, lazily populated key/value cache scoped to the nodes of a
//! context tree.
//!
//! A lookup starts at the asking context and walks up through its ancestors.
//! The nearest cached value wins. When nothing on the chain has one, the
//! creator runs and its result is stored at the asking context.
//!
//! ```
//! use scoped_cache::{ContextArena, ScopedCache};
//!
//! let mut tree = ContextArena::new();
//! let class = tree.root("class");
//! let method = tree.child(class, "method").unwrap();
//!
//! let cache = ScopedCache::new(|name: &&str| format!("mock of {name}"));
//! let shared = cache.get(&tree, class, "repo").unwrap();
//! assert_eq!(cache.get(&tree, method, "repo").unwrap(), shared);
//! ```
pub mod errors;
pub mod context;
pub mod policy;
mod cache;

pub use cache::{CacheStats, ScopedCache};
pub use context::{ContextArena, ContextId, ContextTree};
pub use errors::{CacheError, ConfigError, Result};
pub use policy::{CacheOptions, Inheritance, ScopePolicy};
