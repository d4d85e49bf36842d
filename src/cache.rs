//! Tiered response caching.
//!
//! The cache has two tiers: an authoritative in-memory tier and an optional
//! persisted tier behind a [`Storage`](crate::storage::Storage) adapter. A
//! descriptor's [`CachePolicy`] decides whether its responses are cached at
//! all, for how long, and whether they also reach the persisted tier, and if
//! so, whether a persisted value is trusted on a cold read
//! ([`CacheMode::StorageRestore`]) or only used as a placeholder while a real
//! request is still issued ([`CacheMode::StoragePlaceholder`]).

mod policy;
mod store;

pub use policy::{CacheMode, CachePolicy, Expiry};
pub use store::CacheHit;
pub(crate) use store::CacheStore;
