use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How long a cached response stays valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Expiry {
    /// Responses are not cached at all.
    #[default]
    None,
    /// Responses expire after the given duration.
    After(Duration),
    /// Responses never expire by time alone.
    Forever,
}

impl Expiry {
    /// Returns `true` if this expiry disables caching entirely.
    #[must_use]
    pub const fn is_disabled(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// Which tiers a cached response is written to, and how the persisted tier is
/// interpreted on a cold read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CacheMode {
    /// Memory tier only.
    #[default]
    Memory,
    /// Memory plus persisted tier; a persisted value read on a cold start only
    /// fills state as a placeholder; a real request is still issued.
    StoragePlaceholder,
    /// Memory plus persisted tier; a persisted value read on a cold start is
    /// promoted into the memory tier and trusted like any memory hit.
    StorageRestore,
}

/// Per-descriptor caching policy.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use freshet::cache::CachePolicy;
///
/// // Memory-only, five minutes.
/// let policy = CachePolicy::memory(Duration::from_secs(300));
///
/// // Persisted placeholder, versioned by tag.
/// let policy = CachePolicy::placeholder(Duration::from_secs(300)).tag("v2");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CachePolicy {
    /// When entries written under this policy expire.
    pub expiry: Expiry,
    /// Which tiers entries are written to.
    pub mode: CacheMode,
    /// Version tag for persisted entries. A persisted entry whose tag differs
    /// from the current policy's tag is treated as absent at restore time.
    pub tag: Option<String>,
}

impl CachePolicy {
    /// Policy that disables caching entirely.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            expiry: Expiry::None,
            mode: CacheMode::Memory,
            tag: None,
        }
    }

    /// Memory-only caching with the given lifetime.
    #[must_use]
    pub const fn memory(expire_after: Duration) -> Self {
        Self {
            expiry: Expiry::After(expire_after),
            mode: CacheMode::Memory,
            tag: None,
        }
    }

    /// Memory-only caching that never expires by time.
    #[must_use]
    pub const fn forever() -> Self {
        Self {
            expiry: Expiry::Forever,
            mode: CacheMode::Memory,
            tag: None,
        }
    }

    /// Placeholder-mode persistence with the given lifetime.
    #[must_use]
    pub const fn placeholder(expire_after: Duration) -> Self {
        Self {
            expiry: Expiry::After(expire_after),
            mode: CacheMode::StoragePlaceholder,
            tag: None,
        }
    }

    /// Restore-mode persistence with the given lifetime.
    #[must_use]
    pub const fn restore(expire_after: Duration) -> Self {
        Self {
            expiry: Expiry::After(expire_after),
            mode: CacheMode::StorageRestore,
            tag: None,
        }
    }

    /// Sets the version tag for persisted entries.
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Sets the cache mode, keeping expiry and tag.
    #[must_use]
    pub const fn mode(mut self, mode: CacheMode) -> Self {
        self.mode = mode;
        self
    }

    /// Returns `true` if entries under this policy reach the persisted tier.
    #[must_use]
    pub const fn persists(&self) -> bool {
        matches!(
            self.mode,
            CacheMode::StoragePlaceholder | CacheMode::StorageRestore
        )
    }

    /// Returns `true` if this policy never writes any tier.
    #[must_use]
    pub const fn is_disabled(&self) -> bool {
        self.expiry.is_disabled()
    }
}
