//! # Freshet - Declarative Request Orchestration
//!
//! Freshet is a client-side request orchestration engine: declarative
//! descriptions of HTTP-like operations executed through a pluggable
//! transport, cached in a two-tier store, kept consistent across unrelated
//! call sites, and surfaced as reactive state without depending on any
//! specific UI framework.
//!
//! ## Architecture
//!
//! 1. **Methods**: immutable request descriptors produced by an engine's verb
//!    factories, identified by a deterministic fingerprint
//! 2. **Cache**: an authoritative memory tier plus an optional persisted tier
//!    with placeholder/restore semantics, expiry and tag versioning
//! 3. **Matcher**: name, pattern and predicate selectors that address cached
//!    entities across call sites and engines
//! 4. **Executor**: the hooked request pipeline with per-fingerprint
//!    in-flight sharing, timeouts and aborts
//! 5. **Scheduler**: decides when watched sites re-run: once at
//!    registration, per debounced dependency change, or manually
//! 6. **Silent queue**: optimistic resolution with persisted, retried
//!    background execution
//!
//! ## Core Components
//!
//! - [`Engine`](engine::Engine): one transport + binding + storage + cache
//! - [`Method`](method::Method): one request descriptor
//! - [`use_request`](hooks::use_request) / [`use_watcher`](hooks::use_watcher)
//!   / [`use_fetcher`](hooks::use_fetcher): request-site entry points
//! - [`invalidate_cache`](engine::invalidate_cache) /
//!   [`update_state`](engine::update_state) /
//!   [`set_cache_data`](engine::set_cache_data): cross-cutting cache
//!   operations over [`MethodSelector`](matcher::MethodSelector)s
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use freshet::prelude::*;
//!
//! let engine = Engine::new(
//!     "main",
//!     transport, // any RequestTransport implementation
//!     EngineOptions::new().base_url("https://api.example.com"),
//! );
//!
//! // Cached for five minutes; a second send within that window resolves
//! // from the cache without touching the transport.
//! let user = engine.get(
//!     "/users/1",
//!     MethodConfig::new()
//!         .name("user1")
//!         .cache(CachePolicy::memory(Duration::from_millis(300_000))),
//! );
//! let handle = use_request(&user, RequestConfig::default());
//!
//! // Anywhere else in the application:
//! invalidate_cache(Some("user1".into()));
//! ```

pub mod cache;
pub mod engine;
pub mod error;
pub(crate) mod executor;
pub mod hooks;
pub mod matcher;
pub mod method;
pub mod prelude;
pub(crate) mod scheduler;
pub mod silent;
pub mod states;
pub mod storage;
pub mod transport;

pub use engine::{Engine, EngineOptions, invalidate_cache, set_cache_data, update_state};
pub use error::RequestError;
pub use hooks::{use_fetcher, use_request, use_watcher};
pub use method::{Method, MethodConfig};
