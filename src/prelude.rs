//! Prelude module for convenient imports.
//!
//! ```
//! use freshet::prelude::*;
//! ```
//!
//! # What's included
//!
//! - [`Engine`] / [`EngineOptions`] - engine construction
//! - [`Method`] / [`MethodConfig`] - request descriptors
//! - [`CachePolicy`] / [`CacheMode`] - caching behavior
//! - [`use_request`] / [`use_watcher`] / [`use_fetcher`] - request sites
//! - [`invalidate_cache`] / [`update_state`] / [`set_cache_data`] -
//!   cross-cutting cache operations
//! - [`MethodSelector`] / [`MethodFilter`] - matcher selectors
//! - [`RequestError`] - the error type

pub use crate::cache::{CacheMode, CachePolicy, Expiry};
pub use crate::engine::{
    CacheUpdate, Engine, EngineOptions, Responded, invalidate_cache, set_cache_data, update_state,
};
pub use crate::error::RequestError;
pub use crate::hooks::{
    Fetcher, FetcherConfig, RequestConfig, RequestHandle, WatcherConfig, use_fetcher, use_request,
    use_watcher,
};
pub use crate::matcher::{MethodFilter, MethodSelector};
pub use crate::method::{Method, MethodConfig, Verb};
pub use crate::states::{FrontStates, StateBinding, WatchBinding, watch_dep};
pub use crate::storage::{MemoryStorage, Storage};
pub use crate::transport::{Progress, RequestTransport};
