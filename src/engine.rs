//! Engine instances and cross-cutting cache operations.
//!
//! An [`Engine`] owns one transport, one state binding, one storage adapter,
//! and one two-tier cache. Its verb factories produce [`Method`] descriptors;
//! named descriptors are registered so the matcher can address them later.
//! Engines register themselves process-wide at construction and unregister on
//! [`Engine::dispose`]; the free functions [`invalidate_cache`],
//! [`update_state`] and [`set_cache_data`] span every live engine unless the
//! selector is scoped.
//!
//! # Example
//!
//! ```rust,ignore
//! let engine = Engine::new(
//!     "main",
//!     transport,
//!     EngineOptions::new().base_url("https://api.example.com"),
//! );
//!
//! let user = engine.get("/users/1", MethodConfig::new().name("user1"));
//! let data = user.send(false).await?;
//!
//! invalidate_cache(Some("user1".into()));
//! ```

use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde_json::Value;
use tracing::debug;

use crate::cache::{CachePolicy, CacheStore};
use crate::error::RequestError;
use crate::matcher::{MethodSelector, select};
use crate::method::{Fingerprint, Method, MethodConfig, MethodInner, Verb};
use crate::silent::SilentQueue;
use crate::states::{FrontStates, FrontUpdate, StateBinding, WatchBinding};
use crate::storage::{MemoryStorage, Storage};
use crate::transport::{AdapterRequest, RequestTransport};

/// Pre-request hook: may replace the effective adapter-facing configuration.
pub type BeforeRequestHook = Arc<dyn Fn(AdapterRequest) -> AdapterRequest + Send + Sync>;

/// Response hook: maps the raw payload, or fails the execution.
pub type ResponseHook =
    Arc<dyn Fn(Value, &AdapterRequest) -> Result<Value, RequestError> + Send + Sync>;

/// Response error hook: observes a failed execution.
pub type ResponseErrorHook = Arc<dyn Fn(&RequestError, &AdapterRequest) + Send + Sync>;

/// Global response interception: a single success handler, or a
/// success/error pair. When the success handler fails, control passes to the
/// error handler as though the transport had failed.
#[derive(Clone)]
pub enum Responded {
    Handler(ResponseHook),
    Record {
        on_success: ResponseHook,
        on_error: ResponseErrorHook,
    },
}

impl Responded {
    /// Single success handler.
    pub fn handler(
        on_success: impl Fn(Value, &AdapterRequest) -> Result<Value, RequestError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self::Handler(Arc::new(on_success))
    }

    /// Success/error handler pair.
    pub fn record(
        on_success: impl Fn(Value, &AdapterRequest) -> Result<Value, RequestError>
        + Send
        + Sync
        + 'static,
        on_error: impl Fn(&RequestError, &AdapterRequest) + Send + Sync + 'static,
    ) -> Self {
        Self::Record {
            on_success: Arc::new(on_success),
            on_error: Arc::new(on_error),
        }
    }
}

/// Construction options for an [`Engine`].
#[derive(Default)]
pub struct EngineOptions {
    base_url: String,
    timeout: Option<Duration>,
    local_cache: Option<CachePolicy>,
    storage: Option<Arc<dyn Storage>>,
    binding: Option<Arc<dyn StateBinding>>,
    before_request: Option<BeforeRequestHook>,
    responded: Option<Responded>,
}

impl EngineOptions {
    /// Creates empty options: no base URL, no timeout, verb-default caching,
    /// in-memory storage, watch-channel binding.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Base URL joined in front of every descriptor URL.
    #[must_use]
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Engine-wide timeout, overridable per descriptor.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Engine-wide cache policy, replacing the verb defaults. A descriptor's
    /// own policy still wins.
    #[must_use]
    pub fn local_cache(mut self, policy: CachePolicy) -> Self {
        self.local_cache = Some(policy);
        self
    }

    /// Storage adapter for the persisted tier and the silent queue.
    #[must_use]
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// State binding used for every request site on this engine.
    #[must_use]
    pub fn binding(mut self, binding: Arc<dyn StateBinding>) -> Self {
        self.binding = Some(binding);
        self
    }

    /// Global pre-request hook.
    #[must_use]
    pub fn before_request(
        mut self,
        hook: impl Fn(AdapterRequest) -> AdapterRequest + Send + Sync + 'static,
    ) -> Self {
        self.before_request = Some(Arc::new(hook));
        self
    }

    /// Global response interception.
    #[must_use]
    pub fn responded(mut self, responded: Responded) -> Self {
        self.responded = Some(responded);
        self
    }
}

/// States saved by one active request site, addressable by fingerprint for
/// cross-site updates.
#[derive(Clone)]
pub(crate) struct SavedSite {
    pub(crate) id: u64,
    pub(crate) states: FrontStates,
    pub(crate) binding: Arc<dyn StateBinding>,
}

pub(crate) struct EngineInner {
    pub(crate) id: String,
    pub(crate) transport: Arc<dyn RequestTransport>,
    pub(crate) binding: Arc<dyn StateBinding>,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) base_url: String,
    pub(crate) timeout: Option<Duration>,
    pub(crate) local_cache: Option<CachePolicy>,
    pub(crate) before_request: Option<BeforeRequestHook>,
    pub(crate) responded: Option<Responded>,
    pub(crate) cache: CacheStore,
    pub(crate) silent: SilentQueue,
    pub(crate) inflight: DashMap<Fingerprint, crate::executor::Execution>,
    pub(crate) sites: DashMap<Fingerprint, Vec<SavedSite>>,
    /// Cancelled on [`Engine::dispose`]; background work holding a strong
    /// engine reference (silent retries) stops at the next suspension point.
    pub(crate) disposed: tokio_util::sync::CancellationToken,
    registry: Mutex<Vec<Weak<MethodInner>>>,
}

impl EngineInner {
    /// Builds the effective adapter-facing request for a descriptor and runs
    /// it through the `before_request` hook.
    pub(crate) fn adapter_request(&self, method: &Method) -> AdapterRequest {
        let request = AdapterRequest {
            verb: method.verb(),
            url: join_url(&self.base_url, method.url()),
            params: method.params().clone(),
            headers: method.headers().clone(),
            body: method.body().cloned(),
            timeout: method.timeout().or(self.timeout),
            enable_download: method.enable_download(),
            enable_upload: method.enable_upload(),
            extra: method.extra().cloned(),
        };
        match &self.before_request {
            Some(hook) => hook(request),
            None => request,
        }
    }

    fn register_method(&self, method: &Method) {
        // Only named descriptors are reachable through the matcher.
        if method.name().is_some() {
            self.registry
                .lock()
                .expect("method registry lock poisoned")
                .push(Arc::downgrade(&method.inner));
        }
    }

    /// Live registered descriptors, in creation order. Dead entries are
    /// pruned as a side effect.
    pub(crate) fn methods(&self) -> Vec<Method> {
        let mut registry = self.registry.lock().expect("method registry lock poisoned");
        registry.retain(|weak| weak.strong_count() > 0);
        registry
            .iter()
            .filter_map(Weak::upgrade)
            .map(|inner| Method { inner })
            .collect()
    }

    pub(crate) fn save_site(&self, fingerprint: Fingerprint, site: SavedSite) {
        self.sites.entry(fingerprint).or_default().push(site);
    }

    pub(crate) fn remove_site(&self, fingerprint: Fingerprint, id: u64) {
        if let Some(mut saved) = self.sites.get_mut(&fingerprint) {
            saved.retain(|site| site.id != id);
        }
    }

    pub(crate) fn saved_sites(&self, fingerprint: Fingerprint) -> Vec<SavedSite> {
        self.sites
            .get(&fingerprint)
            .map(|saved| saved.clone())
            .unwrap_or_default()
    }
}

fn join_url(base: &str, path: &str) -> String {
    if base.is_empty() || path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}

static ENGINES: Lazy<RwLock<Vec<Weak<EngineInner>>>> = Lazy::new(|| RwLock::new(Vec::new()));

pub(crate) fn live_engines() -> Vec<Arc<EngineInner>> {
    let engines = ENGINES.read().expect("engine registry lock poisoned");
    engines.iter().filter_map(Weak::upgrade).collect()
}

/// Registered descriptors across live engines (registration order, then
/// creation order), optionally restricted to one engine id.
pub(crate) fn registered_methods(scope: Option<&str>) -> Vec<Method> {
    live_engines()
        .into_iter()
        .filter(|engine| scope.is_none_or(|id| engine.id == id))
        .flat_map(|engine| engine.methods())
        .collect()
}

/// A request orchestration engine. Cheap to clone; clones share one instance.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Creates an engine and registers it process-wide.
    ///
    /// `id` scopes persisted records and matcher lookups; give each engine a
    /// distinct id. The engine stays registered until [`dispose`](Self::dispose).
    pub fn new(
        id: impl Into<String>,
        transport: impl RequestTransport,
        options: EngineOptions,
    ) -> Self {
        let id = id.into();
        let storage: Arc<dyn Storage> = options
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));
        let binding: Arc<dyn StateBinding> =
            options.binding.unwrap_or_else(|| Arc::new(WatchBinding));

        let inner = Arc::new(EngineInner {
            cache: CacheStore::new(id.clone(), storage.clone()),
            silent: SilentQueue::new(id.clone(), storage.clone()),
            id,
            transport: Arc::new(transport),
            binding,
            storage,
            base_url: options.base_url,
            timeout: options.timeout,
            local_cache: options.local_cache,
            before_request: options.before_request,
            responded: options.responded,
            inflight: DashMap::new(),
            sites: DashMap::new(),
            disposed: tokio_util::sync::CancellationToken::new(),
            registry: Mutex::new(Vec::new()),
        });

        debug!(engine = %inner.id, "engine created");
        ENGINES
            .write()
            .expect("engine registry lock poisoned")
            .push(Arc::downgrade(&inner));
        Self { inner }
    }

    /// This engine's id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The engine's state binding, for exporting cells.
    #[must_use]
    pub fn binding(&self) -> Arc<dyn StateBinding> {
        self.inner.binding.clone()
    }

    fn method(
        &self,
        verb: Verb,
        url: impl Into<String>,
        body: Option<Value>,
        config: MethodConfig,
    ) -> Method {
        let method = Method::new(
            verb,
            url,
            body,
            config,
            Arc::downgrade(&self.inner),
            self.inner.local_cache.as_ref(),
        );
        self.inner.register_method(&method);
        method
    }

    /// Creates a GET descriptor.
    pub fn get(&self, url: impl Into<String>, config: MethodConfig) -> Method {
        self.method(Verb::Get, url, None, config)
    }

    /// Creates a HEAD descriptor.
    pub fn head(&self, url: impl Into<String>, config: MethodConfig) -> Method {
        self.method(Verb::Head, url, None, config)
    }

    /// Creates an OPTIONS descriptor.
    pub fn options(&self, url: impl Into<String>, config: MethodConfig) -> Method {
        self.method(Verb::Options, url, None, config)
    }

    /// Creates a POST descriptor.
    pub fn post(&self, url: impl Into<String>, body: Option<Value>, config: MethodConfig) -> Method {
        self.method(Verb::Post, url, body, config)
    }

    /// Creates a PUT descriptor.
    pub fn put(&self, url: impl Into<String>, body: Option<Value>, config: MethodConfig) -> Method {
        self.method(Verb::Put, url, body, config)
    }

    /// Creates a PATCH descriptor.
    pub fn patch(&self, url: impl Into<String>, body: Option<Value>, config: MethodConfig) -> Method {
        self.method(Verb::Patch, url, body, config)
    }

    /// Creates a DELETE descriptor.
    pub fn delete(
        &self,
        url: impl Into<String>,
        body: Option<Value>,
        config: MethodConfig,
    ) -> Method {
        self.method(Verb::Delete, url, body, config)
    }

    /// Re-drives silent records persisted by an earlier process run.
    pub fn resume_silent_requests(&self) {
        crate::silent::resume(self.inner.clone());
    }

    /// Unregisters the engine and cancels every in-flight execution.
    ///
    /// Descriptors created by this engine stop matching, and their
    /// [`send`](Method::send) calls fail once the last clone of the engine
    /// handle is dropped.
    pub fn dispose(&self) {
        debug!(engine = %self.inner.id, "engine disposed");
        self.inner.disposed.cancel();
        for execution in self.inner.inflight.iter() {
            execution.cancel.cancel();
        }
        self.inner.inflight.clear();
        self.inner.sites.clear();
        let target = Arc::downgrade(&self.inner);
        ENGINES
            .write()
            .expect("engine registry lock poisoned")
            .retain(|weak| !weak.ptr_eq(&target));
    }

    pub(crate) fn inner(&self) -> &Arc<EngineInner> {
        &self.inner
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").field("id", &self.inner.id).finish()
    }
}

/// A new cache value for [`set_cache_data`]: either a literal value or a
/// computation over the current one.
#[derive(Clone)]
pub enum CacheUpdate {
    /// Replace the entry (creating it if absent, under the method's policy).
    Value(Value),
    /// Compute the new entry from the current one; absent entries stay
    /// absent.
    Compute(Arc<dyn Fn(Value) -> Value + Send + Sync>),
}

impl CacheUpdate {
    /// Update the entry by applying `updater` to the current value.
    pub fn compute(updater: impl Fn(Value) -> Value + Send + Sync + 'static) -> Self {
        Self::Compute(Arc::new(updater))
    }
}

impl From<Value> for CacheUpdate {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

/// Removes cached entries for every descriptor the selector matches, in both
/// tiers, along with any pending silent record for the same fingerprint.
/// `None` clears every live engine's cache and silent queue entirely.
/// Unmatched selectors are silent no-ops.
pub fn invalidate_cache(selector: Option<MethodSelector>) {
    match selector {
        None => {
            for engine in live_engines() {
                engine.cache.invalidate_all();
                engine.silent.clear();
            }
        }
        Some(selector) => {
            for method in select(&selector) {
                if let Some(engine) = method.engine() {
                    let fingerprint = method.fingerprint();
                    engine.cache.invalidate(fingerprint);
                    engine.silent.remove(&fingerprint.to_string());
                }
            }
        }
    }
}

/// Applies `updater` to the front `data` state of every active site bound to
/// a matched descriptor, and writes the result through to the cache. Matched
/// descriptors without active sites, and unmatched selectors, are silent
/// no-ops.
pub fn update_state(
    selector: impl Into<MethodSelector>,
    updater: impl Fn(Value) -> Value,
) {
    for method in select(&selector.into()) {
        let Some(engine) = method.engine() else {
            continue;
        };
        let fingerprint = method.fingerprint();
        let saved = engine.saved_sites(fingerprint);
        let Some(first) = saved.first() else {
            continue;
        };

        let updated = updater(first.states.data());
        for site in &saved {
            site.binding
                .update(FrontUpdate::default().data(updated.clone()), &site.states);
        }
        engine.cache.set(fingerprint, updated, method.policy());
    }
}

/// Writes cache data for every descriptor the selector matches, without any
/// network call. Unmatched selectors are silent no-ops; disabled cache
/// policies stay uncached.
pub fn set_cache_data(selector: impl Into<MethodSelector>, update: impl Into<CacheUpdate>) {
    let update = update.into();
    for method in select(&selector.into()) {
        let Some(engine) = method.engine() else {
            continue;
        };
        let fingerprint = method.fingerprint();
        match &update {
            CacheUpdate::Value(value) => {
                engine.cache.set(fingerprint, value.clone(), method.policy());
            }
            CacheUpdate::Compute(updater) => {
                engine
                    .cache
                    .update(fingerprint, method.policy(), |current| updater(current));
            }
        }
    }
}
