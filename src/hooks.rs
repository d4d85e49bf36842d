//! Request-site entry points.
//!
//! [`use_request`] drives a one-shot request site, [`use_watcher`] re-runs a
//! site on reactive dependency changes, and [`use_fetcher`] pulls data for
//! descriptors other sites display. All three share one per-site state
//! machine: `idle → loading → (success | error) → idle`, with progress cells
//! reset at the start of every execution, stale resolutions discarded by
//! epoch comparison, and an abort handle that leaves `loading` terminally
//! false.
//!
//! # Example
//!
//! ```rust,ignore
//! let users = engine.get("/users", MethodConfig::new().name("userList"));
//! let handle = use_request(&users, RequestConfig::default());
//! handle.on_success(|data| println!("got {data}"));
//!
//! // Re-run whenever the page number changes, debounced:
//! let handle = use_watcher(
//!     move || engine.get(format!("/users?page={}", page_rx.borrow()), MethodConfig::new()),
//!     vec![watch_dep(page_rx.clone())],
//!     WatcherConfig::default().debounce(Duration::from_millis(300)),
//! );
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::{Engine, EngineInner, SavedSite};
use crate::error::RequestError;
use crate::executor;
use crate::method::{Fingerprint, Method};
use crate::states::{DepStream, EffectRequest, FrontStates, FrontUpdate, StateBinding, WatchBinding};
use crate::transport::Progress;

/// Configuration for [`use_request`].
#[derive(Clone)]
pub struct RequestConfig {
    /// Run once at registration. Defaults to `true`; `false` leaves the site
    /// manual-send only.
    pub immediate: bool,
    /// Skip the cache read on every trigger (results are still written back).
    pub force: bool,
    /// Resolve optimistically and run the execution in the background.
    pub silent: bool,
    /// Initial `data` value, also the silent fallback when nothing is cached.
    pub initial_data: Option<Value>,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            immediate: true,
            force: false,
            silent: false,
            initial_data: None,
        }
    }
}

impl RequestConfig {
    #[must_use]
    pub const fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    #[must_use]
    pub const fn force(mut self) -> Self {
        self.force = true;
        self
    }

    #[must_use]
    pub const fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    #[must_use]
    pub fn initial_data(mut self, data: Value) -> Self {
        self.initial_data = Some(data);
        self
    }
}

/// Configuration for [`use_watcher`].
#[derive(Clone)]
pub struct WatcherConfig {
    /// Run once before any dependency change, not debounced. Defaults to
    /// `false`.
    pub immediate: bool,
    /// Skip the cache read on every trigger.
    pub force: bool,
    /// Resolve optimistically and run executions in the background.
    pub silent: bool,
    /// Initial `data` value.
    pub initial_data: Option<Value>,
    /// Trailing debounce for dependency bursts. Defaults to zero.
    pub debounce: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            immediate: false,
            force: false,
            silent: false,
            initial_data: None,
            debounce: Duration::ZERO,
        }
    }
}

impl WatcherConfig {
    #[must_use]
    pub const fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    #[must_use]
    pub const fn force(mut self) -> Self {
        self.force = true;
        self
    }

    #[must_use]
    pub const fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    #[must_use]
    pub fn initial_data(mut self, data: Value) -> Self {
        self.initial_data = Some(data);
        self
    }

    #[must_use]
    pub const fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }
}

/// Configuration for [`use_fetcher`].
#[derive(Clone, Default)]
pub struct FetcherConfig {
    /// Skip the cache read on every fetch.
    pub force: bool,
}

impl FetcherConfig {
    #[must_use]
    pub const fn force(mut self) -> Self {
        self.force = true;
        self
    }
}

enum MethodSource {
    Fixed(Method),
    Factory(Arc<dyn Fn() -> Method + Send + Sync>),
}

static SITE_IDS: AtomicU64 = AtomicU64::new(0);

type SuccessHandler = Box<dyn Fn(&Value) + Send>;
type ErrorHandler = Box<dyn Fn(&RequestError) + Send>;
type CompleteHandler = Box<dyn Fn() + Send>;

/// One active request site: its descriptor source, its state cells, and the
/// bookkeeping that serializes executions against the caller's latest intent.
pub(crate) struct Site {
    id: u64,
    engine: Weak<EngineInner>,
    source: Mutex<Option<MethodSource>>,
    binding: Arc<dyn StateBinding>,
    states: FrontStates,
    /// Bumped at the start of every run and by [`abort`](Self::abort); a
    /// resolution whose epoch is stale must not touch any state.
    epoch: AtomicU64,
    current_cancel: Mutex<Option<CancellationToken>>,
    registered: Mutex<Option<Fingerprint>>,
    force: bool,
    silent: bool,
    initial_data: Option<Value>,
    success_handlers: Mutex<Vec<SuccessHandler>>,
    error_handlers: Mutex<Vec<ErrorHandler>>,
    complete_handlers: Mutex<Vec<CompleteHandler>>,
}

impl Site {
    fn new(
        engine: Weak<EngineInner>,
        source: Option<MethodSource>,
        binding: Arc<dyn StateBinding>,
        states: FrontStates,
        force: bool,
        silent: bool,
        initial_data: Option<Value>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: SITE_IDS.fetch_add(1, Ordering::Relaxed) + 1,
            engine,
            source: Mutex::new(source),
            binding,
            states,
            epoch: AtomicU64::new(0),
            current_cancel: Mutex::new(None),
            registered: Mutex::new(None),
            force,
            silent,
            initial_data,
            success_handlers: Mutex::new(Vec::new()),
            error_handlers: Mutex::new(Vec::new()),
            complete_handlers: Mutex::new(Vec::new()),
        })
    }

    fn resolve_method(&self) -> Option<Method> {
        let factory = {
            let source = self.source.lock().expect("site source lock poisoned");
            match source.as_ref()? {
                MethodSource::Fixed(method) => return Some(method.clone()),
                MethodSource::Factory(factory) => factory.clone(),
            }
        };
        Some(factory())
    }

    fn set_method(&self, method: Method) {
        *self.source.lock().expect("site source lock poisoned") =
            Some(MethodSource::Fixed(method));
    }

    /// Applies a state update unless a newer run or an abort superseded
    /// `epoch`.
    fn apply(&self, epoch: u64, update: FrontUpdate) {
        if self.epoch.load(Ordering::SeqCst) == epoch {
            self.binding.update(update, &self.states);
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    fn register(&self, fingerprint: Fingerprint) {
        let mut registered = self.registered.lock().expect("site registry lock poisoned");
        if *registered == Some(fingerprint) {
            return;
        }
        if let Some(engine) = self.engine.upgrade() {
            if let Some(previous) = registered.take() {
                engine.remove_site(previous, self.id);
            }
            engine.save_site(
                fingerprint,
                SavedSite {
                    id: self.id,
                    states: self.states.clone(),
                    binding: self.binding.clone(),
                },
            );
            *registered = Some(fingerprint);
        }
    }

    fn unregister(&self) {
        if let Some(fingerprint) = self
            .registered
            .lock()
            .expect("site registry lock poisoned")
            .take()
        {
            if let Some(engine) = self.engine.upgrade() {
                engine.remove_site(fingerprint, self.id);
            }
        }
    }

    fn fire_success(&self, epoch: u64, value: &Value) {
        if !self.is_current(epoch) {
            return;
        }
        for handler in self
            .success_handlers
            .lock()
            .expect("site handlers lock poisoned")
            .iter()
        {
            handler(value);
        }
    }

    fn fire_error(&self, epoch: u64, error: &RequestError) {
        if !self.is_current(epoch) {
            return;
        }
        for handler in self
            .error_handlers
            .lock()
            .expect("site handlers lock poisoned")
            .iter()
        {
            handler(error);
        }
    }

    fn fire_complete(&self, epoch: u64) {
        if !self.is_current(epoch) {
            return;
        }
        for handler in self
            .complete_handlers
            .lock()
            .expect("site handlers lock poisoned")
            .iter()
        {
            handler();
        }
    }

    /// Runs one execution trigger. `force` skips the cache read; `fresh`
    /// supersedes any in-flight execution for the fingerprint instead of
    /// joining it (manual sends).
    async fn run(self: Arc<Self>, force: bool, fresh: bool) -> Result<Value, RequestError> {
        let engine = self
            .engine
            .upgrade()
            .ok_or_else(|| RequestError::Transport("engine disposed".to_string()))?;
        let method = self
            .resolve_method()
            .ok_or_else(|| RequestError::Transport("no method bound".to_string()))?;
        let fingerprint = method.fingerprint();
        self.register(fingerprint);

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        if self.silent {
            let optimistic = engine
                .cache
                .get(fingerprint, method.policy())
                .map(|hit| hit.payload)
                .or_else(|| self.initial_data.clone())
                .unwrap_or(Value::Null);
            self.apply(
                epoch,
                FrontUpdate::default()
                    .loading(false)
                    .data(optimistic.clone())
                    .error(None),
            );
            self.fire_success(epoch, &optimistic);
            self.fire_complete(epoch);
            crate::silent::submit(engine, method);
            return Ok(optimistic);
        }

        self.apply(
            epoch,
            FrontUpdate::default()
                .loading(true)
                .downloading(Progress::default())
                .uploading(Progress::default()),
        );

        if !force {
            if let Some(hit) = engine.cache.get(fingerprint, method.policy()) {
                if !hit.placeholder {
                    self.apply(
                        epoch,
                        FrontUpdate::default()
                            .loading(false)
                            .data(hit.payload.clone())
                            .error(None),
                    );
                    self.fire_success(epoch, &hit.payload);
                    self.fire_complete(epoch);
                    return Ok(hit.payload);
                }
                // Placeholder fills the data need now; the execution below is
                // the scheduled real request.
                debug!(%fingerprint, "placeholder hit, refreshing");
                self.apply(epoch, FrontUpdate::default().data(hit.payload));
            }
        }

        let execution = executor::begin(&engine, &method, force || fresh);
        *self
            .current_cancel
            .lock()
            .expect("site cancel lock poisoned") = Some(execution.cancel.clone());
        pump_progress(&self, &execution, epoch, &method);

        let result = execution.result.clone().await;

        match result {
            Ok(value) => {
                self.apply(
                    epoch,
                    FrontUpdate::default()
                        .loading(false)
                        .data(value.clone())
                        .error(None),
                );
                self.fire_success(epoch, &value);
                self.fire_complete(epoch);
                Ok(value)
            }
            Err(error) if error.is_aborted() => {
                self.apply(epoch, FrontUpdate::default().loading(false));
                Err(error)
            }
            Err(error) => {
                // `data` keeps the last good value alongside the new error.
                self.apply(
                    epoch,
                    FrontUpdate::default()
                        .loading(false)
                        .error(Some(error.clone())),
                );
                self.fire_error(epoch, &error);
                self.fire_complete(epoch);
                Err(error)
            }
        }
    }

    fn abort(&self) {
        debug!("aborting request site");
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = self
            .current_cancel
            .lock()
            .expect("site cancel lock poisoned")
            .take()
        {
            token.cancel();
        }
        self.binding
            .update(FrontUpdate::default().loading(false), &self.states);
    }
}

impl Drop for Site {
    fn drop(&mut self) {
        self.unregister();
    }
}

fn pump_progress(site: &Arc<Site>, execution: &executor::Execution, epoch: u64, method: &Method) {
    if method.enable_download() {
        if let Some(receiver) = execution.download.clone() {
            tokio::spawn(pump(Arc::downgrade(site), receiver, epoch, Direction::Download));
        }
    }
    if method.enable_upload() {
        if let Some(receiver) = execution.upload.clone() {
            tokio::spawn(pump(Arc::downgrade(site), receiver, epoch, Direction::Upload));
        }
    }
}

enum Direction {
    Download,
    Upload,
}

/// Forwards transport progress into the site's cells while the run that
/// started it is still current.
async fn pump(
    site: Weak<Site>,
    mut receiver: watch::Receiver<Progress>,
    epoch: u64,
    direction: Direction,
) {
    while receiver.changed().await.is_ok() {
        let progress = *receiver.borrow();
        let Some(site) = site.upgrade() else {
            return;
        };
        if !site.is_current(epoch) {
            return;
        }
        let update = match direction {
            Direction::Download => FrontUpdate::default().downloading(progress),
            Direction::Upload => FrontUpdate::default().uploading(progress),
        };
        site.binding.update(update, &site.states);
    }
}

/// Handle over one request site, returned by [`use_request`] and
/// [`use_watcher`].
#[derive(Clone)]
pub struct RequestHandle {
    site: Arc<Site>,
}

impl RequestHandle {
    /// The site's reactive state cells.
    #[must_use]
    pub fn states(&self) -> &FrontStates {
        &self.site.states
    }

    /// Dehydrated `loading` flag.
    #[must_use]
    pub fn loading(&self) -> bool {
        self.site.states.loading()
    }

    /// Dehydrated `data` value.
    #[must_use]
    pub fn data(&self) -> Value {
        self.site.states.data()
    }

    /// Dehydrated error message, if the last execution failed.
    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.site.states.error()
    }

    /// Dehydrated download progress.
    #[must_use]
    pub fn downloading(&self) -> Progress {
        self.site.states.downloading()
    }

    /// Dehydrated upload progress.
    #[must_use]
    pub fn uploading(&self) -> Progress {
        self.site.states.uploading()
    }

    /// Manually re-sends the request, superseding any in-flight execution
    /// for the same fingerprint. Honors the configured `force` flag.
    ///
    /// # Errors
    ///
    /// Returns the execution's [`RequestError`].
    pub async fn send(&self) -> Result<Value, RequestError> {
        self.site.clone().run(self.site.force, true).await
    }

    /// Like [`send`](Self::send) but always bypasses the cache read.
    ///
    /// # Errors
    ///
    /// Returns the execution's [`RequestError`].
    pub async fn send_force(&self) -> Result<Value, RequestError> {
        self.site.clone().run(true, true).await
    }

    /// Aborts the in-flight execution, if any: signals the transport,
    /// drives `loading` to a terminal `false`, and discards the execution's
    /// eventual resolution.
    pub fn abort(&self) {
        self.site.abort();
    }

    /// Registers a success callback.
    pub fn on_success(&self, handler: impl Fn(&Value) + Send + 'static) -> &Self {
        self.site
            .success_handlers
            .lock()
            .expect("site handlers lock poisoned")
            .push(Box::new(handler));
        self
    }

    /// Registers an error callback.
    pub fn on_error(&self, handler: impl Fn(&RequestError) + Send + 'static) -> &Self {
        self.site
            .error_handlers
            .lock()
            .expect("site handlers lock poisoned")
            .push(Box::new(handler));
        self
    }

    /// Registers a completion callback, fired after success and error alike.
    pub fn on_complete(&self, handler: impl Fn() + Send + 'static) -> &Self {
        self.site
            .complete_handlers
            .lock()
            .expect("site handlers lock poisoned")
            .push(Box::new(handler));
        self
    }
}

fn binding_for(engine: Option<&Arc<EngineInner>>) -> Arc<dyn StateBinding> {
    engine.map_or_else(|| Arc::new(WatchBinding) as Arc<dyn StateBinding>, |engine| engine.binding.clone())
}

fn spawn_handler(site: &Arc<Site>, force: bool) -> Arc<dyn Fn() + Send + Sync> {
    let site = site.clone();
    Arc::new(move || {
        let site = site.clone();
        tokio::spawn(async move {
            let _ = site.run(force, false).await;
        });
    })
}

fn effect(
    site: &Arc<Site>,
    states: &FrontStates,
    watching: Vec<DepStream>,
    immediate: bool,
    debounce: Duration,
    force: bool,
) -> EffectRequest {
    let save_site = Arc::downgrade(site);
    let remove_site = Arc::downgrade(site);
    EffectRequest {
        handler: spawn_handler(site, force),
        remove_states: Box::new(move || {
            if let Some(site) = remove_site.upgrade() {
                site.unregister();
            }
        }),
        save_states: Box::new(move |_| {
            if let Some(site) = save_site.upgrade() {
                if let Some(method) = site.resolve_method() {
                    site.register(method.fingerprint());
                }
            }
        }),
        front_states: states.clone(),
        watching,
        immediate,
        debounce,
    }
}

/// Registers a one-shot request site for `method`.
///
/// With the default `immediate: true`, the request runs exactly once at
/// registration through the cache-then-execute path; further runs only
/// happen through [`RequestHandle::send`].
pub fn use_request(method: &Method, config: RequestConfig) -> RequestHandle {
    let engine = method.engine();
    let binding = binding_for(engine.as_ref());
    let states = FrontStates::create(
        binding.as_ref(),
        config.initial_data.clone().unwrap_or(Value::Null),
    );
    let site = Site::new(
        method.engine_weak(),
        Some(MethodSource::Fixed(method.clone())),
        binding.clone(),
        states.clone(),
        config.force,
        config.silent,
        config.initial_data,
    );

    let params = effect(&site, &states, vec![], config.immediate, Duration::ZERO, config.force);
    binding.effect_request(params);
    RequestHandle { site }
}

/// Registers a watched request site.
///
/// `handler` rebuilds the descriptor from the current dependency values on
/// every trigger. The site re-runs once per distinguishable dependency
/// change, debounced trailing-edge; `immediate: true` adds an undebounced
/// first run.
pub fn use_watcher(
    handler: impl Fn() -> Method + Send + Sync + 'static,
    watching: Vec<DepStream>,
    config: WatcherConfig,
) -> RequestHandle {
    // Probe once to bind the site to the owning engine.
    let probe = handler();
    let engine = probe.engine();
    let binding = binding_for(engine.as_ref());
    let states = FrontStates::create(
        binding.as_ref(),
        config.initial_data.clone().unwrap_or(Value::Null),
    );
    let site = Site::new(
        probe.engine_weak(),
        Some(MethodSource::Factory(Arc::new(handler))),
        binding.clone(),
        states.clone(),
        config.force,
        config.silent,
        config.initial_data,
    );

    let params = effect(
        &site,
        &states,
        watching,
        config.immediate,
        config.debounce,
        config.force,
    );
    binding.effect_request(params);
    RequestHandle { site }
}

/// A data fetcher: pulls fresh data for descriptors whose states live in
/// other sites, exposing only its own `fetching`/`error`/progress states.
pub struct Fetcher {
    site: Arc<Site>,
}

impl Fetcher {
    /// `true` while a fetch is in flight.
    #[must_use]
    pub fn fetching(&self) -> bool {
        self.site.states.loading()
    }

    /// Dehydrated error message of the last fetch, if it failed.
    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.site.states.error()
    }

    /// Dehydrated download progress.
    #[must_use]
    pub fn downloading(&self) -> Progress {
        self.site.states.downloading()
    }

    /// Dehydrated upload progress.
    #[must_use]
    pub fn uploading(&self) -> Progress {
        self.site.states.uploading()
    }

    /// The fetcher's own state cells.
    #[must_use]
    pub fn states(&self) -> &FrontStates {
        &self.site.states
    }

    /// Fetches `method` through the cache-then-execute path and pushes the
    /// fresh data into the `data` state of every active site bound to the
    /// same fingerprint.
    ///
    /// # Errors
    ///
    /// Returns the execution's [`RequestError`].
    pub async fn fetch(&self, method: &Method) -> Result<Value, RequestError> {
        self.site.set_method(method.clone());
        let result = self.site.clone().run(self.site.force, true).await;

        if let Ok(value) = &result {
            if let Some(engine) = method.engine() {
                for saved in engine.saved_sites(method.fingerprint()) {
                    if saved.id != self.site.id {
                        saved.binding.update(
                            FrontUpdate::default().data(value.clone()),
                            &saved.states,
                        );
                    }
                }
            }
        }
        result
    }

    /// Aborts the in-flight fetch, if any.
    pub fn abort(&self) {
        self.site.abort();
    }
}

/// Creates a [`Fetcher`] bound to `engine`.
#[must_use]
pub fn use_fetcher(engine: &Engine, config: FetcherConfig) -> Fetcher {
    let inner = engine.inner();
    let binding = inner.binding.clone();
    let states = FrontStates::create(binding.as_ref(), Value::Null);
    let site = Site::new(
        Arc::downgrade(inner),
        None,
        binding,
        states,
        config.force,
        false,
        None,
    );
    Fetcher { site }
}
