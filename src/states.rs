//! Framework-agnostic reactive request state.
//!
//! Every active request site owns one [`FrontStates`] group: `loading`,
//! `data`, `error`, `downloading`, `uploading`. The engine never represents
//! these in any UI library's terms: it creates cells through a
//! [`StateBinding`] and mutates them only through [`StateBinding::update`].
//! A binding for a concrete UI library implements cell creation, export to
//! the library's native reactive handle, and [`StateBinding::effect_request`],
//! the seam where the engine's scheduling policy meets the framework's
//! lifecycle.
//!
//! The crate ships [`WatchBinding`], a binding built on
//! [`tokio::sync::watch`] channels. It drives the reference scheduler and is
//! the default for engines built without an explicit binding.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use serde_json::Value;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::error::RequestError;
use crate::transport::Progress;

/// A single reactive cell holding a plain [`Value`].
pub trait StateCell: Send + Sync {
    /// Replaces the cell's value, notifying the binding's subscribers.
    fn set(&self, value: Value);

    /// Returns the cell's current value.
    fn get(&self) -> Value;

    /// Dynamic view of the concrete cell, used by bindings to export their
    /// own cell type.
    fn as_any(&self) -> &dyn Any;
}

/// The five state cells of one request site.
#[derive(Clone)]
pub struct FrontStates {
    /// `true` while an execution for this site is in flight.
    pub loading: Arc<dyn StateCell>,
    /// The last successful (possibly transformed) payload.
    pub data: Arc<dyn StateCell>,
    /// The last error message, or `null` after a success.
    pub error: Arc<dyn StateCell>,
    /// Download progress of the current execution.
    pub downloading: Arc<dyn StateCell>,
    /// Upload progress of the current execution.
    pub uploading: Arc<dyn StateCell>,
}

impl FrontStates {
    pub(crate) fn create(binding: &dyn StateBinding, initial_data: Value) -> Self {
        Self {
            loading: binding.create(Value::Bool(false)),
            data: binding.create(initial_data),
            error: binding.create(Value::Null),
            downloading: binding.create(progress_value(Progress::default())),
            uploading: binding.create(progress_value(Progress::default())),
        }
    }

    /// Dehydrated `loading` flag.
    #[must_use]
    pub fn loading(&self) -> bool {
        self.loading.get().as_bool().unwrap_or(false)
    }

    /// Dehydrated `data` value.
    #[must_use]
    pub fn data(&self) -> Value {
        self.data.get()
    }

    /// Dehydrated error message, if the last execution failed.
    #[must_use]
    pub fn error(&self) -> Option<String> {
        match self.error.get() {
            Value::String(message) => Some(message),
            _ => None,
        }
    }

    /// Dehydrated download progress.
    #[must_use]
    pub fn downloading(&self) -> Progress {
        progress_from_value(&self.downloading.get())
    }

    /// Dehydrated upload progress.
    #[must_use]
    pub fn uploading(&self) -> Progress {
        progress_from_value(&self.uploading.get())
    }
}

fn progress_value(progress: Progress) -> Value {
    serde_json::to_value(progress).unwrap_or(Value::Null)
}

fn progress_from_value(value: &Value) -> Progress {
    serde_json::from_value(value.clone()).unwrap_or_default()
}

/// A partial state write, applied atomically to one [`FrontStates`] group.
#[derive(Default)]
pub struct FrontUpdate {
    pub loading: Option<bool>,
    pub data: Option<Value>,
    /// `Some(None)` clears the error cell; `Some(Some(e))` records `e`.
    pub error: Option<Option<RequestError>>,
    pub downloading: Option<Progress>,
    pub uploading: Option<Progress>,
}

impl FrontUpdate {
    pub(crate) fn loading(mut self, loading: bool) -> Self {
        self.loading = Some(loading);
        self
    }

    pub(crate) fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub(crate) fn error(mut self, error: Option<RequestError>) -> Self {
        self.error = Some(error);
        self
    }

    pub(crate) fn downloading(mut self, progress: Progress) -> Self {
        self.downloading = Some(progress);
        self
    }

    pub(crate) fn uploading(mut self, progress: Progress) -> Self {
        self.uploading = Some(progress);
        self
    }
}

/// A dependency a watched request re-runs on: any stream of change
/// notifications. Stream termination ends the watch.
pub type DepStream = BoxStream<'static, ()>;

/// Turns a [`watch::Receiver`] into a [`DepStream`] that fires on every
/// change after subscription (the current value does not count as a change).
#[must_use]
pub fn watch_dep<T: Clone + Send + Sync + 'static>(receiver: watch::Receiver<T>) -> DepStream {
    use futures::StreamExt;
    Box::pin(WatchStream::from_changes(receiver).map(|_| ()))
}

/// Parameters handed to [`StateBinding::effect_request`].
///
/// `handler` triggers exactly one execution each time it is called; the
/// binding (or the reference scheduler it delegates to) decides *when* to
/// call it: once at registration for an empty `watching` set, per debounced
/// dependency change otherwise, plus an undebounced first run when
/// `immediate` is set.
pub struct EffectRequest {
    /// Triggers one execution.
    pub handler: Arc<dyn Fn() + Send + Sync>,
    /// Unregisters the site's states; bindings call this on unmount.
    pub remove_states: Box<dyn FnOnce() + Send>,
    /// Registers the site's states for cross-site updates.
    pub save_states: Box<dyn Fn(&FrontStates) + Send + Sync>,
    /// The site's state cells.
    pub front_states: FrontStates,
    /// Reactive dependencies; empty means fire-once semantics.
    pub watching: Vec<DepStream>,
    /// Forces a first run before any dependency change.
    pub immediate: bool,
    /// Trailing debounce window for dependency bursts.
    pub debounce: Duration,
}

/// Adapter between the engine and one reactive framework.
///
/// The default method bodies implement the engine's reference policy: plain
/// cell writes for [`update`](Self::update) and the scheduler contract for
/// [`effect_request`](Self::effect_request). A binding for a batching UI
/// framework overrides them to route through its own change machinery.
pub trait StateBinding: Send + Sync + 'static {
    /// Creates one reactive cell holding `initial`.
    fn create(&self, initial: Value) -> Arc<dyn StateCell>;

    /// Exports a cell as the binding's library-native reactive handle.
    fn export(&self, cell: &Arc<dyn StateCell>) -> Box<dyn Any + Send>;

    /// Converts a cell to a plain value.
    fn dehydrate(&self, cell: &dyn StateCell) -> Value {
        cell.get()
    }

    /// Applies a partial update to a state group.
    fn update(&self, update: FrontUpdate, states: &FrontStates) {
        if let Some(loading) = update.loading {
            states.loading.set(Value::Bool(loading));
        }
        if let Some(data) = update.data {
            states.data.set(data);
        }
        if let Some(error) = update.error {
            states.error.set(match error {
                Some(error) => Value::String(error.to_string()),
                None => Value::Null,
            });
        }
        if let Some(progress) = update.downloading {
            states.downloading.set(progress_value(progress));
        }
        if let Some(progress) = update.uploading {
            states.uploading.set(progress_value(progress));
        }
    }

    /// Invokes `params.handler` under the framework's lifecycle rules.
    fn effect_request(&self, params: EffectRequest) {
        crate::scheduler::drive(params);
    }
}

/// Reference [`StateBinding`] over [`tokio::sync::watch`] channels.
///
/// [`export`](StateBinding::export) hands back a
/// `watch::Receiver<Value>`, so plain async code can await state changes
/// without any UI framework.
#[derive(Debug, Default, Clone, Copy)]
pub struct WatchBinding;

/// The cell type created by [`WatchBinding`].
#[derive(Debug)]
pub struct WatchCell {
    sender: watch::Sender<Value>,
}

impl WatchCell {
    /// Subscribes to this cell's changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Value> {
        self.sender.subscribe()
    }
}

impl StateCell for WatchCell {
    fn set(&self, value: Value) {
        self.sender.send_replace(value);
    }

    fn get(&self) -> Value {
        self.sender.borrow().clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl StateBinding for WatchBinding {
    fn create(&self, initial: Value) -> Arc<dyn StateCell> {
        let (sender, _) = watch::channel(initial);
        Arc::new(WatchCell { sender })
    }

    fn export(&self, cell: &Arc<dyn StateCell>) -> Box<dyn Any + Send> {
        match cell.as_any().downcast_ref::<WatchCell>() {
            Some(cell) => Box::new(cell.subscribe()),
            // Foreign cell: fall back to the dehydrated value.
            None => Box::new(cell.get()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_watch_cell_set_get() {
        let binding = WatchBinding;
        let cell = binding.create(json!(1));
        assert_eq!(cell.get(), json!(1));

        cell.set(json!({"a": 2}));
        assert_eq!(cell.get(), json!({"a": 2}));
    }

    #[test]
    fn test_export_returns_watch_receiver() {
        let binding = WatchBinding;
        let cell = binding.create(json!("x"));
        let exported = binding.export(&cell);
        let receiver = exported
            .downcast::<watch::Receiver<Value>>()
            .expect("watch receiver");
        assert_eq!(*receiver.borrow(), json!("x"));
    }

    #[test]
    fn test_front_states_dehydrate() {
        let binding = WatchBinding;
        let states = FrontStates::create(&binding, json!({"id": 1}));

        assert!(!states.loading());
        assert_eq!(states.data(), json!({"id": 1}));
        assert_eq!(states.error(), None);
        assert_eq!(states.downloading(), Progress::default());
    }

    #[test]
    fn test_update_applies_partial_writes() {
        let binding = WatchBinding;
        let states = FrontStates::create(&binding, Value::Null);

        binding.update(
            FrontUpdate::default()
                .loading(true)
                .downloading(Progress::new(10, 100)),
            &states,
        );
        assert!(states.loading());
        assert_eq!(states.downloading(), Progress::new(10, 100));
        // Untouched fields keep their values.
        assert_eq!(states.data(), Value::Null);

        binding.update(
            FrontUpdate::default()
                .loading(false)
                .data(json!([1, 2]))
                .error(None),
            &states,
        );
        assert!(!states.loading());
        assert_eq!(states.data(), json!([1, 2]));
        assert_eq!(states.error(), None);
    }

    #[test]
    fn test_update_records_and_clears_error() {
        let binding = WatchBinding;
        let states = FrontStates::create(&binding, Value::Null);

        binding.update(
            FrontUpdate::default().error(Some(RequestError::Transport("down".to_string()))),
            &states,
        );
        assert_eq!(states.error().as_deref(), Some("transport failed: down"));

        binding.update(FrontUpdate::default().error(None), &states);
        assert_eq!(states.error(), None);
    }

    #[tokio::test]
    async fn test_watch_dep_fires_on_change_only() {
        use futures::StreamExt;

        let (tx, rx) = watch::channel(0);
        let mut dep = watch_dep(rx);

        // No change yet: the stream must not yield the initial value.
        let pending =
            tokio::time::timeout(Duration::from_millis(20), dep.next()).await;
        assert!(pending.is_err());

        tx.send(1).expect("send");
        let fired = tokio::time::timeout(Duration::from_millis(100), dep.next()).await;
        assert!(matches!(fired, Ok(Some(()))));
    }
}
