//! Mock transport for testing.
//!
//! [`MockTransport`] is a controllable [`RequestTransport`] that serves
//! scripted responses without real I/O. It is shared between the engine and
//! test code: clone the handle, keep one side for assertions.
//!
//! ```rust,ignore
//! let transport = MockTransport::new();
//! transport.respond_with(json!({"id": 1}));
//!
//! let engine = Engine::new("main", transport.clone(), EngineOptions::default());
//! // ... drive requests ...
//! assert_eq!(transport.call_count(), 1);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::RequestError;
use crate::method::Headers;
use crate::transport::{AdapterRequest, Progress, RequestTransport, TransportTask};

#[derive(Default)]
struct MockState {
    scripted: VecDeque<Result<Value, RequestError>>,
    default_response: Value,
    headers: Headers,
    latency: Option<Duration>,
    calls: Vec<AdapterRequest>,
}

/// A scriptable transport that records every request it receives.
///
/// Responses are served from a FIFO script when one is queued, otherwise from
/// the default response (initially `null`). An optional latency delays every
/// resolution, which makes abort and debounce behavior observable in tests.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    aborted: Arc<AtomicUsize>,
}

impl MockTransport {
    /// Creates a transport that answers every request with `null`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the response served when the script queue is empty.
    pub fn respond_with(&self, value: Value) {
        self.lock().default_response = value;
    }

    /// Queues one scripted outcome; scripted outcomes are served in order
    /// before the default response.
    pub fn enqueue(&self, outcome: Result<Value, RequestError>) {
        self.lock().scripted.push_back(outcome);
    }

    /// Sets the response headers served with every request.
    pub fn set_headers(&self, headers: Headers) {
        self.lock().headers = headers;
    }

    /// Delays every resolution by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = Some(latency);
    }

    /// Number of requests received so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    /// Snapshot of every request received so far, in arrival order.
    #[must_use]
    pub fn calls(&self) -> Vec<AdapterRequest> {
        self.lock().calls.clone()
    }

    /// Number of times an execution invoked the abort hook.
    #[must_use]
    pub fn aborted_count(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock transport lock poisoned")
    }
}

impl RequestTransport for MockTransport {
    fn request(&self, request: AdapterRequest) -> TransportTask {
        let (outcome, headers, latency) = {
            let mut state = self.lock();
            state.calls.push(request.clone());
            let outcome = state
                .scripted
                .pop_front()
                .unwrap_or_else(|| Ok(state.default_response.clone()));
            (outcome, state.headers.clone(), state.latency)
        };

        let token = CancellationToken::new();
        let abort_token = token.clone();
        let aborted = self.aborted.clone();

        let download = request.enable_download.then(|| {
            let (tx, rx) = watch::channel(Progress::default());
            (tx, rx)
        });
        let upload = request.enable_upload.then(|| {
            let (tx, rx) = watch::channel(Progress::default());
            (tx, rx)
        });

        let (download_tx, download_rx) = match download {
            Some((tx, rx)) => (Some(tx), Some(rx)),
            None => (None, None),
        };
        let (upload_tx, upload_rx) = match upload {
            Some((tx, rx)) => (Some(tx), Some(rx)),
            None => (None, None),
        };

        let response = async move {
            if let Some(tx) = &upload_tx {
                let _ = tx.send(Progress::new(100, 100));
            }
            if let Some(latency) = latency {
                tokio::select! {
                    () = tokio::time::sleep(latency) => {}
                    () = token.cancelled() => return Err(RequestError::Aborted),
                }
            } else if token.is_cancelled() {
                return Err(RequestError::Aborted);
            }
            if let Some(tx) = &download_tx {
                let _ = tx.send(Progress::new(100, 100));
            }
            outcome
        }
        .boxed();

        TransportTask {
            response,
            headers: async move { Ok(headers) }.boxed(),
            download: download_rx,
            upload: upload_rx,
            abort: Some(Box::new(move || {
                aborted.fetch_add(1, Ordering::SeqCst);
                abort_token.cancel();
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::Verb;

    fn request() -> AdapterRequest {
        AdapterRequest {
            verb: Verb::Get,
            url: "/test".to_string(),
            params: Default::default(),
            headers: Default::default(),
            body: None,
            timeout: None,
            enable_download: false,
            enable_upload: false,
            extra: None,
        }
    }

    #[tokio::test]
    async fn test_default_response() {
        let transport = MockTransport::new();
        let task = transport.request(request());
        assert_eq!(task.response.await.expect("response"), Value::Null);
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_scripted_before_default() {
        let transport = MockTransport::new();
        transport.respond_with(serde_json::json!("default"));
        transport.enqueue(Ok(serde_json::json!("first")));
        transport.enqueue(Err(RequestError::Transport("down".to_string())));

        let first = transport.request(request()).response.await;
        assert_eq!(first.expect("first"), serde_json::json!("first"));

        let second = transport.request(request()).response.await;
        assert_eq!(
            second.expect_err("second"),
            RequestError::Transport("down".to_string())
        );

        let third = transport.request(request()).response.await;
        assert_eq!(third.expect("third"), serde_json::json!("default"));
    }

    #[tokio::test]
    async fn test_abort_cancels_delayed_response() {
        let transport = MockTransport::new();
        transport.set_latency(Duration::from_secs(30));

        let task = transport.request(request());
        task.abort.expect("abort hook")();

        let result = task.response.await;
        assert_eq!(result.expect_err("aborted"), RequestError::Aborted);
        assert_eq!(transport.aborted_count(), 1);
    }

    #[tokio::test]
    async fn test_progress_channels_follow_flags() {
        let transport = MockTransport::new();

        let task = transport.request(request());
        assert!(task.download.is_none());
        assert!(task.upload.is_none());

        let mut with_download = request();
        with_download.enable_download = true;
        let task = transport.request(with_download);
        let rx = task.download.expect("download channel");
        task.response.await.expect("response");
        assert_eq!(*rx.borrow(), Progress::new(100, 100));
    }
}
