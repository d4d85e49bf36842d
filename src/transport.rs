//! Transport adapter contract.
//!
//! The engine never performs network I/O itself. A [`RequestTransport`] turns
//! an effective [`AdapterRequest`] into a [`TransportTask`]: a pair of
//! awaitable handles for the raw response and the response headers, optional
//! progress receivers, and an abort hook. Any HTTP client (or anything
//! HTTP-shaped) can back an engine by implementing this one method.

pub mod mock;

use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use crate::error::RequestError;
use crate::method::{Headers, Params, Verb};

/// Transfer progress reported by a transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Bytes transferred so far.
    pub loaded: u64,
    /// Total bytes expected, or 0 when unknown.
    pub total: u64,
}

impl Progress {
    /// Creates a progress value.
    #[must_use]
    pub const fn new(loaded: u64, total: u64) -> Self {
        Self { loaded, total }
    }
}

/// The effective, adapter-facing request configuration.
///
/// Built by the executor from the engine defaults overlaid with the
/// descriptor's own fields, then passed through the engine's optional
/// `before_request` hook (which may replace it wholesale) before reaching
/// the transport.
#[derive(Debug, Clone)]
pub struct AdapterRequest {
    /// Request verb.
    pub verb: Verb,
    /// Absolute URL (engine base URL joined with the descriptor URL).
    pub url: String,
    /// Query parameters.
    pub params: Params,
    /// Effective headers.
    pub headers: Headers,
    /// Request body, if any.
    pub body: Option<Value>,
    /// Effective timeout (descriptor timeout, else engine timeout). Advisory
    /// to the transport; the executor enforces it regardless.
    pub timeout: Option<Duration>,
    /// Whether the caller wants download progress events.
    pub enable_download: bool,
    /// Whether the caller wants upload progress events.
    pub enable_upload: bool,
    /// Opaque caller data from the descriptor.
    pub extra: Option<Value>,
}

/// A single in-flight transport operation.
///
/// `response` and `headers` are independent awaitables so a transport can
/// expose headers before the body finishes streaming. `download`/`upload` are
/// only populated when the matching `enable_*` flag was set on the request.
pub struct TransportTask {
    /// Resolves with the raw response payload.
    pub response: BoxFuture<'static, Result<Value, RequestError>>,
    /// Resolves with the response headers.
    pub headers: BoxFuture<'static, Result<Headers, RequestError>>,
    /// Download progress, when enabled.
    pub download: Option<watch::Receiver<Progress>>,
    /// Upload progress, when enabled.
    pub upload: Option<watch::Receiver<Progress>>,
    /// Abort hook; invoked at most once when the execution is cancelled or
    /// times out. Transports without abort support may leave this `None`.
    pub abort: Option<Box<dyn FnOnce() + Send>>,
}

/// A pluggable transport: turns an effective request configuration into an
/// in-flight operation.
pub trait RequestTransport: Send + Sync + 'static {
    /// Starts one request. Must not block; all waiting happens through the
    /// returned task's futures.
    fn request(&self, request: AdapterRequest) -> TransportTask;
}
