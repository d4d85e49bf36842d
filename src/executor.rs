//! Request execution pipeline.
//!
//! The executor is stateless and re-entrant: given a descriptor it builds the
//! effective adapter request, runs the hook pipeline, and hands back an
//! [`Execution`], a shared future any number of call sites can await. The
//! engine's in-flight map deduplicates executions per fingerprint; `fresh`
//! executions bypass the map and supersede its entry.
//!
//! Pipeline order: merge defaults → `before_request` hook → transport →
//! response hook(s) → `transform_data` → cache write → resolve. A failure at
//! any stage invokes the error hook and rejects with the original error.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::{EngineInner, Responded};
use crate::error::RequestError;
use crate::method::{Method, TransformFn};
use crate::transport::{AdapterRequest, Progress, TransportTask};

/// Future type every awaiter of one execution shares.
pub(crate) type SharedResult = Shared<BoxFuture<'static, Result<Value, RequestError>>>;

static EXECUTION_IDS: AtomicU64 = AtomicU64::new(0);

/// One in-flight execution, cheap to clone between call sites.
#[derive(Clone)]
pub(crate) struct Execution {
    id: u64,
    pub(crate) result: SharedResult,
    pub(crate) cancel: CancellationToken,
    pub(crate) download: Option<watch::Receiver<Progress>>,
    pub(crate) upload: Option<watch::Receiver<Progress>>,
}

/// Starts (or joins) an execution for `method`.
///
/// With `fresh: false` an existing in-flight execution for the same
/// fingerprint is reused. With `fresh: true` a new execution starts and
/// supersedes the in-flight map entry; the superseded execution still
/// resolves for whoever awaits it, but later writers win at the call sites.
pub(crate) fn begin(engine: &Arc<EngineInner>, method: &Method, fresh: bool) -> Execution {
    let fingerprint = method.fingerprint();

    if !fresh {
        if let Some(existing) = engine.inflight.get(&fingerprint) {
            debug!(%fingerprint, "joining in-flight execution");
            return existing.value().clone();
        }
    }

    let request = engine.adapter_request(method);
    debug!(%fingerprint, verb = %request.verb, url = %request.url, "starting execution");

    let TransportTask {
        response,
        headers,
        download,
        upload,
        abort,
    } = engine.transport.request(request.clone());

    let id = EXECUTION_IDS.fetch_add(1, Ordering::Relaxed) + 1;
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let timeout = request.timeout;
    let responded = engine.responded.clone();
    let transform = method.transform();
    let policy = method.policy().clone();
    let weak = Arc::downgrade(engine);

    let result = async move {
        let outcome = pipeline(
            response, headers, abort, token, timeout, responded, transform, request,
        )
        .await;

        if let Some(engine) = weak.upgrade() {
            if let Ok(value) = &outcome {
                engine.cache.set(fingerprint, value.clone(), &policy);
            }
            // Only drop the map entry if it still belongs to this execution;
            // a fresh execution may have superseded it meanwhile.
            engine
                .inflight
                .remove_if(&fingerprint, |_, execution| execution.id == id);
        }
        outcome
    }
    .boxed()
    .shared();

    let execution = Execution {
        id,
        result,
        cancel,
        download,
        upload,
    };
    engine.inflight.insert(fingerprint, execution.clone());
    execution
}

/// Resolves a descriptor once: cache first (unless `force`), then a fresh
/// execution. Used by manual sends, which supersede any in-flight execution
/// rather than joining it.
///
/// A placeholder-mode hit resolves immediately with the persisted value while
/// one real execution is scheduled in the background (deduplicated through
/// the in-flight map).
pub(crate) async fn resolve(
    engine: &Arc<EngineInner>,
    method: &Method,
    force: bool,
) -> Result<Value, RequestError> {
    if !force {
        if let Some(hit) = engine.cache.get(method.fingerprint(), method.policy()) {
            if hit.placeholder {
                let refresh = begin(engine, method, false).result;
                tokio::spawn(async move {
                    let _ = refresh.await;
                });
            }
            return Ok(hit.payload);
        }
    }
    begin(engine, method, true).result.await
}

#[allow(clippy::too_many_arguments)]
async fn pipeline(
    response: BoxFuture<'static, Result<Value, RequestError>>,
    headers: BoxFuture<'static, Result<crate::method::Headers, RequestError>>,
    abort: Option<Box<dyn FnOnce() + Send>>,
    cancel: CancellationToken,
    timeout: Option<Duration>,
    responded: Option<Responded>,
    transform: Option<TransformFn>,
    request: AdapterRequest,
) -> Result<Value, RequestError> {
    let mut abort = abort;

    let raw = tokio::select! {
        () = cancel.cancelled() => Err(RequestError::Aborted),
        result = await_response(timeout, response) => result,
    };
    if matches!(raw, Err(RequestError::Aborted | RequestError::Timeout(_))) {
        if let Some(abort) = abort.take() {
            abort();
        }
    }

    // A success hook that fails routes into the error path exactly like a
    // transport failure.
    let intercepted = match raw {
        Ok(raw) => match &responded {
            None => Ok(raw),
            Some(Responded::Handler(handler)) => handler(raw, &request),
            Some(Responded::Record { on_success, .. }) => on_success(raw, &request),
        },
        Err(error) => Err(error),
    };

    let outcome = match intercepted {
        Ok(raw) => {
            let headers = headers.await.unwrap_or_default();
            match &transform {
                Some(transform) => transform(raw, &headers),
                None => Ok(raw),
            }
        }
        Err(error) => Err(error),
    };

    if let Err(error) = &outcome {
        debug!(error = %error, "execution failed");
        if let Some(Responded::Record { on_error, .. }) = &responded {
            on_error(error, &request);
        }
    }
    outcome
}

async fn await_response(
    timeout: Option<Duration>,
    response: BoxFuture<'static, Result<Value, RequestError>>,
) -> Result<Value, RequestError> {
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, response).await {
            Ok(result) => result,
            Err(_) => Err(RequestError::Timeout(limit)),
        },
        None => response.await,
    }
}
