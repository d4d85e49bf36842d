//! Reference effect-scheduling policy.
//!
//! [`drive`] implements the contract framework bindings are held to:
//!
//! - empty dependency set: the handler runs once at registration (gated by
//!   `immediate`, which defaults to on for one-shot requests);
//! - non-empty dependency set: one run per distinguishable change, after a
//!   **trailing** debounce: a burst of notifications inside the window
//!   collapses to exactly one run, timed from the last notification;
//! - `immediate` adds an undebounced first run before any change.
//!
//! Manual sends and fetches bypass this module entirely; they trigger the
//! same execution path directly.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use tracing::debug;

use crate::states::EffectRequest;

/// Drives one registered request site. Consumes the effect parameters:
/// registers the states, performs the immediate run if requested, and spawns
/// the watch loop when there are dependencies.
pub(crate) fn drive(params: EffectRequest) {
    let EffectRequest {
        handler,
        remove_states: _remove_states,
        save_states,
        front_states,
        watching,
        immediate,
        debounce,
    } = params;

    save_states(&front_states);

    if watching.is_empty() {
        if immediate {
            handler();
        }
        return;
    }

    if immediate {
        handler();
    }

    let merged = stream::select_all(watching).boxed();
    tokio::spawn(watch_loop(merged, debounce, handler));
}

/// Re-runs `handler` once per dependency burst. Returns when every
/// dependency stream has terminated; a burst cut short by termination does
/// not run (the watching site is gone).
async fn watch_loop(
    mut deps: BoxStream<'static, ()>,
    debounce: Duration,
    handler: Arc<dyn Fn() + Send + Sync>,
) {
    while deps.next().await.is_some() {
        if !debounce.is_zero() {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(debounce) => break,
                    next = deps.next() => match next {
                        // Another notification inside the window restarts it.
                        Some(()) => {}
                        None => {
                            debug!("dependency streams closed mid-burst");
                            return;
                        }
                    },
                }
            }
        }
        handler();
    }
}
