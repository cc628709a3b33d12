//! `lookout watch`: register one subscription per resource and print every
//! update until interrupted, `--count` is reached, or the session ends.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};

use lookout_api::{FetchOptions, QueryParams};
use lookout_core::{SessionState, SubscriptionError, SubscriptionId, SubscriptionSpec};

use crate::cli::{GlobalOpts, WatchArgs};
use crate::config;
use crate::error::CliError;
use crate::output;

/// Callbacks tag events with the resource's position on the command line.
enum WatchEvent {
    Update { slot: usize, id: SubscriptionId, value: Value },
    Error { slot: usize, error: SubscriptionError },
}

#[derive(Serialize)]
struct UpdateRecord<'a> {
    subscription: String,
    resource: &'a str,
    received_at: String,
    data: Value,
}

pub async fn handle(args: WatchArgs, global: &GlobalOpts) -> Result<(), CliError> {
    if args.topic.is_some() && args.resources.len() != 1 {
        return Err(CliError::Validation {
            field: "topic".into(),
            reason: "--topic needs exactly one resource".into(),
        });
    }

    let mut resolved = config::resolve(global)?;
    if let Some(ms) = args.debounce_ms {
        resolved.sync.debounce = Duration::from_millis(ms);
    }
    let (query, options) = super::request_options(&args.request)?;
    let session = super::session_for(resolved.sync, &resolved.token)?;
    session.connect().await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut live: HashMap<usize, &str> = HashMap::new();
    for (slot, resource) in args.resources.iter().enumerate() {
        let spec = subscription_spec(slot, resource, &args, &query, &options, tx.clone());
        let id = session.registry().register(spec);
        info!(subscription = %id, %resource, "watching");
        live.insert(slot, resource);
    }
    drop(tx);

    let mut state = session.state();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut printed: u64 = 0;
    let mut last_terminal = String::new();

    let result = loop {
        tokio::select! {
            _ = &mut ctrl_c => break Ok(()),
            changed = state.changed() => {
                if changed.is_err() || *state.borrow() == SessionState::Failed {
                    break Err(session_failed(&last_terminal));
                }
            }
            event = rx.recv() => match event {
                Some(WatchEvent::Update { slot, id, value }) => {
                    let Some(resource) = live.get(&slot).copied() else { continue };
                    let record = UpdateRecord {
                        subscription: id.to_string(),
                        resource,
                        received_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                        data: value,
                    };
                    let printed_ok = output::render_streamed(global.output, &record)
                        .and_then(|rendered| output::print_output(&rendered, global.quiet));
                    if let Err(e) = printed_ok {
                        break Err(e);
                    }
                    printed += 1;
                    if args.count.is_some_and(|limit| printed >= limit) {
                        break Ok(());
                    }
                }
                Some(WatchEvent::Error { slot, error }) if error.terminal => {
                    let resource = live.remove(&slot).unwrap_or_default();
                    warn!(%resource, "{error}");
                    last_terminal = error.message;
                    if live.is_empty() {
                        break Err(if session.current_state() == SessionState::Failed {
                            session_failed(&last_terminal)
                        } else {
                            CliError::SubscriptionEnded { message: last_terminal }
                        });
                    }
                }
                Some(WatchEvent::Error { slot, error }) => {
                    let resource = live.get(&slot).copied().unwrap_or_default();
                    warn!(%resource, "fetch failed: {error}");
                }
                None => break Ok(()),
            },
        }
    };

    session.shutdown().await;
    result
}

fn session_failed(message: &str) -> CliError {
    CliError::AuthFailed {
        message: if message.is_empty() {
            "session ended".into()
        } else {
            message.to_owned()
        },
    }
}

fn subscription_spec(
    slot: usize,
    resource: &str,
    args: &WatchArgs,
    query: &QueryParams,
    options: &FetchOptions,
    tx: mpsc::UnboundedSender<WatchEvent>,
) -> SubscriptionSpec {
    let errors = tx.clone();
    let mut spec = SubscriptionSpec::new(
        resource,
        move |value, id| {
            let _ = tx.send(WatchEvent::Update { slot, id, value });
        },
        move |error| {
            let _ = errors.send(WatchEvent::Error {
                slot,
                error: error.clone(),
            });
        },
    )
    .fetch_options(options.clone());
    spec.query = query.clone();

    if let Some(ref topic) = args.topic {
        spec = spec.topic_override(topic.clone());
    }
    if let Some((field, expected)) = args.when.clone() {
        spec = spec.predicate(field_equals(field, expected));
    }
    spec
}

/// Payload predicate for `--when FIELD=VALUE`. Strings compare by content,
/// everything else by its JSON text.
fn field_equals(field: String, expected: String) -> impl Fn(&Value, &str) -> bool + Send + Sync {
    move |payload: &Value, _topic: &str| match payload.get(&field) {
        Some(Value::String(s)) => *s == expected,
        Some(other) => other.to_string() == expected,
        None => false,
    }
}
