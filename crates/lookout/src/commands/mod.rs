//! Command handlers and the helpers they share.

pub mod config_cmd;
pub mod get;
pub mod watch;

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;

use lookout_api::{FetchOptions, MemorySessionStorage, QueryParams};
use lookout_core::{CoreError, Session, SyncConfig};

use crate::cli::RequestArgs;
use crate::error::CliError;

/// Query parameters and headers from `--query` / `--header`.
fn request_options(args: &RequestArgs) -> Result<(QueryParams, FetchOptions), CliError> {
    let query: QueryParams = args.query.iter().cloned().collect();

    let mut options = FetchOptions::default();
    for (name, value) in &args.headers {
        options = options.with_header(name, value)?;
    }
    Ok((query, options))
}

/// A session whose storage starts out holding `token`.
fn session_for(sync: SyncConfig, token: &SecretString) -> Result<Session, CliError> {
    let session = Session::new(sync, Arc::new(MemorySessionStorage::new()))?;
    session.set_token(token);
    Ok(session)
}

/// Map a fetch error, reporting timeouts with the configured limit.
fn fetch_error(err: lookout_api::Error, timeout: Duration) -> CliError {
    match CoreError::from(err) {
        CoreError::Timeout { .. } => CliError::Timeout {
            seconds: timeout.as_secs(),
        },
        other => other.into(),
    }
}
