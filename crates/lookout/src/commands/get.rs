//! `lookout get`: one authenticated fetch, printed in the chosen format.

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cli::{GetArgs, GlobalOpts};
use crate::config;
use crate::error::CliError;
use crate::output;

pub async fn handle(args: GetArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let resolved = config::resolve(global)?;
    let (query, options) = super::request_options(&args.request)?;
    let timeout = resolved.sync.timeout;
    let session = super::session_for(resolved.sync, &resolved.token)?;

    debug!(
        profile = %resolved.profile_name,
        resource = %args.resource,
        "fetching resource"
    );
    let result = session
        .client()
        .get_json(&args.resource, &query, &options, &CancellationToken::new())
        .await;
    session.shutdown().await;

    let value = result.map_err(|e| super::fetch_error(e, timeout))?;
    output::print_output(&output::render(global.output, &value)?, global.quiet)
}
