//! Output formatting: JSON, compact JSON, YAML.

use std::io::{self, Write};

use serde::Serialize;

use crate::cli::OutputFormat;
use crate::error::CliError;

/// Render one serde-serializable document in the chosen format.
pub fn render<T: Serialize + ?Sized>(format: OutputFormat, data: &T) -> Result<String, CliError> {
    Ok(match format {
        OutputFormat::Json => serde_json::to_string_pretty(data)?,
        OutputFormat::JsonCompact => serde_json::to_string(data)?,
        OutputFormat::Yaml => serde_yaml::to_string(data)?,
    })
}

/// Render a document that is one of a stream (watch mode).
///
/// YAML documents get a `---` separator so the stream stays parseable.
pub fn render_streamed<T: Serialize + ?Sized>(
    format: OutputFormat,
    data: &T,
) -> Result<String, CliError> {
    let body = render(format, data)?;
    Ok(match format {
        OutputFormat::Yaml => format!("---\n{}", body.trim_end()),
        OutputFormat::Json | OutputFormat::JsonCompact => body,
    })
}

/// Print rendered output to stdout, respecting quiet mode.
///
/// Flushes so piped watch output shows up as it happens.
pub fn print_output(output: &str, quiet: bool) -> Result<(), CliError> {
    if quiet || output.is_empty() {
        return Ok(());
    }
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{output}")?;
    stdout.flush()?;
    Ok(())
}
