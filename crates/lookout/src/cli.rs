//! Clap derive structures for the `lookout` CLI.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// lookout -- fetch monitoring resources and watch them change
#[derive(Debug, Parser)]
#[command(
    name = "lookout",
    version,
    about = "Fetch backend resources and keep them fresh from change notifications",
    long_about = "Reads resources from the REST API and, in watch mode, re-fetches them\n\
        whenever the MQTT broker announces a change on the matching topic.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Profile to use
    #[arg(long, short = 'p', env = "LOOKOUT_PROFILE", global = true)]
    pub profile: Option<String>,

    /// Config file (overrides the platform default)
    #[arg(long, env = "LOOKOUT_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// REST API root (overrides profile)
    #[arg(long, env = "LOOKOUT_API_ROOT", global = true)]
    pub api_root: Option<String>,

    /// Access token (overrides profile, env and keyring)
    #[arg(long, env = "LOOKOUT_TOKEN", global = true, hide_env_values = true)]
    pub token: Option<String>,

    /// Output format
    #[arg(
        long,
        short = 'o',
        env = "LOOKOUT_OUTPUT",
        default_value = "json",
        global = true
    )]
    pub output: OutputFormat,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Accept self-signed TLS certificates
    #[arg(long, short = 'k', env = "LOOKOUT_INSECURE", global = true)]
    pub insecure: bool,

    /// Request timeout in seconds (overrides profile)
    #[arg(long, env = "LOOKOUT_TIMEOUT", global = true)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON (one document per line)
    JsonCompact,
    /// YAML
    Yaml,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetch a resource once
    Get(GetArgs),

    /// Fetch resources and re-fetch them on every change notification
    #[command(alias = "w")]
    Watch(WatchArgs),

    /// Manage CLI configuration and profiles
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

// ── Shared request arguments ─────────────────────────────────────────

#[derive(Debug, Args)]
pub struct RequestArgs {
    /// Query parameter as key=value (repeatable, order kept)
    #[arg(long = "query", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    pub query: Vec<(String, String)>,

    /// Extra request header as "Name: value" (repeatable)
    #[arg(long = "header", short = 'H', value_name = "NAME: VALUE", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,
}

fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    Ok((key.to_owned(), value.to_owned()))
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected \"NAME: VALUE\", got '{raw}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty header name in '{raw}'"));
    }
    Ok((name.to_owned(), value.trim().to_owned()))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  GET
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Args)]
pub struct GetArgs {
    /// Resource path relative to the API root (e.g. accounts/1/entities)
    pub resource: String,

    #[command(flatten)]
    pub request: RequestArgs,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  WATCH
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Resource paths to keep fresh
    #[arg(required = true)]
    pub resources: Vec<String>,

    /// Listen on this topic instead of the resource path (single resource;
    /// `+` matches one segment, a trailing `#` any remainder)
    #[arg(long)]
    pub topic: Option<String>,

    /// Only re-fetch when the notification payload has FIELD equal to VALUE
    #[arg(long, value_name = "FIELD=VALUE", value_parser = parse_key_val)]
    pub when: Option<(String, String)>,

    /// Debounce window in milliseconds (overrides profile)
    #[arg(long)]
    pub debounce_ms: Option<u64>,

    /// Exit after this many updates
    #[arg(long, short = 'n')]
    pub count: Option<u64>,

    #[command(flatten)]
    pub request: RequestArgs,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  CONFIG
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the config file location
    Path,

    /// Display the loaded configuration (tokens redacted)
    Show,

    /// List configured profiles
    Profiles,

    /// Set the default profile
    Use {
        /// Profile name to set as default
        name: String,
    },

    /// Set a value on the active profile
    Set {
        /// Profile key, e.g. api_root, broker_port, debounce_ms
        key: String,

        /// Value to set
        value: String,
    },

    /// Store a token in the system keyring (reads stdin when VALUE is omitted)
    SetToken {
        /// The token
        value: Option<String>,
    },

    /// Remove the active profile's token from the system keyring
    ForgetToken,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  COMPLETIONS
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}
