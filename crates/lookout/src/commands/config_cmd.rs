//! Config subcommand handlers.

use std::io::BufRead;

use lookout_config::Profile;

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts};
use crate::config;
use crate::error::CliError;
use crate::output;

const REDACTED: &str = "********";

pub fn handle(args: ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Path => {
            println!("{}", config::config_file(global).display());
            Ok(())
        }

        // ── Show ────────────────────────────────────────────────────
        ConfigCommand::Show => {
            let mut cfg = config::load(global)?;
            for profile in cfg.profiles.values_mut() {
                if profile.token.is_some() {
                    profile.token = Some(REDACTED.into());
                }
            }
            output::print_output(&output::render(global.output, &cfg)?, global.quiet)
        }

        // ── Profiles ────────────────────────────────────────────────
        ConfigCommand::Profiles => {
            let cfg = config::load(global)?;
            let default = cfg.default_profile.as_deref().unwrap_or("default");
            if cfg.profiles.is_empty() {
                eprintln!("No profiles configured. Run: lookout config set api_root <url>");
                return Ok(());
            }
            let mut names: Vec<&String> = cfg.profiles.keys().collect();
            names.sort();
            for name in names {
                let marker = if name == default { " *" } else { "" };
                println!("{name}{marker}");
            }
            Ok(())
        }

        // ── Use <name> ──────────────────────────────────────────────
        ConfigCommand::Use { name } => {
            let mut cfg = config::load(global)?;
            cfg.profile(&name)?;
            cfg.default_profile = Some(name.clone());
            config::save(global, &cfg)?;
            eprintln!("✓ Default profile set to '{name}'");
            Ok(())
        }

        // ── Set <key> <value> ───────────────────────────────────────
        ConfigCommand::Set { key, value } => {
            let mut cfg = config::load(global)?;
            let profile_name = config::active_profile_name(global, &cfg);
            let profile = cfg.profiles.entry(profile_name.clone()).or_default();
            apply_setting(profile, &key, value)?;
            config::save(global, &cfg)?;
            eprintln!("✓ Set {key} on profile '{profile_name}'");
            Ok(())
        }

        // ── Keyring ─────────────────────────────────────────────────
        ConfigCommand::SetToken { value } => {
            let cfg = config::load(global)?;
            let profile_name = config::active_profile_name(global, &cfg);
            let token = match value {
                Some(token) => token,
                None => read_token_line()?,
            };
            if token.is_empty() {
                return Err(CliError::Validation {
                    field: "token".into(),
                    reason: "value cannot be empty".into(),
                });
            }
            lookout_config::store_token(&profile_name, &token)?;
            eprintln!("✓ Token stored in system keyring for profile '{profile_name}'");
            Ok(())
        }

        ConfigCommand::ForgetToken => {
            let cfg = config::load(global)?;
            let profile_name = config::active_profile_name(global, &cfg);
            lookout_config::forget_token(&profile_name)?;
            eprintln!("✓ Token removed from system keyring for profile '{profile_name}'");
            Ok(())
        }
    }
}

fn read_token_line() -> Result<String, CliError> {
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_owned())
}

/// Apply one `config set` assignment to a profile.
fn apply_setting(profile: &mut Profile, key: &str, value: String) -> Result<(), CliError> {
    match key {
        "api_root" | "api-root" => profile.api_root = value,
        "broker_host" | "broker-host" => profile.broker_host = Some(value),
        "broker_port" | "broker-port" => {
            profile.broker_port = Some(parse(key, &value, "a port number")?);
        }
        "broker_secure" | "broker-secure" => {
            profile.broker_secure = Some(parse(key, &value, "'true' or 'false'")?);
        }
        "broker_path" | "broker-path" => profile.broker_path = Some(value),
        "token_env" | "token-env" => profile.token_env = Some(value),
        "debounce_ms" | "debounce-ms" => {
            profile.debounce_ms = Some(parse(key, &value, "a number (milliseconds)")?);
        }
        "timeout" => profile.timeout = Some(parse(key, &value, "a number (seconds)")?),
        "insecure" => profile.insecure = Some(parse(key, &value, "'true' or 'false'")?),
        "ca_cert" | "ca-cert" => profile.ca_cert = Some(value.into()),
        other => {
            return Err(CliError::Validation {
                field: other.into(),
                reason: format!(
                    "unknown config key '{other}'. Valid keys: api_root, broker_host, \
                     broker_port, broker_secure, broker_path, token_env, debounce_ms, \
                     timeout, insecure, ca_cert"
                ),
            });
        }
    }
    Ok(())
}

fn parse<T: std::str::FromStr>(key: &str, value: &str, expected: &str) -> Result<T, CliError> {
    value.parse().map_err(|_| CliError::Validation {
        field: key.into(),
        reason: format!("must be {expected}, got '{value}'"),
    })
}
