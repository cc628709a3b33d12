//! CLI configuration: thin wrapper around `lookout_config`.
//!
//! Adds resolution that respects `GlobalOpts` flag overrides
//! (--config, --api-root, --token, --insecure, --timeout).

use std::path::PathBuf;

use secrecy::SecretString;

use lookout_config::{Config, Profile};
use lookout_core::SyncConfig;

use crate::cli::GlobalOpts;
use crate::error::CliError;

/// Everything a command needs to talk to the backend.
#[derive(Debug)]
pub struct Resolved {
    pub profile_name: String,
    pub sync: SyncConfig,
    pub token: SecretString,
}

/// The config file in effect: `--config` or the platform default.
pub fn config_file(global: &GlobalOpts) -> PathBuf {
    global
        .config
        .clone()
        .unwrap_or_else(lookout_config::config_path)
}

pub fn load(global: &GlobalOpts) -> Result<Config, CliError> {
    Ok(lookout_config::load_config_from(&config_file(global))?)
}

pub fn save(global: &GlobalOpts, cfg: &Config) -> Result<(), CliError> {
    Ok(lookout_config::save_config_to(&config_file(global), cfg)?)
}

/// Resolve the active profile name from CLI flags and config.
pub fn active_profile_name(global: &GlobalOpts, config: &Config) -> String {
    global
        .profile
        .clone()
        .or_else(|| config.default_profile.clone())
        .unwrap_or_else(|| "default".into())
}

/// Profile + flags → connection settings and token.
///
/// Without a matching profile, `--api-root` alone is enough.
pub fn resolve(global: &GlobalOpts) -> Result<Resolved, CliError> {
    let cfg = load(global)?;
    let profile_name = active_profile_name(global, &cfg);

    let mut profile = match cfg.profile(&profile_name) {
        Ok(profile) => profile.clone(),
        Err(_) if global.api_root.is_some() => Profile::default(),
        Err(_) if cfg.profiles.is_empty() => {
            return Err(CliError::NoConfig {
                path: config_file(global).display().to_string(),
            });
        }
        Err(e) => return Err(e.into()),
    };

    apply_overrides(&mut profile, global);
    let sync = lookout_config::profile_to_sync_config(&profile, &cfg.defaults)?;

    let token = match &global.token {
        Some(token) => SecretString::from(token.clone()),
        None => lookout_config::resolve_token(&profile, &profile_name)?,
    };

    Ok(Resolved {
        profile_name,
        sync,
        token,
    })
}

fn apply_overrides(profile: &mut Profile, global: &GlobalOpts) {
    if let Some(ref root) = global.api_root {
        profile.api_root.clone_from(root);
    }
    if global.insecure {
        profile.insecure = Some(true);
    }
    if let Some(timeout) = global.timeout {
        profile.timeout = Some(timeout);
    }
}
