use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

pub const CONFIG_FILE_NAME: &str = "config.json";

/// User defaults. Loaded from `<config-dir>/claude-squad/config.json`;
/// missing or unreadable files fall back to defaults rather than failing the
/// controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Program launched inside new instances.
    pub default_program: String,
    /// Whether the auto-confirm daemon is enabled by default.
    pub auto_yes: bool,
    /// Daemon poll cadence in milliseconds.
    pub daemon_poll_interval: u64,
    /// Prefix for instance branches, e.g. `alice/`.
    pub branch_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            default_program: "claude".to_string(),
            auto_yes: false,
            daemon_poll_interval: 250,
            branch_prefix: default_branch_prefix(),
        }
    }
}

fn default_branch_prefix() -> String {
    std::env::var("USER")
        .ok()
        .filter(|u| !u.is_empty())
        .map(|u| format!("{u}/"))
        .unwrap_or_else(|| "session/".to_string())
}

pub fn config_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|d| d.join("claude-squad"))
        .ok_or_else(|| anyhow!("failed to get config directory"))
}

pub fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Read the config, falling back to defaults on any problem. A default
/// config is written on first use so users have a file to edit.
pub fn load_config() -> Config {
    let path = match config_path() {
        Ok(p) => p,
        Err(e) => {
            log::warn!("failed to locate config: {e}");
            return Config::default();
        }
    };

    if !path.exists() {
        let config = Config::default();
        if let Err(e) = save_config(&config) {
            log::warn!("failed to write default config: {e}");
        }
        return config;
    }

    match fs::read_to_string(&path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
            log::warn!("failed to parse config, using defaults: {e}");
            Config::default()
        }),
        Err(e) => {
            log::warn!("failed to read config, using defaults: {e}");
            Config::default()
        }
    }
}

pub fn save_config(config: &Config) -> Result<()> {
    let dir = config_dir()?;
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    let contents = serde_json::to_string_pretty(config)?;
    fs::write(dir.join(CONFIG_FILE_NAME), contents).context("failed to write config file")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_sensible() {
        let config = Config::default();
        assert_eq!(config.default_program, "claude");
        assert!(!config.auto_yes);
        assert_eq!(config.daemon_poll_interval, 250);
        assert!(config.branch_prefix.ends_with('/'));
    }

    #[test]
    fn partial_config_files_fill_in_defaults() {
        let config: Config = serde_json::from_str(r#"{"default_program": "aider"}"#).unwrap();
        assert_eq!(config.default_program, "aider");
        assert_eq!(config.daemon_poll_interval, 250);
    }

    #[test]
    #[serial]
    fn save_and_reload_round_trips() {
        let tmp = TempDir::new().unwrap();
        let prev = std::env::var("XDG_CONFIG_HOME").ok();
        std::env::set_var("XDG_CONFIG_HOME", tmp.path());

        let mut config = Config::default();
        config.default_program = "aider --model gpt-4".to_string();
        save_config(&config).unwrap();

        let loaded = load_config();
        assert_eq!(loaded.default_program, "aider --model gpt-4");

        match prev {
            Some(p) => std::env::set_var("XDG_CONFIG_HOME", p),
            None => std::env::remove_var("XDG_CONFIG_HOME"),
        }
    }
}
