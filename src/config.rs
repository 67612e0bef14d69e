use anyhow::{anyhow, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::models::Contact;
use crate::sync::directory::ContactDirectory;
use crate::sync::outbound::RetryPolicy;
use crate::sync::store::DEFAULT_MATCH_WINDOW_SECS;
use crate::sync::MAX_ATTACHMENT_BYTES;

pub const SELF_ID_ENV: &str = "PARLEY_SELF_ID";
pub const DISPLAY_NAME_ENV: &str = "PARLEY_DISPLAY_NAME";

const CONFIG_FILE: &str = "config.json";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub self_id: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    /// Where the contact directory is persisted. Defaults to the user data dir.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    pub max_attachment_bytes: usize,
    /// Window for matching echoes that carry no correlation id.
    pub match_window_secs: i64,
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            self_id: "current-user".to_string(),
            display_name: "You".to_string(),
            avatar: None,
            data_dir: None,
            max_attachment_bytes: MAX_ATTACHMENT_BYTES,
            match_window_secs: DEFAULT_MATCH_WINDOW_SECS,
            retry: RetryPolicy::default(),
        }
    }
}

impl ClientConfig {
    /// The self entry for the contact directory.
    pub fn me(&self) -> Contact {
        let mut me = Contact::new(&self.self_id, &self.display_name);
        me.avatar = self.avatar.clone();
        me
    }

    pub fn contacts_path(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.join("contacts.json")),
            None => ContactDirectory::default_path(),
        }
    }

    /// Environment variables win over the file.
    pub fn apply_env(&mut self) {
        if let Ok(self_id) = env::var(SELF_ID_ENV) {
            if !self_id.trim().is_empty() {
                self.self_id = self_id.trim().to_string();
            }
        }
        if let Ok(name) = env::var(DISPLAY_NAME_ENV) {
            if !name.trim().is_empty() {
                self.display_name = name.trim().to_string();
            }
        }
    }
}

pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join("parley");

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

pub fn save_config(dir: &Path, config: &ClientConfig) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
    }
    let file = File::create(dir.join(CONFIG_FILE))?;
    serde_json::to_writer_pretty(file, config)?;

    info!("Configuration saved for {}", config.self_id);
    Ok(())
}

/// Read the config from `dir`, falling back to defaults when absent.
/// Environment overrides are applied either way.
pub fn load_config(dir: &Path) -> Result<ClientConfig> {
    let config_path = dir.join(CONFIG_FILE);

    let mut config = if config_path.exists() {
        let file = File::open(&config_path)?;
        let config: ClientConfig = serde_json::from_reader(file)?;
        info!("Loaded configuration for {} from {}", config.self_id, config_path.display());
        config
    } else {
        info!("No configuration at {}, using defaults", config_path.display());
        ClientConfig::default()
    };

    config.apply_env();
    Ok(config)
}
