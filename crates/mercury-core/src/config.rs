use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Characters reserved per messenger segment for formatting tags, so a
/// rendered segment never exceeds the transport limit.
pub const TAG_RESERVE: usize = 6;

/// Top-level config (mercury.toml + MERCURY_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MercuryConfig {
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub messenger: MessengerConfig,
    #[serde(default)]
    pub access: AccessConfig,
    #[serde(default)]
    pub batcher: BatcherConfig,
    #[serde(default)]
    pub modes: ModesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// TTL in minutes for a non-premium chat's cached state.
    /// Premium chats never expire.
    #[serde(default = "default_cache_alive_minutes")]
    pub chat_cache_alive_minutes: u64,
}

impl ChatConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.chat_cache_alive_minutes * 60)
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            chat_cache_alive_minutes: default_cache_alive_minutes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessengerConfig {
    #[serde(default = "default_max_text_len")]
    pub max_text_len: usize,
    #[serde(default = "default_max_photo_len")]
    pub max_photo_len: usize,
}

impl MessengerConfig {
    /// Usable characters per text segment after the tag reserve.
    pub fn effective_text_len(&self) -> usize {
        self.max_text_len.saturating_sub(TAG_RESERVE)
    }

    /// Usable characters per photo caption after the tag reserve.
    pub fn effective_photo_len(&self) -> usize {
        self.max_photo_len.saturating_sub(TAG_RESERVE)
    }
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            max_text_len: default_max_text_len(),
            max_photo_len: default_max_photo_len(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessConfig {
    /// Single admin chat id, compared case-insensitively. Always allowed.
    pub admin_user_id: Option<String>,
    #[serde(default = "default_ids_file")]
    pub ids_file: String,
    #[serde(default = "default_premium_ids_file")]
    pub premium_ids_file: String,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            admin_user_id: None,
            ids_file: default_ids_file(),
            premium_ids_file: default_premium_ids_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatcherConfig {
    /// Buffer window per chat, milliseconds.
    #[serde(default = "default_batch_interval_ms")]
    pub interval_ms: u64,
    /// Buffer flush threshold per chat.
    #[serde(default = "default_batch_max_events")]
    pub max_events: usize,
}

impl BatcherConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_batch_interval_ms(),
            max_events: default_batch_max_events(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModesConfig {
    /// Directory holding `{mode}.txt` templates.
    #[serde(default = "default_modes_dir")]
    pub dir: String,
    #[serde(default = "default_mode")]
    pub default_mode: String,
}

impl Default for ModesConfig {
    fn default() -> Self {
        Self {
            dir: default_modes_dir(),
            default_mode: default_mode(),
        }
    }
}

fn default_cache_alive_minutes() -> u64 {
    60
}
fn default_max_text_len() -> usize {
    4096
}
fn default_max_photo_len() -> usize {
    1024
}
fn default_ids_file() -> String {
    "ids.txt".to_string()
}
fn default_premium_ids_file() -> String {
    "premium_ids.txt".to_string()
}
fn default_batch_interval_ms() -> u64 {
    250
}
fn default_batch_max_events() -> usize {
    100
}
fn default_modes_dir() -> String {
    "modes".to_string()
}
fn default_mode() -> String {
    "default".to_string()
}

impl MercuryConfig {
    /// Load config from a TOML file with MERCURY_* env var overrides.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let mut figment = Figment::new();
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }
        figment
            .merge(Env::prefixed("MERCURY_").split("_"))
            .extract()
            .map_err(|e| crate::error::MercuryError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = MercuryConfig::default();
        assert_eq!(cfg.chat.chat_cache_alive_minutes, 60);
        assert_eq!(cfg.messenger.max_text_len, 4096);
        assert_eq!(cfg.messenger.effective_text_len(), 4090);
        assert_eq!(cfg.batcher.interval_ms, 250);
        assert_eq!(cfg.batcher.max_events, 100);
    }

    #[test]
    fn load_without_file_uses_defaults() {
        let cfg = MercuryConfig::load(None).expect("defaults should extract");
        assert_eq!(cfg.batcher.interval(), Duration::from_millis(250));
    }
}
