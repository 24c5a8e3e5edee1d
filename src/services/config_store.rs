// Configuration Storage Service
// Handles config file read/write and version backup

use crate::models::{CombineMode, ScanEngine};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434/v1";
pub const DEFAULT_CHAT_MODEL: &str = "llama3.2:1b";
pub const DEFAULT_EMBED_MODEL: &str = "nomic-embed-text:latest";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub provider: ProviderSettings,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub segmenter_url: Option<String>,
    #[serde(default)]
    pub cache_dir: Option<String>,
    #[serde(default)]
    pub rules_path: Option<String>,
    #[serde(default)]
    pub api_keys: HashMap<String, String>,
}

impl AppConfig {
    /// Directory for the embedding cache; defaults to the user cache dir
    pub fn resolved_cache_dir(&self) -> PathBuf {
        match self.cache_dir.as_deref().map(str::trim) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => dirs::cache_dir()
                .map(|p| p.join("toscheck"))
                .unwrap_or_else(|| PathBuf::from(".toscheck-cache")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_embed_model")]
    pub embed_model: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            chat_model: default_chat_model(),
            embed_model: default_embed_model(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl ProviderSettings {
    /// Apply `TOSCHECK_*` / `OPENAI_BASE_URL` environment overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(url) = env_non_empty("TOSCHECK_BASE_URL").or_else(|| env_non_empty("OPENAI_BASE_URL")) {
            self.base_url = url;
        }
        if let Some(model) = env_non_empty("TOSCHECK_MODEL") {
            self.chat_model = model;
        }
        if let Some(model) = env_non_empty("TOSCHECK_EMBED_MODEL") {
            self.embed_model = model;
        }
        self
    }
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanConfig {
    #[serde(default)]
    pub engine: ScanEngine,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
    #[serde(default = "default_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_max_suspects")]
    pub max_suspects: usize,
    #[serde(default = "default_true")]
    pub preselect: bool,
    #[serde(default)]
    pub llm_polish: bool,
    #[serde(default)]
    pub combine: CombineMode,
    #[serde(default)]
    pub seeds_path: Option<String>,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_llm_timeout")]
    pub llm_timeout_secs: u64,
    #[serde(default = "default_llm_attempts")]
    pub llm_max_attempts: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            engine: ScanEngine::default(),
            window_size: default_window_size(),
            overlap: default_overlap(),
            similarity_threshold: default_threshold(),
            max_suspects: default_max_suspects(),
            preselect: true,
            llm_polish: false,
            combine: CombineMode::default(),
            seeds_path: None,
            max_concurrency: default_max_concurrency(),
            llm_timeout_secs: default_llm_timeout(),
            llm_max_attempts: default_llm_attempts(),
        }
    }
}

fn default_base_url() -> String { DEFAULT_BASE_URL.to_string() }
fn default_chat_model() -> String { DEFAULT_CHAT_MODEL.to_string() }
fn default_embed_model() -> String { DEFAULT_EMBED_MODEL.to_string() }
fn default_timeout_secs() -> u64 { 80 }
fn default_window_size() -> usize { 40 }
fn default_overlap() -> usize { 5 }
fn default_threshold() -> f32 { 0.75 }
fn default_max_suspects() -> usize { 120 }
fn default_true() -> bool { true }
fn default_max_concurrency() -> usize { 4 }
fn default_llm_timeout() -> u64 { 60 }
fn default_llm_attempts() -> usize { 2 }

pub struct ConfigStore {
    config_dir: PathBuf,
    config_file: PathBuf,
}

impl ConfigStore {
    pub fn new(config_dir: PathBuf) -> Self {
        let config_file = config_dir.join("config.json");
        Self { config_dir, config_file }
    }

    /// Get default config directory
    pub fn default_config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("toscheck"))
    }

    /// Store backed by an explicit config file, or the default store when none is given
    pub fn at(path: Option<&Path>) -> Option<Self> {
        match path {
            Some(p) => Some(Self {
                config_dir: p.parent().map(Path::to_path_buf).unwrap_or_default(),
                config_file: p.to_path_buf(),
            }),
            None => Self::default_config_dir().map(Self::new),
        }
    }

    /// Load from an explicit file path, or the default store when none is given
    pub fn load_from(path: Option<&Path>) -> Result<AppConfig, String> {
        match path {
            Some(p) => {
                let content = fs::read_to_string(p)
                    .map_err(|e| format!("Failed to read config {}: {}", p.display(), e))?;
                serde_json::from_str(&content).map_err(|e| format!("Failed to parse config: {}", e))
            }
            None => match Self::default_config_dir() {
                Some(dir) => Self::new(dir).load(),
                None => Ok(AppConfig::default()),
            },
        }
    }

    /// Ensure config directory exists
    pub fn ensure_dir(&self) -> Result<(), String> {
        fs::create_dir_all(&self.config_dir)
            .map_err(|e| format!("Failed to create config dir: {}", e))
    }

    /// Load configuration from file
    pub fn load(&self) -> Result<AppConfig, String> {
        if !self.config_file.exists() {
            return Ok(AppConfig::default());
        }

        let content = fs::read_to_string(&self.config_file)
            .map_err(|e| format!("Failed to read config: {}", e))?;

        serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config: {}", e))
    }

    /// Save configuration to file
    pub fn save(&self, config: &AppConfig) -> Result<(), String> {
        self.ensure_dir()?;

        if self.config_file.exists() {
            self.create_backup()?;
        }

        let content = serde_json::to_string_pretty(config)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        fs::write(&self.config_file, content)
            .map_err(|e| format!("Failed to write config: {}", e))
    }

    /// Create a backup of current config
    fn create_backup(&self) -> Result<(), String> {
        let backup_dir = self.config_dir.join("backups");
        fs::create_dir_all(&backup_dir)
            .map_err(|e| format!("Failed to create backup dir: {}", e))?;

        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S%.3f");
        let backup_file = backup_dir.join(format!("config_{}.json", timestamp));

        fs::copy(&self.config_file, &backup_file)
            .map_err(|e| format!("Failed to create backup: {}", e))?;

        // Keep only last 10 backups
        self.cleanup_old_backups(&backup_dir, 10)?;

        Ok(())
    }

    /// Remove old backups, keeping only the most recent N
    fn cleanup_old_backups(&self, backup_dir: &Path, keep: usize) -> Result<(), String> {
        let mut entries: Vec<_> = fs::read_dir(backup_dir)
            .map_err(|e| format!("Failed to read backup dir: {}", e))?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map_or(false, |ext| ext == "json"))
            .collect();

        if entries.len() <= keep {
            return Ok(());
        }

        // Oldest first; file names carry the timestamp
        entries.sort_by_key(|e| e.file_name());

        for entry in entries.iter().take(entries.len() - keep) {
            let _ = fs::remove_file(entry.path());
        }

        Ok(())
    }

    /// Get provider API key from config file
    pub fn get_api_key(&self, provider: &str) -> Result<Option<String>, String> {
        let config = self.load()?;
        Ok(config.api_keys.get(provider).cloned())
    }

    /// Store provider API key in config file
    pub fn set_api_key(&self, provider: &str, key: &str) -> Result<(), String> {
        let mut config = self.load()?;
        config.api_keys.insert(provider.to_string(), key.to_string());
        self.save(&config)
    }

    /// Delete provider API key from config file
    pub fn delete_api_key(&self, provider: &str) -> Result<(), String> {
        let mut config = self.load()?;
        config.api_keys.remove(provider);
        self.save(&config)
    }
}
