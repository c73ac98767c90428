//! Configuration: defaults, global config file, per-project overlay, env.
//!
//! Precedence (lowest to highest): built-in defaults, global
//! `<config_dir>/config.json`, project `.agentsmithy/config.json`, process
//! environment. Only the global layer is writable through the API.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default base port the server starts probing from.
pub const DEFAULT_BASE_PORT: u16 = 8765;

/// Default wall-clock timeout for `run_command` invocations.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 120;

/// Default per-chunk read deadline for LLM streams.
pub const DEFAULT_LLM_CHUNK_TIMEOUT_SECS: u64 = 120;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => anyhow::bail!("unknown log format: {other}"),
        }
    }
}

/// One overlay layer of the config file format.
///
/// All fields optional so layers merge field-by-field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_excludes: Option<Vec<String>>,
    /// Named provider profiles; `rename_profile` operates on these keys.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub profiles: serde_json::Map<String, serde_json::Value>,
}

impl ConfigFile {
    fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    fn merge_from(&mut self, other: ConfigFile) {
        if other.api_key.is_some() {
            self.api_key = other.api_key;
        }
        if other.base_url.is_some() {
            self.base_url = other.base_url;
        }
        if other.model.is_some() {
            self.model = other.model;
        }
        if other.embedding_model.is_some() {
            self.embedding_model = other.embedding_model;
        }
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.command_timeout_secs.is_some() {
            self.command_timeout_secs = other.command_timeout_secs;
        }
        if other.extra_excludes.is_some() {
            self.extra_excludes = other.extra_excludes;
        }
        for (k, v) in other.profiles {
            self.profiles.insert(k, v);
        }
    }
}

/// Resolved runtime settings after all layers are applied.
#[derive(Debug, Clone)]
pub struct Settings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub embedding_model: String,
    pub host: String,
    pub base_port: u16,
    pub log_format: LogFormat,
    pub log_level: String,
    pub config_dir: PathBuf,
    pub command_timeout_secs: u64,
    pub llm_chunk_timeout_secs: u64,
    pub extra_excludes: Vec<String>,
    /// IDE identifier injected into the system prompt (from `--ide`).
    pub ide: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".into(),
            model: "gpt-5.1".into(),
            embedding_model: "text-embedding-3-small".into(),
            host: "127.0.0.1".into(),
            base_port: DEFAULT_BASE_PORT,
            log_format: LogFormat::Pretty,
            log_level: "info".into(),
            config_dir: default_config_dir(),
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            llm_chunk_timeout_secs: DEFAULT_LLM_CHUNK_TIMEOUT_SECS,
            extra_excludes: Vec::new(),
            ide: None,
        }
    }
}

fn default_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("AGENTSMITHY_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    std::env::var("HOME")
        .map(|h| PathBuf::from(h).join(".agentsmithy"))
        .unwrap_or_else(|_| PathBuf::from(".agentsmithy-config"))
}

impl Settings {
    /// Load settings for a project workdir: defaults, global config, project
    /// overlay, then env.
    pub fn load(workdir: &Path) -> Self {
        let mut settings = Settings::default();
        let mut layered = ConfigFile::default();

        let global_path = settings.global_config_path();
        if global_path.exists() {
            match ConfigFile::load(&global_path) {
                Ok(cfg) => layered.merge_from(cfg),
                Err(e) => tracing::warn!(error = %e, "Failed to load global config"),
            }
        }

        let project_path = workdir.join(".agentsmithy").join("config.json");
        if project_path.exists() {
            match ConfigFile::load(&project_path) {
                Ok(cfg) => layered.merge_from(cfg),
                Err(e) => tracing::warn!(error = %e, "Failed to load project config"),
            }
        }

        settings.apply_file(&layered);
        settings.apply_env();
        settings
    }

    fn apply_file(&mut self, cfg: &ConfigFile) {
        if let Some(v) = &cfg.api_key {
            self.api_key = Some(v.clone());
        }
        if let Some(v) = &cfg.base_url {
            self.base_url = v.clone();
        }
        if let Some(v) = &cfg.model {
            self.model = v.clone();
        }
        if let Some(v) = &cfg.embedding_model {
            self.embedding_model = v.clone();
        }
        if let Some(v) = &cfg.host {
            self.host = v.clone();
        }
        if let Some(v) = cfg.port {
            self.base_port = v;
        }
        if let Some(v) = cfg.command_timeout_secs {
            self.command_timeout_secs = v;
        }
        if let Some(v) = &cfg.extra_excludes {
            self.extra_excludes = v.clone();
        }
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("OPENAI_API_KEY") {
            if !v.is_empty() {
                self.api_key = Some(v);
            }
        }
        if let Ok(v) = std::env::var("OPENAI_BASE_URL") {
            if !v.is_empty() {
                self.base_url = v;
            }
        }
        if let Ok(v) = std::env::var("MODEL") {
            if !v.is_empty() {
                self.model = v;
            }
        }
        if let Ok(v) = std::env::var("EMBEDDING_MODEL") {
            if !v.is_empty() {
                self.embedding_model = v;
            }
        }
        if let Ok(v) = std::env::var("SERVER_HOST") {
            if !v.is_empty() {
                self.host = v;
            }
        }
        if let Ok(v) = std::env::var("SERVER_PORT") {
            if let Ok(port) = v.parse() {
                self.base_port = port;
            }
        }
        if let Ok(v) = std::env::var("LOG_FORMAT") {
            if let Ok(fmt) = v.parse() {
                self.log_format = fmt;
            }
        }
        if let Ok(v) = std::env::var("LOG_LEVEL") {
            if !v.is_empty() {
                self.log_level = v;
            }
        }
    }

    pub fn global_config_path(&self) -> PathBuf {
        self.config_dir.join("config.json")
    }

    /// Validate settings, returning the list of problems. Validation never
    /// blocks startup; the result is surfaced in `status.json`.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.api_key.as_deref().unwrap_or("").is_empty() {
            errors.push("OPENAI_API_KEY is not set; chat requests will fail".into());
        }
        if self.model.is_empty() {
            errors.push("model is empty".into());
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            errors.push(format!("base_url is not a valid URL: {}", self.base_url));
        }
        errors
    }

    /// Read the writable (global) config layer for the API.
    pub fn read_global(&self) -> Result<ConfigFile> {
        let path = self.global_config_path();
        if !path.exists() {
            return Ok(ConfigFile::default());
        }
        ConfigFile::load(&path)
    }

    /// Replace the global config layer. Writes atomically (temp + rename).
    pub fn write_global(&self, cfg: &ConfigFile) -> Result<()> {
        let path = self.global_config_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(cfg)?;
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Rename a provider profile in the global layer.
    pub fn rename_profile(&self, from: &str, to: &str) -> Result<()> {
        let mut cfg = self.read_global()?;
        let value = cfg
            .profiles
            .remove(from)
            .with_context(|| format!("profile not found: {from}"))?;
        cfg.profiles.insert(to.to_string(), value);
        self.write_global(&cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert_eq!(s.base_port, DEFAULT_BASE_PORT);
        assert_eq!(s.log_format, LogFormat::Pretty);
        assert!(s.api_key.is_none());
    }

    #[test]
    fn file_layer_overrides_defaults() {
        let mut s = Settings::default();
        s.apply_file(&ConfigFile {
            model: Some("gpt-5-mini".into()),
            port: Some(9100),
            ..Default::default()
        });
        assert_eq!(s.model, "gpt-5-mini");
        assert_eq!(s.base_port, 9100);
    }

    #[test]
    fn missing_api_key_is_reported_not_fatal() {
        let s = Settings::default();
        let errors = s.validate();
        assert!(errors.iter().any(|e| e.contains("OPENAI_API_KEY")));
    }

    #[test]
    fn merge_prefers_later_layer() {
        let mut base = ConfigFile {
            model: Some("a".into()),
            ..Default::default()
        };
        base.merge_from(ConfigFile {
            model: Some("b".into()),
            ..Default::default()
        });
        assert_eq!(base.model.as_deref(), Some("b"));
    }
}
