//! Server configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file
//! (`.coderoom/server.toml` unless `--config` points elsewhere), then
//! environment variables, then command-line flags. The CLI layer is applied
//! by the `serve` command after [`ServerConfig::load`] returns.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::collab::assistant::AssistantConfig;
use crate::collab::sandbox::SandboxConfig;

pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_DB_PATH: &str = "database.db";
pub const CONFIG_DIR: &str = ".coderoom";
pub const CONFIG_FILE: &str = "server.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
    pub log_dir: Option<PathBuf>,
    pub log_json: bool,
    /// Capacity of each connection's outbound queue.
    pub outbound_queue: usize,
    pub sandbox: SandboxConfig,
    pub assistant: AssistantConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            dev_mode: false,
            log_dir: None,
            log_json: false,
            outbound_queue: 256,
            sandbox: SandboxConfig::default(),
            assistant: AssistantConfig::default(),
        }
    }
}

/// Raw TOML structure for `server.toml`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    server: Option<ServerSection>,
    sandbox: Option<SandboxSection>,
    assistant: Option<AssistantSection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServerSection {
    host: Option<String>,
    port: Option<u16>,
    db_path: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    outbound_queue: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SandboxSection {
    interpreter: Option<String>,
    interpreter_args: Option<Vec<String>>,
    timeout_secs: Option<u64>,
    memory_mb: Option<u64>,
    max_output_bytes: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AssistantSection {
    enabled: Option<bool>,
    url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
}

impl ServerConfig {
    /// Load defaults, the TOML file and the process environment.
    ///
    /// An explicit `config_path` must exist; the default location is optional.
    pub fn load(config_path: Option<&Path>, project_dir: &Path) -> Result<Self> {
        let _ = dotenvy::dotenv();
        let mut config = Self::from_file(config_path, project_dir)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Defaults overlaid with the TOML file only.
    pub fn from_file(config_path: Option<&Path>, project_dir: &Path) -> Result<Self> {
        let path = match config_path {
            Some(path) => {
                if !path.exists() {
                    bail!("Config file not found: {}", path.display());
                }
                path.to_path_buf()
            }
            None => {
                let path = project_dir.join(CONFIG_DIR).join(CONFIG_FILE);
                if !path.exists() {
                    return Ok(Self::default());
                }
                path
            }
        };

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Parse TOML content on top of the defaults.
    pub fn parse(content: &str) -> Result<Self> {
        let toml: ConfigToml = toml::from_str(content)?;
        let mut config = Self::default();

        if let Some(server) = toml.server {
            if let Some(host) = server.host {
                config.host = host;
            }
            if let Some(port) = server.port {
                config.port = port;
            }
            if let Some(db_path) = server.db_path {
                config.db_path = db_path;
            }
            if server.log_dir.is_some() {
                config.log_dir = server.log_dir;
            }
            if let Some(outbound_queue) = server.outbound_queue {
                config.outbound_queue = outbound_queue.max(1);
            }
        }

        if let Some(sandbox) = toml.sandbox {
            if let Some(interpreter) = sandbox.interpreter {
                config.sandbox.interpreter = interpreter;
            }
            if let Some(args) = sandbox.interpreter_args {
                config.sandbox.interpreter_args = args;
            }
            if let Some(timeout) = sandbox.timeout_secs {
                if timeout == 0 {
                    bail!("[sandbox] timeout_secs must be at least 1");
                }
                config.sandbox.timeout_secs = timeout;
            }
            if let Some(memory) = sandbox.memory_mb {
                if memory == 0 {
                    bail!("[sandbox] memory_mb must be at least 1");
                }
                config.sandbox.memory_mb = memory;
            }
            if let Some(max_output) = sandbox.max_output_bytes {
                config.sandbox.max_output_bytes = max_output;
            }
        }

        if let Some(assistant) = toml.assistant {
            if let Some(enabled) = assistant.enabled {
                config.assistant.enabled = enabled;
            }
            if let Some(url) = assistant.url {
                config.assistant.url = url;
            }
            if let Some(model) = assistant.model {
                config.assistant.model = model;
            }
            if let Some(timeout) = assistant.timeout_secs {
                if timeout == 0 {
                    bail!("[assistant] timeout_secs must be at least 1");
                }
                config.assistant.timeout_secs = timeout;
            }
        }

        Ok(config)
    }

    /// Overlay environment variables read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            self.port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid PORT value: {}", port))?;
        }
        if let Some(db_path) = lookup("DATABASE_PATH") {
            self.db_path = PathBuf::from(db_path);
        }
        if let Some(enabled) = lookup("OLLAMA_ENABLED") {
            self.assistant.enabled = enabled.trim().eq_ignore_ascii_case("true");
        }
        if let Some(url) = lookup("OLLAMA_URL") {
            self.assistant.url = url;
        }
        if let Some(model) = lookup("OLLAMA_MODEL") {
            self.assistant.model = model;
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        let host = if self.dev_mode { "0.0.0.0" } else { self.host.as_str() };
        format!("{}:{}", host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_server_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 5000);
        assert_eq!(config.db_path, PathBuf::from("database.db"));
        assert!(!config.dev_mode);
        assert!(!config.assistant.enabled);
        assert_eq!(config.bind_addr(), "127.0.0.1:5000");
    }

    #[test]
    fn test_dev_mode_binds_all_interfaces() {
        let config = ServerConfig {
            dev_mode: true,
            port: 8080,
            ..ServerConfig::default()
        };
        assert_eq!(config.bind_addr(), "0.0.0.0:8080");
    }

    #[test]
    fn test_missing_default_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::from_file(None, dir.path()).unwrap();
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let err = ServerConfig::from_file(Some(&missing), dir.path()).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }

    #[test]
    fn test_load_sections_from_default_location() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(CONFIG_DIR)).unwrap();
        std::fs::write(
            dir.path().join(CONFIG_DIR).join(CONFIG_FILE),
            r#"
[server]
port = 7000
db_path = "data/rooms.db"
log_dir = "logs"

[sandbox]
interpreter = "python3.12"
timeout_secs = 3

[assistant]
enabled = true
model = "codellama"
"#,
        )
        .unwrap();

        let config = ServerConfig::from_file(None, dir.path()).unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.db_path, PathBuf::from("data/rooms.db"));
        assert_eq!(config.log_dir, Some(PathBuf::from("logs")));
        assert_eq!(config.sandbox.interpreter, "python3.12");
        assert_eq!(config.sandbox.timeout_secs, 3);
        assert_eq!(config.sandbox.max_output_bytes, SandboxConfig::default().max_output_bytes);
        assert!(config.assistant.enabled);
        assert_eq!(config.assistant.model, "codellama");
        assert_eq!(config.assistant.url, AssistantConfig::default().url);
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let err = ServerConfig::parse("[server]\nprot = 1\n").unwrap_err();
        assert!(err.to_string().contains("prot"));
    }

    #[test]
    fn test_zero_limits_are_rejected() {
        let err = ServerConfig::parse("[sandbox]\ntimeout_secs = 0\n").unwrap_err();
        assert!(err.to_string().contains("timeout_secs must be at least 1"));

        let err = ServerConfig::parse("[sandbox]\nmemory_mb = 0\n").unwrap_err();
        assert!(err.to_string().contains("memory_mb"));

        let err = ServerConfig::parse("[assistant]\ntimeout_secs = 0\n").unwrap_err();
        assert!(err.to_string().contains("[assistant]"));

        let config = ServerConfig::parse("[sandbox]\ntimeout_secs = 1\n").unwrap();
        assert_eq!(config.sandbox.timeout_secs, 1);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = ServerConfig::parse("[server]\nport = 7000\n").unwrap();
        config
            .apply_env(env_from(&[
                ("PORT", "9000"),
                ("DATABASE_PATH", "/tmp/x.db"),
                ("OLLAMA_ENABLED", "TRUE"),
                ("OLLAMA_URL", "http://ollama:11434"),
                ("OLLAMA_MODEL", "mistral"),
            ]))
            .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.db_path, PathBuf::from("/tmp/x.db"));
        assert!(config.assistant.enabled);
        assert_eq!(config.assistant.url, "http://ollama:11434");
        assert_eq!(config.assistant.model, "mistral");
    }

    #[test]
    fn test_ollama_enabled_only_accepts_true() {
        let mut config = ServerConfig::parse("[assistant]\nenabled = true\n").unwrap();
        config.apply_env(env_from(&[("OLLAMA_ENABLED", "yes")])).unwrap();
        assert!(!config.assistant.enabled);
    }

    #[test]
    fn test_invalid_port_env_is_an_error() {
        let mut config = ServerConfig::default();
        let err = config.apply_env(env_from(&[("PORT", "http")])).unwrap_err();
        assert!(err.to_string().contains("Invalid PORT"));
    }
}
