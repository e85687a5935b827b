//! Server command: `coderoom serve`.

use std::path::{Path, PathBuf};

use anyhow::Result;
use coderoom::config::ServerConfig;

pub struct ServeArgs {
    pub port: Option<u16>,
    pub db_path: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub dev: bool,
    pub log_json: bool,
}

/// Apply command-line flags, the last configuration layer.
fn apply_cli(config: &mut ServerConfig, args: &ServeArgs) {
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(db_path) = &args.db_path {
        config.db_path = db_path.clone();
    }
    config.dev_mode |= args.dev;
    config.log_json |= args.log_json;
}

pub async fn cmd_serve(project_dir: &Path, args: ServeArgs) -> Result<()> {
    let mut config = ServerConfig::load(args.config.as_deref(), project_dir)?;
    apply_cli(&mut config, &args);

    let log_dir = config.log_dir.as_ref().map(|dir| project_dir.join(dir));
    let _guard = coderoom::logging::init(config.log_json, log_dir.as_deref())?;

    coderoom::collab::server::start_server(config).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_flags_override_config() {
        let mut config = ServerConfig::default();
        apply_cli(
            &mut config,
            &ServeArgs {
                port: Some(8123),
                db_path: Some(PathBuf::from("/tmp/rooms.db")),
                config: None,
                dev: true,
                log_json: false,
            },
        );
        assert_eq!(config.port, 8123);
        assert_eq!(config.db_path, PathBuf::from("/tmp/rooms.db"));
        assert!(config.dev_mode);
        assert!(!config.log_json);
    }

    #[test]
    fn test_absent_flags_keep_config() {
        let mut config = ServerConfig {
            port: 7000,
            ..ServerConfig::default()
        };
        apply_cli(
            &mut config,
            &ServeArgs {
                port: None,
                db_path: None,
                config: None,
                dev: false,
                log_json: false,
            },
        );
        assert_eq!(config.port, 7000);
        assert_eq!(config.db_path, PathBuf::from("database.db"));
    }
}
