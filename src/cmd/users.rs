//! Database administration commands: `coderoom init-db`, `coderoom add-user`.

use std::path::Path;

use anyhow::{Result, bail};
use coderoom::collab::auth::{hash_token, new_token};
use coderoom::collab::server::open_database;
use coderoom::config::ServerConfig;

fn resolve_config(project_dir: &Path, db_path: Option<&Path>) -> Result<ServerConfig> {
    let mut config = ServerConfig::load(None, project_dir)?;
    if let Some(db_path) = db_path {
        config.db_path = db_path.to_path_buf();
    }
    Ok(config)
}

pub fn cmd_init_db(project_dir: &Path, db_path: Option<&Path>) -> Result<()> {
    let config = resolve_config(project_dir, db_path)?;
    open_database(&config)?;
    println!("Database initialized at {}", config.db_path.display());
    Ok(())
}

pub fn cmd_add_user(project_dir: &Path, email: &str, name: &str, db_path: Option<&Path>) -> Result<()> {
    let email = email.trim().to_lowercase();
    let name = name.trim();
    if !email.contains('@') {
        bail!("A valid email is required");
    }
    if name.is_empty() {
        bail!("name is required");
    }

    let config = resolve_config(project_dir, db_path)?;
    let db = open_database(&config)?;
    let Some(user) = db.create_user(&email, name, None)? else {
        bail!("Email already registered: {}", email);
    };

    let token = new_token();
    db.create_session(&user.id, &hash_token(&token))?;

    println!("User:  {} <{}>", user.name, user.email);
    println!("ID:    {}", user.id);
    println!("Token: {}", token);
    Ok(())
}
