use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "coderoom")]
#[command(version, about = "Real-time collaborative coding rooms")]
pub struct Cli {
    /// Directory holding `.coderoom/server.toml` (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP and WebSocket server
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Config file (defaults to .coderoom/server.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Enable dev mode (bind all interfaces, permissive CORS)
        #[arg(long)]
        dev: bool,
    },
    /// Create the database and its tables
    InitDb {
        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Register a user and print a session token
    AddUser {
        #[arg(long)]
        email: String,

        #[arg(long)]
        name: String,

        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Serve {
            port,
            db_path,
            config,
            dev,
        } => {
            cmd::cmd_serve(
                &project_dir,
                cmd::ServeArgs {
                    port: *port,
                    db_path: db_path.clone(),
                    config: config.clone(),
                    dev: *dev,
                    log_json: cli.log_json,
                },
            )
            .await?;
        }
        Commands::InitDb { db_path } => {
            cmd::cmd_init_db(&project_dir, db_path.as_deref())?;
        }
        Commands::AddUser {
            email,
            name,
            db_path,
        } => {
            cmd::cmd_add_user(&project_dir, email, name, db_path.as_deref())?;
        }
    }

    Ok(())
}
