//! Point d'entrée CLI pour citydb

use std::path::PathBuf;

use anyhow::Result;
use citydb_tool::cli::{self, Commands};
use citydb_tool::config::Config;
use clap::Parser;
use tracing::{debug, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// Charge `.env` depuis le répertoire courant, sinon depuis celui du binaire
fn load_env() {
    if dotenvy::dotenv().is_ok() {
        return;
    }
    let beside_binary = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(".env")));
    if let Some(path) = beside_binary {
        let _ = dotenvy::from_path(path);
    }
}

/// Opérations en masse sur une base de modèles urbains 3D
#[derive(Parser)]
#[command(name = "citydb")]
#[command(author, version)]
#[command(about = "Import, export et suppression en masse de features CityJSON dans PostGIS")]
struct Cli {
    /// Augmenter la verbosité (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Mode silencieux
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Fichier de configuration JSON
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();

    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let config = Config::load_optional(cli.config.as_deref())?;
    debug!(config = ?cli.config, "Configuration loaded");

    match cli.command {
        Commands::Import(args) => cli::cmd_import(args, &config).await?,
        Commands::Export(args) => cli::cmd_export(args, &config).await?,
        Commands::Delete(args) => cli::cmd_delete(args, &config).await?,
    }

    Ok(())
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::WARN
    } else {
        [Level::INFO, Level::DEBUG, Level::TRACE][usize::from(verbose.min(2))]
    };

    // RUST_LOG complète le niveau choisi en ligne de commande
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .init();
}
