// Import and re-export the `error` module
pub use self::error::{Error, Result};
mod error;

use std::path::Path;

use clap::Parser;
use cli::{Cli, Commands};
use suitegate_core::auth::password::hash_password_with_cost;
use suitegate_core::auth::queries::PgAuthStore;
use suitegate_core::auth::secrets::{FileSecrets, SecretsProvider};
use suitegate_core::config::CoreConfig;
use suitegate_core::pool::{ConnectionPool, PgConnector};

mod cli;
mod logging;

fn main() {
    if let Err(e) = run() {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    logging::init()?;

    let args = Cli::parse();

    match args.command {
        Commands::Version => {
            println!("{} {}", env!("CARGO_PKG_NAME"), suitegate_core::version());
        }
        Commands::GenSecret { path, rotate } => gen_secret(path.as_deref(), rotate)?,
        Commands::HashPassword { password, cost } => {
            println!("{}", hash_password_with_cost(&password, cost)?);
        }
        Commands::CheckConfig { file } => {
            let config = CoreConfig::from_file(&file)?;
            println!(
                "{}: ok ({} servers, strategy {:?}, refresh tokens {:?})",
                file.display(),
                config.pool.servers.len(),
                config.pool.load_balancing,
                config.auth.refresh_token_mode
            );
        }
        Commands::Health { file, warm } => runtime()?.block_on(health(&file, warm))?,
        Commands::Migrate { database_url } => runtime()?.block_on(migrate(&database_url))?,
    }

    Ok(())
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?)
}

fn gen_secret(path: Option<&Path>, rotate: bool) -> Result<()> {
    let secrets = match path {
        Some(path) => FileSecrets::new(path),
        None => FileSecrets::with_default_path(),
    };
    if rotate {
        secrets.rotate()?;
        log::warn!("signing secret rotated; all issued tokens are now invalid");
    } else {
        secrets.current()?;
    }
    println!("{}", secrets.path().display());
    Ok(())
}

async fn health(file: &Path, warm: bool) -> Result<()> {
    let config = CoreConfig::from_file(file)?;
    let pool = ConnectionPool::new(
        config.pool,
        PgConnector::new().with_application_name("suitegate"),
    )?;
    if warm {
        pool.warm_up().await;
    }
    let report = pool.health_check().await;
    let output = serde_json::json!({
        "report": report,
        "servers": pool.servers(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    pool.shutdown().await;

    if report.healthy_servers == 0 {
        return Err(Error::Custom("no healthy database servers".into()));
    }
    Ok(())
}

async fn migrate(database_url: &str) -> Result<()> {
    let pool = sqlx::PgPool::connect(database_url).await?;
    log::info!("running auth schema migrations");
    PgAuthStore::new(pool.clone()).migrate().await?;
    pool.close().await;
    log::info!("migrations complete");
    Ok(())
}
