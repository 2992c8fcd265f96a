use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "suitegate", version, about = "Suitegate auth core and connection pool tools")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the version.
    Version,

    /// Create the JWT signing secret if missing, or replace it with --rotate.
    GenSecret {
        /// Secret file (defaults to the platform data directory).
        #[arg(long)]
        path: Option<PathBuf>,

        /// Overwrite an existing secret. Invalidates every issued token.
        #[arg(long, default_value_t = false)]
        rotate: bool,
    },

    /// Print a bcrypt hash of a password.
    HashPassword {
        password: String,

        #[arg(long, default_value_t = 10)]
        cost: u32,
    },

    /// Parse and validate a YAML configuration file.
    CheckConfig { file: PathBuf },

    /// Probe every configured database server and print a JSON report.
    Health {
        file: PathBuf,

        /// Open `min_pool_size` connections before probing.
        #[arg(long, default_value_t = false)]
        warm: bool,
    },

    /// Apply the auth schema migrations.
    Migrate {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
}
