use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{}", .0)]
    Custom(String),

    #[error("IO::{:?}: {}", .0, .0)]
    Io(#[from] std::io::Error),

    #[error("Json::{}", .0)]
    Json(#[from] serde_json::Error),

    #[error("FlexiLogger::{}", .0)]
    FlexiLogger(#[from] flexi_logger::FlexiLoggerError),

    #[error("Config::{}", .0)]
    Config(#[from] suitegate_core::config::ConfigError),

    #[error("Auth::{}", .0)]
    Auth(#[from] suitegate_core::auth::AuthError),

    #[error("Pool::{}", .0)]
    Pool(#[from] suitegate_core::pool::PoolError),

    #[error("Db::{}", .0)]
    Db(#[from] sqlx::Error),

    #[error("Migrate::{}", .0)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}
