//! PostgreSQL connector backed by sqlx.

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{ConnectOptions, Connection};

use super::connector::{ConnectError, Connector, DbConnection};
use crate::config::ServerConfig;

/// Opens single `PgConnection`s; pooling is done by [`super::ConnectionPool`].
#[derive(Debug, Clone, Default)]
pub struct PgConnector {
    application_name: Option<String>,
}

impl PgConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    pub fn options(&self, server: &ServerConfig) -> PgConnectOptions {
        let mut options = PgConnectOptions::new()
            .host(&server.host)
            .port(server.port)
            .database(&server.database)
            .username(&server.username);
        if let Some(password) = &server.password {
            options = options.password(password);
        }
        if let Some(name) = &self.application_name {
            options = options.application_name(name);
        }
        options
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Connection = PgConnection;

    async fn connect(&self, server: &ServerConfig) -> Result<PgConnection, ConnectError> {
        Ok(self.options(server).connect().await?)
    }
}

#[async_trait]
impl DbConnection for PgConnection {
    async fn ping(&mut self) -> Result<(), ConnectError> {
        Ok(Connection::ping(self).await?)
    }

    async fn close(self) -> Result<(), ConnectError> {
        Ok(Connection::close(self).await?)
    }
}
