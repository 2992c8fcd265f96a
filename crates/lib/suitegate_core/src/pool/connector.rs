//! Physical connection seam.

use async_trait::async_trait;
use thiserror::Error;

use crate::config::ServerConfig;

/// Errors opening or probing a physical connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("Connection failed: {0}")]
    Failed(String),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// A live connection owned by the pool.
#[async_trait]
pub trait DbConnection: Send + 'static {
    /// Trivial round-trip used as the liveness probe.
    async fn ping(&mut self) -> Result<(), ConnectError>;

    /// Close gracefully. Dropping also closes, without the goodbye.
    async fn close(self) -> Result<(), ConnectError>;
}

/// Opens connections to configured servers.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: DbConnection;

    async fn connect(&self, server: &ServerConfig) -> Result<Self::Connection, ConnectError>;

    /// Health probe on a dedicated connection.
    async fn probe(&self, server: &ServerConfig) -> Result<(), ConnectError> {
        let mut conn = self.connect(server).await?;
        let result = conn.ping().await;
        if let Err(e) = conn.close().await {
            tracing::debug!(server = %server.name, "probe connection close failed: {e}");
        }
        result
    }
}
