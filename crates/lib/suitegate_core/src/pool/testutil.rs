//! Scriptable connector for pool tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::connector::{ConnectError, Connector, DbConnection};
use crate::config::{PoolConfig, ServerConfig, ServerRole};

#[derive(Default)]
struct Inner {
    down: Mutex<HashSet<String>>,
    connect_delay: Mutex<Option<Duration>>,
    next_id: AtomicU64,
    opened: AtomicUsize,
    live: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct MockConnector {
    inner: Arc<Inner>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, server: &str, down: bool) {
        let mut set = self.inner.down.lock().unwrap();
        if down {
            set.insert(server.to_string());
        } else {
            set.remove(server);
        }
    }

    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        *self.inner.connect_delay.lock().unwrap() = delay;
    }

    pub fn opened(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst)
    }

    /// Connections opened and not yet dropped.
    pub fn live(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    fn is_down(&self, server: &str) -> bool {
        self.inner.down.lock().unwrap().contains(server)
    }
}

pub struct MockConnection {
    pub id: u64,
    pub server: String,
    connector: MockConnector,
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.connector.inner.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DbConnection for MockConnection {
    async fn ping(&mut self) -> Result<(), ConnectError> {
        if self.connector.is_down(&self.server) {
            Err(ConnectError::Failed(format!("{} is down", self.server)))
        } else {
            Ok(())
        }
    }

    async fn close(self) -> Result<(), ConnectError> {
        Ok(())
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Connection = MockConnection;

    async fn connect(&self, server: &ServerConfig) -> Result<MockConnection, ConnectError> {
        let delay = *self.inner.connect_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.is_down(&server.name) {
            return Err(ConnectError::Failed(format!("{} refused", server.name)));
        }
        self.inner.opened.fetch_add(1, Ordering::SeqCst);
        self.inner.live.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection {
            id: self.inner.next_id.fetch_add(1, Ordering::SeqCst),
            server: server.name.clone(),
            connector: self.clone(),
        })
    }
}

pub fn server(name: &str, role: ServerRole, max_connections: Option<u32>) -> ServerConfig {
    ServerConfig {
        name: name.into(),
        role,
        host: format!("{name}.internal"),
        port: 5432,
        database: "crm".into(),
        username: "crm".into(),
        password: None,
        weight: 1,
        max_connections,
    }
}

pub fn pool_config(servers: Vec<ServerConfig>) -> PoolConfig {
    PoolConfig {
        servers,
        ..PoolConfig::default()
    }
}
