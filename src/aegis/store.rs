use std::time::Duration;

use async_trait::async_trait;

/// Persistence collaborator for block lists and connection/packet audit
/// records. The relay engine only calls through this interface; storage
/// format and schema belong to the implementation.
///
/// All calls from the relay path are best-effort: failures are logged by the
/// caller and never tear down a connection.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn record_connection(&self, ip: &str) -> anyhow::Result<()>;
    async fn record_packet(&self, ip: &str) -> anyhow::Result<()>;
    async fn record_block(&self, ip: &str) -> anyhow::Result<()>;
    async fn record_unblock(&self, ip: &str) -> anyhow::Result<()>;
    /// Block list persisted from previous runs, loaded once at startup.
    async fn load_blocked(&self) -> anyhow::Result<Vec<String>>;
    /// Drop audit rows older than `age`. Driven by the periodic maintenance
    /// task in app wiring, not by the relay engine.
    async fn purge_older_than(&self, age: Duration) -> anyhow::Result<()>;
}

/// Default store: keeps nothing. Used when no `[store]` backend is
/// configured.
pub struct NullStore;

#[async_trait]
impl AuditStore for NullStore {
    async fn record_connection(&self, _ip: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn record_packet(&self, _ip: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn record_block(&self, _ip: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn record_unblock(&self, _ip: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn load_blocked(&self) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn purge_older_than(&self, _age: Duration) -> anyhow::Result<()> {
        Ok(())
    }
}

pub type SharedStore = std::sync::Arc<dyn AuditStore>;
