//! Shared fixtures for the transfer integration tests
//!
//! A remote in-memory provider serves both the storage and the transfer
//! ports; a second in-memory provider with local locality stands in for the
//! local disk.

use std::sync::Arc;
use std::time::Duration;

use overcast_core::ports::{Locality, StorageProvider};
use overcast_core::{Config, Container, ProviderContext};
use overcast_memory::{MemoryProvider, MemoryProviderBuilder};
use overcast_transfer::{TransferChannel, TransferListener, TransferManager, TransferProvider, TransferUpdate};
use tokio::sync::mpsc::UnboundedReceiver;

pub struct Fixture {
    pub remote: Arc<MemoryProvider>,
    pub local: Arc<MemoryProvider>,
    pub remote_root: Arc<Container>,
    pub local_root: Arc<Container>,
    pub manager: TransferManager,
}

pub fn remote_builder() -> MemoryProviderBuilder {
    MemoryProvider::builder("remote").tick_delay(Duration::from_millis(1))
}

pub fn local_provider() -> Arc<MemoryProvider> {
    MemoryProvider::builder("local")
        .locality(Locality::Local)
        .build()
}

async fn context(provider: &Arc<MemoryProvider>, name: &str, config: Config) -> Arc<ProviderContext> {
    let storage: Arc<dyn StorageProvider> = provider.clone();
    ProviderContext::connect(name, storage, config).await.unwrap()
}

impl Fixture {
    /// Connects both sides and builds their full trees; seed providers first
    pub async fn connect(remote: Arc<MemoryProvider>, local: Arc<MemoryProvider>, config: Config) -> Self {
        let transfers: Arc<dyn TransferProvider> = remote.clone();
        Self::connect_with_transfers(remote, local, config, transfers).await
    }

    /// Like [`Fixture::connect`], with transfers served by `transfers`
    pub async fn connect_with_transfers(
        remote: Arc<MemoryProvider>,
        local: Arc<MemoryProvider>,
        config: Config,
        transfers: Arc<dyn TransferProvider>,
    ) -> Self {
        let remote_ctx = context(&remote, "remote", config.clone()).await;
        let local_ctx = context(&local, "local", config).await;

        let remote_root = remote_ctx.init_tree().await.unwrap();
        remote_ctx.build_full_tree(&remote_root).await.unwrap();
        let local_root = local_ctx.init_tree().await.unwrap();
        local_ctx.build_full_tree(&local_root).await.unwrap();

        let manager = TransferManager::new(remote_ctx, local_ctx, transfers);
        Self {
            remote,
            local,
            remote_root,
            local_root,
            manager,
        }
    }

    pub async fn with_defaults(remote: Arc<MemoryProvider>, local: Arc<MemoryProvider>) -> Self {
        Self::connect(remote, local, Config::default()).await
    }

    pub fn local_file(&self, name: &str) -> Arc<Container> {
        self.local_root
            .find_child(name, overcast_core::ContainerKind::File)
            .unwrap()
    }

    pub fn remote_file(&self, name: &str) -> Arc<Container> {
        self.remote_root
            .find_child(name, overcast_core::ContainerKind::File)
            .unwrap()
    }

    pub async fn idle(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.manager.wait_idle())
            .await
            .expect("queues did not drain");
    }
}

pub fn listener() -> (Arc<dyn TransferListener>, UnboundedReceiver<TransferUpdate>) {
    let (channel, rx) = TransferChannel::new();
    let listener: Arc<dyn TransferListener> = channel;
    (listener, rx)
}

pub fn drain(rx: &mut UnboundedReceiver<TransferUpdate>) -> Vec<TransferUpdate> {
    let mut updates = Vec::new();
    while let Ok(update) = rx.try_recv() {
        updates.push(update);
    }
    updates
}

/// Polls `condition` until it holds
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
