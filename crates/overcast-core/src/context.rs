//! Provider context
//!
//! One [`ProviderContext`] is built per backend instance and shared by every
//! container of that backend. It replaces process-wide provider singletons:
//! containers, tree builders and transfer queues receive it explicitly.
//!
//! The context never owns containers. The root returned by
//! [`ProviderContext::init_tree`] belongs to the caller.

use std::sync::Arc;

use tracing::{error, info};

use crate::config::Config;
use crate::domain::{Container, StorageError};
use crate::ports::{Locality, StorageProvider};
use crate::usecases::build_tree::TreeBuilder;

/// Depth used by [`ProviderContext::build_full_tree`]
pub const FULL_DEPTH: i32 = i32::MAX;

/// Shared handle to one authorised provider
pub struct ProviderContext {
    name: String,
    provider: Arc<dyn StorageProvider>,
    config: Config,
}

impl ProviderContext {
    /// Authorises `provider` and wraps it in a context
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::AuthorisationFailure`] if the provider rejects
    /// its credentials; no context is produced in that case.
    pub async fn connect(
        name: impl Into<String>,
        provider: Arc<dyn StorageProvider>,
        config: Config,
    ) -> Result<Arc<Self>, StorageError> {
        let name = name.into();

        if let Err(e) = provider.authorise().await {
            error!(provider = %name, error = %format!("{e:#}"), "Authorisation rejected");
            return Err(StorageError::AuthorisationFailure(format!("{name}: {e:#}")));
        }

        info!(provider = %name, "Provider authorised");
        Ok(Arc::new(Self {
            name,
            provider,
            config,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn provider(&self) -> &Arc<dyn StorageProvider> {
        &self.provider
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn locality(&self) -> Locality {
        self.provider.locality()
    }

    pub fn path_prefix(&self) -> Option<&str> {
        self.provider.path_prefix()
    }

    /// Fetches the root folder and builds `tree.default_depth` levels below it
    pub async fn init_tree(self: &Arc<Self>) -> Result<Arc<Container>, StorageError> {
        let handle = self
            .provider
            .root()
            .await
            .map_err(|e| StorageError::operation("init tree", &e))?;

        let root = Container::root(self, handle);
        self.build_file_tree(&root, self.config.tree.default_depth)
            .await?;

        info!(provider = %self.name, children = root.child_count(), "Tree initialised");
        Ok(root)
    }

    /// Refreshes `depth` levels below `folder`
    pub async fn build_file_tree(
        &self,
        folder: &Arc<Container>,
        depth: i32,
    ) -> Result<(), StorageError> {
        TreeBuilder::from_config(&self.config.tree)
            .build(folder, depth)
            .await
    }

    /// Refreshes the whole subtree below `folder`
    pub async fn build_full_tree(&self, folder: &Arc<Container>) -> Result<(), StorageError> {
        self.build_file_tree(folder, FULL_DEPTH).await
    }

    /// Free bytes left on the account
    pub async fn remote_free_space(&self) -> Result<u64, StorageError> {
        self.provider
            .quota()
            .await
            .map(|quota| quota.free())
            .map_err(|e| StorageError::operation("free space", &e))
    }

    /// Builds a context without authorising; unit tests only
    #[cfg(test)]
    pub(crate) fn unauthorised(
        name: impl Into<String>,
        provider: Arc<dyn StorageProvider>,
        config: Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            provider,
            config,
        })
    }
}

impl std::fmt::Debug for ProviderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderContext")
            .field("name", &self.name)
            .field("locality", &self.locality())
            .finish()
    }
}
