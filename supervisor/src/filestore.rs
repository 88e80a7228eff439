use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;

use anchorage_model::{DataResidence, FilestoreKind, Installation};

#[async_trait]
pub trait FilestoreProvider: Send + Sync {
    async fn provision(&self, installation: &Installation) -> Result<()>;
    async fn teardown(&self, installation: &Installation, keep_data: bool) -> Result<()>;
}

#[derive(Clone, Default)]
pub struct FilestoreRegistry {
    providers: HashMap<FilestoreKind, Arc<dyn FilestoreProvider>>,
}

impl FilestoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, kind: FilestoreKind, provider: Arc<dyn FilestoreProvider>) -> Self {
        self.providers.insert(kind, provider);
        self
    }

    pub fn get(&self, kind: FilestoreKind) -> Result<Arc<dyn FilestoreProvider>> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or_else(|| anyhow!("no filestore provider registered for {kind}"))
    }
}

/// Deletes backup artifacts out of their object-store residence.
#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    async fn delete_object(&self, residence: &DataResidence) -> Result<()>;
}
