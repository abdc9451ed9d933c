//! Processor repository: hot data, cached at `base_ttl`. `Upsert`
//! invalidates both lookups it could have changed.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cache::ttl::TtlCache;
use crate::cache::wrapper::CachedWrapper;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Processor {
    pub id: String,
    pub project_id: String,
    pub name: String,
}

#[async_trait]
pub trait ProcessorBackend: Send + Sync {
    async fn find_processor_by_id(&self, id: &str) -> anyhow::Result<Option<Processor>>;
    async fn find_processor_by_project_id(
        &self,
        project_id: &str,
    ) -> anyhow::Result<Option<Processor>>;
    async fn upsert_processor(&self, processor: Processor) -> anyhow::Result<()>;
}

const METHOD_FIND_BY_ID: &str = "findProcessorByID";
const METHOD_FIND_BY_PROJECT_ID: &str = "findProcessorByProjectID";

pub struct ProcessorRepo<B> {
    wrapper: CachedWrapper<B>,
}

impl<B: ProcessorBackend> ProcessorRepo<B> {
    pub fn new(backend: B, cache: Arc<TtlCache>) -> Self {
        let base_ttl = cache.default_ttl();
        let wrapper = CachedWrapper::new(backend, cache);
        wrapper.set_method_config(METHOD_FIND_BY_ID, base_ttl, true);
        wrapper.set_method_config(METHOD_FIND_BY_PROJECT_ID, base_ttl, true);
        Self { wrapper }
    }

    pub async fn find_by_id(&self, id: &str) -> anyhow::Result<Option<Arc<Processor>>> {
        self.wrapper
            .call_cached(METHOD_FIND_BY_ID, &[id], || {
                let backend = self.wrapper.backend();
                async move { backend.find_processor_by_id(id).await }
            })
            .await
    }

    pub async fn find_by_project_id(
        &self,
        project_id: &str,
    ) -> anyhow::Result<Option<Arc<Processor>>> {
        self.wrapper
            .call_cached(METHOD_FIND_BY_PROJECT_ID, &[project_id], || {
                let backend = self.wrapper.backend();
                async move { backend.find_processor_by_project_id(project_id).await }
            })
            .await
    }

    pub async fn upsert(&self, processor: Processor) -> anyhow::Result<()> {
        self.wrapper.backend().upsert_processor(processor.clone()).await?;
        self.wrapper.invalidate_method(METHOD_FIND_BY_ID, &[processor.id.as_str()]);
        self.wrapper
            .invalidate_method(METHOD_FIND_BY_PROJECT_ID, &[processor.project_id.as_str()]);
        Ok(())
    }
}
