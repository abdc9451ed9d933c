//! Provider repository: very-stable provider-class lookups alongside a
//! per-user/project listing. `Upsert` invalidates all three.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cache::ttl::TtlCache;
use crate::cache::wrapper::CachedWrapper;
use crate::repo::ttl_defaults;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub class: String,
    pub user_id: String,
    pub project_id: String,
}

#[async_trait]
pub trait ProviderBackend: Send + Sync {
    async fn find_providers(
        &self,
        user_id: &str,
        project_id: &str,
    ) -> anyhow::Result<Option<Vec<Provider>>>;
    async fn find_provider_by_class(&self, class: &str) -> anyhow::Result<Option<Provider>>;
    async fn find_provider_by_class_user_and_project(
        &self,
        class: &str,
        user_id: &str,
        project_id: &str,
    ) -> anyhow::Result<Option<Provider>>;
    async fn upsert_provider(&self, provider: Provider) -> anyhow::Result<()>;
}

const METHOD_FIND_PROVIDERS: &str = "findProviders";
const METHOD_FIND_BY_CLASS: &str = "findProviderByClass";
const METHOD_FIND_BY_CLASS_USER_PROJECT: &str = "findProviderByClassUserAndProject";

pub struct ProviderRepo<B> {
    wrapper: CachedWrapper<B>,
}

impl<B: ProviderBackend> ProviderRepo<B> {
    pub fn new(backend: B, cache: Arc<TtlCache>) -> Self {
        let wrapper = CachedWrapper::new(backend, cache);
        wrapper.set_method_config(METHOD_FIND_PROVIDERS, ttl_defaults::VERY_STABLE, true);
        wrapper.set_method_config(METHOD_FIND_BY_CLASS, ttl_defaults::VERY_STABLE, true);
        wrapper.set_method_config(METHOD_FIND_BY_CLASS_USER_PROJECT, ttl_defaults::VERY_STABLE, true);
        Self { wrapper }
    }

    pub async fn find_providers(
        &self,
        user_id: &str,
        project_id: &str,
    ) -> anyhow::Result<Option<Arc<Vec<Provider>>>> {
        self.wrapper
            .call_cached(METHOD_FIND_PROVIDERS, &[user_id, project_id], || {
                let backend = self.wrapper.backend();
                async move { backend.find_providers(user_id, project_id).await }
            })
            .await
    }

    pub async fn find_by_class(&self, class: &str) -> anyhow::Result<Option<Arc<Provider>>> {
        self.wrapper
            .call_cached(METHOD_FIND_BY_CLASS, &[class], || {
                let backend = self.wrapper.backend();
                async move { backend.find_provider_by_class(class).await }
            })
            .await
    }

    pub async fn find_by_class_user_and_project(
        &self,
        class: &str,
        user_id: &str,
        project_id: &str,
    ) -> anyhow::Result<Option<Arc<Provider>>> {
        self.wrapper
            .call_cached(
                METHOD_FIND_BY_CLASS_USER_PROJECT,
                &[class, user_id, project_id],
                || {
                    let backend = self.wrapper.backend();
                    async move {
                        backend
                            .find_provider_by_class_user_and_project(class, user_id, project_id)
                            .await
                    }
                },
            )
            .await
    }

    pub async fn upsert(&self, provider: Provider) -> anyhow::Result<()> {
        self.wrapper.backend().upsert_provider(provider.clone()).await?;
        self.wrapper
            .invalidate_method(METHOD_FIND_PROVIDERS, &[provider.user_id.as_str(), provider.project_id.as_str()]);
        self.wrapper
            .invalidate_method(METHOD_FIND_BY_CLASS, &[provider.class.as_str()]);
        self.wrapper.invalidate_method(
            METHOD_FIND_BY_CLASS_USER_PROJECT,
            &[provider.class.as_str(), provider.user_id.as_str(), provider.project_id.as_str()],
        );
        Ok(())
    }
}
