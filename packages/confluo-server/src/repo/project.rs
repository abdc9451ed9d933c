//! Project repository: `FindByID` is hot data at `base_ttl`;
//! `FindAllByUserID` favors list stability at `base + 2min`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cache::ttl::TtlCache;
use crate::cache::wrapper::CachedWrapper;
use crate::repo::ttl_defaults;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub user_id: String,
    pub name: String,
}

#[async_trait]
pub trait ProjectBackend: Send + Sync {
    async fn find_by_id(&self, id: &str) -> anyhow::Result<Option<Project>>;
    async fn find_all_by_user_id(&self, user_id: &str) -> anyhow::Result<Option<Vec<Project>>>;
    async fn upsert_project(&self, project: Project) -> anyhow::Result<()>;
}

const METHOD_FIND_BY_ID: &str = "findByID";
const METHOD_FIND_ALL_BY_USER_ID: &str = "findAllByUserID";

pub struct ProjectRepo<B> {
    wrapper: CachedWrapper<B>,
}

impl<B: ProjectBackend> ProjectRepo<B> {
    pub fn new(backend: B, cache: Arc<TtlCache>) -> Self {
        let base_ttl = cache.default_ttl();
        let wrapper = CachedWrapper::new(backend, cache);
        wrapper.set_method_config(METHOD_FIND_BY_ID, base_ttl, true);
        wrapper.set_method_config(METHOD_FIND_ALL_BY_USER_ID, ttl_defaults::list_ttl(base_ttl), true);
        Self { wrapper }
    }

    pub async fn find_by_id(&self, id: &str) -> anyhow::Result<Option<Arc<Project>>> {
        self.wrapper
            .call_cached(METHOD_FIND_BY_ID, &[id], || {
                let backend = self.wrapper.backend();
                async move { backend.find_by_id(id).await }
            })
            .await
    }

    pub async fn find_all_by_user_id(
        &self,
        user_id: &str,
    ) -> anyhow::Result<Option<Arc<Vec<Project>>>> {
        self.wrapper
            .call_cached(METHOD_FIND_ALL_BY_USER_ID, &[user_id], || {
                let backend = self.wrapper.backend();
                async move { backend.find_all_by_user_id(user_id).await }
            })
            .await
    }

    pub async fn upsert(&self, project: Project) -> anyhow::Result<()> {
        self.wrapper.backend().upsert_project(project.clone()).await?;
        self.wrapper.invalidate_method(METHOD_FIND_BY_ID, &[project.id.as_str()]);
        self.wrapper
            .invalidate_method(METHOD_FIND_ALL_BY_USER_ID, &[project.user_id.as_str()]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct InMemoryProjectBackend {
        projects: Mutex<Vec<Project>>,
        calls: AtomicUsize,
    }

    impl InMemoryProjectBackend {
        fn new(seed: Project) -> Self {
            Self { projects: Mutex::new(vec![seed]), calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl ProjectBackend for InMemoryProjectBackend {
        async fn find_by_id(&self, id: &str) -> anyhow::Result<Option<Project>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.projects.lock().iter().find(|p| p.id == id).cloned())
        }

        async fn find_all_by_user_id(&self, user_id: &str) -> anyhow::Result<Option<Vec<Project>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let matches: Vec<Project> =
                self.projects.lock().iter().filter(|p| p.user_id == user_id).cloned().collect();
            Ok(if matches.is_empty() { None } else { Some(matches) })
        }

        async fn upsert_project(&self, project: Project) -> anyhow::Result<()> {
            let mut projects = self.projects.lock();
            if let Some(existing) = projects.iter_mut().find(|p| p.id == project.id) {
                *existing = project;
            } else {
                projects.push(project);
            }
            Ok(())
        }
    }

    fn cache() -> Arc<TtlCache> {
        Arc::new(TtlCache::new(Duration::from_secs(60), Duration::from_millis(20)))
    }

    #[tokio::test]
    async fn upsert_invalidates_both_lookups() {
        let seed = Project { id: "proj1".into(), user_id: "u1".into(), name: "demo".into() };
        let repo = ProjectRepo::new(InMemoryProjectBackend::new(seed), cache());

        repo.find_by_id("proj1").await.unwrap();
        repo.find_all_by_user_id("u1").await.unwrap();
        assert_eq!(repo.wrapper.backend().calls.load(Ordering::SeqCst), 2);

        repo.upsert(Project { id: "proj1".into(), user_id: "u1".into(), name: "renamed".into() })
            .await
            .unwrap();

        let by_id = repo.find_by_id("proj1").await.unwrap().unwrap();
        let all = repo.find_all_by_user_id("u1").await.unwrap().unwrap();
        assert_eq!(by_id.name, "renamed");
        assert_eq!(all[0].name, "renamed");
        assert_eq!(repo.wrapper.backend().calls.load(Ordering::SeqCst), 4);
    }
}
