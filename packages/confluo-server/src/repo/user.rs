//! User repository: `FindUserByID` is very-stable cached data; `Upsert`
//! invalidates the one key it could have changed.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cache::wrapper::CachedWrapper;
use crate::cache::ttl::TtlCache;
use crate::repo::ttl_defaults;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
}

/// Persistence backend for users. No provided implementation: the backend
/// is an external collaborator, supplied by whatever storage layer the
/// deployment uses.
#[async_trait]
pub trait UserBackend: Send + Sync {
    async fn find_user_by_id(&self, id: &str) -> anyhow::Result<Option<User>>;
    async fn upsert_user(&self, user: User) -> anyhow::Result<()>;
}

const METHOD_FIND_USER_BY_ID: &str = "findUserByID";

pub struct UserRepo<B> {
    wrapper: CachedWrapper<B>,
}

impl<B: UserBackend> UserRepo<B> {
    pub fn new(backend: B, cache: Arc<TtlCache>) -> Self {
        let wrapper = CachedWrapper::new(backend, cache);
        wrapper.set_method_config(METHOD_FIND_USER_BY_ID, ttl_defaults::VERY_STABLE, true);
        Self { wrapper }
    }

    pub async fn find_user_by_id(&self, id: &str) -> anyhow::Result<Option<Arc<User>>> {
        self.wrapper
            .call_cached(METHOD_FIND_USER_BY_ID, &[id], || {
                let backend = self.wrapper.backend();
                async move { backend.find_user_by_id(id).await }
            })
            .await
    }

    pub async fn upsert(&self, user: User) -> anyhow::Result<()> {
        self.wrapper.backend().upsert_user(user.clone()).await?;
        self.wrapper
            .invalidate_method(METHOD_FIND_USER_BY_ID, &[user.id.as_str()]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct InMemoryUserBackend {
        users: Mutex<HashMap<String, User>>,
        calls: AtomicUsize,
    }

    impl InMemoryUserBackend {
        fn new(seed: User) -> Self {
            let mut users = HashMap::new();
            users.insert(seed.id.clone(), seed);
            Self { users: Mutex::new(users), calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl UserBackend for InMemoryUserBackend {
        async fn find_user_by_id(&self, id: &str) -> anyhow::Result<Option<User>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.users.lock().get(id).cloned())
        }

        async fn upsert_user(&self, user: User) -> anyhow::Result<()> {
            self.users.lock().insert(user.id.clone(), user);
            Ok(())
        }
    }

    fn cache() -> Arc<TtlCache> {
        Arc::new(TtlCache::new(Duration::from_secs(60), Duration::from_millis(20)))
    }

    #[tokio::test]
    async fn s6_cache_write_through() {
        let backend = InMemoryUserBackend::new(User { id: "u1".into(), name: "alice".into() });
        let repo = UserRepo::new(backend, cache());

        let first = repo.find_user_by_id("u1").await.unwrap().unwrap();
        assert_eq!(first.name, "alice");

        repo.upsert(User { id: "u1".into(), name: "new".into() }).await.unwrap();

        let second = repo.find_user_by_id("u1").await.unwrap().unwrap();
        assert_eq!(second.name, "new");

        // One read before the upsert's implicit write, one read after the
        // upsert invalidated the cache; never more than two fetches total.
        assert_eq!(repo.wrapper.backend().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_read_before_any_write_is_served_from_cache() {
        let backend = InMemoryUserBackend::new(User { id: "u1".into(), name: "alice".into() });
        let repo = UserRepo::new(backend, cache());

        repo.find_user_by_id("u1").await.unwrap();
        repo.find_user_by_id("u1").await.unwrap();

        assert_eq!(repo.wrapper.backend().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_user_is_not_cached_as_present() {
        let backend = InMemoryUserBackend::new(User { id: "u1".into(), name: "alice".into() });
        let repo = UserRepo::new(backend, cache());

        let missing = repo.find_user_by_id("nope").await.unwrap();
        assert!(missing.is_none());
    }
}
