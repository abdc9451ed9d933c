//! State repository. `FindStateFull(id, *)` is registered under a key
//! prefixed by its state ID so a state or column write can invalidate
//! every variant of it without knowing which variants exist. Three write
//! shapes:
//!
//! - Upsert State (basic): invalidates `FindState` and `FindStateFull`.
//! - Upsert State (complete): also invalidates `FindConfigAttributes` and
//!   `FindStateConfigKeyDefinitionsGroupByType`.
//! - Upsert State Columns: for each affected state ID, invalidates
//!   `FindDataColumnDefinitionsByStateID` and `FindStateFull`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cache::ttl::TtlCache;
use crate::cache::wrapper::CachedWrapper;
use crate::repo::ttl_defaults;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigAttributes {
    pub state_id: String,
    pub attributes: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateConfigKeyDefinition {
    pub key: String,
    pub value_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataColumnDefinition {
    pub name: String,
    pub data_type: String,
}

#[async_trait]
pub trait StateBackend: Send + Sync {
    async fn find_state(&self, id: &str) -> anyhow::Result<Option<State>>;
    async fn find_state_full(&self, id: &str, variant: &str) -> anyhow::Result<Option<serde_json::Value>>;
    async fn find_config_attributes(&self, id: &str) -> anyhow::Result<Option<ConfigAttributes>>;
    async fn find_state_config_key_definitions_group_by_type(
        &self,
        id: &str,
    ) -> anyhow::Result<Option<Vec<StateConfigKeyDefinition>>>;
    async fn find_data_column_definitions_by_state_id(
        &self,
        state_id: &str,
    ) -> anyhow::Result<Option<Vec<DataColumnDefinition>>>;
    async fn upsert_state(&self, state: State) -> anyhow::Result<()>;
}

const METHOD_FIND_STATE: &str = "findState";
const METHOD_FIND_STATE_FULL: &str = "findStateFull";
const METHOD_FIND_CONFIG_ATTRIBUTES: &str = "findConfigAttributes";
const METHOD_FIND_STATE_CONFIG_KEY_DEFS: &str = "findStateConfigKeyDefinitionsGroupByType";
const METHOD_FIND_DATA_COLUMN_DEFS: &str = "findDataColumnDefinitionsByStateID";

pub struct StateRepo<B> {
    wrapper: CachedWrapper<B>,
}

impl<B: StateBackend> StateRepo<B> {
    pub fn new(backend: B, cache: Arc<TtlCache>) -> Self {
        let base_ttl = cache.default_ttl();
        let wrapper = CachedWrapper::new(backend, cache);
        wrapper.set_method_config(METHOD_FIND_STATE, base_ttl, true);
        wrapper.set_method_config(METHOD_FIND_STATE_FULL, base_ttl, true);
        wrapper.set_method_config(METHOD_FIND_CONFIG_ATTRIBUTES, ttl_defaults::STRUCTURAL, true);
        wrapper.set_method_config(METHOD_FIND_STATE_CONFIG_KEY_DEFS, ttl_defaults::STRUCTURAL, true);
        wrapper.set_method_config(METHOD_FIND_DATA_COLUMN_DEFS, ttl_defaults::STRUCTURAL, true);
        Self { wrapper }
    }

    pub async fn find_state(&self, id: &str) -> anyhow::Result<Option<Arc<State>>> {
        self.wrapper
            .call_cached(METHOD_FIND_STATE, &[id], || {
                let backend = self.wrapper.backend();
                async move { backend.find_state(id).await }
            })
            .await
    }

    pub async fn find_state_full(
        &self,
        id: &str,
        variant: &str,
    ) -> anyhow::Result<Option<Arc<serde_json::Value>>> {
        self.wrapper
            .call_cached(METHOD_FIND_STATE_FULL, &[id, variant], || {
                let backend = self.wrapper.backend();
                async move { backend.find_state_full(id, variant).await }
            })
            .await
    }

    pub async fn find_config_attributes(
        &self,
        id: &str,
    ) -> anyhow::Result<Option<Arc<ConfigAttributes>>> {
        self.wrapper
            .call_cached(METHOD_FIND_CONFIG_ATTRIBUTES, &[id], || {
                let backend = self.wrapper.backend();
                async move { backend.find_config_attributes(id).await }
            })
            .await
    }

    pub async fn find_state_config_key_definitions_group_by_type(
        &self,
        id: &str,
    ) -> anyhow::Result<Option<Arc<Vec<StateConfigKeyDefinition>>>> {
        self.wrapper
            .call_cached(METHOD_FIND_STATE_CONFIG_KEY_DEFS, &[id], || {
                let backend = self.wrapper.backend();
                async move { backend.find_state_config_key_definitions_group_by_type(id).await }
            })
            .await
    }

    pub async fn find_data_column_definitions_by_state_id(
        &self,
        state_id: &str,
    ) -> anyhow::Result<Option<Arc<Vec<DataColumnDefinition>>>> {
        self.wrapper
            .call_cached(METHOD_FIND_DATA_COLUMN_DEFS, &[state_id], || {
                let backend = self.wrapper.backend();
                async move { backend.find_data_column_definitions_by_state_id(state_id).await }
            })
            .await
    }

    fn invalidate_state_full(&self, id: &str) {
        self.wrapper.invalidate_method_prefix(METHOD_FIND_STATE_FULL, &[id]);
    }

    /// Upsert State (basic): invalidates `FindState` and `FindStateFull`.
    pub async fn upsert_basic(&self, state: State) -> anyhow::Result<()> {
        self.wrapper.backend().upsert_state(state.clone()).await?;
        self.wrapper.invalidate_method(METHOD_FIND_STATE, &[state.id.as_str()]);
        self.invalidate_state_full(&state.id);
        Ok(())
    }

    /// Upsert State (complete): basic plus `FindConfigAttributes` and
    /// `FindStateConfigKeyDefinitionsGroupByType`.
    pub async fn upsert_complete(&self, state: State) -> anyhow::Result<()> {
        self.upsert_basic(state.clone()).await?;
        self.wrapper.invalidate_method(METHOD_FIND_CONFIG_ATTRIBUTES, &[state.id.as_str()]);
        self.wrapper
            .invalidate_method(METHOD_FIND_STATE_CONFIG_KEY_DEFS, &[state.id.as_str()]);
        Ok(())
    }

    /// Upsert State Columns: for each affected state ID, invalidates
    /// `FindDataColumnDefinitionsByStateID` and `FindStateFull`. Does not
    /// touch `upsert_state` itself -- column writes affect only these two.
    pub fn upsert_columns(&self, affected_state_ids: &[String]) {
        for state_id in affected_state_ids {
            self.wrapper
                .invalidate_method(METHOD_FIND_DATA_COLUMN_DEFS, &[state_id.as_str()]);
            self.invalidate_state_full(state_id);
        }
    }
}
