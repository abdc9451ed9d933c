//! Loaders for [`RouteDirectory`] construction (spec.md §6, "External
//! Interfaces").

use std::env;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use confluo_core::{RouteConfig, RouteDirectory};

use crate::config::DEFAULT_ROUTING_FILE;

#[derive(Debug, Error)]
pub enum DirectoryLoadError {
    #[error("failed to read route directory file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse route directory YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("failed to parse provider routing payload JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// The top-level shape of the route-directory YAML file: a
/// `messageConfig.routes` sequence (spec.md §6).
#[derive(Debug, Deserialize)]
struct DirectoryFile {
    #[serde(rename = "messageConfig")]
    message_config: MessageConfig,
}

#[derive(Debug, Deserialize)]
struct MessageConfig {
    routes: Vec<RouteConfig>,
}

/// Loads the route directory from the YAML file at `path`, the
/// `messageConfig.routes` shape spec.md §6 describes. Unknown fields are
/// ignored (the usual `serde` default for struct deserialization without
/// `deny_unknown_fields`).
pub fn load_from_yaml_file(path: &Path) -> Result<RouteDirectory, DirectoryLoadError> {
    let contents = std::fs::read_to_string(path).map_err(|source| DirectoryLoadError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let file: DirectoryFile = serde_yaml::from_str(&contents)?;
    Ok(RouteDirectory::new(file.message_config.routes))
}

/// Resolves `ROUTING_FILE` (default [`DEFAULT_ROUTING_FILE`]) and loads
/// the directory from it.
pub fn load_from_env() -> Result<RouteDirectory, DirectoryLoadError> {
    let path = env::var("ROUTING_FILE").unwrap_or_else(|_| DEFAULT_ROUTING_FILE.to_string());
    load_from_yaml_file(Path::new(&path))
}

/// Parses a single-route JSON object — the "Provider routing payload"
/// shape embedded in a processor-provider record (spec.md §6) — into a
/// one-entry directory usable by the route directory (C6).
pub fn load_from_provider_payload(json: &str) -> Result<RouteDirectory, DirectoryLoadError> {
    let route: RouteConfig = serde_json::from_str(json)?;
    Ok(RouteDirectory::new(vec![route]))
}
