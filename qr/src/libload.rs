//! External-library loader
//!
//! Fetches the Lua modules a collection's `libraries` list names - by
//! published package coordinates, local file path, or URL - and hands
//! their sources to the script engine's `require`. Nothing executes at
//! fetch time; a module runs only when a script requires it. The whole
//! feature sits behind the explicit `allowExternalLibraries` flag
//! because it opens network and filesystem side effects.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::collection::options::{LibrarySource, RunOptions};
use crate::error::RunnerError;

/// Default registry queried for `LibrarySource::Package` entries
pub const DEFAULT_LIBRARY_REGISTRY: &str = "https://libraries.questrun.dev";

/// Fetches and memoizes library sources for one run
pub struct LibraryLoader {
    registry_base: String,
    client: reqwest::Client,
    /// require-name -> fetched source, memoized across invocations
    cache: HashMap<String, String>,
}

impl LibraryLoader {
    pub fn new(registry_base: Option<&str>) -> Self {
        Self {
            registry_base: registry_base.unwrap_or(DEFAULT_LIBRARY_REGISTRY).trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            cache: HashMap::new(),
        }
    }

    /// Enforce the gate, then fetch every declared library. Returns the
    /// `name -> source` map the engine consults after its builtin
    /// allow-list misses.
    pub async fn load_all(&mut self, options: &RunOptions) -> Result<HashMap<String, String>, RunnerError> {
        if options.libraries.is_empty() {
            return Ok(HashMap::new());
        }
        if !options.allow_external_libraries {
            return Err(RunnerError::Security(
                "collection requests external libraries but allowExternalLibraries is not set".to_string(),
            ));
        }

        for source in &options.libraries {
            let name = source.require_name().to_string();
            if self.cache.contains_key(&name) {
                debug!(%name, "LibraryLoader: cache hit");
                continue;
            }
            let text = self.fetch(source).await?;
            info!(%name, bytes = text.len(), "Loaded external library");
            self.cache.insert(name, text);
        }
        Ok(self.cache.clone())
    }

    async fn fetch(&self, source: &LibrarySource) -> Result<String, RunnerError> {
        match source {
            LibrarySource::Path { name, path } => tokio::fs::read_to_string(path).await.map_err(|e| {
                RunnerError::Config(format!("library {name}: cannot read {path}: {e}"))
            }),
            LibrarySource::Url { name, url } => self.fetch_url(name, url).await,
            LibrarySource::Package { name, version } => {
                let url = format!("{}/{name}/{version}.lua", self.registry_base);
                self.fetch_url(name, &url).await
            }
        }
    }

    async fn fetch_url(&self, name: &str, url: &str) -> Result<String, RunnerError> {
        debug!(%name, %url, "LibraryLoader: fetching");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| RunnerError::Config(format!("library {name}: fetch failed: {e}")))?;
        if !response.status().is_success() {
            return Err(RunnerError::Config(format!(
                "library {name}: fetch returned {}",
                response.status()
            )));
        }
        response
            .text()
            .await
            .map_err(|e| RunnerError::Config(format!("library {name}: body read failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn options(value: serde_json::Value) -> RunOptions {
        RunOptions::resolve(&serde_json::Value::Null, &value).unwrap()
    }

    #[tokio::test]
    async fn test_empty_list_is_fine_without_gate() {
        let mut loader = LibraryLoader::new(None);
        let map = loader.load_all(&options(json!({}))).await.unwrap();
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn test_gate_enforced() {
        let mut loader = LibraryLoader::new(None);
        let opts = options(json!({
            "libraries": [ { "kind": "path", "name": "x", "path": "/tmp/x.lua" } ]
        }));
        let err = loader.load_all(&opts).await.unwrap_err();
        assert!(matches!(err, RunnerError::Security(_)));
    }

    #[tokio::test]
    async fn test_path_library_loads_and_memoizes() {
        let tmp = tempfile::tempdir().unwrap();
        let lib = tmp.path().join("shout.lua");
        std::fs::write(&lib, "return { loud = true }").unwrap();

        let mut loader = LibraryLoader::new(None);
        let opts = options(json!({
            "allowExternalLibraries": true,
            "libraries": [ { "kind": "path", "name": "shout", "path": lib.to_str().unwrap() } ]
        }));
        let map = loader.load_all(&opts).await.unwrap();
        assert_eq!(map["shout"], "return { loud = true }");

        // Second pass hits the cache even if the file disappears
        std::fs::remove_file(&lib).unwrap();
        let map = loader.load_all(&opts).await.unwrap();
        assert_eq!(map["shout"], "return { loud = true }");
    }

    #[tokio::test]
    async fn test_missing_path_is_config_error() {
        let mut loader = LibraryLoader::new(None);
        let opts = options(json!({
            "allowExternalLibraries": true,
            "libraries": [ { "kind": "path", "name": "ghost", "path": "/no/such/file.lua" } ]
        }));
        let err = loader.load_all(&opts).await.unwrap_err();
        assert!(matches!(err, RunnerError::Config(_)));
    }
}
