//! Worker registry: maps a class name to the script that launches it.
//!
//! The registry is an external collaborator. It is kept as a JSON
//! document on disk and re-read on every lookup, so registrations made
//! while the daemon runs are picked up without a restart.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use moman_core::WorkerKind;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("could not read registry: {0}")]
    Io(#[from] io::Error),
    #[error("registry document is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisteredWorker {
    pub path: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
struct RegistryDoc {
    #[serde(default)]
    monitors: HashMap<String, RegisteredWorker>,
    #[serde(default)]
    scrapers: HashMap<String, RegisteredWorker>,
}

#[derive(Debug, Clone)]
pub struct Registry {
    path: PathBuf,
}

impl Registry {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    /// Looks up the launch path for `class_name`. A missing registry
    /// document means nothing is registered, not an error; a corrupt
    /// one is surfaced to the caller.
    pub async fn lookup(
        &self,
        kind: WorkerKind,
        class_name: &str,
    ) -> Result<Option<RegisteredWorker>, RegistryError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let doc: RegistryDoc = serde_json::from_str(&text)?;
        let table = match kind {
            WorkerKind::Monitor => &doc.monitors,
            WorkerKind::Scraper => &doc.scrapers,
        };
        Ok(table.get(class_name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_registry(name: &str, body: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("moman-reg-{}-{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("register.json");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[tokio::test]
    async fn finds_registered_monitor() {
        let path = write_registry(
            "hit",
            r#"{"monitors": {"Footsites": {"path": "/opt/monitors/footsites.py"}}}"#,
        );
        let registry = Registry::new(&path);
        let hit = registry
            .lookup(WorkerKind::Monitor, "Footsites")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.path, PathBuf::from("/opt/monitors/footsites.py"));
        assert!(registry
            .lookup(WorkerKind::Scraper, "Footsites")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn missing_document_means_not_registered() {
        let registry = Registry::new(Path::new("/nonexistent/register.json"));
        assert!(registry
            .lookup(WorkerKind::Monitor, "Footsites")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn corrupt_document_is_an_error() {
        let path = write_registry("corrupt", "{not json");
        let registry = Registry::new(&path);
        assert!(matches!(
            registry.lookup(WorkerKind::Monitor, "X").await,
            Err(RegistryError::Malformed(_))
        ));
    }
}
