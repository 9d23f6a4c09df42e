//! Read-only descriptor store façade
//!
//! The CRUD layer that creates projects, devices, payload templates and
//! targets lives outside this process. The runtime only needs point lookups
//! over an immutable snapshot, expressed here as the [`DescriptorStore`]
//! trait. [`InMemoryStore`] is the standard implementation, populated either
//! programmatically (tests) or from a JSON snapshot document (the binary).

use crate::error::{Error, Result};
use crate::model::{DeviceDescriptor, PayloadDescriptor, ProjectDescriptor, TargetDescriptor};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

/// Point lookups the runtime performs when a project starts
#[async_trait]
pub trait DescriptorStore: Send + Sync {
    /// Look up a project by id
    async fn project(&self, id: &str) -> Result<Option<ProjectDescriptor>>;

    /// All devices belonging to a project (enabled or not)
    async fn devices_for_project(&self, project_id: &str) -> Result<Vec<DeviceDescriptor>>;

    /// Look up a single device by id
    async fn device(&self, id: &str) -> Result<Option<DeviceDescriptor>>;

    /// Look up a payload template by id
    async fn payload(&self, id: &str) -> Result<Option<PayloadDescriptor>>;

    /// Look up a target system by id
    async fn target(&self, id: &str) -> Result<Option<TargetDescriptor>>;
}

/// Serialized snapshot document accepted by [`InMemoryStore::from_json_file`]
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct SnapshotDocument {
    #[serde(default)]
    pub projects: Vec<ProjectDescriptor>,
    #[serde(default)]
    pub devices: Vec<DeviceDescriptor>,
    #[serde(default)]
    pub payloads: Vec<PayloadDescriptor>,
    #[serde(default)]
    pub targets: Vec<TargetDescriptor>,
}

/// In-memory descriptor snapshot
#[derive(Debug, Default)]
pub struct InMemoryStore {
    projects: HashMap<String, ProjectDescriptor>,
    devices: HashMap<String, DeviceDescriptor>,
    payloads: HashMap<String, PayloadDescriptor>,
    targets: HashMap<String, TargetDescriptor>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a snapshot document from disk
    pub async fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        let doc: SnapshotDocument = serde_json::from_str(&raw)?;
        let store = Self::from_document(doc);
        info!(
            "Descriptor snapshot loaded: {} projects, {} devices, {} payloads, {} targets",
            store.projects.len(),
            store.devices.len(),
            store.payloads.len(),
            store.targets.len()
        );
        Ok(store)
    }

    pub fn from_document(doc: SnapshotDocument) -> Self {
        let mut store = Self::new();
        for project in doc.projects {
            store.insert_project(project);
        }
        for device in doc.devices {
            store.insert_device(device);
        }
        for payload in doc.payloads {
            store.insert_payload(payload);
        }
        for target in doc.targets {
            store.insert_target(target);
        }
        store
    }

    pub fn insert_project(&mut self, project: ProjectDescriptor) {
        self.projects.insert(project.id.clone(), project);
    }

    pub fn insert_device(&mut self, device: DeviceDescriptor) {
        self.devices.insert(device.id.clone(), device);
    }

    pub fn insert_payload(&mut self, payload: PayloadDescriptor) {
        self.payloads.insert(payload.id.clone(), payload);
    }

    pub fn insert_target(&mut self, target: TargetDescriptor) {
        self.targets.insert(target.id.clone(), target);
    }
}

#[async_trait]
impl DescriptorStore for InMemoryStore {
    async fn project(&self, id: &str) -> Result<Option<ProjectDescriptor>> {
        Ok(self.projects.get(id).cloned())
    }

    async fn devices_for_project(&self, project_id: &str) -> Result<Vec<DeviceDescriptor>> {
        let mut devices: Vec<_> = self
            .devices
            .values()
            .filter(|d| d.project_id == project_id)
            .cloned()
            .collect();
        // Stable order so start/validate reports are deterministic
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(devices)
    }

    async fn device(&self, id: &str) -> Result<Option<DeviceDescriptor>> {
        Ok(self.devices.get(id).cloned())
    }

    async fn payload(&self, id: &str) -> Result<Option<PayloadDescriptor>> {
        Ok(self.payloads.get(id).cloned())
    }

    async fn target(&self, id: &str) -> Result<Option<TargetDescriptor>> {
        Ok(self.targets.get(id).cloned())
    }
}

/// Convenience lookup that maps a missing entity to [`Error::NotFound`]
pub async fn require_project(
    store: &dyn DescriptorStore,
    id: &str,
) -> Result<ProjectDescriptor> {
    store
        .project(id)
        .await?
        .ok_or_else(|| Error::not_found("project", id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_device(id: &str, project: &str) -> DeviceDescriptor {
        serde_json::from_value(json!({
            "id": id,
            "name": format!("device-{id}"),
            "project_id": project,
            "send_interval_secs": 5
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_devices_for_project_filters_and_sorts() {
        let mut store = InMemoryStore::new();
        store.insert_device(sample_device("b", "p1"));
        store.insert_device(sample_device("a", "p1"));
        store.insert_device(sample_device("c", "p2"));

        let devices = store.devices_for_project("p1").await.unwrap();
        let ids: Vec<_> = devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_snapshot_document_roundtrip() {
        let doc: SnapshotDocument = serde_json::from_value(json!({
            "projects": [{"id": "p1", "name": "plant-floor"}],
            "devices": [{"id": "d1", "name": "sensor", "project_id": "p1"}],
            "payloads": [{"id": "pl1", "name": "telemetry", "kind": "schema",
                          "schema": {"fields": []}}],
            "targets": [{"id": "t1", "name": "ingest", "kind": "http",
                         "config": {"url": "http://localhost:9/ingest"}}]
        }))
        .unwrap();

        let store = InMemoryStore::from_document(doc);
        assert!(store.project("p1").await.unwrap().is_some());
        assert!(store.payload("pl1").await.unwrap().is_some());
        assert!(store.target("t1").await.unwrap().is_some());
        assert!(store.target("t2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_require_project_not_found() {
        let store = InMemoryStore::new();
        let err = require_project(&store, "ghost").await.unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        let doc = json!({
            "projects": [{"id": "p1", "name": "plant-floor"}],
            "devices": [{"id": "d1", "name": "sensor", "project_id": "p1"}]
        });
        tokio::fs::write(&path, doc.to_string()).await.unwrap();

        let store = InMemoryStore::from_json_file(&path).await.unwrap();
        assert!(store.project("p1").await.unwrap().is_some());
        assert_eq!(store.devices_for_project("p1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_from_json_file_rejects_malformed_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        tokio::fs::write(&path, "{not json").await.unwrap();
        assert!(InMemoryStore::from_json_file(&path).await.is_err());
    }
}
