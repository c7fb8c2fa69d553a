//! Project metadata persistence.
//!
//! The session core never touches this; the API records the last start request per
//! project so clients can offer a one-click relaunch.

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::registry::StartRequest;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub display_name: String,
    pub working_directory: PathBuf,
    pub command: String,
    #[serde(default)]
    pub bypass_permissions: bool,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn from_request(request: &StartRequest) -> Self {
        Self {
            id: request.session_id.trim().to_string(),
            display_name: request
                .display_name
                .clone()
                .unwrap_or_else(|| request.session_id.trim().to_string()),
            working_directory: request.working_directory.clone(),
            command: request.command.clone(),
            bypass_permissions: request.bypass_permissions,
            updated_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait ProjectStore: Send + Sync + 'static {
    async fn load(&self) -> anyhow::Result<Vec<Project>>;
    async fn save(&self, projects: &[Project]) -> anyhow::Result<()>;
    /// Insert or replace `project` by id as one atomic read-modify-write.
    async fn upsert(&self, project: Project) -> anyhow::Result<()>;
}

/// Replace by id, keeping the list sorted by id.
fn merge(projects: &mut Vec<Project>, project: Project) {
    match projects.iter_mut().find(|p| p.id == project.id) {
        Some(existing) => *existing = project,
        None => projects.push(project),
    }
    projects.sort_by(|a, b| a.id.cmp(&b.id));
}

/// JSON file store. A missing file reads as an empty list.
pub struct JsonProjectStore {
    path: PathBuf,
    // Held across whole read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl JsonProjectStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    async fn read_file(&self) -> anyhow::Result<Vec<Project>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", self.path.display())),
        }
    }

    async fn write_file(&self, projects: &[Project]) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }
        let contents =
            serde_json::to_string_pretty(projects).context("Failed to serialize projects")?;
        tokio::fs::write(&self.path, contents)
            .await
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        tracing::debug!("Saved {} projects to {:?}", projects.len(), self.path);
        Ok(())
    }
}

#[async_trait]
impl ProjectStore for JsonProjectStore {
    async fn load(&self) -> anyhow::Result<Vec<Project>> {
        let _guard = self.lock.lock().await;
        self.read_file().await
    }

    async fn save(&self, projects: &[Project]) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        self.write_file(projects).await
    }

    async fn upsert(&self, project: Project) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let mut projects = self.read_file().await?;
        merge(&mut projects, project);
        self.write_file(&projects).await
    }
}

/// Volatile store, used when no config directory is available.
#[derive(Default)]
pub struct MemoryProjectStore {
    projects: Mutex<Vec<Project>>,
}

#[async_trait]
impl ProjectStore for MemoryProjectStore {
    async fn load(&self) -> anyhow::Result<Vec<Project>> {
        Ok(self.projects.lock().await.clone())
    }

    async fn save(&self, projects: &[Project]) -> anyhow::Result<()> {
        *self.projects.lock().await = projects.to_vec();
        Ok(())
    }

    async fn upsert(&self, project: Project) -> anyhow::Result<()> {
        merge(&mut *self.projects.lock().await, project);
        Ok(())
    }
}
