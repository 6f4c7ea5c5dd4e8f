//! Project directory: the consumed interface to tenant records.
//!
//! Project CRUD lives behind the REST façade, outside this workspace; the
//! orchestrator only needs existence, activation state, and the concurrency
//! cap at create time.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use wallcrawler_protocol::ProjectId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectStatus {
	Active,
	Suspended,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRecord {
	pub id: ProjectId,
	pub status: ProjectStatus,
	/// Maximum concurrent capacity-holding sessions for this project.
	pub concurrency: u32,
}

#[derive(Debug, Error)]
pub enum ProjectDirectoryError {
	#[error("project directory unavailable: {0}")]
	Unavailable(String),
}

#[async_trait]
pub trait ProjectDirectory: Send + Sync {
	async fn get(&self, id: &ProjectId) -> Result<Option<ProjectRecord>, ProjectDirectoryError>;
}

/// In-process directory for tests and the local daemon.
#[derive(Default)]
pub struct MemoryProjectDirectory {
	projects: DashMap<ProjectId, ProjectRecord>,
}

impl MemoryProjectDirectory {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_projects(records: impl IntoIterator<Item = ProjectRecord>) -> Self {
		let directory = Self::new();
		for record in records {
			directory.upsert(record);
		}
		directory
	}

	pub fn upsert(&self, record: ProjectRecord) {
		self.projects.insert(record.id.clone(), record);
	}
}

#[async_trait]
impl ProjectDirectory for MemoryProjectDirectory {
	async fn get(&self, id: &ProjectId) -> Result<Option<ProjectRecord>, ProjectDirectoryError> {
		Ok(self.projects.get(id).map(|entry| entry.value().clone()))
	}
}
