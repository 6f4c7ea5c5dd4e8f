use dashmap::DashMap;
use parking_lot::Mutex;
use wallcrawler_protocol::{ProjectId, SessionEvent, SessionId, SessionRecord, SessionStatus, TaskHandle};

use super::{SessionStore, StoreError, TaskBinding, Versioned};
use async_trait::async_trait;

/// In-memory [`SessionStore`] with compare-and-set semantics, used by tests
/// and the local daemon.
#[derive(Default)]
pub struct MemoryStore {
	records: DashMap<SessionId, Versioned<SessionRecord>>,
	bindings: DashMap<TaskHandle, TaskBinding>,
	/// Serializes the insert-time capacity scan so concurrent creates under
	/// one project cannot both pass the cap check.
	insert_gate: Mutex<()>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	fn active_count(&self, project: &ProjectId) -> u32 {
		self.records
			.iter()
			.filter(|entry| entry.value().record.project_id == *project && entry.value().record.status.holds_capacity())
			.count() as u32
	}
}

#[async_trait]
impl SessionStore for MemoryStore {
	async fn get(&self, id: &SessionId) -> Result<Versioned<SessionRecord>, StoreError> {
		self.records.get(id).map(|entry| entry.value().clone()).ok_or(StoreError::NotFound)
	}

	async fn insert(&self, record: SessionRecord, project_cap: u32) -> Result<Versioned<SessionRecord>, StoreError> {
		let _gate = self.insert_gate.lock();
		if self.active_count(&record.project_id) >= project_cap {
			return Err(StoreError::CapacityExceeded);
		}
		if self.records.contains_key(&record.id) {
			return Err(StoreError::VersionConflict);
		}
		let versioned = Versioned { version: 1, record };
		self.records.insert(versioned.record.id.clone(), versioned.clone());
		Ok(versioned)
	}

	async fn update(&self, record: SessionRecord, expected_version: u64) -> Result<Versioned<SessionRecord>, StoreError> {
		let mut entry = self.records.get_mut(&record.id).ok_or(StoreError::NotFound)?;
		if entry.version != expected_version {
			return Err(StoreError::VersionConflict);
		}
		entry.version += 1;
		entry.record = record;
		Ok(entry.value().clone())
	}

	async fn append_event(&self, id: &SessionId, event: SessionEvent) -> Result<(), StoreError> {
		let mut entry = self.records.get_mut(id).ok_or(StoreError::NotFound)?;
		entry.version += 1;
		entry.record.push_event(event);
		Ok(())
	}

	async fn query(&self, project: &ProjectId, statuses: &[SessionStatus]) -> Result<Vec<SessionRecord>, StoreError> {
		Ok(self
			.records
			.iter()
			.filter(|entry| entry.value().record.project_id == *project && statuses.contains(&entry.value().record.status))
			.map(|entry| entry.value().record.clone())
			.collect())
	}

	async fn scan_expiring(&self, now: u64) -> Result<Vec<SessionRecord>, StoreError> {
		Ok(self
			.records
			.iter()
			.filter(|entry| entry.value().record.is_expired(now))
			.map(|entry| entry.value().record.clone())
			.collect())
	}

	async fn bind_task(&self, task: &TaskHandle, binding: TaskBinding) -> Result<(), StoreError> {
		self.bindings.insert(task.clone(), binding);
		Ok(())
	}

	async fn task_binding(&self, task: &TaskHandle) -> Result<Option<TaskBinding>, StoreError> {
		Ok(self.bindings.get(task).map(|entry| entry.value().clone()))
	}

	async fn unbind_task(&self, task: &TaskHandle) -> Result<(), StoreError> {
		self.bindings.remove(task);
		Ok(())
	}
}
