//! Capability interfaces the orchestrator is written against, plus the
//! in-process implementations used by tests and the local daemon.
//!
//! Each collaborator gets a small, stable trait: [`store::SessionStore`]
//! (conditional writes), [`bus::EventBus`] (at-least-once pub/sub),
//! [`notify::ReadinessNotifier`] (ephemeral per-session signals),
//! [`platform::ContainerPlatform`] (workload control plane),
//! [`projects::ProjectDirectory`] and [`callback::WorkflowCallback`].
//! Swapping a deployment backend means implementing one of these traits;
//! nothing in `wallcrawler-core` knows which implementation it drives.

pub mod bus;
pub mod callback;
pub mod notify;
pub mod platform;
pub mod projects;
pub mod store;

pub use bus::{BusError, EventBus, MemoryBus};
pub use callback::{CallbackError, RecordingCallback, WorkflowCallback};
pub use notify::{MemoryNotifier, ReadinessNotifier, ReadyOutcome};
pub use platform::{AttachmentId, ContainerPlatform, FakePlatform, LaunchSpec, LocalProcessPlatform, PlatformError, TaskNetwork, TaskState, TaskStateEvent};
pub use projects::{MemoryProjectDirectory, ProjectDirectory, ProjectDirectoryError, ProjectRecord, ProjectStatus};
pub use store::{MemoryStore, SessionStore, StoreError, TaskBinding, Versioned};
