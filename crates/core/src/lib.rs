//! Session lifecycle orchestration.
//!
//! The orchestrator accepts create/terminate requests, provisions one
//! container workload per session, promotes sessions to `READY` when the
//! runtime reports the workload up, and guarantees cleanup. It is written
//! entirely against the capability traits in `wallcrawler-runtime`, so the
//! same code runs over in-memory fakes in tests and real infrastructure in
//! deployments.
//!
//! Components:
//! - [`LifecycleController`] — synchronous API surface and sole authority
//!   over transition legality.
//! - [`ProvisionerReactor`] — consumes create/termination requests from the
//!   bus, drives the container platform with bounded retries.
//! - [`TaskStateReactor`] — consumes runtime task-state changes, extracts
//!   endpoints, promotes sessions to `READY`, notifies waiters.
//! - [`ExpirySweeper`] — routes expired sessions through normal termination.
//! - [`Orchestrator`] — wires the above and owns their task handles.

pub(crate) mod calls;
pub mod config;
pub mod controller;
pub mod error;
pub mod orchestrator;
pub mod provisioner;
pub mod sweeper;
pub mod task_reactor;

pub use config::Config;
pub use controller::{Actor, CreateSessionRequest, LifecycleController};
pub use error::{LifecycleError, Result};
pub use orchestrator::{Capabilities, Orchestrator};
pub use provisioner::ProvisionerReactor;
pub use sweeper::ExpirySweeper;
pub use task_reactor::TaskStateReactor;
