//! The process that runs inside each browser container.
//!
//! Boot order: read the `WALLCRAWLER_*` environment, hydrate the browser
//! profile when a context is attached, launch headless Chrome with CDP on a
//! loopback port, then serve the authenticated proxy on the externally
//! reachable port. Termination (a signal or a control-channel command)
//! drains the proxy, optionally persists the profile, and stops Chrome
//! before the process exits.

pub mod chrome;
pub mod config;
pub mod control;
pub mod error;
pub mod lifecycle;
pub mod profile;
pub mod proxy;

pub use config::AgentConfig;
pub use error::AgentError;
pub use lifecycle::{Agent, AgentPhase};
