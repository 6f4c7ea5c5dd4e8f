use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
	#[error("missing environment variable: {0}")]
	MissingEnv(&'static str),

	#[error("invalid value for {key}: {value}")]
	InvalidEnv { key: &'static str, value: String },

	#[error("no usable chrome binary found")]
	ChromeNotFound,

	#[error("chrome launch failed: {0}")]
	ChromeLaunch(String),

	#[error("chrome did not expose CDP within {0:?}")]
	ChromeBootTimeout(Duration),

	#[error("profile hydrate failed: {0}")]
	ProfileHydrate(String),

	#[error("profile persist failed: {0}")]
	ProfilePersist(String),

	#[error("proxy server failed: {0}")]
	Proxy(String),

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Http(#[from] reqwest::Error),
}
