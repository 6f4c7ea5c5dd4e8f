use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

/// A project grant for the local daemon: `id` or `id=concurrency`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectSpec {
	pub id: String,
	pub concurrency: Option<u32>,
}

impl std::str::FromStr for ProjectSpec {
	type Err = String;

	fn from_str(raw: &str) -> Result<Self, Self::Err> {
		match raw.split_once('=') {
			None => Ok(Self { id: raw.to_string(), concurrency: None }),
			Some((id, cap)) => {
				let concurrency = cap.parse().map_err(|_| format!("invalid concurrency in `{raw}`"))?;
				Ok(Self {
					id: id.to_string(),
					concurrency: Some(concurrency),
				})
			}
		}
	}
}

#[derive(Parser, Debug)]
#[command(name = "wallcrawler", version, about = "Self-hosted remote browser sessions over CDP")]
pub struct Cli {
	/// Increase log verbosity (-v, -vv).
	#[arg(short, long, action = ArgAction::Count, global = true)]
	pub verbose: u8,

	#[command(subcommand)]
	pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
	/// Run the orchestrator daemon with the local process platform.
	Serve(ServeArgs),
	/// Session lifecycle operations against a running daemon.
	#[command(subcommand)]
	Session(SessionCommand),
	/// Mint a scoped connection token for a ready session.
	Token(TokenArgs),
	/// Check whether the daemon is up.
	Ping,
	/// Stop a running daemon.
	Shutdown,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
	/// Path to the agent binary; discovered next to this binary or on PATH
	/// when omitted.
	#[arg(long)]
	pub agent_bin: Option<PathBuf>,

	/// Projects allowed to create sessions, as `id` or `id=concurrency`.
	/// Repeatable; defaults to a single `default` project.
	#[arg(long = "project")]
	pub projects: Vec<ProjectSpec>,

	/// Concurrency for projects that do not carry their own cap.
	#[arg(long, default_value_t = 5)]
	pub default_concurrency: u32,
}

#[derive(Subcommand, Debug)]
pub enum SessionCommand {
	/// Create a session; prints the session view as JSON.
	Create {
		#[arg(long)]
		project: String,
		/// Session lifetime in seconds.
		#[arg(long)]
		timeout: Option<u64>,
		/// Browser-profile context to hydrate.
		#[arg(long)]
		context: Option<String>,
		/// Persist the profile back on termination.
		#[arg(long)]
		persist: bool,
		/// Block until the session is READY before printing.
		#[arg(long)]
		wait: bool,
	},
	/// Fetch a session by id.
	Get {
		id: String,
		#[arg(long)]
		project: Option<String>,
	},
	/// Request termination of a session.
	Terminate {
		id: String,
		#[arg(long)]
		project: Option<String>,
	},
}

#[derive(Args, Debug)]
pub struct TokenArgs {
	pub id: String,
	/// Token scope: cdp-direct, debug, or screencast.
	#[arg(long, default_value = "cdp-direct")]
	pub scope: String,
	/// Bind the token to a client IP.
	#[arg(long)]
	pub ip: Option<String>,
}

#[cfg(test)]
mod tests {
	use clap::CommandFactory;

	use super::*;

	#[test]
	fn cli_definition_is_consistent() {
		Cli::command().debug_assert();
	}

	#[test]
	fn project_spec_parses_with_and_without_cap() {
		assert_eq!("p1".parse::<ProjectSpec>().unwrap(), ProjectSpec { id: "p1".into(), concurrency: None });
		assert_eq!(
			"p1=3".parse::<ProjectSpec>().unwrap(),
			ProjectSpec {
				id: "p1".into(),
				concurrency: Some(3)
			}
		);
		assert!("p1=x".parse::<ProjectSpec>().is_err());
	}

	#[test]
	fn session_create_flags_parse() {
		let cli = Cli::parse_from(["wallcrawler", "session", "create", "--project", "p1", "--timeout", "600", "--wait"]);
		match cli.command {
			Command::Session(SessionCommand::Create { project, timeout, wait, persist, context }) => {
				assert_eq!(project, "p1");
				assert_eq!(timeout, Some(600));
				assert!(wait);
				assert!(!persist);
				assert!(context.is_none());
			}
			other => panic!("unexpected command: {other:?}"),
		}
	}

	#[test]
	fn serve_accepts_repeated_projects() {
		let cli = Cli::parse_from(["wallcrawler", "serve", "--project", "p1=2", "--project", "p2"]);
		match cli.command {
			Command::Serve(args) => {
				assert_eq!(args.projects.len(), 2);
				assert_eq!(args.projects[0].concurrency, Some(2));
			}
			other => panic!("unexpected command: {other:?}"),
		}
	}
}
