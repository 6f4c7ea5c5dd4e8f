//! Browser-profile snapshots: hydrate before Chrome starts, persist after
//! it stops. Snapshots are `profile.tar.gz` archives exchanged through
//! signed URLs; the object store itself is someone else's problem.

use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tracing::info;

use crate::error::{AgentError, Result};

/// Downloads and unpacks a profile snapshot into the user-data directory.
pub async fn hydrate(download_url: &str, user_data_dir: &Path) -> Result<()> {
	let response = reqwest::get(download_url).await?;
	if !response.status().is_success() {
		return Err(AgentError::ProfileHydrate(format!("download returned {}", response.status())));
	}
	let bytes = response.bytes().await?.to_vec();
	let dir = user_data_dir.to_path_buf();
	let unpacked = tokio::task::spawn_blocking(move || unpack(&bytes, &dir))
		.await
		.map_err(|err| AgentError::ProfileHydrate(err.to_string()))?;
	unpacked?;
	info!(target = "wc.agent", dir = %user_data_dir.display(), "profile hydrated");
	Ok(())
}

/// Packs the user-data directory and uploads it to the signed URL.
pub async fn persist(upload_url: &str, user_data_dir: &Path) -> Result<()> {
	let dir = user_data_dir.to_path_buf();
	let archive = tokio::task::spawn_blocking(move || pack(&dir))
		.await
		.map_err(|err| AgentError::ProfilePersist(err.to_string()))??;

	let response = reqwest::Client::new().put(upload_url).body(archive).send().await?;
	if !response.status().is_success() {
		return Err(AgentError::ProfilePersist(format!("upload returned {}", response.status())));
	}
	info!(target = "wc.agent", dir = %user_data_dir.display(), "profile persisted");
	Ok(())
}

fn unpack(bytes: &[u8], dir: &PathBuf) -> Result<()> {
	std::fs::create_dir_all(dir)?;
	let decoder = GzDecoder::new(bytes);
	let mut archive = tar::Archive::new(decoder);
	archive.unpack(dir).map_err(|err| AgentError::ProfileHydrate(err.to_string()))
}

fn pack(dir: &PathBuf) -> Result<Vec<u8>> {
	let encoder = GzEncoder::new(Vec::new(), Compression::default());
	let mut builder = tar::Builder::new(encoder);
	builder.append_dir_all("", dir).map_err(|err| AgentError::ProfilePersist(err.to_string()))?;
	let encoder = builder.into_inner().map_err(|err| AgentError::ProfilePersist(err.to_string()))?;
	encoder.finish().map_err(|err| AgentError::ProfilePersist(err.to_string()))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn pack_unpack_round_trips_profile_files() {
		let source = tempfile::tempdir().unwrap();
		std::fs::create_dir_all(source.path().join("Default")).unwrap();
		std::fs::write(source.path().join("Default/Preferences"), b"{\"homepage\":\"about:blank\"}").unwrap();
		std::fs::write(source.path().join("Local State"), b"{}").unwrap();

		let archive = pack(&source.path().to_path_buf()).unwrap();

		let target = tempfile::tempdir().unwrap();
		unpack(&archive, &target.path().to_path_buf()).unwrap();

		let restored = std::fs::read(target.path().join("Default/Preferences")).unwrap();
		assert_eq!(restored, b"{\"homepage\":\"about:blank\"}");
		assert!(target.path().join("Local State").exists());
	}
}
