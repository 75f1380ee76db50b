// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// File access used by the backup store.
#[async_trait]
pub trait FileSystem: Send + Sync {
	async fn exists(&self, path: &Path) -> bool;
	async fn read_to_string(&self, path: &Path) -> io::Result<String>;
	/// Replaces `path` with `contents` so readers see either the old or the new file.
	async fn write_atomic(&self, path: &Path, contents: &str) -> io::Result<()>;
	async fn remove(&self, path: &Path) -> io::Result<()>;
}

/// [`FileSystem`] backed by `tokio::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdFileSystem;

impl StdFileSystem {
	fn temp_path(path: &Path) -> PathBuf {
		let name = path
			.file_name()
			.map(|n| n.to_string_lossy().into_owned())
			.unwrap_or_default();
		path.with_file_name(format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple()))
	}

	async fn write_then_rename(tmp_path: &Path, path: &Path, contents: &str) -> io::Result<()> {
		let mut file = tokio::fs::File::create(tmp_path).await?;
		file.write_all(contents.as_bytes()).await?;
		file.sync_all().await?;
		drop(file);
		tokio::fs::rename(tmp_path, path).await
	}
}

#[async_trait]
impl FileSystem for StdFileSystem {
	async fn exists(&self, path: &Path) -> bool {
		tokio::fs::try_exists(path).await.unwrap_or(false)
	}

	async fn read_to_string(&self, path: &Path) -> io::Result<String> {
		tokio::fs::read_to_string(path).await
	}

	async fn write_atomic(&self, path: &Path, contents: &str) -> io::Result<()> {
		if let Some(parent) = path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}

		let tmp_path = Self::temp_path(path);
		let result = Self::write_then_rename(&tmp_path, path, contents).await;
		if result.is_err() {
			let _ = tokio::fs::remove_file(&tmp_path).await;
		} else {
			debug!(path = %path.display(), bytes = contents.len(), "wrote file");
		}
		result
	}

	async fn remove(&self, path: &Path) -> io::Result<()> {
		tokio::fs::remove_file(path).await
	}
}
