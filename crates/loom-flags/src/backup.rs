// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Durable copy of the last applied toggle state.
//!
//! The state and its etag live in two files. The state file is always
//! written first, and the etag file is left untouched if that write fails.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::bootstrap::BootstrapProvider;
use crate::error::FlagsError;
use crate::events::{ErrorKind, EventCallbacks};
use crate::fs::FileSystem;

const STATE_FILE_STEM: &str = "flags.toggles";
const ETAG_FILE_STEM: &str = "flags.etag";

/// Last known state plus its version tag. Either may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Backup {
	pub state: String,
	pub etag: Option<String>,
}

impl Backup {
	pub fn new(state: impl Into<String>, etag: Option<String>) -> Self {
		Self {
			state: state.into(),
			etag,
		}
	}

	pub fn is_empty(&self) -> bool {
		self.state.is_empty()
	}
}

/// Loads and saves [`Backup`]s. Neither operation fails; problems are raised as error events.
#[async_trait]
pub trait BackupStore: Send + Sync {
	async fn load(&self) -> Backup;
	async fn save(&self, backup: &Backup);
}

/// A store that never persists anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpBackupStore;

#[async_trait]
impl BackupStore for NoOpBackupStore {
	async fn load(&self) -> Backup {
		Backup::default()
	}

	async fn save(&self, _backup: &Backup) {}
}

/// File locations for the current and legacy backup layouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupPaths {
	pub state: PathBuf,
	pub etag: PathBuf,
	pub legacy_state: PathBuf,
	pub legacy_etag: PathBuf,
}

impl BackupPaths {
	pub fn new(dir: &Path, app_name: &str, instance_tag: &str, sdk_version: &str) -> Self {
		let current = |stem: &str, ext: &str| {
			dir.join(sanitize_file_name(&format!(
				"{stem}-{app_name}-{sdk_version}.{ext}"
			)))
		};
		let legacy_dir = dir.join(sanitize_file_name(app_name));
		let legacy = |stem: &str, ext: &str| {
			legacy_dir.join(sanitize_file_name(&format!(
				"{stem}-{app_name}-{instance_tag}-{sdk_version}.{ext}"
			)))
		};

		Self {
			state: current(STATE_FILE_STEM, "json"),
			etag: current(ETAG_FILE_STEM, "txt"),
			legacy_state: legacy(STATE_FILE_STEM, "json"),
			legacy_etag: legacy(ETAG_FILE_STEM, "txt"),
		}
	}
}

/// Strips characters that are not allowed in file names on common platforms.
pub fn sanitize_file_name(name: &str) -> String {
	name
		.chars()
		.filter(|c| !c.is_control() && !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'))
		.collect()
}

fn is_missing(e: &io::Error) -> bool {
	matches!(
		e.kind(),
		io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
	)
}

/// [`BackupStore`] over a [`FileSystem`], with an optional bootstrap fallback.
pub struct FileBackupStore {
	fs: Arc<dyn FileSystem>,
	paths: BackupPaths,
	bootstrap: Option<Arc<dyn BootstrapProvider>>,
	bootstrap_override: bool,
	events: Arc<EventCallbacks>,
}

impl FileBackupStore {
	pub fn new(fs: Arc<dyn FileSystem>, paths: BackupPaths, events: Arc<EventCallbacks>) -> Self {
		Self {
			fs,
			paths,
			bootstrap: None,
			bootstrap_override: false,
			events,
		}
	}

	/// Consults `provider` when no backup exists, or always when `override_backup` is set.
	pub fn with_bootstrap(
		mut self,
		provider: Arc<dyn BootstrapProvider>,
		override_backup: bool,
	) -> Self {
		self.bootstrap = Some(provider);
		self.bootstrap_override = override_backup;
		self
	}

	pub fn paths(&self) -> &BackupPaths {
		&self.paths
	}

	async fn read_pair(&self, state: &Path, etag: &Path) -> io::Result<Option<Backup>> {
		let state_contents = match self.fs.read_to_string(state).await {
			Ok(contents) => contents,
			Err(e) if is_missing(&e) => {
				debug!(path = %state.display(), error = %e, "no backup at path");
				return Ok(None);
			}
			Err(e) => return Err(e),
		};
		let etag_contents = match self.fs.read_to_string(etag).await {
			Ok(contents) => contents,
			Err(e) if is_missing(&e) => {
				debug!(path = %etag.display(), error = %e, "no backup etag at path");
				return Ok(None);
			}
			Err(e) => return Err(e),
		};

		let etag = etag_contents.trim();
		Ok(Some(Backup {
			state: state_contents,
			etag: (!etag.is_empty()).then(|| etag.to_string()),
		}))
	}

	async fn try_load(&self) -> io::Result<Backup> {
		let mut backup = self
			.read_pair(&self.paths.state, &self.paths.etag)
			.await?;
		if backup.is_none() {
			backup = self
				.read_pair(&self.paths.legacy_state, &self.paths.legacy_etag)
				.await?;
			if backup.is_some() {
				info!(path = %self.paths.legacy_state.display(), "loaded legacy backup");
			}
		}

		if let Some(provider) = &self.bootstrap {
			if backup.is_none() || self.bootstrap_override {
				let existing = backup.unwrap_or_default();
				let state = provider.read()?.unwrap_or(existing.state);
				debug!(bytes = state.len(), "using bootstrap state");
				return Ok(Backup {
					state,
					etag: existing.etag,
				});
			}
		}

		Ok(backup.unwrap_or_default())
	}

	async fn try_save(&self, backup: &Backup) -> io::Result<()> {
		self.fs.write_atomic(&self.paths.state, &backup.state).await?;
		self
			.fs
			.write_atomic(&self.paths.etag, backup.etag.as_deref().unwrap_or(""))
			.await
	}
}

#[async_trait]
impl BackupStore for FileBackupStore {
	async fn load(&self) -> Backup {
		match self.try_load().await {
			Ok(backup) => backup,
			Err(e) => {
				warn!(error = %e, "failed to load backup files");
				self
					.events
					.raise_error(ErrorKind::FileCache, FlagsError::Io(e));
				Backup::default()
			}
		}
	}

	async fn save(&self, backup: &Backup) {
		if let Err(e) = self.try_save(backup).await {
			warn!(error = %e, "failed to write backup files");
			self
				.events
				.raise_error(ErrorKind::TogglesBackup, FlagsError::Io(e));
		}
	}
}
