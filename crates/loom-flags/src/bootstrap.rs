// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Initial toggle state for first boot, before any backup exists.

use std::io;
use std::path::PathBuf;

/// Supplies initial toggle state.
pub trait BootstrapProvider: Send + Sync {
	/// Returns the state blob, or `None` when there is nothing to offer.
	fn read(&self) -> io::Result<Option<String>>;
}

/// Reads bootstrap state from a file. A missing file yields `None`.
#[derive(Debug, Clone)]
pub struct FileBootstrapProvider {
	path: PathBuf,
}

impl FileBootstrapProvider {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}
}

impl BootstrapProvider for FileBootstrapProvider {
	fn read(&self) -> io::Result<Option<String>> {
		match std::fs::read_to_string(&self.path) {
			Ok(contents) if contents.is_empty() => Ok(None),
			Ok(contents) => Ok(Some(contents)),
			Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(e),
		}
	}
}

/// Serves a fixed state blob, typically embedded at build time.
#[derive(Debug, Clone)]
pub struct StaticBootstrapProvider {
	state: String,
}

impl StaticBootstrapProvider {
	pub fn new(state: impl Into<String>) -> Self {
		Self {
			state: state.into(),
		}
	}
}

impl BootstrapProvider for StaticBootstrapProvider {
	fn read(&self) -> io::Result<Option<String>> {
		if self.state.is_empty() {
			Ok(None)
		} else {
			Ok(Some(self.state.clone()))
		}
	}
}
