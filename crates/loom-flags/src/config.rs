// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Client settings.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use loom_flags_core::SyncMode;
use reqwest::Url;

use crate::error::{FlagsError, Result};
use crate::failover::FailoverConfig;
use crate::sse::SseConfig;

/// SDK name for identification.
pub const SDK_NAME: &str = "loom-flags-rust";
/// SDK version for identification.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// `name:version` string sent to the backend and used in backup file names.
pub fn sdk_version() -> String {
	format!("{SDK_NAME}:{SDK_VERSION}")
}

fn default_instance_tag() -> String {
	let host = std::env::var("HOSTNAME")
		.or_else(|_| std::env::var("COMPUTERNAME"))
		.unwrap_or_default();
	if host.is_empty() {
		format!("generated-{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
	} else {
		host
	}
}

/// Configuration for the flags client.
#[derive(Debug, Clone)]
pub struct FlagsSettings {
	pub app_name: String,
	/// Identifies this process to the backend.
	pub instance_tag: String,
	pub environment: String,
	/// Base URL of the client API, e.g. `https://loom.example.com/api`.
	pub api_url: String,
	pub fetch_toggles_interval: Duration,
	/// `None` disables registration and metrics entirely.
	pub send_metrics_interval: Option<Duration>,
	/// Directory holding the backup files.
	pub storage_dir: PathBuf,
	/// Run the first fetch before `build` returns.
	pub synchronous_initialization: bool,
	/// Fail the first fetch loudly instead of reporting and carrying on.
	pub throw_on_initial_fetch_fail: bool,
	/// Run the first scheduled fetch immediately instead of after one interval.
	pub schedule_fetch_immediately: bool,
	pub use_streaming: bool,
	/// Prefer bootstrap state over an existing backup.
	pub bootstrap_override: bool,
	pub custom_headers: HashMap<String, String>,
	pub request_timeout: Duration,
	pub failover: FailoverConfig,
	pub sse: SseConfig,
}

impl Default for FlagsSettings {
	fn default() -> Self {
		Self {
			app_name: String::new(),
			instance_tag: default_instance_tag(),
			environment: "default".to_string(),
			api_url: String::new(),
			fetch_toggles_interval: Duration::from_secs(30),
			send_metrics_interval: Some(Duration::from_secs(60)),
			storage_dir: std::env::temp_dir(),
			synchronous_initialization: false,
			throw_on_initial_fetch_fail: false,
			schedule_fetch_immediately: true,
			use_streaming: false,
			bootstrap_override: false,
			custom_headers: HashMap::new(),
			request_timeout: Duration::from_secs(30),
			failover: FailoverConfig::default(),
			sse: SseConfig::default(),
		}
	}
}

impl FlagsSettings {
	pub fn validate(&self) -> Result<()> {
		if self.app_name.trim().is_empty() {
			return Err(FlagsError::InvalidSettings("app name is required".to_string()));
		}
		if self.instance_tag.trim().is_empty() {
			return Err(FlagsError::InvalidSettings(
				"instance tag must not be empty".to_string(),
			));
		}
		self.parsed_api_url()?;
		if self.fetch_toggles_interval.is_zero() {
			return Err(FlagsError::InvalidSettings(
				"fetch interval must be greater than zero".to_string(),
			));
		}
		Ok(())
	}

	pub fn parsed_api_url(&self) -> Result<Url> {
		let url = Url::parse(self.api_url.trim())
			.map_err(|e| FlagsError::InvalidUrl(format!("{}: {e}", self.api_url)))?;
		if !matches!(url.scheme(), "http" | "https") {
			return Err(FlagsError::InvalidUrl(format!(
				"{}: unsupported scheme",
				self.api_url
			)));
		}
		Ok(url)
	}

	/// Joins `path` onto the API base URL.
	pub fn endpoint(&self, path: &str) -> String {
		format!("{}/{}", self.api_url.trim().trim_end_matches('/'), path)
	}

	pub fn initial_mode(&self) -> SyncMode {
		if self.use_streaming {
			SyncMode::Streaming
		} else {
			SyncMode::Polling
		}
	}
}

/// Identity this process presents to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
	pub app_name: String,
	pub instance_id: String,
	/// Unique per client instance; regenerated on every build.
	pub connection_id: String,
	pub sdk_version: String,
}

impl ClientIdentity {
	pub fn from_settings(settings: &FlagsSettings) -> Self {
		Self {
			app_name: settings.app_name.clone(),
			instance_id: settings.instance_tag.clone(),
			connection_id: uuid::Uuid::new_v4().to_string(),
			sdk_version: sdk_version(),
		}
	}
}
