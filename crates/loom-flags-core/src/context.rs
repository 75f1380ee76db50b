// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Context supplied by the application for toggle evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationContext {
	pub user_id: Option<String>,
	pub session_id: Option<String>,
	pub remote_address: Option<String>,
	pub environment: Option<String>,
	pub app_name: Option<String>,
	pub current_time: Option<DateTime<Utc>>,
	#[serde(default)]
	pub properties: HashMap<String, String>,
}

impl EvaluationContext {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
		self.user_id = Some(user_id.into());
		self
	}

	pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
		self.session_id = Some(session_id.into());
		self
	}

	pub fn with_remote_address(mut self, remote_address: impl Into<String>) -> Self {
		self.remote_address = Some(remote_address.into());
		self
	}

	pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
		self.environment = Some(environment.into());
		self
	}

	pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
		self.app_name = Some(app_name.into());
		self
	}

	pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.properties.insert(key.into(), value.into());
		self
	}

	/// Fills `environment` and `app_name` from static settings when the caller left them unset.
	pub fn apply_static_fields(mut self, app_name: &str, environment: &str) -> Self {
		if self.app_name.is_none() {
			self.app_name = Some(app_name.to_string());
		}
		if self.environment.is_none() {
			self.environment = Some(environment.to_string());
		}
		self
	}

	/// Resolves a named context field, falling back to custom properties.
	pub fn field(&self, name: &str) -> Option<&str> {
		match name {
			"userId" => self.user_id.as_deref(),
			"sessionId" => self.session_id.as_deref(),
			"remoteAddress" => self.remote_address.as_deref(),
			"environment" => self.environment.as_deref(),
			"appName" => self.app_name.as_deref(),
			other => self.properties.get(other).map(String::as_str),
		}
	}

	/// Returns the value used for sticky variant assignment.
	///
	/// An explicit stickiness field wins; otherwise user id, session id and
	/// remote address are tried in order.
	pub fn stickiness_value(&self, stickiness: Option<&str>) -> Option<&str> {
		match stickiness {
			Some(field) if field != "default" => self.field(field),
			_ => self
				.user_id
				.as_deref()
				.or(self.session_id.as_deref())
				.or(self.remote_address.as_deref()),
		}
	}
}

/// Maps `(group, key)` onto a bucket in `1..=modulus` using SHA-256.
///
/// The same pair always lands in the same bucket, which keeps variant
/// assignment stable across processes.
pub fn normalized_bucket(group: &str, key: &str, modulus: u32) -> u32 {
	if modulus == 0 {
		return 0;
	}
	let mut hasher = Sha256::new();
	hasher.update(group.as_bytes());
	hasher.update(b":");
	hasher.update(key.as_bytes());
	let digest = hasher.finalize();
	let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
	(prefix % modulus) + 1
}

/// Hex-encoded SHA-256 of a context for a given toggle; used to dedupe impressions.
pub fn context_fingerprint(toggle: &str, context: &EvaluationContext) -> String {
	let mut hasher = Sha256::new();
	hasher.update(toggle.as_bytes());
	hasher.update(b"|");
	for value in [
		&context.user_id,
		&context.session_id,
		&context.remote_address,
		&context.environment,
	] {
		if let Some(value) = value {
			hasher.update(value.as_bytes());
		}
		hasher.update(b"|");
	}
	let mut keys: Vec<_> = context.properties.keys().collect();
	keys.sort();
	for key in keys {
		hasher.update(key.as_bytes());
		hasher.update(b"=");
		if let Some(value) = context.properties.get(key) {
			hasher.update(value.as_bytes());
		}
		hasher.update(b",");
	}
	hex::encode(hasher.finalize())
}
