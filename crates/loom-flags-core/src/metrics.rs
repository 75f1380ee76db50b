// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Client registration and usage metrics payloads.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Strategy names every client reports as supported.
pub const DEFAULT_STRATEGIES: &[&str] = &[
	"applicationHostname",
	"default",
	"flexibleRollout",
	"gradualRolloutRandom",
	"gradualRolloutSessionId",
	"gradualRolloutUserId",
	"remoteAddress",
	"userWithId",
];

/// Sent once at startup so the backend knows this instance exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRegistration {
	pub app_name: String,
	pub instance_id: String,
	pub connection_id: String,
	pub sdk_version: String,
	pub strategies: Vec<String>,
	pub started: DateTime<Utc>,
	pub interval_ms: u64,
}

/// Periodic usage report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMetrics {
	pub app_name: String,
	pub instance_id: String,
	pub connection_id: String,
	pub bucket: MetricsBucket,
}

/// Evaluation counts for a time window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsBucket {
	pub start: DateTime<Utc>,
	pub stop: DateTime<Utc>,
	pub toggles: HashMap<String, ToggleCount>,
}

impl MetricsBucket {
	pub fn new(start: DateTime<Utc>) -> Self {
		Self {
			start,
			stop: start,
			toggles: HashMap::new(),
		}
	}

	pub fn is_empty(&self) -> bool {
		self.toggles.is_empty()
	}

	pub fn count(&mut self, toggle: &str, enabled: bool) {
		let entry = self.toggles.entry(toggle.to_string()).or_default();
		if enabled {
			entry.yes += 1;
		} else {
			entry.no += 1;
		}
	}

	pub fn count_variant(&mut self, toggle: &str, variant: &str) {
		*self
			.toggles
			.entry(toggle.to_string())
			.or_default()
			.variants
			.entry(variant.to_string())
			.or_insert(0) += 1;
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToggleCount {
	pub yes: u64,
	pub no: u64,
	#[serde(default)]
	pub variants: HashMap<String, u64>,
}
