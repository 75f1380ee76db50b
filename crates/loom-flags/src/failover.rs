// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Decides when streaming has failed badly enough to fall back to polling.

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::FlagsError;

/// Statuses that trigger failover on first sight.
pub const HARD_FAILOVER_STATUSES: [u16; 5] = [401, 403, 404, 429, 501];
/// Statuses that count towards the rolling window.
pub const SOFT_FAILOVER_STATUSES: [u16; 5] = [408, 500, 502, 503, 504];
/// Server hints that trigger failover.
pub const FAILOVER_SERVER_HINTS: [&str; 1] = ["polling"];

/// Configuration for the rolling failure window.
#[derive(Debug, Clone)]
pub struct FailoverConfig {
	/// Failures inside the window that trigger failover.
	pub max_failures: usize,
	/// Length of the rolling window.
	pub failure_window: Duration,
}

impl Default for FailoverConfig {
	fn default() -> Self {
		Self {
			max_failures: 5,
			failure_window: Duration::from_secs(60),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailKind {
	Network { message: String },
	HttpStatus { status: u16, message: String },
	ServerHint { hint: String },
}

/// A streaming failure observed at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailEvent {
	pub kind: FailKind,
	pub occurred_at: DateTime<Utc>,
}

impl FailEvent {
	pub fn network(message: impl Into<String>, occurred_at: DateTime<Utc>) -> Self {
		Self {
			kind: FailKind::Network {
				message: message.into(),
			},
			occurred_at,
		}
	}

	pub fn http_status(status: u16, message: impl Into<String>, occurred_at: DateTime<Utc>) -> Self {
		Self {
			kind: FailKind::HttpStatus {
				status,
				message: message.into(),
			},
			occurred_at,
		}
	}

	pub fn server_hint(hint: impl Into<String>, occurred_at: DateTime<Utc>) -> Self {
		Self {
			kind: FailKind::ServerHint { hint: hint.into() },
			occurred_at,
		}
	}

	/// Classifies a transport error: anything carrying a status is an HTTP failure.
	pub fn from_error(error: &FlagsError, occurred_at: DateTime<Utc>) -> Self {
		match error.status() {
			Some(status) => Self::http_status(status, error.to_string(), occurred_at),
			None => Self::network(error.to_string(), occurred_at),
		}
	}
}

/// Rolling-window failover policy for the streaming path.
#[derive(Debug)]
pub struct FailoverStrategy {
	config: FailoverConfig,
	failures: Mutex<Vec<FailEvent>>,
}

impl FailoverStrategy {
	pub fn new(config: FailoverConfig) -> Self {
		Self {
			config,
			failures: Mutex::new(Vec::new()),
		}
	}

	/// Records `event` where relevant and returns whether to switch to polling.
	pub fn should_fail_over(&self, event: &FailEvent, now: DateTime<Utc>) -> bool {
		match &event.kind {
			FailKind::Network { .. } => self.has_too_many_failures(event, now),
			FailKind::HttpStatus { status, .. } => {
				if HARD_FAILOVER_STATUSES.contains(status) {
					true
				} else if SOFT_FAILOVER_STATUSES.contains(status) {
					self.has_too_many_failures(event, now)
				} else {
					false
				}
			}
			FailKind::ServerHint { hint } => FAILOVER_SERVER_HINTS.contains(&hint.as_str()),
		}
	}

	/// Number of failures currently retained, including stale ones not yet pruned.
	pub fn retained_failures(&self) -> usize {
		self.failures.lock().len()
	}

	fn has_too_many_failures(&self, event: &FailEvent, now: DateTime<Utc>) -> bool {
		let cutoff = chrono::Duration::from_std(self.config.failure_window)
			.ok()
			.and_then(|window| now.checked_sub_signed(window))
			.unwrap_or(DateTime::<Utc>::MIN_UTC);

		let mut failures = self.failures.lock();
		let mut retained: Vec<FailEvent> = failures
			.iter()
			.filter(|f| f.occurred_at >= cutoff)
			.cloned()
			.collect();
		retained.push(event.clone());
		*failures = retained;

		debug!(
			failures = failures.len(),
			max = self.config.max_failures,
			"streaming failure recorded"
		);
		failures.len() >= self.config.max_failures
	}
}

impl Default for FailoverStrategy {
	fn default() -> Self {
		Self::new(FailoverConfig::default())
	}
}
