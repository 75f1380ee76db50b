// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StateError;

/// How the SDK acquires toggle state from the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
	Polling,
	Streaming,
}

impl SyncMode {
	pub fn as_str(&self) -> &'static str {
		match self {
			SyncMode::Polling => "polling",
			SyncMode::Streaming => "streaming",
		}
	}
}

impl fmt::Display for SyncMode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for SyncMode {
	type Err = StateError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim() {
			"polling" => Ok(SyncMode::Polling),
			"streaming" => Ok(SyncMode::Streaming),
			other => Err(StateError::UnknownMode(other.to_string())),
		}
	}
}
