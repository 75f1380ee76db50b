// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use serde::{Deserialize, Serialize};

use crate::toggle::Payload;

/// Name of the variant returned when no variant applies.
pub const DISABLED_VARIANT: &str = "disabled";

/// Result of a variant lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
	pub name: String,
	pub enabled: bool,
	pub feature_enabled: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub payload: Option<Payload>,
}

impl Variant {
	/// The variant handed out for unknown or disabled toggles.
	pub fn disabled() -> Self {
		Self {
			name: DISABLED_VARIANT.to_string(),
			enabled: false,
			feature_enabled: false,
			payload: None,
		}
	}

	pub fn is_disabled(&self) -> bool {
		!self.enabled
	}
}

impl Default for Variant {
	fn default() -> Self {
		Self::disabled()
	}
}
