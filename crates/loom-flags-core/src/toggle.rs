// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Toggle definitions and the two state payload shapes the backend sends.
//!
//! A state blob is either a full [`ToggleCollection`] (the polling response
//! and the persisted backup) or a [`DeltaPayload`] carrying hydration and
//! per-toggle change events (the streaming channel).

use serde::{Deserialize, Serialize};

use crate::error::{Result, StateError};

/// Current version of the full-state document.
pub const STATE_VERSION: u32 = 2;

/// Full snapshot of every toggle known to the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToggleCollection {
	#[serde(default = "default_version")]
	pub version: u32,
	pub features: Vec<ToggleDefinition>,
}

fn default_version() -> u32 {
	STATE_VERSION
}

impl ToggleCollection {
	pub fn new(features: Vec<ToggleDefinition>) -> Self {
		Self {
			version: STATE_VERSION,
			features,
		}
	}

	pub fn get(&self, name: &str) -> Option<&ToggleDefinition> {
		self.features.iter().find(|f| f.name == name)
	}

	/// Inserts or replaces a toggle by name.
	pub fn upsert(&mut self, feature: ToggleDefinition) {
		match self.features.iter_mut().find(|f| f.name == feature.name) {
			Some(existing) => *existing = feature,
			None => self.features.push(feature),
		}
	}

	/// Removes a toggle by name. Returns true if it existed.
	pub fn remove(&mut self, name: &str) -> bool {
		let before = self.features.len();
		self.features.retain(|f| f.name != name);
		before != self.features.len()
	}
}

/// A single feature toggle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleDefinition {
	pub name: String,
	#[serde(default)]
	pub enabled: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub project: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	#[serde(default)]
	pub impression_data: bool,
	#[serde(default)]
	pub variants: Vec<VariantDefinition>,
}

impl ToggleDefinition {
	pub fn new(name: impl Into<String>, enabled: bool) -> Self {
		Self {
			name: name.into(),
			enabled,
			project: None,
			description: None,
			impression_data: false,
			variants: Vec::new(),
		}
	}

	pub fn with_variant(mut self, variant: VariantDefinition) -> Self {
		self.variants.push(variant);
		self
	}

	pub fn with_impression_data(mut self, impression_data: bool) -> Self {
		self.impression_data = impression_data;
		self
	}
}

/// A weighted variant of a toggle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantDefinition {
	pub name: String,
	#[serde(default)]
	pub weight: u32,
	/// Context field used for sticky assignment; defaults to user, session, then address.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub stickiness: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub payload: Option<Payload>,
}

impl VariantDefinition {
	pub fn new(name: impl Into<String>, weight: u32) -> Self {
		Self {
			name: name.into(),
			weight,
			stickiness: None,
			payload: None,
		}
	}

	pub fn with_payload(mut self, payload: Payload) -> Self {
		self.payload = Some(payload);
		self
	}
}

/// Opaque variant payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
	#[serde(rename = "type")]
	pub payload_type: String,
	pub value: String,
}

/// Incremental state sent over the streaming channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaPayload {
	pub events: Vec<DeltaEvent>,
}

/// One change inside a [`DeltaPayload`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DeltaEvent {
	/// Replaces the whole collection.
	#[serde(rename_all = "camelCase")]
	Hydration {
		event_id: u64,
		features: Vec<ToggleDefinition>,
	},
	/// Inserts or replaces one toggle.
	#[serde(rename_all = "camelCase")]
	FeatureUpdated {
		event_id: u64,
		feature: ToggleDefinition,
	},
	/// Removes one toggle.
	#[serde(rename_all = "camelCase")]
	FeatureRemoved {
		event_id: u64,
		feature_name: String,
		#[serde(default)]
		project: Option<String>,
	},
}

impl DeltaEvent {
	pub fn event_id(&self) -> u64 {
		match self {
			DeltaEvent::Hydration { event_id, .. }
			| DeltaEvent::FeatureUpdated { event_id, .. }
			| DeltaEvent::FeatureRemoved { event_id, .. } => *event_id,
		}
	}
}

/// A decoded state blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatePayload {
	Delta(DeltaPayload),
	Full(ToggleCollection),
}

impl StatePayload {
	/// Decodes a state blob in either shape.
	pub fn parse(raw: &str) -> Result<Self> {
		if raw.trim().is_empty() {
			return Err(StateError::Empty);
		}
		Ok(serde_json::from_str(raw)?)
	}

	/// Applies this payload on top of `current`, producing the next snapshot.
	pub fn apply_to(self, current: &ToggleCollection) -> ToggleCollection {
		match self {
			StatePayload::Full(collection) => collection,
			StatePayload::Delta(delta) => {
				let mut next = current.clone();
				for event in delta.events {
					match event {
						DeltaEvent::Hydration { features, .. } => {
							next = ToggleCollection::new(features);
						}
						DeltaEvent::FeatureUpdated { feature, .. } => next.upsert(feature),
						DeltaEvent::FeatureRemoved { feature_name, .. } => {
							next.remove(&feature_name);
						}
					}
				}
				next
			}
		}
	}
}
