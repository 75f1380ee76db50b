// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Toggle evaluation over the current state snapshot.
//!
//! Readers clone an `Arc` to the snapshot and never wait on network or disk.
//! Writers build the next snapshot and swap it in.

use std::sync::Arc;

use chrono::Utc;
use loom_flags_core::{
	normalized_bucket, EvaluationContext, MetricsBucket, StatePayload, StateError,
	ToggleCollection, ToggleDefinition, Variant,
};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

/// Outcome of an enabled check on a known toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnabledResponse {
	pub enabled: bool,
	pub impression_data: bool,
}

/// Summary of a toggle present in the current snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownToggle {
	pub name: String,
	pub project: Option<String>,
	pub enabled: bool,
}

/// Evaluates toggles against the state the sync paths feed it.
pub trait EvaluationEngine: Send + Sync {
	/// Applies a full or delta state blob.
	fn take_state(&self, raw: &str) -> Result<(), StateError>;

	/// Serializes the current snapshot as a full state blob.
	fn get_state(&self) -> String;

	/// Returns `None` for unknown toggles.
	fn is_enabled(&self, name: &str, context: &EvaluationContext) -> Option<EnabledResponse>;

	/// Returns `None` for unknown toggles.
	fn get_variant(&self, name: &str, context: &EvaluationContext) -> Option<Variant>;

	fn list_known_toggles(&self) -> Vec<KnownToggle>;

	/// Drains usage counts collected since the last call; `None` if nothing was evaluated.
	fn take_metrics(&self) -> Option<MetricsBucket>;

	/// Whether evaluating `name` should raise impression events.
	fn impression_data(&self, name: &str) -> bool;
}

/// Default [`EvaluationEngine`].
///
/// A toggle's `enabled` flag is its result. Variants are assigned by hashing
/// the stickiness value into the total variant weight.
pub struct ToggleEngine {
	state: RwLock<Arc<ToggleCollection>>,
	metrics: Mutex<MetricsBucket>,
}

impl ToggleEngine {
	pub fn new() -> Self {
		Self {
			state: RwLock::new(Arc::new(ToggleCollection::default())),
			metrics: Mutex::new(MetricsBucket::new(Utc::now())),
		}
	}

	/// Current snapshot. Cheap; holds no lock after returning.
	pub fn snapshot(&self) -> Arc<ToggleCollection> {
		Arc::clone(&*self.state.read())
	}

	fn pick_variant(toggle: &ToggleDefinition, context: &EvaluationContext) -> Variant {
		let mut variant = Variant::disabled();
		variant.feature_enabled = toggle.enabled;
		if !toggle.enabled {
			return variant;
		}

		let total: u64 = toggle.variants.iter().map(|v| u64::from(v.weight)).sum();
		if total == 0 {
			return variant;
		}

		let stickiness = toggle.variants.first().and_then(|v| v.stickiness.as_deref());
		let key = match context.stickiness_value(stickiness) {
			Some(value) => value.to_string(),
			None => fastrand::u32(..).to_string(),
		};
		let modulus = u32::try_from(total).unwrap_or(u32::MAX);
		let bucket = u64::from(normalized_bucket(&toggle.name, &key, modulus));

		let mut cumulative = 0u64;
		for candidate in &toggle.variants {
			cumulative += u64::from(candidate.weight);
			if bucket <= cumulative {
				return Variant {
					name: candidate.name.clone(),
					enabled: true,
					feature_enabled: true,
					payload: candidate.payload.clone(),
				};
			}
		}
		variant
	}
}

impl Default for ToggleEngine {
	fn default() -> Self {
		Self::new()
	}
}

impl EvaluationEngine for ToggleEngine {
	fn take_state(&self, raw: &str) -> Result<(), StateError> {
		let payload = StatePayload::parse(raw)?;
		let mut state = self.state.write();
		let next = payload.apply_to(&state);
		debug!(toggles = next.features.len(), "applied toggle state");
		*state = Arc::new(next);
		Ok(())
	}

	fn get_state(&self) -> String {
		serde_json::to_string(&*self.snapshot()).unwrap_or_default()
	}

	fn is_enabled(&self, name: &str, _context: &EvaluationContext) -> Option<EnabledResponse> {
		let snapshot = self.snapshot();
		let toggle = snapshot.get(name)?;
		self.metrics.lock().count(name, toggle.enabled);
		Some(EnabledResponse {
			enabled: toggle.enabled,
			impression_data: toggle.impression_data,
		})
	}

	fn get_variant(&self, name: &str, context: &EvaluationContext) -> Option<Variant> {
		let snapshot = self.snapshot();
		let toggle = snapshot.get(name)?;
		let variant = Self::pick_variant(toggle, context);
		let mut metrics = self.metrics.lock();
		metrics.count(name, toggle.enabled);
		metrics.count_variant(name, &variant.name);
		Some(variant)
	}

	fn list_known_toggles(&self) -> Vec<KnownToggle> {
		self
			.snapshot()
			.features
			.iter()
			.map(|f| KnownToggle {
				name: f.name.clone(),
				project: f.project.clone(),
				enabled: f.enabled,
			})
			.collect()
	}

	fn take_metrics(&self) -> Option<MetricsBucket> {
		let now = Utc::now();
		let mut bucket = std::mem::replace(&mut *self.metrics.lock(), MetricsBucket::new(now));
		if bucket.is_empty() {
			return None;
		}
		bucket.stop = now;
		Some(bucket)
	}

	fn impression_data(&self, name: &str) -> bool {
		self
			.snapshot()
			.get(name)
			.map(|t| t.impression_data)
			.unwrap_or(false)
	}
}
