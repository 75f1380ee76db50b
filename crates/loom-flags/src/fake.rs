// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! In-memory [`FeatureFlags`] for application tests.

use std::collections::HashMap;

use loom_flags_core::{EvaluationContext, Variant};
use parking_lot::RwLock;

use crate::client::FeatureFlags;
use crate::engine::KnownToggle;

#[derive(Debug, Clone)]
struct FakeToggle {
	enabled: bool,
	variant: Option<Variant>,
}

/// A [`FeatureFlags`] whose answers are set directly. The context is ignored.
///
/// ```
/// use loom_flags::{EvaluationContext, FakeFlagsClient, FeatureFlags};
///
/// let flags = FakeFlagsClient::new().with_toggle("checkout", true);
/// assert!(flags.is_enabled("checkout", &EvaluationContext::new(), false));
/// assert!(flags.is_enabled("unknown", &EvaluationContext::new(), true));
/// ```
#[derive(Debug, Default)]
pub struct FakeFlagsClient {
	toggles: RwLock<HashMap<String, FakeToggle>>,
}

impl FakeFlagsClient {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_toggle(self, name: impl Into<String>, enabled: bool) -> Self {
		self.set_enabled(name, enabled);
		self
	}

	pub fn with_variant(self, name: impl Into<String>, variant: Variant) -> Self {
		self.set_variant(name, variant);
		self
	}

	pub fn set_enabled(&self, name: impl Into<String>, enabled: bool) {
		self.toggles
			.write()
			.entry(name.into())
			.and_modify(|t| t.enabled = enabled)
			.or_insert(FakeToggle {
				enabled,
				variant: None,
			});
	}

	/// Sets the variant returned for `name`. Also marks the toggle enabled.
	pub fn set_variant(&self, name: impl Into<String>, variant: Variant) {
		let mut toggles = self.toggles.write();
		let toggle = toggles.entry(name.into()).or_insert(FakeToggle {
			enabled: true,
			variant: None,
		});
		toggle.enabled = true;
		toggle.variant = Some(variant);
	}

	pub fn remove(&self, name: &str) {
		self.toggles.write().remove(name);
	}

	pub fn clear(&self) {
		self.toggles.write().clear();
	}
}

impl FeatureFlags for FakeFlagsClient {
	fn is_enabled(&self, name: &str, _context: &EvaluationContext, default: bool) -> bool {
		self.toggles
			.read()
			.get(name)
			.map(|t| t.enabled)
			.unwrap_or(default)
	}

	fn get_variant(&self, name: &str, _context: &EvaluationContext, default: Variant) -> Variant {
		match self.toggles.read().get(name) {
			Some(FakeToggle {
				variant: Some(variant),
				..
			}) => variant.clone(),
			Some(FakeToggle { enabled, .. }) => Variant {
				feature_enabled: *enabled,
				..Variant::disabled()
			},
			None => default,
		}
	}

	fn list_known_toggles(&self) -> Vec<KnownToggle> {
		let mut known: Vec<KnownToggle> = self
			.toggles
			.read()
			.iter()
			.map(|(name, t)| KnownToggle {
				name: name.clone(),
				project: None,
				enabled: t.enabled,
			})
			.collect();
		known.sort_by(|a, b| a.name.cmp(&b.name));
		known
	}
}
