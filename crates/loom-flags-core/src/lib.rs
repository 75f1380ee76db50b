// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Core types for the Loom feature flags client SDK.
//!
//! This crate holds the data shared between the SDK runtime (`loom-flags`)
//! and anything that produces or inspects toggle state: the toggle
//! collection and its delta payloads, the evaluation context, variants,
//! sync modes, registration and metrics payloads, and the names of the
//! messages carried by the streaming channel.
//!
//! # Example
//!
//! ```
//! use loom_flags_core::{EvaluationContext, StatePayload, ToggleCollection};
//!
//! let raw = r#"{"version":2,"features":[{"name":"checkout","enabled":true}]}"#;
//! let collection = StatePayload::parse(raw)
//!     .unwrap()
//!     .apply_to(&ToggleCollection::default());
//! assert!(collection.get("checkout").unwrap().enabled);
//!
//! let ctx = EvaluationContext::new().with_user_id("user123");
//! assert_eq!(ctx.stickiness_value(None), Some("user123"));
//! ```

pub mod context;
pub mod error;
pub mod metrics;
pub mod mode;
pub mod stream;
pub mod toggle;
pub mod variant;

pub use context::{context_fingerprint, normalized_bucket, EvaluationContext};
pub use error::{Result, StateError};
pub use metrics::{ClientMetrics, ClientRegistration, MetricsBucket, ToggleCount, DEFAULT_STRATEGIES};
pub use mode::SyncMode;
pub use stream::StreamMessage;
pub use toggle::{
	DeltaEvent, DeltaPayload, Payload, StatePayload, ToggleCollection, ToggleDefinition,
	VariantDefinition, STATE_VERSION,
};
pub use variant::Variant;
