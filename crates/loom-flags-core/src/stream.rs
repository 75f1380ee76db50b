// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Named messages delivered over the streaming channel.
//!
//! # Events
//!
//! - `flags-connected` - Full state on connect
//! - `flags-updated` - Incremental delta
//! - `fetch-mode` - Server hint naming the mode the client should use

use serde::{Deserialize, Serialize};

pub const EVENT_CONNECTED: &str = "flags-connected";
pub const EVENT_UPDATED: &str = "flags-updated";
pub const EVENT_FETCH_MODE: &str = "fetch-mode";

/// A message received on the streaming channel, classified by event name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum StreamMessage {
	#[serde(rename = "flags-connected")]
	Connected(String),
	#[serde(rename = "flags-updated")]
	Updated(String),
	#[serde(rename = "fetch-mode")]
	FetchMode(String),
	#[serde(skip)]
	Unknown { event: String, data: String },
}

impl StreamMessage {
	/// Classifies a raw `(event, data)` pair. Never fails.
	pub fn from_parts(event: &str, data: impl Into<String>) -> Self {
		let data = data.into();
		match event {
			EVENT_CONNECTED => StreamMessage::Connected(data),
			EVENT_UPDATED => StreamMessage::Updated(data),
			EVENT_FETCH_MODE => StreamMessage::FetchMode(data),
			other => StreamMessage::Unknown {
				event: other.to_string(),
				data,
			},
		}
	}

	/// Returns the event name as a string.
	pub fn event_type(&self) -> &str {
		match self {
			StreamMessage::Connected(_) => EVENT_CONNECTED,
			StreamMessage::Updated(_) => EVENT_UPDATED,
			StreamMessage::FetchMode(_) => EVENT_FETCH_MODE,
			StreamMessage::Unknown { event, .. } => event,
		}
	}

	/// Returns the state payload for messages that carry one.
	pub fn state(&self) -> Option<&str> {
		match self {
			StreamMessage::Connected(data) | StreamMessage::Updated(data) => Some(data),
			_ => None,
		}
	}
}
