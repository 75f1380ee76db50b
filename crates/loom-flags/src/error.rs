// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the feature flags SDK.

use std::sync::Arc;

use loom_flags_core::StateError;
use thiserror::Error;

/// Result type alias for SDK operations.
pub type Result<T> = std::result::Result<T, FlagsError>;

/// Errors that can occur in the feature flags SDK.
#[derive(Debug, Error)]
pub enum FlagsError {
	/// Settings failed validation.
	#[error("invalid settings: {0}")]
	InvalidSettings(String),

	/// The API URL could not be parsed.
	#[error("invalid API URL: {0}")]
	InvalidUrl(String),

	/// HTTP request failed before a response was received.
	#[error("HTTP request failed: {0}")]
	RequestFailed(#[from] reqwest::Error),

	/// Server returned an unexpected status.
	#[error("server error (status {status}): {message}")]
	ServerError {
		/// HTTP status code.
		status: u16,
		/// Error message from server.
		message: String,
	},

	/// The streaming channel failed mid-stream.
	#[error("stream error: {0}")]
	Stream(String),

	/// Toggle state could not be applied.
	#[error(transparent)]
	State(#[from] StateError),

	/// Local file access failed.
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	/// Failed to serialize a request body.
	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),

	/// A scheduled task did not stop within the shutdown timeout.
	#[error("timed out waiting for task '{0}' to stop")]
	TaskShutdownTimeout(String),

	/// A task name was used before being configured.
	#[error("task '{0}' is not configured")]
	UnknownTask(String),

	/// The operation was cancelled by shutdown.
	#[error("operation cancelled")]
	Cancelled,

	/// The client has been closed.
	#[error("flags client has been closed")]
	ClientClosed,

	/// An error already raised through the error event.
	#[error(transparent)]
	Reported(Arc<FlagsError>),
}

impl FlagsError {
	/// Returns the HTTP status carried by this error, if any.
	pub fn status(&self) -> Option<u16> {
		match self {
			FlagsError::ServerError { status, .. } => Some(*status),
			FlagsError::RequestFailed(e) => e.status().map(|s| s.as_u16()),
			FlagsError::Reported(inner) => inner.status(),
			_ => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn status_is_exposed_for_server_errors() {
		let err = FlagsError::ServerError {
			status: 503,
			message: "unavailable".to_string(),
		};
		assert_eq!(err.status(), Some(503));
		assert_eq!(err.to_string(), "server error (status 503): unavailable");
	}

	#[test]
	fn non_http_errors_have_no_status() {
		assert_eq!(FlagsError::Stream("reset".to_string()).status(), None);
		assert_eq!(FlagsError::Cancelled.status(), None);
	}

	#[test]
	fn reported_errors_keep_status() {
		let inner = FlagsError::ServerError {
			status: 429,
			message: "slow down".to_string(),
		};
		let err = FlagsError::Reported(Arc::new(inner));
		assert_eq!(err.status(), Some(429));
		assert_eq!(err.to_string(), "server error (status 429): slow down");
	}

	#[test]
	fn state_errors_are_transparent() {
		let err: FlagsError = StateError::Empty.into();
		assert_eq!(err.to_string(), "toggle state payload is empty");
	}
}
