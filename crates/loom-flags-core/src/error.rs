// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

/// Errors produced while decoding toggle state or core values.
#[derive(Debug, Error)]
pub enum StateError {
	/// The payload is not valid JSON or does not match either state shape.
	#[error("malformed toggle state: {0}")]
	Malformed(#[from] serde_json::Error),

	/// The payload was empty.
	#[error("toggle state payload is empty")]
	Empty,

	/// Unknown sync mode name.
	#[error("unknown sync mode: {0}")]
	UnknownMode(String),
}

pub type Result<T> = std::result::Result<T, StateError>;
