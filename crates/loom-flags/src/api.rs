// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The backend boundary: fetching state, streaming, registration and metrics.

use std::sync::Arc;

use async_trait::async_trait;
use loom_flags_core::{ClientMetrics, ClientRegistration};
use tokio_util::sync::CancellationToken;

use crate::error::{FlagsError, Result};

/// Outcome of a polling fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchTogglesResult {
	pub has_changed: bool,
	pub state: Option<String>,
	pub etag: Option<String>,
}

impl FetchTogglesResult {
	pub fn unchanged() -> Self {
		Self::default()
	}

	pub fn changed(state: impl Into<String>, etag: Option<String>) -> Self {
		Self {
			has_changed: true,
			state: Some(state.into()),
			etag,
		}
	}
}

/// What the transport should do after a message was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamControl {
	Continue,
	/// Drop the current connection and open a new one.
	Reconnect,
}

/// Receives messages and failures from the streaming channel.
#[async_trait]
pub trait StreamingEventHandler: Send + Sync {
	/// Called once the channel is open, before any message.
	async fn handle_open(&self) {}

	async fn handle_message(&self, event: &str, data: &str) -> StreamControl;

	/// Called for every transport failure, including failed connection attempts.
	async fn handle_error(&self, error: FlagsError);

	/// Called when the channel closes for any reason.
	async fn handle_closed(&self) {}
}

/// Client for the toggle backend.
#[async_trait]
pub trait ApiClient: Send + Sync {
	/// Fetches the full state unless `etag` is still current.
	///
	/// With `throw_on_failure` unset, implementations report failures through
	/// the error event and return [`FetchTogglesResult::unchanged`].
	async fn fetch_toggles(
		&self,
		etag: Option<&str>,
		cancel: &CancellationToken,
		throw_on_failure: bool,
	) -> Result<FetchTogglesResult>;

	/// Opens the streaming channel in the background, replacing any open one.
	///
	/// The channel closes when `cancel` fires or on [`stop_streaming`](ApiClient::stop_streaming).
	async fn start_streaming(
		&self,
		handler: Arc<dyn StreamingEventHandler>,
		cancel: &CancellationToken,
	) -> Result<()>;

	/// Closes the streaming channel and waits for its task to finish.
	async fn stop_streaming(&self);

	/// Announces this instance. Returns whether the backend accepted it;
	/// failures are reported through the error event.
	async fn register_client(
		&self,
		registration: &ClientRegistration,
		cancel: &CancellationToken,
	) -> bool;

	/// Sends a metrics bucket. Same reporting contract as
	/// [`register_client`](ApiClient::register_client).
	async fn send_metrics(&self, metrics: &ClientMetrics, cancel: &CancellationToken) -> bool;
}
