// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The streaming sync path: applies state pushed over the streaming channel
//! and asks the coordinator to fall back to polling when the channel is unhealthy.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use loom_flags_core::{StreamMessage, SyncMode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::api::{ApiClient, StreamControl, StreamingEventHandler};
use crate::backup::{Backup, BackupStore};
use crate::coordinator::ModeChangeRequester;
use crate::engine::EvaluationEngine;
use crate::error::{FlagsError, Result};
use crate::events::{ErrorKind, EventCallbacks};
use crate::failover::{FailEvent, FailoverStrategy};
use crate::ready::ReadyNotifier;

/// Lifecycle of the streaming channel as seen by [`StreamingSync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
	Disconnected = 0,
	Connecting = 1,
	Connected = 2,
	/// Connected and at least one state applied.
	Ready = 3,
}

impl StreamState {
	fn from_u8(value: u8) -> Self {
		match value {
			1 => StreamState::Connecting,
			2 => StreamState::Connected,
			3 => StreamState::Ready,
			_ => StreamState::Disconnected,
		}
	}
}

pub struct StreamingSync {
	api: Arc<dyn ApiClient>,
	engine: Arc<dyn EvaluationEngine>,
	backup: Arc<dyn BackupStore>,
	events: Arc<EventCallbacks>,
	failover: FailoverStrategy,
	mode_requests: ModeChangeRequester,
	on_ready: ReadyNotifier,
	cancel: CancellationToken,
	state: AtomicU8,
	ready_fired: AtomicBool,
}

impl StreamingSync {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		api: Arc<dyn ApiClient>,
		engine: Arc<dyn EvaluationEngine>,
		backup: Arc<dyn BackupStore>,
		events: Arc<EventCallbacks>,
		failover: FailoverStrategy,
		mode_requests: ModeChangeRequester,
		on_ready: ReadyNotifier,
		cancel: CancellationToken,
	) -> Self {
		Self {
			api,
			engine,
			backup,
			events,
			failover,
			mode_requests,
			on_ready,
			cancel,
			state: AtomicU8::new(StreamState::Disconnected as u8),
			ready_fired: AtomicBool::new(false),
		}
	}

	pub fn state(&self) -> StreamState {
		StreamState::from_u8(self.state.load(Ordering::SeqCst))
	}

	fn set_state(&self, state: StreamState) {
		self.state.store(state as u8, Ordering::SeqCst);
	}

	/// Opens the streaming channel with this sync as its handler.
	#[instrument(skip_all)]
	pub async fn start(self: &Arc<Self>) -> Result<()> {
		self.set_state(StreamState::Connecting);
		let handler = Arc::clone(self) as Arc<dyn StreamingEventHandler>;
		if let Err(e) = self.api.start_streaming(handler, &self.cancel).await {
			self.set_state(StreamState::Disconnected);
			return Err(self.events.report(ErrorKind::Client, e));
		}
		info!("streaming started");
		Ok(())
	}

	/// Closes the streaming channel and waits for it to wind down.
	pub async fn stop(&self) {
		self.api.stop_streaming().await;
		self.set_state(StreamState::Disconnected);
		debug!("streaming stopped");
	}

	async fn apply(&self, data: &str) -> StreamControl {
		if let Err(e) = self.engine.take_state(data) {
			warn!(error = %e, "rejected streamed toggle state, reconnecting");
			self.events.raise_error(ErrorKind::TogglesUpdate, e.into());
			return StreamControl::Reconnect;
		}

		self.backup
			.save(&Backup::new(self.engine.get_state(), None))
			.await;
		self.events.raise_toggles_updated();
		self.set_state(StreamState::Ready);
		if !self.ready_fired.swap(true, Ordering::SeqCst) {
			(self.on_ready)();
		}
		StreamControl::Continue
	}

	fn record_failure(&self, event: FailEvent) {
		if self.failover.should_fail_over(&event, Utc::now()) {
			info!(reason = ?event.kind, "streaming unhealthy, requesting polling");
			self.mode_requests.request(SyncMode::Polling);
		}
	}
}

#[async_trait]
impl StreamingEventHandler for StreamingSync {
	async fn handle_open(&self) {
		self.set_state(StreamState::Connected);
	}

	async fn handle_message(&self, event: &str, data: &str) -> StreamControl {
		match StreamMessage::from_parts(event, data) {
			StreamMessage::Connected(state) | StreamMessage::Updated(state) => self.apply(&state).await,
			StreamMessage::FetchMode(hint) => {
				debug!(hint = %hint.trim(), "received fetch mode hint");
				self.record_failure(FailEvent::server_hint(hint.trim(), Utc::now()));
				StreamControl::Continue
			}
			StreamMessage::Unknown { event, .. } => {
				debug!(event = %event, "ignoring unknown stream event");
				StreamControl::Continue
			}
		}
	}

	async fn handle_error(&self, error: FlagsError) {
		let event = FailEvent::from_error(&error, Utc::now());
		self.events.raise_error(ErrorKind::Client, error);
		self.record_failure(event);
	}

	async fn handle_closed(&self) {
		self.set_state(StreamState::Disconnected);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::api::testing::StubApiClient;
	use crate::backup::NoOpBackupStore;
	use crate::engine::ToggleEngine;
	use crate::events::testing::Recorder;
	use crate::failover::FailoverConfig;
	use loom_flags_core::EvaluationContext;
	use parking_lot::Mutex;
	use std::sync::atomic::AtomicUsize;
	use std::time::Duration;
	use tokio::sync::mpsc;

	const HYDRATION: &str = r#"{"events":[{"type":"hydration","eventId":1,"features":[{"name":"deltaFeature","enabled":true}]}]}"#;
	const UPDATE: &str = r#"{"events":[{"type":"feature-updated","eventId":2,"feature":{"name":"deltaFeature","enabled":false}}]}"#;

	#[derive(Default)]
	struct RecordingBackup {
		saved: Mutex<Vec<Backup>>,
	}

	#[async_trait]
	impl BackupStore for RecordingBackup {
		async fn load(&self) -> Backup {
			Backup::default()
		}

		async fn save(&self, backup: &Backup) {
			self.saved.lock().push(backup.clone());
		}
	}

	struct Harness {
		api: Arc<StubApiClient>,
		engine: Arc<ToggleEngine>,
		recorder: Arc<Recorder>,
		ready: Arc<AtomicUsize>,
		requests: mpsc::UnboundedReceiver<SyncMode>,
		sync: Arc<StreamingSync>,
	}

	fn harness_with(backup: Arc<dyn BackupStore>, failover: FailoverConfig) -> Harness {
		let api = Arc::new(StubApiClient::default());
		let engine = Arc::new(ToggleEngine::new());
		let recorder = Arc::new(Recorder::default());
		let ready = Arc::new(AtomicUsize::new(0));
		let (requester, requests) = ModeChangeRequester::channel();
		let counter = Arc::clone(&ready);
		let sync = Arc::new(StreamingSync::new(
			api.clone(),
			engine.clone(),
			backup,
			Arc::new(recorder.callbacks()),
			FailoverStrategy::new(failover),
			requester,
			Arc::new(move || {
				counter.fetch_add(1, Ordering::SeqCst);
			}),
			CancellationToken::new(),
		));
		Harness {
			api,
			engine,
			recorder,
			ready,
			requests,
			sync,
		}
	}

	fn harness() -> Harness {
		harness_with(Arc::new(NoOpBackupStore), FailoverConfig::default())
	}

	fn enabled(engine: &ToggleEngine, name: &str) -> Option<bool> {
		engine
			.is_enabled(name, &EvaluationContext::new())
			.map(|r| r.enabled)
	}

	#[tokio::test]
	async fn start_registers_handler() {
		let h = harness();
		h.sync.start().await.unwrap();
		assert_eq!(*h.api.stream_starts.lock(), 1);
		assert!(h.api.handler().is_some());
		assert_eq!(h.sync.state(), StreamState::Connecting);

		h.sync.stop().await;
		assert_eq!(*h.api.stream_stops.lock(), 1);
		assert_eq!(h.sync.state(), StreamState::Disconnected);
	}

	#[tokio::test]
	async fn failed_start_is_reported() {
		let h = harness();
		*h.api.fail_stream_start.lock() = true;

		assert!(h.sync.start().await.is_err());
		assert_eq!(h.recorder.error_kinds(), vec![ErrorKind::Client]);
		assert_eq!(h.sync.state(), StreamState::Disconnected);
	}

	#[tokio::test]
	async fn applies_connected_then_updated() {
		let backup = Arc::new(RecordingBackup::default());
		let h = harness_with(backup.clone(), FailoverConfig::default());

		h.sync.handle_open().await;
		assert_eq!(h.sync.state(), StreamState::Connected);

		let control = h.sync.handle_message("flags-connected", HYDRATION).await;
		assert_eq!(control, StreamControl::Continue);
		assert_eq!(enabled(&h.engine, "deltaFeature"), Some(true));
		assert_eq!(h.sync.state(), StreamState::Ready);

		h.sync.handle_message("flags-updated", UPDATE).await;
		assert_eq!(enabled(&h.engine, "deltaFeature"), Some(false));

		assert_eq!(h.recorder.updated_count(), 2);
		assert_eq!(h.ready.load(Ordering::SeqCst), 1);

		let saved = backup.saved.lock();
		assert_eq!(saved.len(), 2);
		assert!(saved.iter().all(|b| b.etag.is_none()));
		assert_eq!(saved[1].state, h.engine.get_state());
	}

	#[tokio::test]
	async fn bad_payload_requests_reconnect() {
		let h = harness();
		let control = h.sync.handle_message("flags-updated", "{broken").await;

		assert_eq!(control, StreamControl::Reconnect);
		assert_eq!(h.recorder.error_kinds(), vec![ErrorKind::TogglesUpdate]);
		assert_eq!(h.ready.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn unknown_events_are_ignored() {
		let h = harness();
		let control = h.sync.handle_message("heartbeat", "").await;
		assert_eq!(control, StreamControl::Continue);
		assert!(h.recorder.error_kinds().is_empty());
	}

	#[tokio::test]
	async fn polling_hint_requests_failover() {
		let mut h = harness();
		h.sync.handle_message("fetch-mode", " polling ").await;
		assert_eq!(h.requests.try_recv().ok(), Some(SyncMode::Polling));

		h.sync.handle_message("fetch-mode", "streaming").await;
		assert!(h.requests.try_recv().is_err());
	}

	#[tokio::test]
	async fn hard_status_fails_over_immediately() {
		let mut h = harness();
		h.sync
			.handle_error(FlagsError::ServerError {
				status: 401,
				message: "unauthorized".to_string(),
			})
			.await;

		assert_eq!(h.recorder.error_kinds(), vec![ErrorKind::Client]);
		assert_eq!(h.requests.try_recv().ok(), Some(SyncMode::Polling));
	}

	#[tokio::test]
	async fn network_errors_fail_over_past_threshold() {
		let mut h = harness_with(
			Arc::new(NoOpBackupStore),
			FailoverConfig {
				max_failures: 2,
				failure_window: Duration::from_secs(60),
			},
		);

		h.sync
			.handle_error(FlagsError::Stream("reset".to_string()))
			.await;
		assert!(h.requests.try_recv().is_err());

		h.sync
			.handle_error(FlagsError::Stream("reset".to_string()))
			.await;
		assert_eq!(h.requests.try_recv().ok(), Some(SyncMode::Polling));
	}

	#[tokio::test]
	async fn closed_channel_resets_state() {
		let h = harness();
		h.sync.handle_open().await;
		h.sync.handle_closed().await;
		assert_eq!(h.sync.state(), StreamState::Disconnected);
	}
}
