// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Owns both sync paths and switches between them.
//!
//! Exactly one path is active at a time. Mode changes are serialized: a
//! request made while another change is in progress waits for it. Sync paths
//! never switch modes themselves; they send a request through a
//! [`ModeChangeRequester`] and a background worker applies it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use loom_flags_core::SyncMode;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::api::ApiClient;
use crate::backup::BackupStore;
use crate::engine::EvaluationEngine;
use crate::error::Result;
use crate::events::EventCallbacks;
use crate::failover::{FailoverConfig, FailoverStrategy};
use crate::polling::{FetchTogglesTask, PollingSync};
use crate::ready::ReadySignal;
use crate::scheduler::TaskManager;
use crate::streaming::{StreamState, StreamingSync};

/// Sends mode change requests to the coordinator without waiting for them.
#[derive(Debug, Clone)]
pub struct ModeChangeRequester {
	tx: mpsc::UnboundedSender<SyncMode>,
}

impl ModeChangeRequester {
	pub fn channel() -> (Self, mpsc::UnboundedReceiver<SyncMode>) {
		let (tx, rx) = mpsc::unbounded_channel();
		(Self { tx }, rx)
	}

	pub fn request(&self, mode: SyncMode) {
		if self.tx.send(mode).is_err() {
			debug!(mode = %mode, "mode change dropped, coordinator is gone");
		}
	}
}

/// Shared collaborators for both sync paths.
#[derive(Clone)]
pub struct SyncDependencies {
	pub api: Arc<dyn ApiClient>,
	pub engine: Arc<dyn EvaluationEngine>,
	pub backup: Arc<dyn BackupStore>,
	pub events: Arc<EventCallbacks>,
	pub task_manager: Arc<dyn TaskManager>,
	pub ready: Arc<ReadySignal>,
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
	/// Tag of the state restored from backup, if any.
	pub initial_etag: Option<String>,
	pub fetch_interval: Duration,
	pub schedule_fetch_immediately: bool,
	/// Run the first polling fetch inline during start. Ignored when streaming.
	pub synchronous_initialization: bool,
	pub throw_on_initial_fetch_fail: bool,
	pub failover: FailoverConfig,
}

impl Default for SyncOptions {
	fn default() -> Self {
		Self {
			initial_etag: None,
			fetch_interval: Duration::from_secs(30),
			schedule_fetch_immediately: true,
			synchronous_initialization: false,
			throw_on_initial_fetch_fail: false,
			failover: FailoverConfig::default(),
		}
	}
}

pub struct SyncCoordinator {
	polling: PollingSync,
	streaming: Arc<StreamingSync>,
	events: Arc<EventCallbacks>,
	ready: Arc<ReadySignal>,
	task_manager: Arc<dyn TaskManager>,
	cancel: CancellationToken,
	synchronous_initialization: bool,
	switching: tokio::sync::Mutex<()>,
	active: Mutex<Option<SyncMode>>,
	worker: Mutex<Option<JoinHandle<()>>>,
	disposed: AtomicBool,
}

impl SyncCoordinator {
	/// Builds both sync paths and activates `initial_mode`.
	///
	/// `cancel` is the client-wide token; it is cancelled on dispose.
	#[instrument(skip(deps, options, cancel))]
	pub async fn start(
		deps: SyncDependencies,
		options: SyncOptions,
		initial_mode: SyncMode,
		cancel: CancellationToken,
	) -> Result<Arc<Self>> {
		let (requester, requests) = ModeChangeRequester::channel();

		let fetch_task = FetchTogglesTask::new(
			Arc::clone(&deps.api),
			Arc::clone(&deps.engine),
			Arc::clone(&deps.backup),
			Arc::clone(&deps.events),
			deps.ready.notifier(),
			options.initial_etag.clone(),
			options.fetch_interval,
			options.schedule_fetch_immediately,
		)
		.throw_on_initial_fetch_fail(options.throw_on_initial_fetch_fail);
		let polling = PollingSync::new(
			Arc::new(fetch_task),
			Arc::clone(&deps.task_manager),
			cancel.clone(),
		);

		let streaming = Arc::new(StreamingSync::new(
			Arc::clone(&deps.api),
			Arc::clone(&deps.engine),
			Arc::clone(&deps.backup),
			Arc::clone(&deps.events),
			FailoverStrategy::new(options.failover.clone()),
			requester,
			deps.ready.notifier(),
			cancel.clone(),
		));

		let coordinator = Arc::new(Self {
			polling,
			streaming,
			events: deps.events,
			ready: deps.ready,
			task_manager: deps.task_manager,
			cancel: cancel.clone(),
			synchronous_initialization: options.synchronous_initialization,
			switching: tokio::sync::Mutex::new(()),
			active: Mutex::new(None),
			worker: Mutex::new(None),
			disposed: AtomicBool::new(false),
		});

		let worker = tokio::spawn(run_mode_worker(
			Arc::downgrade(&coordinator),
			requests,
			cancel,
		));
		*coordinator.worker.lock() = Some(worker);

		if let Err(e) = coordinator.activate(initial_mode, true).await {
			warn!(error = %e, mode = %initial_mode, "failed to start sync");
			if let Err(dispose_err) = coordinator.dispose().await {
				warn!(error = %dispose_err, "failed to dispose after start failure");
			}
			return Err(e);
		}

		info!(mode = %initial_mode, "sync started");
		Ok(coordinator)
	}

	/// Switches to `mode`. A no-op when `mode` is already active or after dispose.
	pub async fn handle_mode_change(&self, mode: SyncMode) -> Result<()> {
		self.activate(mode, false).await
	}

	async fn activate(&self, mode: SyncMode, initial: bool) -> Result<()> {
		let _guard = self.switching.lock().await;

		if self.disposed.load(Ordering::SeqCst) {
			debug!(mode = %mode, "ignoring mode change after dispose");
			return Ok(());
		}
		let previous = *self.active.lock();
		if previous == Some(mode) {
			debug!(mode = %mode, "mode already active");
			return Ok(());
		}

		match mode {
			SyncMode::Polling => {
				self.streaming.stop().await;
				self.polling
					.start(initial && self.synchronous_initialization)
					.await?;
			}
			SyncMode::Streaming => {
				self.polling.stop()?;
				if let Err(e) = self.streaming.start().await {
					if previous == Some(SyncMode::Polling) {
						warn!(error = %e, "streaming failed to start, resuming polling");
						self.polling.start(false).await?;
					}
					return Err(e);
				}
			}
		}

		*self.active.lock() = Some(mode);
		if !initial {
			info!(from = ?previous, to = %mode, "sync mode changed");
			self.events.raise_mode_changed(mode);
		}
		Ok(())
	}

	pub fn active_mode(&self) -> Option<SyncMode> {
		*self.active.lock()
	}

	pub fn stream_state(&self) -> StreamState {
		self.streaming.state()
	}

	pub fn is_ready(&self) -> bool {
		self.ready.is_ready()
	}

	/// Waits until the first hydration. Returns false on timeout.
	pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
		self.ready.wait(timeout).await
	}

	/// Tag of the last state applied by polling.
	pub fn etag(&self) -> Option<String> {
		self.polling.etag()
	}

	pub fn is_disposed(&self) -> bool {
		self.disposed.load(Ordering::SeqCst)
	}

	/// Stops both sync paths and every scheduled task. Idempotent.
	#[instrument(skip(self))]
	pub async fn dispose(&self) -> Result<()> {
		if self.disposed.swap(true, Ordering::SeqCst) {
			return Ok(());
		}

		self.cancel.cancel();
		let _guard = self.switching.lock().await;

		self.streaming.stop().await;
		if let Err(e) = self.polling.stop() {
			debug!(error = %e, "polling was not configured");
		}
		self.ready.disarm();
		*self.active.lock() = None;

		let worker = self.worker.lock().take();
		if let Some(worker) = worker {
			worker.abort();
		}

		let result = self.task_manager.shutdown().await;
		info!("sync disposed");
		result
	}
}

async fn run_mode_worker(
	coordinator: Weak<SyncCoordinator>,
	mut requests: mpsc::UnboundedReceiver<SyncMode>,
	cancel: CancellationToken,
) {
	loop {
		let mode = tokio::select! {
			_ = cancel.cancelled() => break,
			mode = requests.recv() => match mode {
				Some(mode) => mode,
				None => break,
			},
		};

		let Some(coordinator) = coordinator.upgrade() else {
			break;
		};
		if let Err(e) = coordinator.handle_mode_change(mode).await {
			warn!(error = %e, mode = %mode, "mode change failed");
		}
	}
	debug!("mode change worker exited");
}
