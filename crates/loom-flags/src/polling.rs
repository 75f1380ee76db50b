// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Periodic fetching of the full toggle state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::api::ApiClient;
use crate::backup::{Backup, BackupStore};
use crate::engine::EvaluationEngine;
use crate::error::{FlagsError, Result};
use crate::events::{ErrorKind, EventCallbacks};
use crate::ready::ReadyNotifier;
use crate::scheduler::{ScheduledTask, TaskManager};

pub const FETCH_TOGGLES_TASK: &str = "fetch-toggles";

/// One fetch-and-apply cycle, run by the task manager on an interval.
pub struct FetchTogglesTask {
	api: Arc<dyn ApiClient>,
	engine: Arc<dyn EvaluationEngine>,
	backup: Arc<dyn BackupStore>,
	events: Arc<EventCallbacks>,
	on_ready: ReadyNotifier,
	etag: Mutex<Option<String>>,
	interval: Duration,
	execute_during_startup: bool,
	throw_on_initial_fetch_fail: bool,
	first_fetch_done: AtomicBool,
	ready_fired: AtomicBool,
}

impl FetchTogglesTask {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		api: Arc<dyn ApiClient>,
		engine: Arc<dyn EvaluationEngine>,
		backup: Arc<dyn BackupStore>,
		events: Arc<EventCallbacks>,
		on_ready: ReadyNotifier,
		initial_etag: Option<String>,
		interval: Duration,
		execute_during_startup: bool,
	) -> Self {
		Self {
			api,
			engine,
			backup,
			events,
			on_ready,
			etag: Mutex::new(initial_etag.filter(|e| !e.is_empty())),
			interval,
			execute_during_startup,
			throw_on_initial_fetch_fail: false,
			first_fetch_done: AtomicBool::new(false),
			ready_fired: AtomicBool::new(false),
		}
	}

	/// Makes the first fetch return its failure instead of only reporting it.
	pub fn throw_on_initial_fetch_fail(mut self, throw: bool) -> Self {
		self.throw_on_initial_fetch_fail = throw;
		self
	}

	/// The tag of the last state applied by this task.
	pub fn etag(&self) -> Option<String> {
		self.etag.lock().clone()
	}

	/// Whether a fetch has completed without a transport failure.
	pub fn first_fetch_done(&self) -> bool {
		self.first_fetch_done.load(Ordering::SeqCst)
	}

	/// Fetches once and applies the result if it carries a new state.
	///
	/// The stored etag only advances after the engine accepted the new state.
	#[instrument(skip_all)]
	pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<()> {
		let throw = self.throw_on_initial_fetch_fail && !self.first_fetch_done();
		let current = self.etag();

		let result = match self.api.fetch_toggles(current.as_deref(), cancel, throw).await {
			Ok(result) => result,
			Err(FlagsError::Cancelled) => return Err(FlagsError::Cancelled),
			Err(e) => {
				warn!(error = %e, "toggle fetch failed");
				let reported = self.events.report(ErrorKind::Client, e);
				return if throw { Err(reported) } else { Ok(()) };
			}
		};
		self.first_fetch_done.store(true, Ordering::SeqCst);

		if !result.has_changed {
			debug!("toggles unchanged");
			self.mark_ready();
			return Ok(());
		}

		let Some(etag) = result.etag.filter(|e| !e.is_empty()) else {
			debug!("fetched state has no etag, ignoring it");
			self.mark_ready();
			return Ok(());
		};
		if current.as_deref() == Some(etag.as_str()) {
			debug!("fetched etag matches the applied state");
			self.mark_ready();
			return Ok(());
		}

		let Some(state) = result.state.filter(|s| !s.trim().is_empty()) else {
			debug!("fetch returned an empty state");
			self.mark_ready();
			return Ok(());
		};

		if let Err(e) = self.engine.take_state(&state) {
			warn!(error = %e, "rejected fetched toggle state");
			return Err(self.events.report(ErrorKind::TogglesUpdate, e.into()));
		}

		self.backup.save(&Backup::new(state, Some(etag.clone()))).await;
		info!(etag = %etag, "applied fetched toggle state");
		*self.etag.lock() = Some(etag);
		self.events.raise_toggles_updated();
		self.mark_ready();
		Ok(())
	}

	fn mark_ready(&self) {
		if !self.ready_fired.swap(true, Ordering::SeqCst) {
			(self.on_ready)();
		}
	}
}

#[async_trait]
impl ScheduledTask for FetchTogglesTask {
	fn name(&self) -> &str {
		FETCH_TOGGLES_TASK
	}

	fn interval(&self) -> Duration {
		self.interval
	}

	fn execute_during_startup(&self) -> bool {
		self.execute_during_startup
	}

	async fn execute(&self, cancel: &CancellationToken) -> Result<()> {
		self.run_cycle(cancel).await
	}
}

/// The polling sync path: a [`FetchTogglesTask`] registered with a [`TaskManager`].
pub struct PollingSync {
	task: Arc<FetchTogglesTask>,
	task_manager: Arc<dyn TaskManager>,
	cancel: CancellationToken,
}

impl PollingSync {
	/// Registers the fetch task without starting it.
	pub fn new(
		task: Arc<FetchTogglesTask>,
		task_manager: Arc<dyn TaskManager>,
		cancel: CancellationToken,
	) -> Self {
		task_manager.configure(
			Arc::clone(&task) as Arc<dyn ScheduledTask>,
			cancel.clone(),
			false,
		);
		Self {
			task,
			task_manager,
			cancel,
		}
	}

	/// Starts periodic fetching.
	///
	/// With `synchronous` set and no fetch done yet, one cycle runs inline
	/// first and its error, if any, is returned.
	pub async fn start(&self, synchronous: bool) -> Result<()> {
		if synchronous && !self.task.first_fetch_done() {
			debug!("running initial fetch synchronously");
			self.task.run_cycle(&self.cancel).await?;
		}
		self.task_manager.start(FETCH_TOGGLES_TASK)
	}

	pub fn stop(&self) -> Result<()> {
		self.task_manager.stop(FETCH_TOGGLES_TASK)
	}

	pub fn etag(&self) -> Option<String> {
		self.task.etag()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::api::testing::StubApiClient;
	use crate::api::FetchTogglesResult;
	use crate::engine::ToggleEngine;
	use crate::events::testing::Recorder;
	use crate::scheduler::TimerTaskManager;
	use loom_flags_core::EvaluationContext;
	use std::sync::atomic::AtomicUsize;

	const V1: &str = r#"{"version":2,"features":[{"name":"checkout","enabled":true}]}"#;
	const V2: &str = r#"{"version":2,"features":[{"name":"checkout","enabled":false}]}"#;

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
		backup: Arc<RecordingBackup>,
		recorder: Arc<Recorder>,
		ready: Arc<AtomicUsize>,
	}

	impl Harness {
		fn new() -> Self {
			Self {
				api: Arc::new(StubApiClient::default()),
				engine: Arc::new(ToggleEngine::new()),
				backup: Arc::new(RecordingBackup::default()),
				recorder: Arc::new(Recorder::default()),
				ready: Arc::new(AtomicUsize::new(0)),
			}
		}

		fn task(&self, initial_etag: Option<&str>) -> FetchTogglesTask {
			let ready = Arc::clone(&self.ready);
			FetchTogglesTask::new(
				self.api.clone(),
				self.engine.clone(),
				self.backup.clone(),
				Arc::new(self.recorder.callbacks()),
				Arc::new(move || {
					ready.fetch_add(1, Ordering::SeqCst);
				}),
				initial_etag.map(str::to_string),
				Duration::from_secs(30),
				true,
			)
		}

		fn enabled(&self, name: &str) -> Option<bool> {
			self.engine
				.is_enabled(name, &EvaluationContext::new())
				.map(|r| r.enabled)
		}

		fn ready_count(&self) -> usize {
			self.ready.load(Ordering::SeqCst)
		}
	}

	#[tokio::test]
	async fn applies_new_state_and_advances_etag() {
		let h = Harness::new();
		let task = h.task(None);
		h.api
			.respond(Ok(FetchTogglesResult::changed(V1, Some("v1".to_string()))));

		task.run_cycle(&CancellationToken::new()).await.unwrap();

		assert_eq!(h.enabled("checkout"), Some(true));
		assert_eq!(task.etag().as_deref(), Some("v1"));
		assert_eq!(
			h.backup.saved.lock().as_slice(),
			&[Backup::new(V1, Some("v1".to_string()))]
		);
		assert_eq!(h.recorder.updated_count(), 1);
		assert_eq!(h.ready_count(), 1);
	}

	#[tokio::test]
	async fn sends_current_etag_on_next_fetch() {
		let h = Harness::new();
		let task = h.task(Some("boot"));
		h.api
			.respond(Ok(FetchTogglesResult::changed(V1, Some("v1".to_string()))));

		let cancel = CancellationToken::new();
		task.run_cycle(&cancel).await.unwrap();
		task.run_cycle(&cancel).await.unwrap();

		assert_eq!(
			h.api.fetched_etags.lock().as_slice(),
			&[Some("boot".to_string()), Some("v1".to_string())]
		);
		assert_eq!(h.recorder.updated_count(), 1);
		assert_eq!(h.ready_count(), 1);
	}

	#[tokio::test]
	async fn unchanged_fetch_fires_ready_without_update() {
		let h = Harness::new();
		let task = h.task(None);

		task.run_cycle(&CancellationToken::new()).await.unwrap();

		assert_eq!(h.ready_count(), 1);
		assert_eq!(h.recorder.updated_count(), 0);
		assert!(h.backup.saved.lock().is_empty());
	}

	#[tokio::test]
	async fn same_etag_is_not_reapplied() {
		let h = Harness::new();
		let task = h.task(Some("v1"));
		h.api
			.respond(Ok(FetchTogglesResult::changed(V2, Some("v1".to_string()))));

		task.run_cycle(&CancellationToken::new()).await.unwrap();

		assert_eq!(h.enabled("checkout"), None);
		assert_eq!(h.recorder.updated_count(), 0);
	}

	#[tokio::test]
	async fn state_without_etag_is_ignored() {
		let h = Harness::new();
		let task = h.task(Some("v1"));
		h.api.respond(Ok(FetchTogglesResult::changed(V1, None)));
		h.api
			.respond(Ok(FetchTogglesResult::changed(V1, Some(String::new()))));

		let cancel = CancellationToken::new();
		task.run_cycle(&cancel).await.unwrap();
		task.run_cycle(&cancel).await.unwrap();
		task.run_cycle(&cancel).await.unwrap();

		assert_eq!(h.enabled("checkout"), None);
		assert_eq!(task.etag().as_deref(), Some("v1"));
		assert!(h.backup.saved.lock().is_empty());
		assert_eq!(h.recorder.updated_count(), 0);
		assert_eq!(h.ready_count(), 1);
		assert_eq!(
			h.api.fetched_etags.lock().as_slice(),
			&[
				Some("v1".to_string()),
				Some("v1".to_string()),
				Some("v1".to_string())
			]
		);
	}

	#[tokio::test]
	async fn empty_state_is_a_noop() {
		let h = Harness::new();
		let task = h.task(Some("v1"));
		h.api
			.respond(Ok(FetchTogglesResult::changed("", Some("v2".to_string()))));

		task.run_cycle(&CancellationToken::new()).await.unwrap();

		assert_eq!(task.etag().as_deref(), Some("v1"));
		assert!(h.backup.saved.lock().is_empty());
		assert_eq!(h.recorder.updated_count(), 0);
	}

	#[tokio::test]
	async fn rejected_state_keeps_etag_and_reports() {
		let h = Harness::new();
		let task = h.task(Some("v1"));
		h.api.respond(Ok(FetchTogglesResult::changed(
			"{not json",
			Some("v2".to_string()),
		)));

		let err = task.run_cycle(&CancellationToken::new()).await.unwrap_err();

		assert!(matches!(err, FlagsError::Reported(_)));
		assert_eq!(task.etag().as_deref(), Some("v1"));
		assert!(h.backup.saved.lock().is_empty());
		assert_eq!(h.recorder.error_kinds(), vec![ErrorKind::TogglesUpdate]);
		assert_eq!(h.ready_count(), 0);
	}

	#[tokio::test]
	async fn initial_failure_is_returned_only_when_configured() {
		let h = Harness::new();
		let task = h.task(None).throw_on_initial_fetch_fail(true);
		h.api.respond(Err(FlagsError::ServerError {
			status: 500,
			message: "boom".to_string(),
		}));
		h.api.respond(Err(FlagsError::ServerError {
			status: 500,
			message: "boom".to_string(),
		}));

		let cancel = CancellationToken::new();
		let err = task.run_cycle(&cancel).await.unwrap_err();
		assert_eq!(err.status(), Some(500));

		h.api
			.respond(Ok(FetchTogglesResult::changed(V1, Some("v1".to_string()))));
		assert!(task.run_cycle(&cancel).await.is_err());

		task.run_cycle(&cancel).await.unwrap();
		assert_eq!(h.enabled("checkout"), Some(true));
		assert_eq!(
			h.recorder.error_kinds(),
			vec![ErrorKind::Client, ErrorKind::Client]
		);
	}

	#[tokio::test]
	async fn failures_are_swallowed_without_throw() {
		let h = Harness::new();
		let task = h.task(None);
		h.api.respond(Err(FlagsError::Stream("reset".to_string())));

		task.run_cycle(&CancellationToken::new()).await.unwrap();

		assert_eq!(h.recorder.error_kinds(), vec![ErrorKind::Client]);
		assert!(!task.first_fetch_done());
		assert_eq!(h.ready_count(), 0);
	}

	#[tokio::test]
	async fn cancellation_is_quiet() {
		let h = Harness::new();
		let task = h.task(None);
		let cancel = CancellationToken::new();
		cancel.cancel();

		assert!(matches!(
			task.run_cycle(&cancel).await,
			Err(FlagsError::Cancelled)
		));
		assert!(h.recorder.error_kinds().is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn polling_sync_fetches_on_schedule() {
		let h = Harness::new();
		h.api
			.respond(Ok(FetchTogglesResult::changed(V1, Some("v1".to_string()))));
		h.api
			.respond(Ok(FetchTogglesResult::changed(V2, Some("v2".to_string()))));
		let polling = PollingSync::new(
			Arc::new(h.task(None)),
			Arc::new(TimerTaskManager::new()),
			CancellationToken::new(),
		);

		polling.start(true).await.unwrap();
		assert_eq!(h.enabled("checkout"), Some(true));

		tokio::time::sleep(Duration::from_secs(31)).await;
		assert_eq!(h.enabled("checkout"), Some(false));
		assert_eq!(polling.etag().as_deref(), Some("v2"));

		polling.stop().unwrap();
		let fetches = h.api.fetch_count();
		tokio::time::sleep(Duration::from_secs(120)).await;
		assert_eq!(h.api.fetch_count(), fetches);
	}
}
