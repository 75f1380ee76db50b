// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Named background tasks that run on a fixed interval.
//!
//! Each task runs in its own tokio task. A run never overlaps the previous
//! run of the same task: the next run is scheduled only after the current one
//! returns, and a restarted task waits for its previous loop to exit first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{FlagsError, Result};

/// Per-task budget for [`TaskManager::shutdown`].
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Work executed by a [`TaskManager`].
#[async_trait]
pub trait ScheduledTask: Send + Sync {
	/// Unique name used to start and stop the task.
	fn name(&self) -> &str;

	/// Delay between runs. Zero means run once.
	fn interval(&self) -> Duration;

	/// Whether the first run happens immediately instead of after one interval.
	fn execute_during_startup(&self) -> bool;

	/// Executes one run. `cancel` fires when the task is stopped or the client closes.
	async fn execute(&self, cancel: &CancellationToken) -> Result<()>;
}

/// Schedules [`ScheduledTask`]s by name.
#[async_trait]
pub trait TaskManager: Send + Sync {
	/// Registers a task under its name, replacing any task with the same name.
	///
	/// Runs observe `cancel`; when `start` is set the task is started immediately.
	fn configure(&self, task: Arc<dyn ScheduledTask>, cancel: CancellationToken, start: bool);

	/// Starts a configured task. Starting a running task is a no-op.
	fn start(&self, name: &str) -> Result<()>;

	/// Stops a configured task. An in-flight run is cancelled.
	fn stop(&self, name: &str) -> Result<()>;

	/// Stops every task and waits for each to exit.
	///
	/// Returns [`FlagsError::TaskShutdownTimeout`] naming the first task that
	/// did not exit in time.
	async fn shutdown(&self) -> Result<()>;
}

struct RunningTask {
	stop: CancellationToken,
	handle: JoinHandle<()>,
}

struct TaskSlot {
	task: Arc<dyn ScheduledTask>,
	cancel: CancellationToken,
	run: Option<RunningTask>,
}

/// [`TaskManager`] backed by tokio timers.
pub struct TimerTaskManager {
	slots: Mutex<HashMap<String, TaskSlot>>,
	shutdown_timeout: Duration,
	shut_down: AtomicBool,
}

impl TimerTaskManager {
	pub fn new() -> Self {
		Self::with_shutdown_timeout(DEFAULT_SHUTDOWN_TIMEOUT)
	}

	pub fn with_shutdown_timeout(shutdown_timeout: Duration) -> Self {
		Self {
			slots: Mutex::new(HashMap::new()),
			shutdown_timeout,
			shut_down: AtomicBool::new(false),
		}
	}

	/// Returns true if the named task has a live, unstopped loop.
	pub fn is_running(&self, name: &str) -> bool {
		self.slots
			.lock()
			.get(name)
			.and_then(|slot| slot.run.as_ref())
			.is_some_and(|run| !run.stop.is_cancelled() && !run.handle.is_finished())
	}

	pub fn task_names(&self) -> Vec<String> {
		self.slots.lock().keys().cloned().collect()
	}
}

impl Default for TimerTaskManager {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl TaskManager for TimerTaskManager {
	fn configure(&self, task: Arc<dyn ScheduledTask>, cancel: CancellationToken, start: bool) {
		let name = task.name().to_string();
		{
			let mut slots = self.slots.lock();
			let previous = slots.insert(
				name.clone(),
				TaskSlot {
					task,
					cancel,
					run: None,
				},
			);
			if let Some(run) = previous.and_then(|slot| slot.run) {
				run.stop.cancel();
			}
		}
		debug!(task = %name, "task configured");

		if start {
			if let Err(e) = self.start(&name) {
				warn!(task = %name, error = %e, "failed to start task");
			}
		}
	}

	fn start(&self, name: &str) -> Result<()> {
		if self.shut_down.load(Ordering::SeqCst) {
			return Err(FlagsError::ClientClosed);
		}

		let mut slots = self.slots.lock();
		let slot = slots
			.get_mut(name)
			.ok_or_else(|| FlagsError::UnknownTask(name.to_string()))?;

		if let Some(run) = &slot.run {
			if !run.stop.is_cancelled() && !run.handle.is_finished() {
				debug!(task = %name, "task already running");
				return Ok(());
			}
		}

		let previous = slot.run.take().map(|run| run.handle);
		let stop = slot.cancel.child_token();
		let handle = tokio::spawn(run_task_loop(Arc::clone(&slot.task), stop.clone(), previous));
		slot.run = Some(RunningTask { stop, handle });

		debug!(task = %name, "task started");
		Ok(())
	}

	fn stop(&self, name: &str) -> Result<()> {
		let slots = self.slots.lock();
		let slot = slots
			.get(name)
			.ok_or_else(|| FlagsError::UnknownTask(name.to_string()))?;
		if let Some(run) = &slot.run {
			run.stop.cancel();
			debug!(task = %name, "task stopped");
		}
		Ok(())
	}

	#[instrument(skip(self))]
	async fn shutdown(&self) -> Result<()> {
		if self.shut_down.swap(true, Ordering::SeqCst) {
			return Ok(());
		}

		let running: Vec<(String, RunningTask)> = {
			let mut slots = self.slots.lock();
			slots
				.iter_mut()
				.filter_map(|(name, slot)| slot.run.take().map(|run| (name.clone(), run)))
				.collect()
		};

		for (_, run) in &running {
			run.stop.cancel();
		}

		let mut first_timeout = None;
		for (name, mut run) in running {
			if tokio::time::timeout(self.shutdown_timeout, &mut run.handle)
				.await
				.is_err()
			{
				error!(task = %name, "task did not stop within the shutdown timeout");
				run.handle.abort();
				first_timeout.get_or_insert(name);
			}
		}

		match first_timeout {
			Some(name) => Err(FlagsError::TaskShutdownTimeout(name)),
			None => {
				info!("task manager shut down");
				Ok(())
			}
		}
	}
}

async fn run_task_loop(
	task: Arc<dyn ScheduledTask>,
	stop: CancellationToken,
	previous: Option<JoinHandle<()>>,
) {
	if let Some(previous) = previous {
		let _ = previous.await;
	}

	let interval = task.interval();
	if !interval.is_zero() && !task.execute_during_startup() {
		tokio::select! {
			_ = tokio::time::sleep(interval) => {}
			_ = stop.cancelled() => return,
		}
	}

	loop {
		if stop.is_cancelled() {
			break;
		}

		run_once(task.as_ref(), &stop).await;

		if interval.is_zero() {
			break;
		}

		tokio::select! {
			_ = tokio::time::sleep(interval) => {}
			_ = stop.cancelled() => break,
		}
	}

	debug!(task = %task.name(), "task loop exited");
}

async fn run_once(task: &dyn ScheduledTask, stop: &CancellationToken) {
	match task.execute(stop).await {
		Ok(()) => debug!(task = %task.name(), "task run completed"),
		Err(FlagsError::Cancelled) => debug!(task = %task.name(), "task run cancelled"),
		Err(FlagsError::Reported(e)) => debug!(task = %task.name(), error = %e, "task run failed"),
		Err(e) if stop.is_cancelled() => debug!(task = %task.name(), error = %e, "task run aborted"),
		Err(e) => warn!(task = %task.name(), error = %e, "task run failed"),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::AtomicUsize;

	struct CountingTask {
		name: &'static str,
		interval: Duration,
		startup: bool,
		run_for: Duration,
		ignore_cancel: bool,
		runs: AtomicUsize,
		active: AtomicUsize,
		max_active: AtomicUsize,
	}

	impl CountingTask {
		fn new(name: &'static str, interval: Duration, startup: bool) -> Self {
			Self {
				name,
				interval,
				startup,
				run_for: Duration::ZERO,
				ignore_cancel: false,
				runs: AtomicUsize::new(0),
				active: AtomicUsize::new(0),
				max_active: AtomicUsize::new(0),
			}
		}

		fn runs(&self) -> usize {
			self.runs.load(Ordering::SeqCst)
		}
	}

	#[async_trait]
	impl ScheduledTask for CountingTask {
		fn name(&self) -> &str {
			self.name
		}

		fn interval(&self) -> Duration {
			self.interval
		}

		fn execute_during_startup(&self) -> bool {
			self.startup
		}

		async fn execute(&self, cancel: &CancellationToken) -> Result<()> {
			let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
			self.max_active.fetch_max(active, Ordering::SeqCst);
			self.runs.fetch_add(1, Ordering::SeqCst);

			let outcome = if self.run_for.is_zero() {
				Ok(())
			} else if self.ignore_cancel {
				tokio::time::sleep(self.run_for).await;
				Ok(())
			} else {
				tokio::select! {
					_ = tokio::time::sleep(self.run_for) => Ok(()),
					_ = cancel.cancelled() => Err(FlagsError::Cancelled),
				}
			};

			self.active.fetch_sub(1, Ordering::SeqCst);
			outcome
		}
	}

	#[tokio::test(start_paused = true)]
	async fn zero_interval_runs_once() {
		let manager = TimerTaskManager::new();
		let task = Arc::new(CountingTask::new("once", Duration::ZERO, false));
		manager.configure(task.clone(), CancellationToken::new(), true);

		tokio::time::sleep(Duration::from_secs(10)).await;
		assert_eq!(task.runs(), 1);
		assert!(!manager.is_running("once"));
	}

	#[tokio::test(start_paused = true)]
	async fn startup_flag_controls_first_run() {
		let manager = TimerTaskManager::new();
		let eager = Arc::new(CountingTask::new("eager", Duration::from_secs(30), true));
		let lazy = Arc::new(CountingTask::new("lazy", Duration::from_secs(30), false));
		manager.configure(eager.clone(), CancellationToken::new(), true);
		manager.configure(lazy.clone(), CancellationToken::new(), true);

		tokio::time::sleep(Duration::from_secs(1)).await;
		assert_eq!(eager.runs(), 1);
		assert_eq!(lazy.runs(), 0);

		tokio::time::sleep(Duration::from_secs(30)).await;
		assert_eq!(eager.runs(), 2);
		assert_eq!(lazy.runs(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn stop_prevents_further_runs() {
		let manager = TimerTaskManager::new();
		let task = Arc::new(CountingTask::new("poll", Duration::from_secs(5), true));
		manager.configure(task.clone(), CancellationToken::new(), true);

		tokio::time::sleep(Duration::from_secs(6)).await;
		assert_eq!(task.runs(), 2);

		manager.stop("poll").unwrap();
		tokio::time::sleep(Duration::from_secs(60)).await;
		assert_eq!(task.runs(), 2);
		assert!(!manager.is_running("poll"));
	}

	#[tokio::test(start_paused = true)]
	async fn restart_never_overlaps_previous_run() {
		let manager = TimerTaskManager::new();
		let mut task = CountingTask::new("slow", Duration::from_secs(1), true);
		task.run_for = Duration::from_secs(5);
		task.ignore_cancel = true;
		let task = Arc::new(task);
		manager.configure(task.clone(), CancellationToken::new(), true);

		tokio::time::sleep(Duration::from_millis(100)).await;
		manager.stop("slow").unwrap();
		manager.start("slow").unwrap();
		manager.stop("slow").unwrap();
		manager.start("slow").unwrap();

		tokio::time::sleep(Duration::from_secs(20)).await;
		assert_eq!(task.max_active.load(Ordering::SeqCst), 1);
		assert!(task.runs() >= 2);
	}

	#[tokio::test(start_paused = true)]
	async fn starting_a_running_task_is_a_noop() {
		let manager = TimerTaskManager::new();
		let task = Arc::new(CountingTask::new("poll", Duration::from_secs(5), true));
		manager.configure(task.clone(), CancellationToken::new(), true);
		manager.start("poll").unwrap();
		manager.start("poll").unwrap();

		tokio::time::sleep(Duration::from_secs(1)).await;
		assert_eq!(task.runs(), 1);
	}

	#[tokio::test]
	async fn unknown_task_is_an_error() {
		let manager = TimerTaskManager::new();
		assert!(matches!(
			manager.start("missing"),
			Err(FlagsError::UnknownTask(name)) if name == "missing"
		));
		assert!(matches!(
			manager.stop("missing"),
			Err(FlagsError::UnknownTask(_))
		));
	}

	#[tokio::test(start_paused = true)]
	async fn parent_cancellation_stops_tasks() {
		let manager = TimerTaskManager::new();
		let cancel = CancellationToken::new();
		let task = Arc::new(CountingTask::new("poll", Duration::from_secs(5), true));
		manager.configure(task.clone(), cancel.clone(), true);

		tokio::time::sleep(Duration::from_secs(1)).await;
		cancel.cancel();
		tokio::time::sleep(Duration::from_secs(60)).await;
		assert_eq!(task.runs(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn shutdown_cancels_in_flight_runs() {
		let manager = TimerTaskManager::new();
		let mut task = CountingTask::new("poll", Duration::from_secs(5), true);
		task.run_for = Duration::from_secs(30);
		let task = Arc::new(task);
		manager.configure(task.clone(), CancellationToken::new(), true);

		tokio::time::sleep(Duration::from_millis(100)).await;
		manager.shutdown().await.unwrap();
		assert_eq!(task.active.load(Ordering::SeqCst), 0);
		assert!(matches!(manager.start("poll"), Err(FlagsError::ClientClosed)));
	}

	#[tokio::test(start_paused = true)]
	async fn shutdown_reports_task_that_overruns() {
		let manager = TimerTaskManager::with_shutdown_timeout(Duration::from_millis(50));
		let mut task = CountingTask::new("stubborn", Duration::from_secs(5), true);
		task.run_for = Duration::from_secs(30);
		task.ignore_cancel = true;
		manager.configure(Arc::new(task), CancellationToken::new(), true);

		tokio::time::sleep(Duration::from_millis(10)).await;
		let result = manager.shutdown().await;
		assert!(matches!(
			result,
			Err(FlagsError::TaskShutdownTimeout(name)) if name == "stubborn"
		));

		assert!(manager.shutdown().await.is_ok());
	}
}
