// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Client registration and periodic usage reporting.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use loom_flags_core::{ClientMetrics, ClientRegistration, DEFAULT_STRATEGIES};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::ApiClient;
use crate::config::ClientIdentity;
use crate::engine::EvaluationEngine;
use crate::error::Result;
use crate::scheduler::{ScheduledTask, TaskManager};

pub const REGISTER_CLIENT_TASK: &str = "register-client";
pub const SEND_METRICS_TASK: &str = "send-metrics";

/// Announces this instance once at startup.
pub struct RegisterClientTask {
	api: Arc<dyn ApiClient>,
	registration: ClientRegistration,
}

impl RegisterClientTask {
	pub fn new(
		api: Arc<dyn ApiClient>,
		identity: &ClientIdentity,
		metrics_interval: Duration,
		started: DateTime<Utc>,
	) -> Self {
		Self {
			api,
			registration: ClientRegistration {
				app_name: identity.app_name.clone(),
				instance_id: identity.instance_id.clone(),
				connection_id: identity.connection_id.clone(),
				sdk_version: identity.sdk_version.clone(),
				strategies: DEFAULT_STRATEGIES.iter().map(|s| s.to_string()).collect(),
				started,
				interval_ms: metrics_interval.as_millis() as u64,
			},
		}
	}
}

#[async_trait]
impl ScheduledTask for RegisterClientTask {
	fn name(&self) -> &str {
		REGISTER_CLIENT_TASK
	}

	fn interval(&self) -> Duration {
		Duration::ZERO
	}

	fn execute_during_startup(&self) -> bool {
		true
	}

	async fn execute(&self, cancel: &CancellationToken) -> Result<()> {
		self.api.register_client(&self.registration, cancel).await;
		Ok(())
	}
}

/// Drains the engine's usage counters and sends them on an interval.
pub struct SendMetricsTask {
	api: Arc<dyn ApiClient>,
	engine: Arc<dyn EvaluationEngine>,
	identity: ClientIdentity,
	interval: Duration,
}

impl SendMetricsTask {
	pub fn new(
		api: Arc<dyn ApiClient>,
		engine: Arc<dyn EvaluationEngine>,
		identity: ClientIdentity,
		interval: Duration,
	) -> Self {
		Self {
			api,
			engine,
			identity,
			interval,
		}
	}
}

#[async_trait]
impl ScheduledTask for SendMetricsTask {
	fn name(&self) -> &str {
		SEND_METRICS_TASK
	}

	fn interval(&self) -> Duration {
		self.interval
	}

	fn execute_during_startup(&self) -> bool {
		false
	}

	async fn execute(&self, cancel: &CancellationToken) -> Result<()> {
		let Some(bucket) = self.engine.take_metrics() else {
			debug!("no metrics to send");
			return Ok(());
		};

		let metrics = ClientMetrics {
			app_name: self.identity.app_name.clone(),
			instance_id: self.identity.instance_id.clone(),
			connection_id: self.identity.connection_id.clone(),
			bucket,
		};
		if self.api.send_metrics(&metrics, cancel).await {
			debug!(toggles = metrics.bucket.toggles.len(), "metrics sent");
		}
		Ok(())
	}
}

/// Wires registration and metrics into a [`TaskManager`].
pub struct MetricsReporter;

impl MetricsReporter {
	/// Configures and starts both tasks. Does nothing when `interval` is `None`.
	///
	/// Returns whether reporting is enabled.
	pub fn start(
		interval: Option<Duration>,
		identity: &ClientIdentity,
		api: Arc<dyn ApiClient>,
		engine: Arc<dyn EvaluationEngine>,
		task_manager: &dyn TaskManager,
		cancel: &CancellationToken,
	) -> bool {
		let Some(interval) = interval.filter(|i| !i.is_zero()) else {
			info!("metrics reporting disabled");
			return false;
		};

		task_manager.configure(
			Arc::new(RegisterClientTask::new(
				Arc::clone(&api),
				identity,
				interval,
				Utc::now(),
			)),
			cancel.clone(),
			true,
		);
		task_manager.configure(
			Arc::new(SendMetricsTask::new(api, engine, identity.clone(), interval)),
			cancel.clone(),
			true,
		);
		debug!(interval_ms = interval.as_millis() as u64, "metrics reporting started");
		true
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::api::testing::StubApiClient;
	use crate::engine::ToggleEngine;
	use crate::scheduler::TimerTaskManager;
	use loom_flags_core::EvaluationContext;

	fn identity() -> ClientIdentity {
		ClientIdentity {
			app_name: "billing".to_string(),
			instance_id: "host-1".to_string(),
			connection_id: "conn-1".to_string(),
			sdk_version: "loom-flags-rust:0.1.0".to_string(),
		}
	}

	#[tokio::test(start_paused = true)]
	async fn registers_once_and_sends_drained_buckets() {
		let api = Arc::new(StubApiClient::default());
		let engine = Arc::new(ToggleEngine::new());
		engine
			.take_state(r#"{"version":2,"features":[{"name":"checkout","enabled":true}]}"#)
			.unwrap();
		let manager = TimerTaskManager::new();

		let enabled = MetricsReporter::start(
			Some(Duration::from_secs(60)),
			&identity(),
			api.clone(),
			engine.clone(),
			&manager,
			&CancellationToken::new(),
		);
		assert!(enabled);

		engine.is_enabled("checkout", &EvaluationContext::new());
		engine.is_enabled("checkout", &EvaluationContext::new());

		tokio::time::sleep(Duration::from_secs(61)).await;
		{
			let registrations = api.registrations.lock();
			assert_eq!(registrations.len(), 1);
			assert_eq!(registrations[0].interval_ms, 60_000);
			assert_eq!(registrations[0].connection_id, "conn-1");
			assert_eq!(registrations[0].strategies.len(), DEFAULT_STRATEGIES.len());
		}
		{
			let metrics = api.metrics.lock();
			assert_eq!(metrics.len(), 1);
			assert_eq!(metrics[0].bucket.toggles["checkout"].yes, 2);
		}

		tokio::time::sleep(Duration::from_secs(60)).await;
		assert_eq!(api.registrations.lock().len(), 1);
		assert_eq!(api.metrics.lock().len(), 1);
	}

	#[tokio::test]
	async fn disabled_without_interval() {
		let api = Arc::new(StubApiClient::default());
		let manager = TimerTaskManager::new();

		let enabled = MetricsReporter::start(
			None,
			&identity(),
			api,
			Arc::new(ToggleEngine::new()),
			&manager,
			&CancellationToken::new(),
		);

		assert!(!enabled);
		assert!(manager.task_names().is_empty());
	}
}
