// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! SSE (Server-Sent Events) connection for streamed toggle updates.
//!
//! The connection runs in a background task, reconnecting with backoff until
//! stopped. Every message and failure is handed to a
//! [`StreamingEventHandler`]; the handler can ask for a fresh connection.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::header::{HeaderMap, ACCEPT, CACHE_CONTROL};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{StreamControl, StreamingEventHandler};
use crate::error::{FlagsError, Result};

/// Configuration for SSE connection behavior.
#[derive(Debug, Clone)]
pub struct SseConfig {
	/// Base delay for reconnection attempts.
	pub reconnect_base_delay: Duration,
	/// Maximum delay for reconnection attempts.
	pub reconnect_max_delay: Duration,
	/// Maximum number of consecutive failed attempts (0 = unlimited).
	pub max_reconnect_attempts: u32,
	/// Whether to use exponential backoff for reconnection.
	pub use_exponential_backoff: bool,
}

impl Default for SseConfig {
	fn default() -> Self {
		Self {
			reconnect_base_delay: Duration::from_secs(1),
			reconnect_max_delay: Duration::from_secs(30),
			max_reconnect_attempts: 0,
			use_exponential_backoff: true,
		}
	}
}

impl SseConfig {
	/// Delay before the next attempt after `consecutive_failures` failures.
	pub fn backoff_delay(&self, consecutive_failures: u32) -> Duration {
		if !self.use_exponential_backoff {
			return self.reconnect_base_delay;
		}
		let factor = 2u64.saturating_pow(consecutive_failures.min(10));
		let delay_ms = (self.reconnect_base_delay.as_millis() as u64).saturating_mul(factor);
		Duration::from_millis(delay_ms.min(self.reconnect_max_delay.as_millis() as u64))
	}
}

/// Request parameters for the streaming endpoint.
#[derive(Debug, Clone)]
pub struct SseRequest {
	pub url: String,
	pub headers: HeaderMap,
}

struct RunningStream {
	stop: CancellationToken,
	handle: JoinHandle<()>,
}

enum StreamEnd {
	Closed,
	Reconnect,
}

/// Manages the background SSE task.
pub struct SseConnection {
	http: reqwest::Client,
	config: SseConfig,
	connected: Arc<AtomicBool>,
	reconnect_attempts: Arc<AtomicU64>,
	events_received: Arc<AtomicU64>,
	running: Mutex<Option<RunningStream>>,
}

impl SseConnection {
	pub fn new(http: reqwest::Client, config: SseConfig) -> Self {
		Self {
			http,
			config,
			connected: Arc::new(AtomicBool::new(false)),
			reconnect_attempts: Arc::new(AtomicU64::new(0)),
			events_received: Arc::new(AtomicU64::new(0)),
			running: Mutex::new(None),
		}
	}

	/// Starts the connection loop, stopping any loop already running.
	///
	/// The loop also exits when `cancel` fires.
	pub async fn start(
		&self,
		request: SseRequest,
		handler: Arc<dyn StreamingEventHandler>,
		cancel: &CancellationToken,
	) -> Result<()> {
		if cancel.is_cancelled() {
			return Err(FlagsError::Cancelled);
		}

		let mut running = self.running.lock().await;
		if let Some(previous) = running.take() {
			previous.stop.cancel();
			let _ = previous.handle.await;
		}

		let stop = cancel.child_token();
		let task = SseTask {
			http: self.http.clone(),
			request,
			config: self.config.clone(),
			handler,
			connected: Arc::clone(&self.connected),
			reconnect_attempts: Arc::clone(&self.reconnect_attempts),
			events_received: Arc::clone(&self.events_received),
			stop: stop.clone(),
		};
		let handle = tokio::spawn(task.run());

		*running = Some(RunningStream { stop, handle });
		Ok(())
	}

	/// Stops the connection loop and waits for it to exit.
	pub async fn stop(&self) {
		let previous = self.running.lock().await.take();
		if let Some(previous) = previous {
			previous.stop.cancel();
			if let Err(e) = previous.handle.await {
				warn!(error = %e, "SSE task ended abnormally");
			}
		}
		self.connected.store(false, Ordering::SeqCst);
	}

	/// Returns true if the SSE connection is currently active.
	pub fn is_connected(&self) -> bool {
		self.connected.load(Ordering::SeqCst)
	}

	/// Returns the number of reconnection attempts since creation.
	pub fn reconnect_attempts(&self) -> u64 {
		self.reconnect_attempts.load(Ordering::SeqCst)
	}

	/// Returns the number of events received since creation.
	pub fn events_received(&self) -> u64 {
		self.events_received.load(Ordering::SeqCst)
	}
}

impl Drop for SseConnection {
	fn drop(&mut self) {
		if let Some(running) = self.running.get_mut().take() {
			running.stop.cancel();
			running.handle.abort();
		}
	}
}

struct SseTask {
	http: reqwest::Client,
	request: SseRequest,
	config: SseConfig,
	handler: Arc<dyn StreamingEventHandler>,
	connected: Arc<AtomicBool>,
	reconnect_attempts: Arc<AtomicU64>,
	events_received: Arc<AtomicU64>,
	stop: CancellationToken,
}

impl SseTask {
	async fn run(self) {
		let mut consecutive_failures: u32 = 0;

		loop {
			if self.stop.is_cancelled() {
				break;
			}

			info!(url = %self.request.url, "connecting to SSE stream");

			let outcome = tokio::select! {
				_ = self.stop.cancelled() => {
					info!("SSE connection received shutdown signal");
					break;
				}
				outcome = self.connect_and_process() => outcome,
			};

			if self.connected.swap(false, Ordering::SeqCst) {
				self.handler.handle_closed().await;
			}

			match outcome {
				Ok(StreamEnd::Closed) => {
					debug!("SSE stream ended normally");
					consecutive_failures = 0;
				}
				Ok(StreamEnd::Reconnect) => {
					info!("SSE handler requested reconnect");
					consecutive_failures = 0;
				}
				Err(e) => {
					error!(error = %e, "SSE connection error");
					consecutive_failures = consecutive_failures.saturating_add(1);
					self.handler.handle_error(e).await;
				}
			}

			if self.config.max_reconnect_attempts > 0
				&& consecutive_failures >= self.config.max_reconnect_attempts
			{
				error!(
					attempts = consecutive_failures,
					"max reconnection attempts reached, stopping SSE"
				);
				break;
			}

			let delay = self.config.backoff_delay(consecutive_failures);
			self.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
			warn!(
				delay_ms = delay.as_millis() as u64,
				attempts = consecutive_failures,
				"reconnecting to SSE stream"
			);

			tokio::select! {
				_ = tokio::time::sleep(delay) => {}
				_ = self.stop.cancelled() => {
					info!("SSE connection received shutdown signal during reconnect wait");
					break;
				}
			}
		}
	}

	async fn connect_and_process(&self) -> Result<StreamEnd> {
		let response = self
			.http
			.get(&self.request.url)
			.headers(self.request.headers.clone())
			.header(ACCEPT, "text/event-stream")
			.header(CACHE_CONTROL, "no-cache")
			.send()
			.await?;

		let status = response.status();
		if !status.is_success() {
			return Err(FlagsError::ServerError {
				status: status.as_u16(),
				message: response.text().await.unwrap_or_default(),
			});
		}

		self.connected.store(true, Ordering::SeqCst);
		info!("SSE connection established");
		self.handler.handle_open().await;

		let mut event_stream = response.bytes_stream().eventsource();
		while let Some(event_result) = event_stream.next().await {
			match event_result {
				Ok(event) => {
					self.events_received.fetch_add(1, Ordering::SeqCst);
					debug!(event = %event.event, bytes = event.data.len(), "SSE event received");
					if self.handler.handle_message(&event.event, &event.data).await
						== StreamControl::Reconnect
					{
						return Ok(StreamEnd::Reconnect);
					}
				}
				Err(e) => return Err(FlagsError::Stream(e.to_string())),
			}
		}

		Ok(StreamEnd::Closed)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_sse_config_defaults() {
		let config = SseConfig::default();
		assert_eq!(config.reconnect_base_delay, Duration::from_secs(1));
		assert_eq!(config.reconnect_max_delay, Duration::from_secs(30));
		assert_eq!(config.max_reconnect_attempts, 0);
		assert!(config.use_exponential_backoff);
	}

	#[test]
	fn backoff_doubles_and_caps() {
		let config = SseConfig::default();
		assert_eq!(config.backoff_delay(0), Duration::from_secs(1));
		assert_eq!(config.backoff_delay(1), Duration::from_secs(2));
		assert_eq!(config.backoff_delay(3), Duration::from_secs(8));
		assert_eq!(config.backoff_delay(5), Duration::from_secs(30));
		assert_eq!(config.backoff_delay(u32::MAX), Duration::from_secs(30));
	}

	#[test]
	fn fixed_backoff_ignores_failures() {
		let config = SseConfig {
			use_exponential_backoff: false,
			..Default::default()
		};
		assert_eq!(config.backoff_delay(7), Duration::from_secs(1));
	}

	#[test]
	fn test_sse_connection_initial_state() {
		let conn = SseConnection::new(reqwest::Client::new(), SseConfig::default());
		assert!(!conn.is_connected());
		assert_eq!(conn.reconnect_attempts(), 0);
		assert_eq!(conn.events_received(), 0);
	}
}
