// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! [`ApiClient`] over HTTP.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use loom_flags_core::{ClientMetrics, ClientRegistration};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, FetchTogglesResult, StreamingEventHandler};
use crate::config::{ClientIdentity, FlagsSettings, SDK_NAME, SDK_VERSION};
use crate::error::{FlagsError, Result};
use crate::events::{ErrorKind, EventCallbacks};
use crate::sse::{SseConnection, SseRequest};

pub const HEADER_APP_NAME: &str = "loom-appname";
pub const HEADER_INSTANCE_ID: &str = "loom-instanceid";
pub const HEADER_CONNECTION_ID: &str = "loom-connection-id";
pub const HEADER_SDK: &str = "loom-sdk";

const FEATURES_PATH: &str = "client/features";
const STREAMING_PATH: &str = "client/streaming";
const REGISTER_PATH: &str = "client/register";
const METRICS_PATH: &str = "client/metrics";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for the toggle backend.
pub struct HttpApiClient {
	http: reqwest::Client,
	headers: HeaderMap,
	features_url: String,
	streaming_url: String,
	register_url: String,
	metrics_url: String,
	sse: SseConnection,
	events: Arc<EventCallbacks>,
}

impl HttpApiClient {
	pub fn new(
		settings: &FlagsSettings,
		identity: &ClientIdentity,
		events: Arc<EventCallbacks>,
	) -> Result<Self> {
		settings.parsed_api_url()?;

		let user_agent = format!("{SDK_NAME}/{SDK_VERSION}");
		let http = reqwest::Client::builder()
			.user_agent(&user_agent)
			.connect_timeout(CONNECT_TIMEOUT)
			.timeout(settings.request_timeout)
			.build()?;
		// No overall timeout: the stream stays open indefinitely.
		let stream_http = reqwest::Client::builder()
			.user_agent(&user_agent)
			.connect_timeout(CONNECT_TIMEOUT)
			.build()?;

		let headers = build_headers(settings, identity)?;

		Ok(Self {
			http,
			headers,
			features_url: settings.endpoint(FEATURES_PATH),
			streaming_url: settings.endpoint(STREAMING_PATH),
			register_url: settings.endpoint(REGISTER_PATH),
			metrics_url: settings.endpoint(METRICS_PATH),
			sse: SseConnection::new(stream_http, settings.sse.clone()),
			events,
		})
	}

	/// The underlying SSE connection, for diagnostics.
	pub fn sse(&self) -> &SseConnection {
		&self.sse
	}

	async fn try_fetch(&self, etag: Option<&str>) -> Result<FetchTogglesResult> {
		let mut request = self.http.get(&self.features_url).headers(self.headers.clone());
		if let Some(etag) = etag.filter(|e| !e.is_empty()) {
			request = request.header(IF_NONE_MATCH, etag);
		}

		let response = request.send().await?;
		let status = response.status();
		if status == StatusCode::NOT_MODIFIED {
			debug!("toggles not modified");
			return Ok(FetchTogglesResult::unchanged());
		}
		if !status.is_success() {
			return Err(FlagsError::ServerError {
				status: status.as_u16(),
				message: response.text().await.unwrap_or_default(),
			});
		}

		let etag = response
			.headers()
			.get(ETAG)
			.and_then(|v| v.to_str().ok())
			.map(str::to_string);
		let state = response.text().await?;
		debug!(etag = ?etag, bytes = state.len(), "fetched toggles");
		Ok(FetchTogglesResult::changed(state, etag))
	}

	async fn post_json<T: Serialize + Sync>(&self, url: &str, body: &T) -> Result<()> {
		let response = self
			.http
			.post(url)
			.headers(self.headers.clone())
			.json(body)
			.send()
			.await?;
		let status = response.status();
		if !status.is_success() {
			return Err(FlagsError::ServerError {
				status: status.as_u16(),
				message: response.text().await.unwrap_or_default(),
			});
		}
		Ok(())
	}

	/// Runs `fut` unless `cancel` fires first.
	async fn cancellable<T>(
		cancel: &CancellationToken,
		fut: impl Future<Output = Result<T>>,
	) -> Result<T> {
		tokio::select! {
			_ = cancel.cancelled() => Err(FlagsError::Cancelled),
			result = fut => result,
		}
	}
}

fn build_headers(settings: &FlagsSettings, identity: &ClientIdentity) -> Result<HeaderMap> {
	let mut headers = HeaderMap::new();
	let mut insert = |name: &str, value: &str| -> Result<()> {
		let name = HeaderName::from_bytes(name.as_bytes())
			.map_err(|e| FlagsError::InvalidSettings(format!("header name {name}: {e}")))?;
		let value = HeaderValue::from_str(value)
			.map_err(|e| FlagsError::InvalidSettings(format!("header {name}: {e}")))?;
		headers.insert(name, value);
		Ok(())
	};

	insert(HEADER_APP_NAME, &identity.app_name)?;
	insert(HEADER_INSTANCE_ID, &identity.instance_id)?;
	insert(HEADER_CONNECTION_ID, &identity.connection_id)?;
	insert(HEADER_SDK, &identity.sdk_version)?;
	for (name, value) in &settings.custom_headers {
		insert(name, value)?;
	}
	Ok(headers)
}

#[async_trait]
impl ApiClient for HttpApiClient {
	async fn fetch_toggles(
		&self,
		etag: Option<&str>,
		cancel: &CancellationToken,
		throw_on_failure: bool,
	) -> Result<FetchTogglesResult> {
		match Self::cancellable(cancel, self.try_fetch(etag)).await {
			Ok(result) => Ok(result),
			Err(FlagsError::Cancelled) => Err(FlagsError::Cancelled),
			Err(e) if throw_on_failure => Err(e),
			Err(e) => {
				warn!(error = %e, "failed to fetch toggles");
				self.events.raise_error(ErrorKind::Client, e);
				Ok(FetchTogglesResult::unchanged())
			}
		}
	}

	async fn start_streaming(
		&self,
		handler: Arc<dyn StreamingEventHandler>,
		cancel: &CancellationToken,
	) -> Result<()> {
		let request = SseRequest {
			url: self.streaming_url.clone(),
			headers: self.headers.clone(),
		};
		self.sse.start(request, handler, cancel).await
	}

	async fn stop_streaming(&self) {
		self.sse.stop().await;
	}

	async fn register_client(
		&self,
		registration: &ClientRegistration,
		cancel: &CancellationToken,
	) -> bool {
		match Self::cancellable(cancel, self.post_json(&self.register_url, registration)).await {
			Ok(()) => {
				info!(app_name = %registration.app_name, "client registered");
				true
			}
			Err(FlagsError::Cancelled) => false,
			Err(e) => {
				warn!(error = %e, "failed to register client");
				self.events.raise_error(ErrorKind::Client, e);
				false
			}
		}
	}

	async fn send_metrics(&self, metrics: &ClientMetrics, cancel: &CancellationToken) -> bool {
		match Self::cancellable(cancel, self.post_json(&self.metrics_url, metrics)).await {
			Ok(()) => {
				debug!(toggles = metrics.bucket.toggles.len(), "metrics sent");
				true
			}
			Err(FlagsError::Cancelled) => false,
			Err(e) => {
				warn!(error = %e, "failed to send metrics");
				self.events.raise_error(ErrorKind::Client, e);
				false
			}
		}
	}
}
