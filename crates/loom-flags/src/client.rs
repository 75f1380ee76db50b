// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Feature flags client: restores the last known state, keeps it in sync
//! with the backend and evaluates toggles locally.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use loom_flags_core::{context_fingerprint, EvaluationContext, SyncMode, Variant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::api::ApiClient;
use crate::backup::{BackupPaths, BackupStore, FileBackupStore};
use crate::bootstrap::BootstrapProvider;
use crate::config::{ClientIdentity, FlagsSettings};
use crate::coordinator::{SyncCoordinator, SyncDependencies, SyncOptions};
use crate::engine::{EvaluationEngine, KnownToggle, ToggleEngine};
use crate::error::{FlagsError, Result};
use crate::events::{ErrorKind, EventCallbacks, ImpressionEvent, ImpressionKind};
use crate::fs::{FileSystem, StdFileSystem};
use crate::http::HttpApiClient;
use crate::metrics::MetricsReporter;
use crate::ready::ReadySignal;
use crate::scheduler::{TaskManager, TimerTaskManager};
use crate::sse::SseConfig;

/// Toggle evaluation as seen by application code.
pub trait FeatureFlags: Send + Sync {
	/// Returns whether `name` is enabled, or `default` if the toggle is unknown.
	fn is_enabled(&self, name: &str, context: &EvaluationContext, default: bool) -> bool;

	/// Returns the variant assigned to `context`, or `default` if the toggle is unknown.
	fn get_variant(&self, name: &str, context: &EvaluationContext, default: Variant) -> Variant;

	fn list_known_toggles(&self) -> Vec<KnownToggle>;
}

/// Builder for constructing a [`FlagsClient`].
pub struct FlagsClientBuilder {
	settings: FlagsSettings,
	events: EventCallbacks,
	api: Option<Arc<dyn ApiClient>>,
	engine: Option<Arc<dyn EvaluationEngine>>,
	file_system: Option<Arc<dyn FileSystem>>,
	backup: Option<Arc<dyn BackupStore>>,
	bootstrap: Option<Arc<dyn BootstrapProvider>>,
	task_manager: Option<Arc<dyn TaskManager>>,
}

impl FlagsClientBuilder {
	pub fn new() -> Self {
		Self {
			settings: FlagsSettings::default(),
			events: EventCallbacks::default(),
			api: None,
			engine: None,
			file_system: None,
			backup: None,
			bootstrap: None,
			task_manager: None,
		}
	}

	/// Replaces every setting at once.
	pub fn settings(mut self, settings: FlagsSettings) -> Self {
		self.settings = settings;
		self
	}

	pub fn app_name(mut self, app_name: impl Into<String>) -> Self {
		self.settings.app_name = app_name.into();
		self
	}

	/// Sets the backend base URL, e.g. `https://loom.example.com/api/`.
	pub fn api_url(mut self, url: impl Into<String>) -> Self {
		self.settings.api_url = url.into();
		self
	}

	pub fn instance_tag(mut self, tag: impl Into<String>) -> Self {
		self.settings.instance_tag = tag.into();
		self
	}

	pub fn environment(mut self, environment: impl Into<String>) -> Self {
		self.settings.environment = environment.into();
		self
	}

	/// Directory holding the backup files.
	pub fn storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
		self.settings.storage_dir = dir.into();
		self
	}

	pub fn fetch_toggles_interval(mut self, interval: Duration) -> Self {
		self.settings.fetch_toggles_interval = interval;
		self
	}

	/// Sets the metrics interval; `None` disables registration and metrics.
	pub fn send_metrics_interval(mut self, interval: Option<Duration>) -> Self {
		self.settings.send_metrics_interval = interval;
		self
	}

	pub fn use_streaming(mut self, enable: bool) -> Self {
		self.settings.use_streaming = enable;
		self
	}

	/// Runs the first polling fetch before `build` returns.
	pub fn synchronous_initialization(mut self, enable: bool) -> Self {
		self.settings.synchronous_initialization = enable;
		self
	}

	/// Makes `build` fail when the synchronous first fetch fails.
	pub fn throw_on_initial_fetch_fail(mut self, enable: bool) -> Self {
		self.settings.throw_on_initial_fetch_fail = enable;
		self
	}

	pub fn schedule_fetch_immediately(mut self, enable: bool) -> Self {
		self.settings.schedule_fetch_immediately = enable;
		self
	}

	pub fn custom_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.settings.custom_headers.insert(name.into(), value.into());
		self
	}

	pub fn request_timeout(mut self, timeout: Duration) -> Self {
		self.settings.request_timeout = timeout;
		self
	}

	pub fn sse_config(mut self, config: SseConfig) -> Self {
		self.settings.sse = config;
		self
	}

	/// Sets the state used when no backup exists.
	///
	/// With `override_backup` set it is used even when a backup exists.
	pub fn bootstrap(
		mut self,
		provider: impl BootstrapProvider + 'static,
		override_backup: bool,
	) -> Self {
		self.bootstrap = Some(Arc::new(provider));
		self.settings.bootstrap_override = override_backup;
		self
	}

	pub fn events(mut self, events: EventCallbacks) -> Self {
		self.events = events;
		self
	}

	/// Replaces the HTTP backend client.
	pub fn api_client(mut self, api: Arc<dyn ApiClient>) -> Self {
		self.api = Some(api);
		self
	}

	pub fn engine(mut self, engine: Arc<dyn EvaluationEngine>) -> Self {
		self.engine = Some(engine);
		self
	}

	/// File system used by the default backup store.
	pub fn file_system(mut self, fs: Arc<dyn FileSystem>) -> Self {
		self.file_system = Some(fs);
		self
	}

	/// Replaces the file backup store entirely.
	pub fn backup_store(mut self, backup: Arc<dyn BackupStore>) -> Self {
		self.backup = Some(backup);
		self
	}

	pub fn task_manager(mut self, task_manager: Arc<dyn TaskManager>) -> Self {
		self.task_manager = Some(task_manager);
		self
	}

	/// Builds the client, restores the backup and starts syncing.
	///
	/// Returns once the active sync path has started; with synchronous
	/// initialization the first fetch has completed too.
	#[instrument(skip_all)]
	pub async fn build(self) -> Result<FlagsClient> {
		let settings = self.settings;
		settings.validate()?;

		let events = Arc::new(self.events);
		let identity = ClientIdentity::from_settings(&settings);

		let api: Arc<dyn ApiClient> = match self.api {
			Some(api) => api,
			None => Arc::new(HttpApiClient::new(
				&settings,
				&identity,
				Arc::clone(&events),
			)?),
		};
		let engine = self
			.engine
			.unwrap_or_else(|| Arc::new(ToggleEngine::new()) as Arc<dyn EvaluationEngine>);
		let backup: Arc<dyn BackupStore> = match self.backup {
			Some(backup) => backup,
			None => {
				let fs = self
					.file_system
					.unwrap_or_else(|| Arc::new(StdFileSystem) as Arc<dyn FileSystem>);
				let paths = BackupPaths::new(
					&settings.storage_dir,
					&settings.app_name,
					&settings.instance_tag,
					&identity.sdk_version,
				);
				let mut store = FileBackupStore::new(fs, paths, Arc::clone(&events));
				if let Some(provider) = self.bootstrap {
					store = store.with_bootstrap(provider, settings.bootstrap_override);
				}
				Arc::new(store)
			}
		};
		let task_manager = self
			.task_manager
			.unwrap_or_else(|| Arc::new(TimerTaskManager::new()) as Arc<dyn TaskManager>);

		let restored = backup.load().await;
		let mut initial_etag = restored.etag;
		if !restored.state.is_empty() {
			match engine.take_state(&restored.state) {
				Ok(()) => debug!(etag = ?initial_etag, "restored toggle state from backup"),
				Err(e) => {
					warn!(error = %e, "backup state rejected");
					events.raise_error(ErrorKind::FileCache, e.into());
					initial_etag = None;
				}
			}
		}

		let cancel = CancellationToken::new();
		let ready = Arc::new(ReadySignal::new(Arc::clone(&events)));

		MetricsReporter::start(
			settings.send_metrics_interval,
			&identity,
			Arc::clone(&api),
			Arc::clone(&engine),
			task_manager.as_ref(),
			&cancel,
		);

		let mode = settings.initial_mode();
		let coordinator = SyncCoordinator::start(
			SyncDependencies {
				api,
				engine: Arc::clone(&engine),
				backup,
				events: Arc::clone(&events),
				task_manager,
				ready,
			},
			SyncOptions {
				initial_etag,
				fetch_interval: settings.fetch_toggles_interval,
				schedule_fetch_immediately: settings.schedule_fetch_immediately,
				synchronous_initialization: settings.synchronous_initialization,
				throw_on_initial_fetch_fail: settings.throw_on_initial_fetch_fail,
				failover: settings.failover.clone(),
			},
			mode,
			cancel.clone(),
		)
		.await?;

		info!(
			app_name = %settings.app_name,
			instance_id = %identity.instance_id,
			mode = %mode,
			"flags client initialized"
		);

		Ok(FlagsClient {
			inner: Arc::new(ClientInner {
				settings,
				identity,
				engine,
				events,
				coordinator,
				cancel,
				closed: AtomicBool::new(false),
			}),
		})
	}
}

impl Default for FlagsClientBuilder {
	fn default() -> Self {
		Self::new()
	}
}

struct ClientInner {
	settings: FlagsSettings,
	identity: ClientIdentity,
	engine: Arc<dyn EvaluationEngine>,
	events: Arc<EventCallbacks>,
	coordinator: Arc<SyncCoordinator>,
	cancel: CancellationToken,
	closed: AtomicBool,
}

impl Drop for ClientInner {
	fn drop(&mut self) {
		self.cancel.cancel();
	}
}

/// Client for evaluating feature toggles. Cheap to clone.
///
/// Evaluations never block on the network; they read the last applied state.
#[derive(Clone)]
pub struct FlagsClient {
	inner: Arc<ClientInner>,
}

impl FlagsClient {
	pub fn builder() -> FlagsClientBuilder {
		FlagsClientBuilder::new()
	}

	fn prepare_context(&self, context: &EvaluationContext) -> EvaluationContext {
		context
			.clone()
			.apply_static_fields(&self.inner.settings.app_name, &self.inner.settings.environment)
	}

	fn raise_impression(
		&self,
		kind: ImpressionKind,
		name: &str,
		enabled: bool,
		variant: Option<String>,
		context: EvaluationContext,
	) {
		if !self.inner.events.has_impression_listener() {
			return;
		}
		let context_hash = context_fingerprint(name, &context);
		self.inner.events.raise_impression(ImpressionEvent {
			kind,
			feature_name: name.to_string(),
			enabled,
			variant,
			context,
			context_hash,
		});
	}

	/// Whether any sync path has applied state since the client was built.
	pub fn is_ready(&self) -> bool {
		self.inner.coordinator.is_ready()
	}

	/// Waits for the first hydration. Returns false on timeout.
	pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
		self.inner.coordinator.wait_until_ready(timeout).await
	}

	/// The sync path currently in use; `None` after close.
	pub fn active_mode(&self) -> Option<SyncMode> {
		self.inner.coordinator.active_mode()
	}

	/// Switches between polling and streaming.
	pub async fn set_mode(&self, mode: SyncMode) -> Result<()> {
		if self.is_closed() {
			return Err(FlagsError::ClientClosed);
		}
		self.inner.coordinator.handle_mode_change(mode).await
	}

	/// Returns the current toggle state as JSON.
	pub fn state(&self) -> String {
		self.inner.engine.get_state()
	}

	pub fn identity(&self) -> &ClientIdentity {
		&self.inner.identity
	}

	pub fn settings(&self) -> &FlagsSettings {
		&self.inner.settings
	}

	pub fn is_closed(&self) -> bool {
		self.inner.closed.load(Ordering::SeqCst)
	}

	/// Stops syncing and every background task. Idempotent.
	///
	/// Evaluations keep answering from the last applied state.
	#[instrument(skip(self))]
	pub async fn close(&self) -> Result<()> {
		if self.inner.closed.swap(true, Ordering::SeqCst) {
			return Ok(());
		}
		info!("closing flags client");
		self.inner.coordinator.dispose().await
	}

	/// Returns whether `name` is enabled, or `default` if the toggle is unknown.
	pub fn is_enabled(&self, name: &str, context: &EvaluationContext, default: bool) -> bool {
		let context = self.prepare_context(context);
		match self.inner.engine.is_enabled(name, &context) {
			Some(response) => {
				if response.impression_data {
					self.raise_impression(
						ImpressionKind::IsEnabled,
						name,
						response.enabled,
						None,
						context,
					);
				}
				response.enabled
			}
			None => {
				debug!(toggle = %name, default, "unknown toggle, using default");
				default
			}
		}
	}

	/// Returns the variant assigned to `context`, or `default` if the toggle is unknown.
	pub fn get_variant(&self, name: &str, context: &EvaluationContext, default: Variant) -> Variant {
		let context = self.prepare_context(context);
		let Some(variant) = self.inner.engine.get_variant(name, &context) else {
			debug!(toggle = %name, "unknown toggle, using default variant");
			return default;
		};
		if self.inner.engine.impression_data(name) {
			self.raise_impression(
				ImpressionKind::GetVariant,
				name,
				variant.feature_enabled,
				Some(variant.name.clone()),
				context,
			);
		}
		variant
	}

	pub fn list_known_toggles(&self) -> Vec<KnownToggle> {
		self.inner.engine.list_known_toggles()
	}

	/// Evaluates every known toggle for `context`.
	pub fn get_all(&self, context: &EvaluationContext) -> HashMap<String, bool> {
		self.list_known_toggles()
			.into_iter()
			.map(|toggle| {
				let enabled = self.is_enabled(&toggle.name, context, false);
				(toggle.name, enabled)
			})
			.collect()
	}
}

impl FeatureFlags for FlagsClient {
	fn is_enabled(&self, name: &str, context: &EvaluationContext, default: bool) -> bool {
		FlagsClient::is_enabled(self, name, context, default)
	}

	fn get_variant(&self, name: &str, context: &EvaluationContext, default: Variant) -> Variant {
		FlagsClient::get_variant(self, name, context, default)
	}

	fn list_known_toggles(&self) -> Vec<KnownToggle> {
		FlagsClient::list_known_toggles(self)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::api::testing::StubApiClient;
	use crate::api::FetchTogglesResult;
	use crate::backup::testing::MemoryFileSystem;
	use crate::backup::Backup;
	use crate::bootstrap::StaticBootstrapProvider;
	use crate::events::testing::Recorder;
	use parking_lot::Mutex;
	use std::path::Path;

	const V1: &str = r#"{"version":2,"features":[{"name":"checkout","enabled":true,"impressionData":true},{"name":"legacy","enabled":false}]}"#;

	fn builder(api: Arc<StubApiClient>) -> FlagsClientBuilder {
		FlagsClient::builder()
			.app_name("billing")
			.api_url("https://loom.example.com/api/")
			.instance_tag("host-1")
			.storage_dir("/cache")
			.send_metrics_interval(None)
			.file_system(Arc::new(MemoryFileSystem::default()))
			.api_client(api)
	}

	#[tokio::test]
	async fn rejects_invalid_settings() {
		let result = FlagsClient::builder().api_url("https://x").build().await;
		assert!(matches!(result, Err(FlagsError::InvalidSettings(_))));
	}

	#[tokio::test(start_paused = true)]
	async fn synchronous_build_evaluates_immediately() {
		let api = Arc::new(StubApiClient::default());
		api.respond(Ok(FetchTogglesResult::changed(V1, Some("v1".to_string()))));

		let client = builder(api)
			.synchronous_initialization(true)
			.build()
			.await
			.unwrap();

		let ctx = EvaluationContext::new().with_user_id("u1");
		assert!(client.is_ready());
		assert!(client.is_enabled("checkout", &ctx, false));
		assert!(!client.is_enabled("legacy", &ctx, true));
		assert!(client.is_enabled("missing", &ctx, true));
		assert_eq!(client.list_known_toggles().len(), 2);
		assert_eq!(client.active_mode(), Some(SyncMode::Polling));
		client.close().await.unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn restores_backup_before_first_fetch() {
		let api = Arc::new(StubApiClient::default());
		let fs = Arc::new(MemoryFileSystem::default());
		let paths = BackupPaths::new(
			Path::new("/cache"),
			"billing",
			"host-1",
			&crate::config::sdk_version(),
		);
		fs.put(&paths.state, V1);
		fs.put(&paths.etag, "from-disk");

		let client = builder(api.clone())
			.file_system(fs)
			.synchronous_initialization(true)
			.build()
			.await
			.unwrap();

		assert!(client.is_enabled("checkout", &EvaluationContext::new(), false));
		assert_eq!(
			api.fetched_etags.lock().first().cloned().flatten().as_deref(),
			Some("from-disk")
		);
		client.close().await.unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn bootstrap_is_used_without_backup() {
		let api = Arc::new(StubApiClient::default());
		let client = builder(api)
			.bootstrap(StaticBootstrapProvider::new(V1), false)
			.build()
			.await
			.unwrap();

		assert!(client.is_enabled("checkout", &EvaluationContext::new(), false));
		client.close().await.unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn impressions_only_for_flagged_toggles() {
		let api = Arc::new(StubApiClient::default());
		let seen = Arc::new(Mutex::new(Vec::new()));
		let sink = Arc::clone(&seen);
		let events = EventCallbacks::new().on_impression(move |e| {
			sink.lock()
				.push((e.kind, e.feature_name.clone(), e.context.app_name.clone()))
		});

		let client = builder(api)
			.backup_store(Arc::new(SeededBackup(Backup::new(V1, None))))
			.events(events)
			.build()
			.await
			.unwrap();

		let ctx = EvaluationContext::new();
		client.is_enabled("checkout", &ctx, false);
		client.is_enabled("legacy", &ctx, false);
		client.get_variant("checkout", &ctx, Variant::disabled());

		let seen = seen.lock();
		assert_eq!(seen.len(), 2);
		assert_eq!(seen[0].0, ImpressionKind::IsEnabled);
		assert_eq!(seen[1].0, ImpressionKind::GetVariant);
		assert!(seen
			.iter()
			.all(|(_, name, app)| name == "checkout" && app.as_deref() == Some("billing")));
		drop(seen);
		client.close().await.unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn close_is_idempotent() {
		let recorder = Arc::new(Recorder::default());
		let api = Arc::new(StubApiClient::default());
		let client = builder(api)
			.events(recorder.callbacks())
			.build()
			.await
			.unwrap();

		client.close().await.unwrap();
		client.close().await.unwrap();
		assert!(client.is_closed());
		assert_eq!(client.active_mode(), None);
		assert!(matches!(
			client.set_mode(SyncMode::Streaming).await,
			Err(FlagsError::ClientClosed)
		));
	}

	struct SeededBackup(Backup);

	#[async_trait::async_trait]
	impl BackupStore for SeededBackup {
		async fn load(&self) -> Backup {
			self.0.clone()
		}

		async fn save(&self, _backup: &Backup) {}
	}
}
