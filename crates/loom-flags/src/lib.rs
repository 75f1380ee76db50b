// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Feature Flags Rust SDK for Loom.
//!
//! The client keeps a local copy of the toggle state in sync with the
//! backend and evaluates toggles against it without touching the network.
//!
//! # Features
//!
//! - **Polling**: Periodic conditional fetches of the full state
//! - **Streaming**: SSE updates, with automatic failover to polling
//! - **Local Backup**: The last applied state survives restarts
//! - **Bootstrap**: Seed state for first start or offline use
//! - **Metrics**: Registration and usage counts sent in the background
//!
//! # Example
//!
//! ```ignore
//! use loom_flags::{EvaluationContext, FlagsClient};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = FlagsClient::builder()
//!         .app_name("billing")
//!         .api_url("https://loom.example.com/api/")
//!         .use_streaming(true)
//!         .build()
//!         .await?;
//!
//!     client.wait_until_ready(Duration::from_secs(5)).await;
//!
//!     let context = EvaluationContext::new().with_user_id("user123");
//!     if client.is_enabled("checkout.new_flow", &context, false) {
//!         // ...
//!     }
//!
//!     client.close().await?;
//!     Ok(())
//! }
//! ```

mod api;
mod backup;
mod bootstrap;
mod client;
mod config;
mod coordinator;
mod engine;
mod error;
mod events;
mod fake;
mod failover;
mod fs;
mod http;
mod metrics;
mod polling;
mod ready;
mod scheduler;
mod sse;
mod streaming;

pub use api::{ApiClient, FetchTogglesResult, StreamControl, StreamingEventHandler};
pub use backup::{Backup, BackupPaths, BackupStore, FileBackupStore, NoOpBackupStore};
pub use bootstrap::{BootstrapProvider, FileBootstrapProvider, StaticBootstrapProvider};
pub use client::{FeatureFlags, FlagsClient, FlagsClientBuilder};
pub use config::{sdk_version, ClientIdentity, FlagsSettings, SDK_NAME, SDK_VERSION};
pub use coordinator::{ModeChangeRequester, SyncCoordinator, SyncDependencies, SyncOptions};
pub use engine::{EnabledResponse, EvaluationEngine, KnownToggle, ToggleEngine};
pub use error::{FlagsError, Result};
pub use events::{
	ErrorEvent, ErrorKind, EventCallbacks, ImpressionEvent, ImpressionKind, ModeChangedEvent,
	TogglesUpdatedEvent,
};
pub use fake::FakeFlagsClient;
pub use failover::{FailEvent, FailKind, FailoverConfig, FailoverStrategy};
pub use fs::{FileSystem, StdFileSystem};
pub use http::HttpApiClient;
pub use metrics::{MetricsReporter, RegisterClientTask, SendMetricsTask};
pub use polling::{FetchTogglesTask, PollingSync, FETCH_TOGGLES_TASK};
pub use ready::{ReadyNotifier, ReadySignal};
pub use scheduler::{ScheduledTask, TaskManager, TimerTaskManager};
pub use sse::{SseConfig, SseConnection};
pub use streaming::{StreamState, StreamingSync};

// Re-export core types for convenience
pub use loom_flags_core::{
	EvaluationContext, MetricsBucket, Payload, StateError, SyncMode, ToggleCollection,
	ToggleDefinition, Variant, VariantDefinition,
};
