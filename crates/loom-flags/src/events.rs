// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Lifecycle events raised to the application.
//!
//! Callbacks run inline on the thread that raised the event. Keep them fast;
//! queue anything expensive.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use loom_flags_core::{EvaluationContext, SyncMode};
use tracing::warn;

use crate::error::FlagsError;

/// Which part of the SDK produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
	/// Talking to the backend failed.
	Client,
	/// Reading the local backup failed.
	FileCache,
	/// Writing the local backup failed.
	TogglesBackup,
	/// Applying new toggle state failed.
	TogglesUpdate,
}

impl fmt::Display for ErrorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			ErrorKind::Client => "client",
			ErrorKind::FileCache => "file_cache",
			ErrorKind::TogglesBackup => "toggles_backup",
			ErrorKind::TogglesUpdate => "toggles_update",
		};
		f.write_str(s)
	}
}

#[derive(Debug, Clone)]
pub struct ErrorEvent {
	pub kind: ErrorKind,
	pub error: Arc<FlagsError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TogglesUpdatedEvent {
	pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeChangedEvent {
	pub mode: SyncMode,
}

/// Which read-path call produced an impression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImpressionKind {
	IsEnabled,
	GetVariant,
}

/// Raised when a toggle with impression data enabled is evaluated.
#[derive(Debug, Clone)]
pub struct ImpressionEvent {
	pub kind: ImpressionKind,
	pub feature_name: String,
	pub enabled: bool,
	pub variant: Option<String>,
	pub context: EvaluationContext,
	/// SHA-256 over the toggle name and context, for deduplication downstream.
	pub context_hash: String,
}

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Application callbacks for SDK lifecycle events.
#[derive(Clone, Default)]
pub struct EventCallbacks {
	ready: Option<Arc<dyn Fn() + Send + Sync>>,
	error: Option<Callback<ErrorEvent>>,
	toggles_updated: Option<Callback<TogglesUpdatedEvent>>,
	mode_changed: Option<Callback<ModeChangedEvent>>,
	impression: Option<Callback<ImpressionEvent>>,
}

impl EventCallbacks {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn on_ready(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
		self.ready = Some(Arc::new(f));
		self
	}

	pub fn on_error(mut self, f: impl Fn(&ErrorEvent) + Send + Sync + 'static) -> Self {
		self.error = Some(Arc::new(f));
		self
	}

	pub fn on_toggles_updated(
		mut self,
		f: impl Fn(&TogglesUpdatedEvent) + Send + Sync + 'static,
	) -> Self {
		self.toggles_updated = Some(Arc::new(f));
		self
	}

	pub fn on_mode_changed(mut self, f: impl Fn(&ModeChangedEvent) + Send + Sync + 'static) -> Self {
		self.mode_changed = Some(Arc::new(f));
		self
	}

	pub fn on_impression(mut self, f: impl Fn(&ImpressionEvent) + Send + Sync + 'static) -> Self {
		self.impression = Some(Arc::new(f));
		self
	}

	pub fn has_impression_listener(&self) -> bool {
		self.impression.is_some()
	}

	pub(crate) fn raise_ready(&self) {
		if let Some(f) = &self.ready {
			f();
		}
	}

	pub(crate) fn raise_error(&self, kind: ErrorKind, error: FlagsError) {
		self.emit_error(kind, Arc::new(error));
	}

	/// Raises `error` and hands back a [`FlagsError::Reported`] for propagation.
	pub(crate) fn report(&self, kind: ErrorKind, error: FlagsError) -> FlagsError {
		let error = Arc::new(error);
		self.emit_error(kind, Arc::clone(&error));
		FlagsError::Reported(error)
	}

	fn emit_error(&self, kind: ErrorKind, error: Arc<FlagsError>) {
		warn!(kind = %kind, error = %error, "flags error");
		if let Some(f) = &self.error {
			f(&ErrorEvent { kind, error });
		}
	}

	pub(crate) fn raise_toggles_updated(&self) {
		if let Some(f) = &self.toggles_updated {
			f(&TogglesUpdatedEvent {
				updated_at: Utc::now(),
			});
		}
	}

	pub(crate) fn raise_mode_changed(&self, mode: SyncMode) {
		if let Some(f) = &self.mode_changed {
			f(&ModeChangedEvent { mode });
		}
	}

	pub(crate) fn raise_impression(&self, event: ImpressionEvent) {
		if let Some(f) = &self.impression {
			f(&event);
		}
	}
}

impl fmt::Debug for EventCallbacks {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("EventCallbacks")
			.field("ready", &self.ready.is_some())
			.field("error", &self.error.is_some())
			.field("toggles_updated", &self.toggles_updated.is_some())
			.field("mode_changed", &self.mode_changed.is_some())
			.field("impression", &self.impression.is_some())
			.finish()
	}
}


#[cfg(test)]
mod tests {
	use super::testing::Recorder;
	use super::*;

	#[test]
	fn callbacks_receive_events() {
		let recorder = Arc::new(Recorder::default());
		let callbacks = recorder.callbacks();

		callbacks.raise_ready();
		callbacks.raise_toggles_updated();
		callbacks.raise_error(ErrorKind::TogglesBackup, FlagsError::Cancelled);
		callbacks.raise_mode_changed(SyncMode::Polling);

		assert_eq!(recorder.ready_count(), 1);
		assert_eq!(recorder.updated_count(), 1);
		assert_eq!(recorder.error_kinds(), vec![ErrorKind::TogglesBackup]);
		assert_eq!(recorder.modes(), vec![SyncMode::Polling]);
	}

	#[test]
	fn report_raises_and_wraps() {
		let recorder = Arc::new(Recorder::default());
		let callbacks = recorder.callbacks();
		let err = callbacks.report(ErrorKind::Client, FlagsError::Stream("eof".to_string()));
		assert!(matches!(err, FlagsError::Reported(_)));
		assert_eq!(err.to_string(), "stream error: eof");
		assert_eq!(recorder.error_kinds(), vec![ErrorKind::Client]);
	}

	#[test]
	fn missing_callbacks_are_ignored() {
		let callbacks = EventCallbacks::new();
		callbacks.raise_ready();
		callbacks.raise_error(ErrorKind::Client, FlagsError::Cancelled);
		assert!(!callbacks.has_impression_listener());
	}
}
