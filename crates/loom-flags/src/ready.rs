// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use crate::events::EventCallbacks;

/// One-shot readiness latch shared by both sync paths.
///
/// The first successful hydration from any source fires it; later calls are
/// ignored. It never resets.
pub struct ReadySignal {
	fired: AtomicBool,
	armed: AtomicBool,
	tx: watch::Sender<bool>,
	events: Arc<EventCallbacks>,
}

impl ReadySignal {
	pub fn new(events: Arc<EventCallbacks>) -> Self {
		let (tx, _rx) = watch::channel(false);
		Self {
			fired: AtomicBool::new(false),
			armed: AtomicBool::new(true),
			tx,
			events,
		}
	}

	/// Fires the signal. Returns true only for the call that flipped it.
	pub fn fire(&self) -> bool {
		if !self.armed.load(Ordering::SeqCst) {
			return false;
		}
		if self
			.fired
			.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
			.is_err()
		{
			return false;
		}
		info!("flags client ready");
		self.tx.send_replace(true);
		self.events.raise_ready();
		true
	}

	/// Stops later `fire` calls from reaching the application.
	pub fn disarm(&self) {
		self.armed.store(false, Ordering::SeqCst);
	}

	pub fn is_ready(&self) -> bool {
		self.fired.load(Ordering::SeqCst)
	}

	/// Waits for readiness. Returns false if `timeout` elapses first.
	pub async fn wait(&self, timeout: Duration) -> bool {
		let mut rx = self.tx.subscribe();
		let ready = matches!(
			tokio::time::timeout(timeout, rx.wait_for(|ready| *ready)).await,
			Ok(Ok(_))
		);
		ready
	}

	/// Returns a callback that fires this signal, for handing to a sync path.
	pub fn notifier(self: &Arc<Self>) -> ReadyNotifier {
		let signal = Arc::clone(self);
		Arc::new(move || {
			signal.fire();
		})
	}
}

/// Callback a sync path invokes after its first successful hydration.
pub type ReadyNotifier = Arc<dyn Fn() + Send + Sync>;
