use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Shared handle through which every shutdown source (operator, Ctrl-C,
/// marker file) reaches the single shutdown path.
#[derive(Clone)]
pub struct ShutdownTrigger {
	fired: Arc<watch::Sender<bool>>,
	begun: Arc<AtomicBool>,
}

impl Default for ShutdownTrigger {
	fn default() -> Self {
		Self::new()
	}
}

impl ShutdownTrigger {
	pub fn new() -> Self {
		let (tx, _) = watch::channel(false);
		Self { fired: Arc::new(tx), begun: Arc::new(AtomicBool::new(false)) }
	}

	pub fn fire(&self) {
		self.fired.send_replace(true);
	}

	pub fn is_fired(&self) -> bool {
		*self.fired.borrow()
	}

	pub async fn fired(&self) {
		let mut rx = self.fired.subscribe();
		let _ = rx.wait_for(|fired| *fired).await;
	}

	/// True for exactly one caller; everyone else skips the teardown.
	pub fn begin(&self) -> bool {
		!self.begun.swap(true, Ordering::SeqCst)
	}
}

pub struct ShutdownWatcher {
	marker: PathBuf,
	interval: Duration,
}

impl ShutdownWatcher {
	pub fn new(marker: impl Into<PathBuf>, interval: Duration) -> Self {
		Self { marker: marker.into(), interval }
	}

	pub fn marker(&self) -> &Path {
		&self.marker
	}

	/// Removes a marker left over from a previous run.
	pub fn clear(&self) {
		match std::fs::remove_file(&self.marker) {
			Ok(()) => tracing::debug!("removed stale {}", self.marker.display()),
			Err(e) if e.kind() == ErrorKind::NotFound => {}
			Err(e) => tracing::warn!("failed to remove {}: {}", self.marker.display(), e),
		}
	}

	pub fn spawn(self, trigger: ShutdownTrigger) -> JoinHandle<()> {
		tokio::spawn(async move {
			loop {
				if trigger.is_fired() {
					return;
				}
				if self.marker.exists() {
					tracing::info!("found {}, shutting down", self.marker.display());
					trigger.fire();
					return;
				}
				tokio::time::sleep(self.interval).await;
			}
		})
	}
}
