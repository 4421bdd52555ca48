use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use regex::{Regex, RegexBuilder};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::Snapshot;
use crate::style::Style;
use crate::unit::ReadOutcome;

const IDLE_SLEEP: Duration = Duration::from_millis(50);

// ── Filter ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Filter {
	regex: Regex,
	pub case_insensitive: bool,
}

impl Filter {
	/// Builds a filter from an operator pattern. One trailing `/` is dropped so
	/// `/ERROR/` and `/ERROR` mean the same thing. An empty pattern clears the
	/// filter.
	pub fn new(pattern: &str, case_insensitive: bool) -> Result<Option<Filter>, regex::Error> {
		let pattern = pattern.strip_suffix('/').unwrap_or(pattern);
		if pattern.is_empty() {
			return Ok(None);
		}
		let regex = RegexBuilder::new(pattern).case_insensitive(case_insensitive).build()?;
		Ok(Some(Filter { regex, case_insensitive }))
	}

	pub fn matches(&self, line: &str) -> bool {
		self.regex.is_match(line)
	}

	pub fn pattern(&self) -> &str {
		self.regex.as_str()
	}
}

// ── Sink ─────────────────────────────────────────────────────────────────────

/// Append-only file receiving a plain copy of the multiplexed stream.
pub struct LineSink {
	file: File,
	path: PathBuf,
}

impl LineSink {
	pub fn open(path: &Path) -> io::Result<Self> {
		let file = OpenOptions::new().create(true).append(true).open(path)?;
		Ok(Self { file, path: path.to_path_buf() })
	}

	pub fn append(&mut self, line: &str) -> io::Result<()> {
		writeln!(self.file, "{}", line)?;
		self.file.flush()
	}

	pub fn path(&self) -> &Path {
		&self.path
	}
}

// ── Routing ──────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct Settings {
	pub silent: bool,
	pub filter: Option<Filter>,
	pub sink: Option<Arc<Mutex<LineSink>>>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Emission {
	pub console: Option<String>,
	pub sink: Option<String>,
}

/// Where one line read from `project` goes. `None` when the filter drops it.
pub fn route(project: &str, line: &str, settings: &Settings, style: &dyn Style) -> Option<Emission> {
	if let Some(filter) = &settings.filter {
		if !filter.matches(line) {
			return None;
		}
	}
	Some(Emission {
		console: (!settings.silent).then(|| format!("{} - {}", style.project(project), line)),
		sink: settings.sink.is_some().then(|| format!("[{}] - {}", project, line)),
	})
}

// ── Multiplexer ──────────────────────────────────────────────────────────────

struct Running {
	cancel: watch::Sender<bool>,
	handle: JoinHandle<()>,
}

/// Background loop draining every unit of a [`Snapshot`] into the console
/// and the optional sink. A unit is read until its pty closes, so lines
/// printed right before it exits still come through. The snapshot and
/// settings are only ever replaced while the loop is stopped.
pub struct Multiplexer {
	snapshot: Arc<Snapshot>,
	settings: Settings,
	style: Arc<dyn Style>,
	running: Option<Running>,
}

impl Multiplexer {
	pub fn new(snapshot: Arc<Snapshot>, style: Arc<dyn Style>) -> Self {
		Self { snapshot, settings: Settings::default(), style, running: None }
	}

	pub fn is_running(&self) -> bool {
		self.running.is_some()
	}

	pub fn settings(&self) -> &Settings {
		&self.settings
	}

	pub fn start(&mut self) {
		if self.running.is_some() {
			return;
		}
		let (cancel, cancel_rx) = watch::channel(false);
		let snapshot = Arc::clone(&self.snapshot);
		let settings = self.settings.clone();
		let style = Arc::clone(&self.style);
		let handle = tokio::spawn(async move {
			poll_loop(snapshot, settings, style, cancel_rx).await;
		});
		self.running = Some(Running { cancel, handle });
	}

	pub async fn stop(&mut self) {
		if let Some(running) = self.running.take() {
			let _ = running.cancel.send(true);
			if let Err(e) = running.handle.await {
				tracing::warn!("multiplexer loop ended abnormally: {}", e);
			}
		}
	}

	pub async fn restart_with(&mut self, snapshot: Arc<Snapshot>) {
		self.stop().await;
		self.snapshot = snapshot;
		self.start();
	}

	pub async fn set_filter(&mut self, filter: Option<Filter>) {
		self.update(|s| s.filter = filter).await;
	}

	/// Returns the new silence state.
	pub async fn toggle_silence(&mut self) -> bool {
		self.update(|s| s.silent = !s.silent).await;
		self.settings.silent
	}

	pub async fn set_silent(&mut self, silent: bool) {
		self.update(|s| s.silent = silent).await;
	}

	pub async fn set_sink(&mut self, sink: Option<LineSink>) {
		let sink = sink.map(|s| Arc::new(Mutex::new(s)));
		self.update(|s| s.sink = sink).await;
	}

	async fn update(&mut self, change: impl FnOnce(&mut Settings)) {
		let was_running = self.is_running();
		self.stop().await;
		change(&mut self.settings);
		if was_running {
			self.start();
		}
	}
}

async fn poll_loop(
	snapshot: Arc<Snapshot>,
	settings: Settings,
	style: Arc<dyn Style>,
	mut cancel: watch::Receiver<bool>,
) {
	loop {
		if *cancel.borrow() {
			return;
		}

		let mut read = 0usize;
		for group in &snapshot.groups {
			for output in group.outputs.iter().filter(|o| o.has_more()) {
				let line = match output.try_read_line() {
					ReadOutcome::Line(line) => line,
					ReadOutcome::Pending => continue,
					ReadOutcome::Closed => {
						tracing::debug!("{} (pid {}): output closed", group.project, output.pid);
						continue;
					}
					ReadOutcome::Failed(e) => {
						tracing::warn!("{} (pid {}): read failed: {}", group.project, output.pid, e);
						continue;
					}
				};
				read += 1;
				let Some(emission) = route(&group.project, &line, &settings, style.as_ref()) else {
					continue;
				};
				if let Some(text) = emission.console {
					println!("{}", text);
				}
				if let (Some(text), Some(sink)) = (emission.sink, &settings.sink) {
					let mut sink = sink.lock().await;
					if let Err(e) = sink.append(&text) {
						tracing::warn!("failed to write {}: {}", sink.path().display(), e);
					}
				}
			}
		}

		if read == 0 {
			tokio::select! {
				_ = tokio::time::sleep(IDLE_SLEEP) => {}
				_ = cancel.changed() => return,
			}
		} else {
			tokio::task::yield_now().await;
		}
	}
}
