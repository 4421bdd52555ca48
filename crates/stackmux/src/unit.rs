use std::io::{self, BufRead, BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use serde::Deserialize;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::sync::Mutex;

use crate::error::Error;
use crate::terminate::{self, Termination, TerminationReport};

const PTY_SIZE: PtySize = PtySize { rows: 24, cols: 160, pixel_width: 0, pixel_height: 0 };

/// Shell every unit runs under, e.g. `bash -ic "<command>"`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Shell {
	pub program: String,
	#[serde(default)]
	pub args: Vec<String>,
}

impl Default for Shell {
	fn default() -> Self {
		Self { program: "bash".into(), args: vec!["-ic".into()] }
	}
}

impl Shell {
	pub fn sh() -> Self {
		Self { program: "sh".into(), args: vec!["-c".into()] }
	}
}

// ── Executable resolution ────────────────────────────────────────────────────

const TEST_ENV: &str = "RAILS_ENV=test RACK_ENV=test NODE_ENV=test";

pub fn normalize(command: &str) -> String {
	command.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Rewrites `command` for test mode. Framework servers take an environment
/// flag, everything else gets the test environment variables.
pub fn resolve_command(command: &str, test_mode: bool) -> String {
	if !test_mode {
		return command.to_string();
	}
	if is_framework_server(command) {
		format!("{} -e test", command)
	} else {
		format!("{} {}", TEST_ENV, command)
	}
}

fn is_framework_server(command: &str) -> bool {
	let mut words = command.split_whitespace().peekable();
	if words.peek() == Some(&"bundle") {
		words.next();
		if words.next() != Some("exec") {
			return false;
		}
	}
	let program = words.next().unwrap_or_default();
	let program = program.strip_prefix("bin/").unwrap_or(program);
	program == "rails" && matches!(words.next(), Some("s") | Some("server"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Runtime {
	Rvm,
	Nvm,
	Plain,
}

impl Runtime {
	pub fn detect(dir: &Path) -> Self {
		if dir.join(".ruby-version").exists() {
			Runtime::Rvm
		} else if dir.join(".nvmrc").exists() {
			Runtime::Nvm
		} else {
			Runtime::Plain
		}
	}

	pub fn wrap(&self, dir: &Path, command: &str) -> String {
		let dir = quote(&dir.to_string_lossy());
		match self {
			Runtime::Rvm => format!("cd {} && rvm in {} do bash -c {}", dir, dir, quote(command)),
			Runtime::Nvm => format!(
				"cd {} && . \"$NVM_DIR/nvm.sh\" && nvm use > /dev/null && {}",
				dir, command
			),
			Runtime::Plain => format!("cd {} && {}", dir, command),
		}
	}
}

fn quote(text: &str) -> String {
	format!("'{}'", text.replace('\'', "'\\''"))
}

// ── Output channel ───────────────────────────────────────────────────────────

pub enum ReadOutcome {
	Line(String),
	Pending,
	/// The pty reached end of stream and every buffered line has been read.
	Closed,
	Failed(io::Error),
}

/// Read side of one unit's pty, shared with the multiplexer.
pub struct UnitOutput {
	pub project: String,
	pub pid: u32,
	exited: Arc<AtomicBool>,
	drained: AtomicBool,
	lines: Mutex<mpsc::UnboundedReceiver<io::Result<String>>>,
}

impl UnitOutput {
	pub fn is_alive(&self) -> bool {
		!self.exited.load(Ordering::SeqCst) && terminate::is_alive(self.pid)
	}

	/// False once the output has reported `Closed`. Outlives `is_alive` so
	/// the last lines of an exited unit still get read.
	pub fn has_more(&self) -> bool {
		!self.drained.load(Ordering::SeqCst)
	}

	/// Never waits: a line that is not buffered yet reports `Pending`.
	pub fn try_read_line(&self) -> ReadOutcome {
		let Ok(mut lines) = self.lines.try_lock() else {
			return ReadOutcome::Pending;
		};
		match lines.try_recv() {
			Ok(Ok(line)) => ReadOutcome::Line(line),
			Ok(Err(e)) => ReadOutcome::Failed(e),
			Err(TryRecvError::Empty) => ReadOutcome::Pending,
			Err(TryRecvError::Disconnected) => {
				self.drained.store(true, Ordering::SeqCst);
				ReadOutcome::Closed
			}
		}
	}
}

// ── RunUnit ──────────────────────────────────────────────────────────────────

pub struct RunUnit {
	pub project: String,
	pub command: String,
	pub seq: u32,
	pub test_mode: bool,
	pub dir: PathBuf,
	/// Nodes that asked for this command.
	pub nodes: Vec<String>,
	process: Option<Process>,
}

struct Process {
	pid: u32,
	output: Arc<UnitOutput>,
	_master: Box<dyn MasterPty + Send>,
}

impl RunUnit {
	pub fn new(project: &str, command: &str, dir: &Path, test_mode: bool, node: &str) -> Self {
		Self {
			project: project.to_string(),
			command: normalize(command),
			seq: 0,
			test_mode,
			dir: dir.to_path_buf(),
			nodes: vec![node.to_string()],
			process: None,
		}
	}

	pub fn executable(&self) -> String {
		let command = resolve_command(&self.command, self.test_mode);
		Runtime::detect(&self.dir).wrap(&self.dir, &command)
	}

	pub fn spawn(&mut self, shell: &Shell) -> Result<u32, Error> {
		let line = self.executable();
		let pair = native_pty_system()
			.openpty(PTY_SIZE)
			.map_err(|e| Error::Pty(e.to_string()))?;

		let mut cmd = CommandBuilder::new(&shell.program);
		cmd.args(&shell.args);
		cmd.arg(&line);
		if std::env::var("TERM").is_err() {
			cmd.env("TERM", "xterm-256color");
		}

		let mut child = pair.slave.spawn_command(cmd).map_err(|e| Error::Spawn {
			command: line.clone(),
			reason: e.to_string(),
		})?;
		drop(pair.slave);

		let pid = child.process_id().ok_or_else(|| Error::NoPid(line.clone()))?;
		let reader = pair.master.try_clone_reader().map_err(|e| Error::Pty(e.to_string()))?;

		let (tx, rx) = mpsc::unbounded_channel();
		let exited = Arc::new(AtomicBool::new(false));
		let label = format!("{}#{}", self.project, self.seq);

		std::thread::Builder::new()
			.name(format!("pty-{}", label))
			.spawn(move || pump_lines(reader, tx))?;

		let flag = Arc::clone(&exited);
		std::thread::Builder::new()
			.name(format!("reap-{}", label))
			.spawn(move || {
				match child.wait() {
					Ok(status) => tracing::debug!("{} (pid {}) exited with {}", label, pid, status.exit_code()),
					Err(e) => tracing::debug!("{} (pid {}) wait failed: {}", label, pid, e),
				}
				flag.store(true, Ordering::SeqCst);
			})?;

		tracing::info!("{}: spawned `{}` as pid {}", self.project, self.command, pid);
		self.process = Some(Process {
			pid,
			output: Arc::new(UnitOutput {
				project: self.project.clone(),
				pid,
				exited,
				drained: AtomicBool::new(false),
				lines: Mutex::new(rx),
			}),
			_master: pair.master,
		});
		Ok(pid)
	}

	/// Terminates the unit's process tree. `None` if it was never spawned or
	/// has already exited; a reaped pid is never signaled.
	pub async fn stop(&mut self, termination: &Termination) -> Option<TerminationReport> {
		if !self.is_alive() {
			return None;
		}
		let pid = self.pid()?;
		Some(termination.terminate(&[pid]).await)
	}

	pub async fn restart(&mut self, shell: &Shell, termination: &Termination) -> Result<u32, Error> {
		self.stop(termination).await;
		self.spawn(shell)
	}

	pub fn is_alive(&self) -> bool {
		self.process.as_ref().is_some_and(|p| p.output.is_alive())
	}

	pub fn pid(&self) -> Option<u32> {
		self.process.as_ref().map(|p| p.pid)
	}

	pub fn output(&self) -> Option<Arc<UnitOutput>> {
		self.process.as_ref().map(|p| Arc::clone(&p.output))
	}
}

fn pump_lines(reader: Box<dyn Read + Send>, tx: mpsc::UnboundedSender<io::Result<String>>) {
	let mut reader = BufReader::new(reader);
	let mut buf = Vec::new();
	loop {
		buf.clear();
		match reader.read_until(b'\n', &mut buf) {
			Ok(0) => break,
			Ok(_) => {
				let line = String::from_utf8_lossy(&buf);
				let line = line.trim_end_matches(|c| c == '\r' || c == '\n');
				if tx.send(Ok(line.to_string())).is_err() {
					break;
				}
			}
			Err(e) if e.kind() == ErrorKind::Interrupted => continue,
			// Linux reports EIO on the master once the last slave fd closes.
			Err(e) if e.raw_os_error() == Some(nix::libc::EIO) => break,
			Err(e) => {
				let _ = tx.send(Err(e));
				break;
			}
		}
	}
}
