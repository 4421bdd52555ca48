use std::io::Write;
use std::sync::Arc;

use stackmux::{Filter, Multiplexer, RunConfiguration, ShutdownTrigger, TerminationReport};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};

use crate::context::Context;
use crate::setup;

// ── Operator commands ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
	Empty,
	Help,
	Listing,
	Restart(Option<String>),
	Stop(Option<String>),
	Quit,
	Silence,
	Activate(Option<String>),
	Deactivate(Option<String>),
	Filter { pattern: String, case_insensitive: bool },
	Unknown(String),
}

impl Command {
	/// `r`, `s`, `a` and `d` take their number inline (`r 3`) or from a
	/// follow-up prompt.
	pub fn parse(line: &str) -> Command {
		let line = line.trim();
		if let Some(pattern) = line.strip_prefix("i/") {
			return Command::Filter { pattern: pattern.to_string(), case_insensitive: true };
		}
		if let Some(pattern) = line.strip_prefix('/') {
			return Command::Filter { pattern: pattern.to_string(), case_insensitive: false };
		}

		let mut words = line.split_whitespace();
		let head = words.next().unwrap_or_default();
		let arg = words.next().map(String::from);
		if words.next().is_some() {
			return Command::Unknown(line.to_string());
		}
		match (head, arg) {
			("", None) => Command::Empty,
			("?", None) => Command::Help,
			("p", None) => Command::Listing,
			("q", None) => Command::Quit,
			("l", None) => Command::Silence,
			("r", arg) => Command::Restart(arg),
			("s", arg) => Command::Stop(arg),
			("a", arg) => Command::Activate(arg),
			("d", arg) => Command::Deactivate(arg),
			_ => Command::Unknown(line.to_string()),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
	Continue,
	Quit,
}

/// Parses a prompt answer as a 1-based position among `count` entries.
fn pick(answer: &str, count: usize) -> Result<usize, String> {
	let n: usize = answer
		.trim()
		.parse()
		.map_err(|_| format!("'{}' is not a number", answer.trim()))?;
	if n == 0 || n > count {
		return Err(format!("{} is out of range (1-{})", n, count));
	}
	Ok(n - 1)
}

fn deactivation_summary(name: &str, removed: usize, shared: usize, report: &TerminationReport) -> String {
	let mut msg = format!(
		"deactivated {}: removed {} unit(s), signaled {} process(es)",
		name,
		removed,
		report.signaled.len()
	);
	if !report.killed.is_empty() {
		msg.push_str(&format!(", force-killed {:?}", report.killed));
	}
	if shared > 0 {
		msg.push_str(&format!(", kept {} shared unit(s) running", shared));
	}
	msg
}

fn parse_seq(answer: &str) -> Result<u32, String> {
	answer
		.trim()
		.parse()
		.map_err(|_| format!("'{}' is not a number", answer.trim()))
}

// ── Control loop ─────────────────────────────────────────────────────────────

/// Foreground loop owning the live configuration. Every mutation stops the
/// multiplexer first and restarts it on a fresh snapshot afterwards.
pub struct ControlLoop {
	ctx: Arc<Context>,
	live: RunConfiguration,
	mux: Multiplexer,
	trigger: ShutdownTrigger,
}

impl ControlLoop {
	pub fn new(ctx: Arc<Context>, live: RunConfiguration, mux: Multiplexer, trigger: ShutdownTrigger) -> Self {
		Self { ctx, live, mux, trigger }
	}

	pub fn live(&self) -> &RunConfiguration {
		&self.live
	}

	pub fn mux(&self) -> &Multiplexer {
		&self.mux
	}

	/// Returns on `q` or end of input.
	pub async fn run<R: AsyncBufRead + Unpin>(&mut self, input: R) -> std::io::Result<()> {
		let mut lines = input.lines();
		while let Some(line) = lines.next_line().await? {
			if self.dispatch(Command::parse(&line), &mut lines).await == Flow::Quit {
				break;
			}
		}
		Ok(())
	}

	async fn dispatch<R: AsyncBufRead + Unpin>(&mut self, command: Command, lines: &mut Lines<R>) -> Flow {
		let result = match command {
			Command::Empty => return Flow::Continue,
			Command::Help => {
				self.print_help();
				return Flow::Continue;
			}
			Command::Listing => {
				print!("{}", self.render_listing());
				return Flow::Continue;
			}
			Command::Quit => {
				self.trigger.fire();
				return Flow::Quit;
			}
			Command::Silence => {
				let silent = self.mux.toggle_silence().await;
				Ok(if silent { "console silenced".to_string() } else { "console resumed".to_string() })
			}
			Command::Filter { pattern, case_insensitive } => self.set_filter(&pattern, case_insensitive).await,
			Command::Restart(arg) => match self.answer(arg, "restart #", lines).await {
				Some(answer) => match parse_seq(&answer) {
					Ok(seq) => self.restart_unit(seq).await,
					Err(e) => Err(e),
				},
				None => return Flow::Continue,
			},
			Command::Stop(arg) => match self.answer(arg, "stop #", lines).await {
				Some(answer) => match parse_seq(&answer) {
					Ok(seq) => self.stop_unit(seq).await,
					Err(e) => Err(e),
				},
				None => return Flow::Continue,
			},
			Command::Activate(arg) => {
				print!("{}", self.render_nodes(false));
				match self.answer(arg, "activate node #", lines).await {
					Some(answer) => match pick(&answer, self.ctx.config.nodes.len()) {
						Ok(index) => self.activate(index).await,
						Err(e) => Err(e),
					},
					None => return Flow::Continue,
				}
			}
			Command::Deactivate(arg) => {
				print!("{}", self.render_nodes(true));
				match self.answer(arg, "deactivate node #", lines).await {
					Some(answer) => match pick(&answer, self.live.active_nodes().len()) {
						Ok(index) => self.deactivate(index).await,
						Err(e) => Err(e),
					},
					None => return Flow::Continue,
				}
			}
			Command::Unknown(text) => Err(format!("unrecognized: {} (? for help)", text)),
		};

		match result {
			Ok(msg) => println!("{}", msg),
			Err(msg) => eprintln!("{}", self.ctx.style.bad(&msg)),
		}
		Flow::Continue
	}

	/// Inline argument if given, otherwise the next input line.
	async fn answer<R: AsyncBufRead + Unpin>(
		&self,
		inline: Option<String>,
		question: &str,
		lines: &mut Lines<R>,
	) -> Option<String> {
		if inline.is_some() {
			return inline;
		}
		print!("{}", self.ctx.style.bold(question));
		let _ = std::io::stdout().flush();
		match lines.next_line().await {
			Ok(answer) => answer,
			Err(e) => {
				tracing::warn!("failed to read answer: {}", e);
				None
			}
		}
	}

	// --- Units ---

	pub async fn restart_unit(&mut self, seq: u32) -> Result<String, String> {
		let command = self.command_of(seq)?;
		self.mux.stop().await;
		let result = match self.live.unit_mut(seq) {
			Some(unit) => unit
				.restart(&self.ctx.config.shell, &self.ctx.termination)
				.await
				.map(|pid| format!("restarted #{} `{}` as pid {}", seq, command, pid))
				.map_err(|e| format!("#{}: {}", seq, e)),
			None => Err(format!("no unit #{}", seq)),
		};
		self.mux.restart_with(self.live.snapshot()).await;
		result
	}

	pub async fn stop_unit(&mut self, seq: u32) -> Result<String, String> {
		let command = self.command_of(seq)?;
		if !self.live.units().any(|u| u.seq == seq && u.is_alive()) {
			return Err(format!("#{} `{}` is not running", seq, command));
		}
		self.mux.stop().await;
		let report = match self.live.unit_mut(seq) {
			Some(unit) => unit.stop(&self.ctx.termination).await,
			None => None,
		};
		self.mux.restart_with(self.live.snapshot()).await;
		match report {
			Some(report) if !report.killed.is_empty() => {
				Ok(format!("stopped #{} `{}` (killed {:?})", seq, command, report.killed))
			}
			_ => Ok(format!("stopped #{} `{}`", seq, command)),
		}
	}

	fn command_of(&self, seq: u32) -> Result<String, String> {
		self.live
			.units()
			.find(|u| u.seq == seq)
			.map(|u| u.command.clone())
			.ok_or_else(|| format!("no unit #{}", seq))
	}

	// --- Nodes ---

	/// `index` is 0-based into the configured node table.
	pub async fn activate(&mut self, index: usize) -> Result<String, String> {
		let node = self
			.ctx
			.config
			.nodes
			.get(index)
			.cloned()
			.ok_or_else(|| format!("no node #{}", index + 1))?;
		if self.live.active_nodes().contains(&node.name) {
			return Err(format!("{} is already active", node.name));
		}

		let incoming = RunConfiguration::assemble(std::slice::from_ref(&node), &self.ctx.assembly(self.live.next_seq()));
		for group in &incoming.groups {
			if self.live.groups.iter().any(|g| g.project == group.project) {
				continue;
			}
			setup::run_setup(group, &self.ctx)
				.await
				.map_err(|e| format!("{} not activated: {}", node.name, e))?;
		}

		self.mux.stop().await;
		let absorbed = self.live.absorb(incoming);
		let mut spawned = 0;
		for seq in &absorbed.new_units {
			let Some(unit) = self.live.unit_mut(*seq) else { continue };
			match unit.spawn(&self.ctx.config.shell) {
				Ok(_) => spawned += 1,
				Err(e) => tracing::error!("{} #{}: {}", unit.project, seq, e),
			}
		}
		self.mux.restart_with(self.live.snapshot()).await;

		tracing::info!("activated {}: {} new unit(s), new projects {:?}", node.name, spawned, absorbed.new_projects);
		Ok(format!("activated {} ({} new unit(s))", node.name, spawned))
	}

	/// `index` is 0-based into the active node list.
	pub async fn deactivate(&mut self, index: usize) -> Result<String, String> {
		let name = self
			.live
			.active_nodes()
			.get(index)
			.cloned()
			.ok_or_else(|| format!("no active node #{}", index + 1))?;

		self.mux.stop().await;
		let owned = self.live.units_owned_by(&name);
		let pids: Vec<u32> = self
			.live
			.units()
			.filter(|u| owned.contains(&u.seq) && u.is_alive())
			.filter_map(|u| u.pid())
			.collect();
		let shared = self
			.live
			.units()
			.filter(|u| u.nodes.contains(&name) && !owned.contains(&u.seq))
			.count();
		let report = self.ctx.termination.terminate(&pids).await;
		let removed = self.live.detach_node(&name);
		self.mux.restart_with(self.live.snapshot()).await;

		tracing::info!("deactivated {}: {:?}", name, report);
		Ok(deactivation_summary(&name, removed.len(), shared, &report))
	}

	// --- Output ---

	async fn set_filter(&mut self, pattern: &str, case_insensitive: bool) -> Result<String, String> {
		match Filter::new(pattern, case_insensitive) {
			Ok(Some(filter)) => {
				let msg = format!(
					"filtering on /{}/{}",
					filter.pattern(),
					if case_insensitive { "i" } else { "" }
				);
				self.mux.set_filter(Some(filter)).await;
				Ok(msg)
			}
			Ok(None) => {
				self.mux.set_filter(None).await;
				Ok("filter cleared".to_string())
			}
			Err(e) => Err(format!("bad pattern, keeping current filter: {}", e)),
		}
	}

	pub fn render_listing(&self) -> String {
		let style = &self.ctx.style;
		let mut out = String::new();
		for group in &self.live.groups {
			out.push_str(&format!("{}\n", style.project(&group.project)));
			for unit in &group.units {
				let pid = unit.pid().map_or("-".to_string(), |p| p.to_string());
				let state = if unit.is_alive() { style.good("alive") } else { style.bad("dead ") };
				out.push_str(&format!("  {:>3}  {:>7}  {}  {}\n", unit.seq, pid, state, unit.command));
			}
		}
		if out.is_empty() {
			out.push_str(&style.dim("nothing is running\n"));
		}
		out
	}

	fn render_nodes(&self, active_only: bool) -> String {
		let style = &self.ctx.style;
		let active = self.live.active_nodes();
		let names: Vec<&str> = if active_only {
			active.iter().map(String::as_str).collect()
		} else {
			self.ctx.config.node_names()
		};
		let mut out = String::new();
		for (i, name) in names.iter().enumerate() {
			let marker = if active.iter().any(|a| a.as_str() == *name) { style.good("*") } else { " ".to_string() };
			out.push_str(&format!("  {:>2} {} {}\n", i + 1, marker, name));
		}
		out
	}

	fn print_help(&self) {
		let style = &self.ctx.style;
		println!("{}", style.heading("commands"));
		println!("  ?          this help");
		println!("  p          list units");
		println!("  r [n]      restart unit n");
		println!("  s [n]      stop unit n");
		println!("  a [n]      activate node n");
		println!("  d [n]      deactivate node n");
		println!("  l          toggle console output");
		println!("  /pattern   show only matching lines (i/pattern ignores case, / clears)");
		println!("  q          stop everything and quit");
	}

	// --- Shutdown ---

	/// Stops the multiplexer and terminates every live unit. Only the first
	/// call does anything.
	pub async fn shutdown(&mut self) {
		if !self.trigger.begin() {
			return;
		}
		self.trigger.fire();
		self.mux.stop().await;

		let pids = self.live.alive_pids();
		tracing::info!("shutting down {} unit(s)", pids.len());
		let report = self.ctx.termination.terminate(&pids).await;
		if !report.killed.is_empty() {
			tracing::warn!("force-killed {:?}", report.killed);
		}

		let marker = self.ctx.marker_path();
		if marker.exists() {
			if let Err(e) = std::fs::remove_file(&marker) {
				tracing::warn!("failed to remove {}: {}", marker.display(), e);
			}
		}
	}
}
