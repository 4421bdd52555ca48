use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;

use crate::unit::{normalize, RunUnit};

/// A named, operator-selectable bundle of projects.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Node {
	pub name: String,
	#[serde(default, rename = "project")]
	pub projects: Vec<ProjectBundle>,
}

/// Normalized per-project commands as handed over by the config layer.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ProjectBundle {
	pub name: String,
	#[serde(default)]
	pub setup: Vec<String>,
	#[serde(default)]
	pub test_setup: Vec<String>,
	#[serde(default)]
	pub run: Vec<String>,
}

/// Decides once per project whether setup commands may be skipped.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SetupPolicy {
	#[default]
	Always,
	Never,
	/// Skip when the checkout is not on the main branch, or when a dry-run
	/// fetch reports nothing new.
	Smart,
}

impl SetupPolicy {
	pub fn skip_setup(&self, dir: &Path) -> bool {
		match self {
			SetupPolicy::Always => false,
			SetupPolicy::Never => true,
			SetupPolicy::Smart => !on_main_branch(dir) || !remote_has_changes(dir),
		}
	}
}

fn git(dir: &Path, args: &[&str]) -> Option<std::process::Output> {
	Command::new("git")
		.args(args)
		.current_dir(dir)
		.output()
		.ok()
		.filter(|out| out.status.success())
}

fn on_main_branch(dir: &Path) -> bool {
	git(dir, &["rev-parse", "--abbrev-ref", "HEAD"])
		.map(|out| {
			let branch = String::from_utf8_lossy(&out.stdout);
			matches!(branch.trim(), "main" | "master")
		})
		.unwrap_or(false)
}

// `git fetch --dry-run` prints ref updates on stderr and nothing when up to date.
fn remote_has_changes(dir: &Path) -> bool {
	git(dir, &["fetch", "--dry-run"])
		.map(|out| !out.stdout.is_empty() || !out.stderr.is_empty())
		.unwrap_or(false)
}

// ── ProcessGroup ─────────────────────────────────────────────────────────────

pub struct ProcessGroup {
	pub project: String,
	pub dir: PathBuf,
	pub setup: Vec<String>,
	pub test_setup: Vec<String>,
	pub units: Vec<RunUnit>,
	pub skip_setup: bool,
}

impl ProcessGroup {
	pub fn new(
		node: &str,
		bundle: &ProjectBundle,
		dir: &Path,
		test_mode: bool,
		skip_setup: bool,
		substitute: impl Fn(&str) -> String,
	) -> Self {
		let mut group = Self {
			project: bundle.name.clone(),
			dir: dir.to_path_buf(),
			setup: Vec::new(),
			test_setup: Vec::new(),
			units: Vec::new(),
			skip_setup,
		};
		for cmd in &bundle.setup {
			push_unique(&mut group.setup, normalize(&substitute(cmd)));
		}
		for cmd in &bundle.test_setup {
			push_unique(&mut group.test_setup, normalize(&substitute(cmd)));
		}
		for cmd in &bundle.run {
			let unit = RunUnit::new(&group.project, &substitute(cmd), dir, test_mode, node);
			if !group.units.iter().any(|u| u.command == unit.command) {
				group.units.push(unit);
			}
		}
		group
	}

	/// Absorbs another group of the same project. Only command texts not yet
	/// present are appended; returns the sequence numbers of appended units.
	pub fn merge(&mut self, other: ProcessGroup) -> Vec<u32> {
		for cmd in other.setup {
			push_unique(&mut self.setup, cmd);
		}
		for cmd in other.test_setup {
			push_unique(&mut self.test_setup, cmd);
		}

		let mut appended = Vec::new();
		for unit in other.units {
			match self.units.iter_mut().find(|u| u.command == unit.command) {
				Some(existing) => {
					for node in unit.nodes {
						push_unique(&mut existing.nodes, node);
					}
				}
				None => {
					appended.push(unit.seq);
					self.units.push(unit);
				}
			}
		}
		appended
	}

	pub fn setup_commands(&self, test_mode: bool) -> &[String] {
		if test_mode {
			&self.test_setup
		} else {
			&self.setup
		}
	}
}

fn push_unique(list: &mut Vec<String>, item: String) {
	if !list.contains(&item) {
		list.push(item);
	}
}
