use serde::Deserialize;
use stackmux::{Node, SetupPolicy, Shell};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

// ── stackup.toml ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
	#[serde(default = "default_projects_dir")]
	pub projects_dir: String,
	#[serde(default)]
	pub shell: Shell,
	#[serde(default = "default_log_file")]
	pub log_file: String,
	#[serde(default)]
	pub setup: SetupPolicy,
	#[serde(default = "default_marker")]
	pub marker: String,
	#[serde(default = "default_grace_secs")]
	pub grace_secs: u64,
	#[serde(default)]
	pub vars: HashMap<String, String>,
	#[serde(default, rename = "node")]
	pub nodes: Vec<Node>,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			projects_dir: default_projects_dir(),
			shell: Shell::default(),
			log_file: default_log_file(),
			setup: SetupPolicy::default(),
			marker: default_marker(),
			grace_secs: default_grace_secs(),
			vars: HashMap::new(),
			nodes: Vec::new(),
		}
	}
}

fn default_projects_dir() -> String { "..".into() }
fn default_log_file() -> String { "stackup.log".into() }
fn default_marker() -> String { ".stackup-stop".into() }
fn default_grace_secs() -> u64 { 5 }

impl Config {
	pub fn projects_dir(&self) -> PathBuf {
		expand_tilde(&self.projects_dir)
	}

	pub fn log_path(&self) -> PathBuf {
		expand_tilde(&self.log_file)
	}

	pub fn marker_path(&self) -> PathBuf {
		expand_tilde(&self.marker)
	}

	pub fn node(&self, name: &str) -> Option<&Node> {
		self.nodes.iter().find(|n| n.name == name)
	}

	pub fn node_names(&self) -> Vec<&str> {
		self.nodes.iter().map(|n| n.name.as_str()).collect()
	}
}

pub fn parse(content: &str) -> Result<Config, String> {
	let config: Config = toml::from_str(content).map_err(|e| e.to_string())?;
	let mut seen = Vec::new();
	for node in &config.nodes {
		if seen.contains(&node.name.as_str()) {
			return Err(format!("node '{}' is defined twice", node.name));
		}
		seen.push(node.name.as_str());
	}
	Ok(config)
}

pub fn load(path: &Path) -> Result<Config, String> {
	let content = std::fs::read_to_string(path)
		.map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
	parse(&content).map_err(|e| format!("failed to parse {}: {}", path.display(), e))
}

fn expand_tilde(path: &str) -> PathBuf {
	if let Some(rest) = path.strip_prefix("~/") {
		if let Ok(home) = std::env::var("HOME") {
			return PathBuf::from(home).join(rest);
		}
	}
	PathBuf::from(path)
}
