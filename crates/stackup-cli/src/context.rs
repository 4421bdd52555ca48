use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use stackmux::{AssemblyOptions, Node, Plain, Style, Styled, Termination};

use crate::config::Config;
use crate::error::StartupError;
use crate::options::Options;

/// Everything a run needs to know, built once in `main` and shared by
/// reference with the setup runner and the control loop.
pub struct Context {
	pub options: Options,
	pub config: Config,
	pub style: Arc<dyn Style>,
	pub termination: Termination,
}

impl Context {
	pub fn new(options: Options, config: Config) -> Self {
		let plain = options.no_color
			|| std::env::var_os("NO_COLOR").is_some()
			|| !std::io::stdout().is_terminal();
		let style: Arc<dyn Style> = if plain { Arc::new(Plain) } else { Arc::new(Styled) };
		let termination = Termination {
			grace: Duration::from_secs(config.grace_secs),
			..Termination::default()
		};
		Self { options, config, style, termination }
	}

	pub fn assembly(&self, first_seq: u32) -> AssemblyOptions {
		AssemblyOptions {
			projects_dir: self.config.projects_dir(),
			except: self.options.except.clone(),
			vars: self.config.vars.clone(),
			test_mode: self.options.test_mode,
			setup_policy: self.config.setup,
			first_seq,
		}
	}

	/// Nodes named on the command line, in the order given.
	pub fn selected_nodes(&self) -> Result<Vec<Node>, StartupError> {
		if self.options.nodes.is_empty() {
			return Err(StartupError::NoNodes(self.config.node_names().join(", ")));
		}
		self.options
			.nodes
			.iter()
			.map(|name| {
				self.config.node(name).cloned().ok_or_else(|| {
					StartupError::Config(format!(
						"unknown node '{}' (available: {})",
						name,
						self.config.node_names().join(", ")
					))
				})
			})
			.collect()
	}

	pub fn marker_path(&self) -> PathBuf {
		self.config.marker_path()
	}

	pub fn log_path(&self) -> PathBuf {
		self.config.log_path()
	}
}
