use thiserror::Error;

/// Failures that abort startup before the control loop runs.
#[derive(Debug, Error)]
pub enum StartupError {
	#[error("{project}: `{command}` failed with exit status {code}")]
	Setup { project: String, command: String, code: i32 },

	#[error("{project}: failed to run `{command}`: {source}")]
	SetupIo {
		project: String,
		command: String,
		#[source]
		source: std::io::Error,
	},

	#[error("{0}")]
	Config(String),

	#[error("no nodes selected (available: {0})")]
	NoNodes(String),
}

impl StartupError {
	pub fn exit_code(&self) -> i32 {
		match self {
			StartupError::Setup { code, .. } => *code,
			StartupError::SetupIo { .. } => 1,
			StartupError::Config(_) | StartupError::NoNodes(_) => 2,
		}
	}
}
