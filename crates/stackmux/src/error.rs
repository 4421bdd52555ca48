use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
	#[error("failed to open pty: {0}")]
	Pty(String),

	#[error("failed to spawn `{command}`: {reason}")]
	Spawn { command: String, reason: String },

	#[error("spawned `{0}` but the OS reported no pid")]
	NoPid(String),

	#[error(transparent)]
	Io(#[from] std::io::Error),
}
