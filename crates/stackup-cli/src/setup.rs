use std::process::Stdio;

use stackmux::{ProcessGroup, Runtime};
use tokio::process::Command;

use crate::context::Context;
use crate::error::StartupError;

/// Runs the group's setup list (test-setup list in test mode) to completion,
/// one command at a time. The first failure stops the list.
pub async fn run_setup(group: &ProcessGroup, ctx: &Context) -> Result<(), StartupError> {
	if group.skip_setup {
		tracing::info!("{}: setup skipped", group.project);
		return Ok(());
	}
	let runtime = Runtime::detect(&group.dir);
	for command in group.setup_commands(ctx.options.test_mode) {
		println!("{} {}", ctx.style.project(&group.project), ctx.style.dim(&format!("$ {}", command)));
		let status = Command::new(&ctx.config.shell.program)
			.args(&ctx.config.shell.args)
			.arg(runtime.wrap(&group.dir, command))
			.stdin(Stdio::null())
			.status()
			.await
			.map_err(|source| StartupError::SetupIo {
				project: group.project.clone(),
				command: command.clone(),
				source,
			})?;
		if !status.success() {
			return Err(StartupError::Setup {
				project: group.project.clone(),
				command: command.clone(),
				// killed by a signal
				code: status.code().unwrap_or(1),
			});
		}
	}
	Ok(())
}
