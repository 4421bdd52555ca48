mod config;
mod context;
mod control;
mod error;
mod options;
mod setup;

use std::sync::Arc;
use std::time::Duration;

use stackmux::{LineSink, Multiplexer, RunConfiguration, ShutdownTrigger, ShutdownWatcher};
use tokio::io::BufReader;
use tracing::Level;

use context::Context;
use control::ControlLoop;
use error::StartupError;

const WATCH_INTERVAL: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() {
	let args: Vec<String> = std::env::args().skip(1).collect();
	let options = match options::parse(&args) {
		Ok(options) => options,
		Err(e) => {
			eprintln!("error: {}", e);
			eprintln!();
			options::print_usage();
			std::process::exit(2);
		}
	};
	if options.help {
		options::print_usage();
		return;
	}

	init_tracing(options.debug);

	match run(options).await {
		// the blocking stdin reader would otherwise hold the runtime open
		Ok(()) => std::process::exit(0),
		Err(e) => {
			eprintln!("error: {}", e);
			std::process::exit(e.exit_code());
		}
	}
}

fn init_tracing(debug: bool) {
	tracing_subscriber::fmt()
		.with_max_level(if debug { Level::DEBUG } else { Level::INFO })
		.with_writer(std::io::stderr)
		.with_target(false)
		.init();
}

async fn run(options: options::Options) -> Result<(), StartupError> {
	let config = config::load(&options.config).map_err(StartupError::Config)?;
	let ctx = Arc::new(Context::new(options, config));

	let watcher = ShutdownWatcher::new(ctx.marker_path(), WATCH_INTERVAL);
	watcher.clear();
	tracing::debug!("watching for {}", watcher.marker().display());

	let nodes = ctx.selected_nodes()?;
	let mut live = RunConfiguration::assemble(&nodes, &ctx.assembly(1));
	if live.groups.is_empty() {
		tracing::warn!("nothing to run for {:?}", ctx.options.nodes);
	}

	for group in &live.groups {
		setup::run_setup(group, &ctx).await?;
	}

	for unit in live.units_mut() {
		if let Err(e) = unit.spawn(&ctx.config.shell) {
			tracing::error!("{} #{}: {}", unit.project, unit.seq, e);
		}
	}

	let mut mux = Multiplexer::new(live.snapshot(), Arc::clone(&ctx.style));
	if ctx.options.log {
		let path = ctx.log_path();
		match LineSink::open(&path) {
			Ok(sink) => {
				println!("logging to {}", path.display());
				mux.set_sink(Some(sink)).await;
				mux.set_silent(true).await;
			}
			Err(e) => tracing::error!("failed to open {}: {}", path.display(), e),
		}
	}
	mux.start();

	let trigger = ShutdownTrigger::new();
	let watch_handle = watcher.spawn(trigger.clone());
	let mut control = ControlLoop::new(Arc::clone(&ctx), live, mux, trigger.clone());
	println!("{}", ctx.style.dim("type ? for help"));

	tokio::select! {
		result = control.run(BufReader::new(tokio::io::stdin())) => {
			if let Err(e) = result {
				tracing::error!("failed to read input: {}", e);
			}
		}
		_ = tokio::signal::ctrl_c() => {
			tracing::info!("interrupted");
		}
		_ = trigger.fired() => {}
	}

	control.shutdown().await;
	watch_handle.abort();
	Ok(())
}
