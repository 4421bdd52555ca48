use std::collections::HashSet;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
	pub config: PathBuf,
	pub test_mode: bool,
	pub log: bool,
	pub except: HashSet<String>,
	pub debug: bool,
	pub no_color: bool,
	pub help: bool,
	pub nodes: Vec<String>,
}

impl Default for Options {
	fn default() -> Self {
		Self {
			config: PathBuf::from("stackup.toml"),
			test_mode: false,
			log: false,
			except: HashSet::new(),
			debug: false,
			no_color: false,
			help: false,
			nodes: Vec::new(),
		}
	}
}

pub fn parse(args: &[String]) -> Result<Options, String> {
	let mut options = Options::default();
	let mut iter = args.iter();
	while let Some(arg) = iter.next() {
		match arg.as_str() {
			"-h" | "--help" => options.help = true,
			"-t" | "--test" => options.test_mode = true,
			"--log" => options.log = true,
			"--debug" => options.debug = true,
			"--no-color" => options.no_color = true,
			"-c" | "--config" => {
				let path = iter.next().ok_or_else(|| format!("{} needs a path", arg))?;
				options.config = PathBuf::from(path);
			}
			"-x" | "--except" => {
				let list = iter.next().ok_or_else(|| format!("{} needs a project list", arg))?;
				options.except.extend(
					list.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from),
				);
			}
			flag if flag.starts_with('-') => return Err(format!("unknown option: {}", flag)),
			node => options.nodes.push(node.to_string()),
		}
	}
	Ok(options)
}

pub fn print_usage() {
	eprintln!("stackup {} - run a multi-project environment in one console", env!("CARGO_PKG_VERSION"));
	eprintln!();
	eprintln!("usage: stackup [options] <node>...");
	eprintln!();
	eprintln!("  -c, --config <path>    config file (default: stackup.toml)");
	eprintln!("  -t, --test             run everything in test mode");
	eprintln!("  -x, --except <a,b>     skip these projects");
	eprintln!("      --log              copy output to the log file and silence the console");
	eprintln!("      --no-color         plain output");
	eprintln!("      --debug            verbose logging");
	eprintln!("  -h, --help             show this help");
}
