use owo_colors::{AnsiColors, OwoColorize};

/// Text styling used wherever console output is formatted. Picked once at
/// startup: [`Styled`] for terminals, [`Plain`] otherwise.
pub trait Style: Send + Sync {
	/// `[project]` prefix, colored per project.
	fn project(&self, name: &str) -> String;
	fn heading(&self, text: &str) -> String;
	fn bold(&self, text: &str) -> String;
	fn dim(&self, text: &str) -> String;
	fn good(&self, text: &str) -> String;
	fn bad(&self, text: &str) -> String;
}

pub struct Styled;

pub struct Plain;

const PALETTE: [AnsiColors; 6] = [
	AnsiColors::Cyan,
	AnsiColors::Magenta,
	AnsiColors::Yellow,
	AnsiColors::Green,
	AnsiColors::Blue,
	AnsiColors::BrightRed,
];

fn palette_color(name: &str) -> AnsiColors {
	let hash = name.bytes().fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
	PALETTE[hash % PALETTE.len()]
}

impl Style for Styled {
	fn project(&self, name: &str) -> String {
		format!("[{}]", name).color(palette_color(name)).to_string()
	}

	fn heading(&self, text: &str) -> String {
		text.cyan().bold().to_string()
	}

	fn bold(&self, text: &str) -> String {
		text.bold().to_string()
	}

	fn dim(&self, text: &str) -> String {
		text.dimmed().to_string()
	}

	fn good(&self, text: &str) -> String {
		text.green().to_string()
	}

	fn bad(&self, text: &str) -> String {
		text.red().to_string()
	}
}

impl Style for Plain {
	fn project(&self, name: &str) -> String {
		format!("[{}]", name)
	}

	fn heading(&self, text: &str) -> String {
		text.to_string()
	}

	fn bold(&self, text: &str) -> String {
		text.to_string()
	}

	fn dim(&self, text: &str) -> String {
		text.to_string()
	}

	fn good(&self, text: &str) -> String {
		text.to_string()
	}

	fn bad(&self, text: &str) -> String {
		text.to_string()
	}
}
