use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use uexpr_equiv::pipeline::timeout::Timeout;
use uexpr_equiv::{Config, Input, verify_with};

#[derive(Parser)]
#[command(name = "uexpr-equiv", version, about = "Decide bag equivalence of U-expression pairs")]
struct Args {
	/// Print the LIA* formula and the full report
	#[arg(long)]
	debug: bool,
	/// Time limit per pair in milliseconds (0 for none)
	#[arg(long, default_value_t = 10_000)]
	timeout_ms: u64,
	/// Time limit per solver call in milliseconds
	#[arg(long, default_value_t = 2_000)]
	solver_timeout_ms: u32,
	/// Number of matchings to try per pair
	#[arg(long, default_value_t = 8)]
	bvm_limit: usize,
	/// Input JSON files, one pair each
	files: Vec<PathBuf>,
}

fn main() -> anyhow::Result<()> {
	env_logger::init();
	let args = Args::parse();
	let config = Config {
		debug: args.debug,
		timeout_ms: (args.timeout_ms > 0).then_some(args.timeout_ms),
		solver_timeout_ms: args.solver_timeout_ms,
		bvm_limit: args.bvm_limit,
	};
	let interrupt = Arc::new(AtomicBool::new(false));
	let flag = interrupt.clone();
	ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)).context("installing the Ctrl-C handler")?;

	for path in &args.files {
		let json = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
		let input: Input = serde_json::from_str(&json).with_context(|| format!("parsing {}", path.display()))?;
		let timeout = Timeout::with_interrupt(config.timeout_ms.map(Duration::from_millis), interrupt.clone());
		match verify_with(input, &config, &timeout) {
			Ok(report) => {
				println!("{}\t{}", path.display(), report.verdict);
				if config.debug {
					println!("{}", serde_json::to_string_pretty(&report)?);
				}
			},
			Err(e) => println!("{}\terror: {}", path.display(), e),
		}
	}
	Ok(())
}
