use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::pipeline::bvm::HeuristicSeedGenerator;
use crate::pipeline::enumerate::{BvmEnumerator, HeuristicBvmEnumerator};
use crate::pipeline::error::{Error, Result};
use crate::pipeline::lia::LiaTerm;
use crate::pipeline::replay::{Database, replay};
use crate::pipeline::shared::SchemaMap;
use crate::pipeline::smt::{Assignment, DecisionProcedure, Outcome, SatOutcome, Z3Bridge};
use crate::pipeline::timeout::Timeout;
use crate::pipeline::translate::LiaStarTranslator;
use crate::pipeline::uexpr::UTerm;

pub mod bag;
pub mod bvm;
pub mod enumerate;
pub mod error;
pub mod evaluation;
pub mod lia;
pub mod matcher;
pub mod replay;
pub mod shared;
pub mod smt;
pub mod star;
pub mod sumtree;
pub mod timeout;
pub mod translate;
pub mod uexpr;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
	/// Keep the LIA* formula in the report and log it.
	pub debug: bool,
	pub timeout_ms: Option<u64>,
	pub solver_timeout_ms: u32,
	pub bvm_limit: usize,
}

impl Default for Config {
	fn default() -> Self {
		Config { debug: false, timeout_ms: Some(10_000), solver_timeout_ms: 2_000, bvm_limit: 8 }
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Input {
	pub schemas: SchemaMap,
	pub output: String,
	pub queries: (UTerm, UTerm),
}

/// A model separating both terms and the database it describes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Witness {
	pub assignment: Assignment,
	pub database: Database,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Verdict {
	Equivalent,
	Different(Option<Witness>),
	/// Timeout or solver failure; never evidence either way.
	Inconclusive(String),
}

impl Display for Verdict {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Verdict::Equivalent => write!(f, "EQUIVALENT"),
			Verdict::Different(_) => write!(f, "DIFFERENT"),
			Verdict::Inconclusive(reason) => write!(f, "INCONCLUSIVE ({})", reason),
		}
	}
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Stats {
	pub trivial: bool,
	pub timed_out: bool,
	pub bvms_tried: usize,
	pub seed_duration: Duration,
	pub translate_duration: Duration,
	pub star_duration: Duration,
	pub smt_duration: Duration,
	pub replay_duration: Duration,
	pub total_duration: Duration,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Report {
	pub verdict: Verdict,
	pub stats: Stats,
	/// The last LIA* formula tried, when `debug` is set.
	pub formula: Option<String>,
}

pub fn verify(input: Input, config: &Config) -> Result<Report> {
	verify_with(input, config, &Timeout::new(config.timeout_ms.map(Duration::from_millis)))
}

/// Decides a pair under an externally owned timeout.
///
/// Running out of time yields an inconclusive report; structural and
/// translation failures are returned as errors.
pub fn verify_with(input: Input, config: &Config, timeout: &Timeout) -> Result<Report> {
	let start = Instant::now();
	let mut stats = Stats::default();
	let mut formula = None;
	let verdict = match check(input, config, timeout, &mut stats, &mut formula) {
		Ok(verdict) => verdict,
		Err(Error::Timeout) => {
			stats.timed_out = true;
			Verdict::Inconclusive("timed out".to_string())
		},
		Err(e) => return Err(e),
	};
	stats.total_duration = start.elapsed();
	log::info!("{} after {:.4?}", verdict, stats.total_duration);
	Ok(Report { verdict, stats, formula })
}

fn check(
	Input { schemas, output, queries: (left, right) }: Input,
	config: &Config,
	timeout: &Timeout,
	stats: &mut Stats,
	formula: &mut Option<String>,
) -> Result<Verdict> {
	log::info!("Left:\n{}", left);
	log::info!("Right:\n{}", right);
	if left == right {
		log::debug!("Early exit: syntactically equal");
		stats.trivial = true;
		return Ok(Verdict::Equivalent);
	}
	let mut schemas = schemas;
	let mut counter = 0;
	let left = left.freshen(&mut schemas, &mut counter);
	let right = right.freshen(&mut schemas, &mut counter);

	let seed_start = Instant::now();
	log::debug!("Seed matching started");
	let seed = HeuristicSeedGenerator::new(&left, &right, &output, timeout).generate()?;
	seed.validate(&left, &right)?;
	stats.seed_duration = seed_start.elapsed();
	log::debug!("Seed matching finished - {:.4?}", stats.seed_duration);
	log::info!("Seed: {}", seed);

	let oracle = Z3Bridge::new(config.solver_timeout_ms);
	// Table counts and tuple values are universal in the proof and free in the model search.
	let none = BTreeSet::new();
	let mut reason = "no matching decided the pair".to_string();
	let mut bvms = HeuristicBvmEnumerator::new(&left, &right, seed, config.bvm_limit.max(1));
	while let Some(bvm) = bvms.next() {
		timeout.check()?;
		stats.bvms_tried += 1;

		let translate_start = Instant::now();
		let lia = LiaStarTranslator::new(&schemas, &bvm, timeout).translate(&left, &right)?;
		stats.translate_duration += translate_start.elapsed();
		if config.debug {
			log::info!("LIA* under {}:\n{}", bvm, lia);
			*formula = Some(lia.to_string());
		}

		let star_start = Instant::now();
		let over = star::over_approximate(&lia.term, &oracle, timeout)?;
		stats.star_duration += star_start.elapsed();
		log::trace!("Over-approximation: {}", over);

		let smt_start = Instant::now();
		let proof = oracle.check_valid(&LiaTerm::not(over), &none, &none, timeout)?;
		stats.smt_duration += smt_start.elapsed();
		match proof {
			Outcome::Valid => return Ok(Verdict::Equivalent),
			Outcome::Invalid(_) => log::debug!("Over-approximation satisfiable under {}", bvm),
			Outcome::Unknown(why) => reason = why,
		}

		let smt_start = Instant::now();
		let model = oracle.check_sat(&lia.term.under_approximate(), &none, &none, timeout)?;
		stats.smt_duration += smt_start.elapsed();
		match model {
			SatOutcome::Sat(assignment) => {
				let replay_start = Instant::now();
				let database = Database::from_assignment(&assignment, &lia.tuples, &output, &schemas);
				let l = replay(&left, &database, &schemas, &output);
				let r = replay(&right, &database, &schemas, &output);
				stats.replay_duration += replay_start.elapsed();
				match (l, r) {
					(Some(l), Some(r)) if l != r => {
						log::info!("Counterexample ({} vs {}):\n{}", l, r, database);
						return Ok(Verdict::Different(Some(Witness { assignment, database })));
					},
					(l, r) => log::debug!("Replay did not separate the pair: {:?} vs {:?}", l, r),
				}
			},
			SatOutcome::Unsat => log::debug!("Under-approximation unsatisfiable under {}", bvm),
			SatOutcome::Unknown(why) => reason = why,
		}
	}
	Ok(Verdict::Inconclusive(reason))
}
