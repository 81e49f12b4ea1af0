use std::collections::{BTreeSet, VecDeque};

use itertools::Itertools;

use super::bag::Bag;
use super::bvm::LayerSum;
use super::error::Result;
use super::shared::Side;
use super::timeout::Timeout;
use super::uexpr::{PredKind, UTerm, UVar};

/// A bound variable offered as common tuple of a layer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Candidate {
	pub index: usize,
	pub var: UVar,
	pub table: Option<String>,
}

/// How much evidence a decision needs; relaxed only when nothing else moves.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Mode {
	Strict,
	Pattern,
	Forced,
}

/// Decides, for one layer, which variable of every summation joins the common tuple.
pub struct HeuristicBoundVarMatcher<'a> {
	scope: &'a [LayerSum],
	tuple: &'a str,
	output: &'a str,
	timeout: &'a Timeout,
}

/// Sort hashes of the atoms of `term` that mention `base`.
pub fn profile(term: &UTerm, base: &str) -> Bag<u64> {
	term.atoms().into_iter().filter(|a| a.mentions(base)).map(UTerm::sort_hash).collect()
}

/// Pairs `(out column, column)` of equalities `out_col(output) = col(base)`.
fn output_links(term: &UTerm, output: &str, base: &str) -> BTreeSet<(String, String)> {
	term.atoms()
		.into_iter()
		.filter_map(|atom| match atom {
			UTerm::Pred(PredKind::Eq, args) if args.len() == 2 => match (&args[0], &args[1]) {
				(UTerm::Var(UVar::Proj(oc, o)), UTerm::Var(UVar::Proj(c, b)))
				| (UTerm::Var(UVar::Proj(c, b)), UTerm::Var(UVar::Proj(oc, o)))
					if o == output && b == base =>
				{
					Some((oc.clone(), c.clone()))
				},
				_ => None,
			},
			_ => None,
		})
		.collect()
}

/// Position of the membership atom of `base` among the table atoms of `term`.
fn table_position(term: &UTerm, base: &str) -> Option<usize> {
	term.atoms()
		.into_iter()
		.filter(|a| matches!(a, UTerm::Table(..)))
		.position(|a| matches!(a, UTerm::Table(_, UVar::Base(b)) if b == base))
}

fn unique<T: Clone>(items: &[&T]) -> Option<T> {
	match items {
		[one] => Some((*one).clone()),
		_ => None,
	}
}

impl<'a> HeuristicBoundVarMatcher<'a> {
	pub fn new(scope: &'a [LayerSum], tuple: &'a str, output: &'a str, timeout: &'a Timeout) -> Self {
		HeuristicBoundVarMatcher { scope, tuple, output, timeout }
	}

	pub fn candidates(&self) -> Vec<Candidate> {
		self.scope
			.iter()
			.enumerate()
			.flat_map(|(index, sum)| {
				sum.vars.iter().map(move |var| Candidate {
					index,
					var: var.clone(),
					table: sum.table_of(var).map(str::to_string),
				})
			})
			.collect()
	}

	fn options(&self, index: usize, table: Option<&str>) -> Vec<UVar> {
		let sum = &self.scope[index];
		sum.vars.iter().filter(|v| sum.table_of(v) == table).cloned().collect()
	}

	/// The candidate matchable in the most other summations; earlier candidates win ties.
	pub fn common_tuple(&self) -> Option<Candidate> {
		let mut best: Option<(usize, Candidate)> = None;
		for candidate in self.candidates() {
			let reach = (0..self.scope.len())
				.filter(|&j| j != candidate.index && !self.options(j, candidate.table.as_deref()).is_empty())
				.count();
			if best.as_ref().is_none_or(|(r, _)| reach > *r) {
				best = Some((reach, candidate));
			}
		}
		best.map(|(_, c)| c)
	}

	/// The matched variable of every summation in scope, in scope order.
	pub fn decide(&self) -> Result<Vec<Option<UVar>>> {
		let n = self.scope.len();
		let Some(common) = self.common_tuple() else {
			return Ok(vec![None; n]);
		};
		log::trace!("Common tuple {} of summation {}", common.var, common.index);
		let mut matched: Vec<Option<UVar>> = vec![None; n];
		let mut renamed: Vec<Option<UTerm>> = vec![None; n];
		renamed[common.index] = Some(self.scope[common.index].body.rename(common.var.base(), self.tuple));
		matched[common.index] = Some(common.var.clone());

		let options = (0..n).map(|i| self.options(i, common.table.as_deref())).collect_vec();
		let mut queue: VecDeque<usize> =
			(0..n).filter(|&i| i != common.index && !options[i].is_empty()).collect();
		let mut delayed = vec![];
		let mut mode = Mode::Strict;
		let mut progress = false;
		loop {
			self.timeout.check()?;
			if let Some(i) = queue.pop_front() {
				match self.try_decide(i, &options[i], &renamed, mode) {
					Some(var) => {
						log::trace!("{:?} match {} in summation {}", mode, var, i);
						renamed[i] = Some(self.scope[i].body.rename(var.base(), self.tuple));
						matched[i] = Some(var);
						progress = true;
						if mode == Mode::Forced {
							mode = Mode::Strict;
						}
					},
					None => delayed.push(i),
				}
				continue;
			}
			if delayed.is_empty() {
				break;
			}
			mode = match (progress, mode) {
				(true, _) => Mode::Strict,
				(false, Mode::Strict) => Mode::Pattern,
				(false, _) => Mode::Forced,
			};
			progress = false;
			queue.extend(delayed.drain(..));
		}
		Ok(matched)
	}

	fn baseline<'r>(&self, renamed: &'r [Option<UTerm>], side: Side) -> Vec<&'r UTerm> {
		renamed
			.iter()
			.enumerate()
			.filter(|(j, _)| self.scope[*j].side == side)
			.filter_map(|(_, r)| r.as_ref())
			.collect()
	}

	fn try_decide(&self, i: usize, options: &[UVar], renamed: &[Option<UTerm>], mode: Mode) -> Option<UVar> {
		if let [only] = options {
			return Some(only.clone());
		}
		let side = self.scope[i].side;
		let opposite = self.baseline(renamed, side.opposite());
		match mode {
			Mode::Strict if opposite.is_empty() => None,
			Mode::Strict => unique(&self.closest(i, options, &opposite)),
			Mode::Pattern => {
				let base = if opposite.is_empty() { self.baseline(renamed, side) } else { opposite };
				let tied = self.closest(i, options, &base);
				unique(&tied).or_else(|| self.linked(i, &tied, &base)).or_else(|| self.positional(i, &tied, &base))
			},
			Mode::Forced => {
				let decided = renamed.iter().flatten().collect_vec();
				Some(self.overlapping(i, options, &decided))
			},
		}
	}

	/// Options at the least bag distance from any baseline summation.
	fn closest<'o>(&self, i: usize, options: &'o [UVar], base: &[&UTerm]) -> Vec<&'o UVar> {
		let targets = base.iter().map(|b| profile(b, self.tuple)).collect_vec();
		let scored = options
			.iter()
			.map(|v| {
				let p = profile(&self.scope[i].body.rename(v.base(), self.tuple), self.tuple);
				(v, targets.iter().map(|t| p.difference_size(t)).min().unwrap_or(usize::MAX))
			})
			.collect_vec();
		let min = scored.iter().map(|(_, d)| *d).min();
		scored.into_iter().filter(|(_, d)| Some(*d) == min).map(|(v, _)| v).collect()
	}

	fn linked(&self, i: usize, tied: &[&UVar], base: &[&UTerm]) -> Option<UVar> {
		let links: BTreeSet<_> = base.iter().flat_map(|b| output_links(b, self.output, self.tuple)).collect();
		let hits = tied
			.iter()
			.filter(|v| output_links(&self.scope[i].body, self.output, v.base()).iter().any(|l| links.contains(l)))
			.copied()
			.collect_vec();
		unique(&hits)
	}

	fn positional(&self, i: usize, tied: &[&UVar], base: &[&UTerm]) -> Option<UVar> {
		let positions: BTreeSet<usize> = base.iter().filter_map(|b| table_position(b, self.tuple)).collect();
		let hits = tied
			.iter()
			.filter(|v| table_position(&self.scope[i].body, v.base()).is_some_and(|p| positions.contains(&p)))
			.copied()
			.collect_vec();
		unique(&hits)
	}

	/// Option sharing the most atoms with everything decided so far; first one on ties.
	fn overlapping(&self, i: usize, options: &[UVar], decided: &[&UTerm]) -> UVar {
		let mut pool = Bag::new();
		for d in decided {
			pool.extend_from(&profile(d, self.tuple));
		}
		let mut best = (0, &options[0]);
		for v in options {
			let overlap = profile(&self.scope[i].body.rename(v.base(), self.tuple), self.tuple).intersection_size(&pool);
			if overlap > best.0 {
				best = (overlap, v);
			}
		}
		best.1.clone()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn var(name: &str) -> UVar {
		UVar::Base(name.to_string())
	}

	fn eq(a: UTerm, b: UTerm) -> UTerm {
		UTerm::eq(a, b)
	}

	fn decide(left: UTerm, right: UTerm) -> Vec<Option<UVar>> {
		let scope = LayerSum::scope(&left, &right);
		let timeout = Timeout::never();
		HeuristicBoundVarMatcher::new(&scope, "#bv0", "out", &timeout).decide().unwrap()
	}

	#[test]
	fn strict_prefers_agreeing_predicates() {
		let left = UTerm::sum(["x"], UTerm::mul([UTerm::table("r", "x"), eq(UTerm::attr("a", "out"), UTerm::attr("a", "x"))]));
		let right = UTerm::sum(
			["y1", "y2"],
			UTerm::mul([UTerm::table("r", "y1"), UTerm::table("r", "y2"), eq(UTerm::attr("a", "out"), UTerm::attr("a", "y1"))]),
		);
		assert_eq!(decide(left, right), vec![Some(var("x")), Some(var("y1"))]);
	}

	#[test]
	fn output_linkage_breaks_ties() {
		let left = UTerm::sum(
			["x"],
			UTerm::mul([
				UTerm::table("r", "x"),
				eq(UTerm::attr("a", "x"), UTerm::attr("a", "out")),
				UTerm::pred(PredKind::Gt, [UTerm::attr("b", "x"), UTerm::int(0)]),
			]),
		);
		let right = UTerm::sum(
			["y1", "y2"],
			UTerm::mul([
				UTerm::table("r", "y2"),
				UTerm::table("r", "y1"),
				eq(UTerm::attr("a", "y1"), UTerm::attr("a", "out")),
				UTerm::pred(PredKind::Gt, [UTerm::attr("b", "y2"), UTerm::int(0)]),
			]),
		);
		assert_eq!(decide(left, right)[1], Some(var("y1")));
	}

	#[test]
	fn forced_choice_always_decides() {
		let left = UTerm::sum(["x", "z1", "z2"], UTerm::mul([UTerm::table("s", "z1"), UTerm::table("s", "z2"), UTerm::table("r", "x")]));
		let right = UTerm::sum(
			["y1", "y2"],
			UTerm::mul([UTerm::table("r", "y1"), UTerm::table("r", "y2"), eq(UTerm::attr("a", "y1"), UTerm::attr("a", "y2"))]),
		);
		assert_eq!(decide(left, right), vec![Some(var("x")), Some(var("y1"))]);
	}

	#[test]
	fn summations_over_other_tables_stay_unmatched() {
		let left = UTerm::sum(["x"], UTerm::table("r", "x"));
		let right = UTerm::sum(["y"], UTerm::table("s", "y"));
		assert_eq!(decide(left, right), vec![Some(var("x")), None]);
	}
}
