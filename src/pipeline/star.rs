use std::collections::BTreeSet;

use imbl::Vector;
use itertools::Itertools;

use super::error::Result;
use super::lia::{LiaSum, LiaTerm, LiaVar};
use super::shared::Side;
use super::smt::{DecisionProcedure, Outcome};
use super::timeout::Timeout;

/// Linear invariants closed under vector addition and holding at zero.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Template {
	Nonneg(usize),
	Zero(usize),
	Equal(usize, usize),
	AtMost(usize, usize),
	Balanced,
	/// Only closed under addition when both components are nonnegative.
	ZeroTogether(usize, usize),
}

impl Template {
	fn instantiate(self, vars: &Vector<LiaVar>, sides: &Vector<Side>) -> LiaTerm {
		let v = |i: usize| LiaTerm::var(&vars[i]);
		match self {
			Template::Nonneg(i) => LiaTerm::le(LiaTerm::zero(), v(i)),
			Template::Zero(i) => LiaTerm::eq(v(i), LiaTerm::zero()),
			Template::Equal(i, j) => LiaTerm::eq(v(i), v(j)),
			Template::AtMost(i, j) => LiaTerm::le(v(i), v(j)),
			Template::Balanced => {
				let side = |s: Side| {
					LiaTerm::Plus(sides.iter().enumerate().filter(|(_, t)| **t == s).map(|(i, _)| v(i)).collect())
				};
				LiaTerm::eq(side(Side::Left), side(Side::Right))
			},
			Template::ZeroTogether(i, j) => {
				LiaTerm::iff(LiaTerm::eq(v(i), LiaTerm::zero()), LiaTerm::eq(v(j), LiaTerm::zero()))
			},
		}
	}
}

fn templates(sum: &LiaSum) -> Vec<Template> {
	let n = sum.inner.len();
	let mut out = (0..n).map(Template::Nonneg).chain((0..n).map(Template::Zero)).collect_vec();
	for (i, j) in (0..n).tuple_combinations() {
		out.extend([Template::Equal(i, j), Template::AtMost(i, j), Template::AtMost(j, i)]);
	}
	let sides: BTreeSet<Side> = sum.sides.iter().copied().collect();
	if sides.len() == 2 {
		out.push(Template::Balanced);
	}
	out.extend((0..n).tuple_combinations().map(|(i, j)| Template::ZeroTogether(i, j)));
	out
}

/// Replaces every iterated sum by linear invariants of its components.
///
/// An invariant is kept when the sum body implies it for every summand; it
/// then holds of any finite sum of summands. Iterated sums only occur as
/// conjuncts, so the result is implied by the input.
pub fn over_approximate(term: &LiaTerm, oracle: &dyn DecisionProcedure, timeout: &Timeout) -> Result<LiaTerm> {
	match term {
		LiaTerm::Sum(sum) => {
			let body = over_approximate(&sum.body, oracle, timeout)?;
			Ok(LiaTerm::and(invariants(sum, &body, oracle, timeout)?))
		},
		t if !t.has_sum() => Ok(t.clone()),
		t => {
			let mut failure = None;
			let out = t.map_children(&mut |c| match over_approximate(c, oracle, timeout) {
				Ok(c) => c,
				Err(e) => {
					failure.get_or_insert(e);
					c.clone()
				},
			});
			match failure {
				Some(e) => Err(e),
				None => Ok(out),
			}
		},
	}
}

fn invariants(sum: &LiaSum, body: &LiaTerm, oracle: &dyn DecisionProcedure, timeout: &Timeout) -> Result<Vec<LiaTerm>> {
	let mut nonneg = BTreeSet::new();
	let mut kept = vec![];
	// Every variable is universal: an existential summand could simply falsify the body.
	let none = BTreeSet::new();
	for template in templates(sum) {
		if let Template::ZeroTogether(i, j) = template
			&& !(nonneg.contains(&i) && nonneg.contains(&j))
		{
			continue;
		}
		let claim = LiaTerm::implies(body.clone(), template.instantiate(&sum.inner, &sum.sides));
		match oracle.check_valid(&claim, &none, &none, timeout)? {
			Outcome::Valid => {
				log::trace!("Invariant {:?} holds for ({})", template, sum.outer.iter().map(|u| &u.name).format(", "));
				if let Template::Nonneg(i) = template {
					nonneg.insert(i);
				}
				kept.push(template.instantiate(&sum.outer, &sum.sides));
			},
			Outcome::Invalid(_) => {},
			Outcome::Unknown(reason) => log::debug!("Dropped invariant {:?}: {}", template, reason),
		}
	}
	Ok(kept)
}

#[cfg(test)]
mod tests {
	use imbl::vector;

	use std::cell::RefCell;

	use super::*;
	use crate::pipeline::lia::LiaType;
	use crate::pipeline::smt::{SatOutcome, Z3Bridge};

	struct Clueless;

	impl DecisionProcedure for Clueless {
		fn check_valid(&self, _: &LiaTerm, _: &BTreeSet<LiaVar>, _: &BTreeSet<LiaVar>, _: &Timeout) -> Result<Outcome> {
			Ok(Outcome::Unknown("clueless".into()))
		}

		fn check_sat(&self, _: &LiaTerm, _: &BTreeSet<LiaVar>, _: &BTreeSet<LiaVar>, _: &Timeout) -> Result<SatOutcome> {
			Ok(SatOutcome::Unknown("clueless".into()))
		}
	}

	/// Records the sizes of the quantified sets and proves nothing.
	#[derive(Default)]
	struct Recording {
		calls: RefCell<Vec<(usize, usize)>>,
	}

	impl DecisionProcedure for Recording {
		fn check_valid(&self, _: &LiaTerm, all: &BTreeSet<LiaVar>, some: &BTreeSet<LiaVar>, _: &Timeout) -> Result<Outcome> {
			self.calls.borrow_mut().push((all.len(), some.len()));
			Ok(Outcome::Invalid(Default::default()))
		}

		fn check_sat(&self, _: &LiaTerm, _: &BTreeSet<LiaVar>, _: &BTreeSet<LiaVar>, _: &Timeout) -> Result<SatOutcome> {
			Ok(SatOutcome::Unsat)
		}
	}

	fn int(name: &str) -> LiaVar {
		LiaVar::new(name, LiaType::Int)
	}

	fn star(left: LiaTerm, right: LiaTerm) -> LiaTerm {
		let body = LiaTerm::and([
			LiaTerm::eq(LiaTerm::var(&int("v0")), left),
			LiaTerm::eq(LiaTerm::var(&int("v1")), right),
		]);
		LiaTerm::Sum(Box::new(LiaSum {
			outer: vector![int("u0"), int("u1")],
			inner: vector![int("v0"), int("v1")],
			sides: vector![Side::Left, Side::Right],
			body,
		}))
	}

	fn proves_equal(over: LiaTerm) -> bool {
		let claim = LiaTerm::implies(over, LiaTerm::eq(LiaTerm::var(&int("u0")), LiaTerm::var(&int("u1"))));
		let none = BTreeSet::new();
		Z3Bridge::default().check_valid(&claim, &none, &none, &Timeout::never()).unwrap() == Outcome::Valid
	}

	#[test]
	fn shared_summands_keep_equality() {
		let n = LiaTerm::Var(LiaVar::new("n", LiaType::Nat));
		let over = over_approximate(&star(n.clone(), n), &Z3Bridge::default(), &Timeout::never()).unwrap();
		assert!(!over.has_sum());
		assert!(proves_equal(over));
	}

	#[test]
	fn independent_summands_lose_equality() {
		let n = LiaTerm::Var(LiaVar::new("n", LiaType::Nat));
		let m = LiaTerm::Var(LiaVar::new("m", LiaType::Nat));
		let over = over_approximate(&star(n, m), &Z3Bridge::default(), &Timeout::never()).unwrap();
		assert!(!proves_equal(over));
	}

	#[test]
	fn invariant_checks_leave_every_variable_free() {
		let n = LiaTerm::Var(LiaVar::new("n", LiaType::Nat));
		let oracle = Recording::default();
		let over = over_approximate(&star(n.clone(), n), &oracle, &Timeout::never()).unwrap();
		assert_eq!(over, LiaTerm::And(Vector::new()));
		let calls = oracle.calls.into_inner();
		assert!(!calls.is_empty());
		assert!(calls.iter().all(|c| *c == (0, 0)));
	}

	#[test]
	fn unknown_candidates_are_dropped() {
		let t = LiaTerm::Var(LiaVar::new("t", LiaType::Nat));
		let term = LiaTerm::and([LiaTerm::lt(LiaTerm::zero(), t.clone()), star(t.clone(), t)]);
		let over = over_approximate(&term, &Clueless, &Timeout::never()).unwrap();
		let LiaTerm::And(conj) = over else { panic!("expected a conjunction") };
		assert_eq!(conj.len(), 2);
		assert_eq!(conj[1], LiaTerm::And(Vector::new()));
	}
}
