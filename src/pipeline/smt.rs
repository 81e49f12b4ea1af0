use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use itertools::Itertools;
use num::rational::Rational64;
use serde::{Deserialize, Serialize};
use z3::ast::{self, Ast, Bool, Dynamic, Int, Real, exists_const, forall_const};
use z3::{Config, Context, FuncDecl, Model, Params, SatResult, Solver, Sort, SortKind};

use super::error::{Error, Result};
use super::lia::{LiaTerm, LiaType, LiaVar};
use super::shared::Eval;
use super::timeout::Timeout;

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub enum Value {
	Int(i64),
	Real(Rational64),
	Str(String),
	Unknown(String),
}

impl Display for Value {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Value::Int(i) => write!(f, "{}", i),
			Value::Real(r) => write!(f, "{}", r),
			Value::Str(s) => write!(f, "{:?}", s),
			Value::Unknown(s) => write!(f, "{}", s),
		}
	}
}

/// Model values of the universally quantified variables, by name.
pub type Assignment = BTreeMap<String, Value>;

#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
	Valid,
	Invalid(Assignment),
	Unknown(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum SatOutcome {
	Sat(Assignment),
	Unsat,
	Unknown(String),
}

/// An SMT oracle for quantifier-free LIA extended with uninterpreted functions.
///
/// Variables neither listed as universal nor as existential are universal.
/// Natural-typed variables are constrained nonnegative in their quantifier.
pub trait DecisionProcedure {
	fn check_valid(
		&self,
		claim: &LiaTerm,
		universal: &BTreeSet<LiaVar>,
		existential: &BTreeSet<LiaVar>,
		timeout: &Timeout,
	) -> Result<Outcome>;

	fn check_sat(
		&self,
		formula: &LiaTerm,
		universal: &BTreeSet<LiaVar>,
		existential: &BTreeSet<LiaVar>,
		timeout: &Timeout,
	) -> Result<SatOutcome>;
}

#[derive(Clone, Copy, Debug)]
enum Query {
	Refute,
	Satisfy,
}

/// Runs every query in a fresh z3 context.
#[derive(Clone, Debug)]
pub struct Z3Bridge {
	pub solver_timeout_ms: u32,
}

impl Default for Z3Bridge {
	fn default() -> Self {
		Z3Bridge { solver_timeout_ms: 2000 }
	}
}

struct Done<'a>(&'a AtomicBool);

impl Drop for Done<'_> {
	fn drop(&mut self) {
		self.0.store(true, Ordering::Relaxed);
	}
}

impl Z3Bridge {
	pub fn new(solver_timeout_ms: u32) -> Self {
		Z3Bridge { solver_timeout_ms }
	}

	fn limit(&self, timeout: &Timeout) -> Result<u32> {
		let limit = match timeout.remaining() {
			Some(left) => u32::try_from(left.as_millis()).unwrap_or(u32::MAX).min(self.solver_timeout_ms),
			None => self.solver_timeout_ms,
		};
		if limit == 0 {
			return Err(Error::Timeout);
		}
		Ok(limit)
	}

	fn solve(
		&self,
		formula: &LiaTerm,
		universal: &BTreeSet<LiaVar>,
		existential: &BTreeSet<LiaVar>,
		query: Query,
		timeout: &Timeout,
	) -> Result<SatOutcome> {
		timeout.check()?;
		let limit = self.limit(timeout)?;
		let universal: BTreeSet<LiaVar> = formula
			.free_vars()
			.into_iter()
			.filter(|v| !existential.contains(v))
			.chain(universal.iter().cloned())
			.collect();
		let result = panic::catch_unwind(AssertUnwindSafe(|| self.run(formula, &universal, existential, query, limit, timeout)));
		match result {
			Ok(Err(Error::DecisionProcedure(msg))) => {
				log::debug!("Solver rejected the query: {}", msg);
				Ok(SatOutcome::Unknown(msg))
			},
			Ok(Ok(SatOutcome::Unknown(reason))) if timeout.expired() => {
				log::debug!("Solver stopped at the deadline ({})", reason);
				Err(Error::Timeout)
			},
			Ok(outcome) => outcome,
			Err(payload) => {
				let msg = payload
					.downcast_ref::<&str>()
					.map(|s| s.to_string())
					.or_else(|| payload.downcast_ref::<String>().cloned())
					.unwrap_or_else(|| "unknown panic".to_string());
				log::warn!("Solver panicked: {}", msg);
				Ok(SatOutcome::Unknown(format!("solver panicked: {}", msg)))
			},
		}
	}

	fn run(
		&self,
		formula: &LiaTerm,
		universal: &BTreeSet<LiaVar>,
		existential: &BTreeSet<LiaVar>,
		query: Query,
		limit: u32,
		timeout: &Timeout,
	) -> Result<SatOutcome> {
		let cfg = Config::new();
		let ctx = Context::new(&cfg);
		let env = Z3Env::new(&ctx);
		let body = env.boolean(&(&env).eval(formula)?)?;
		let body = match query {
			Query::Refute => body.not(),
			Query::Satisfy => body,
		};
		let body = if existential.is_empty() {
			body
		} else {
			let bounds = existential.iter().map(|v| env.var(v)).collect_vec();
			let bounds = bounds.iter().map(|b| b as &dyn Ast).collect_vec();
			let guard = env.nonneg(existential);
			match query {
				Query::Refute => forall_const(&ctx, &bounds, &[], &guard.implies(&body)),
				Query::Satisfy => exists_const(&ctx, &bounds, &[], &Bool::and(&ctx, &[&guard, &body])),
			}
		};

		let solver = Solver::new(&ctx);
		let mut params = Params::new(&ctx);
		params.set_u32("timeout", limit);
		solver.set_params(&params);
		solver.assert(&env.nonneg(universal));
		solver.assert(&body);
		log::trace!("Solver query:\n{}", solver);

		let start = Instant::now();
		let done = AtomicBool::new(false);
		let handle = ctx.handle();
		let result = thread::scope(|s| {
			s.spawn(|| {
				while !done.load(Ordering::Relaxed) {
					if timeout.expired() {
						handle.interrupt();
						break;
					}
					thread::sleep(Duration::from_millis(5));
				}
			});
			let _done = Done(&done);
			solver.check()
		});
		log::debug!("Solver {:?} in {:.4?}", result, start.elapsed());

		Ok(match result {
			SatResult::Unsat => SatOutcome::Unsat,
			SatResult::Sat => {
				let model = solver.get_model().ok_or_else(|| Error::DecisionProcedure("no model for sat query".into()))?;
				SatOutcome::Sat(env.assignment(&model, universal))
			},
			SatResult::Unknown => SatOutcome::Unknown(solver.get_reason_unknown().unwrap_or_else(|| "unknown".to_string())),
		})
	}
}

impl DecisionProcedure for Z3Bridge {
	fn check_valid(
		&self,
		claim: &LiaTerm,
		universal: &BTreeSet<LiaVar>,
		existential: &BTreeSet<LiaVar>,
		timeout: &Timeout,
	) -> Result<Outcome> {
		Ok(match self.solve(claim, universal, existential, Query::Refute, timeout)? {
			SatOutcome::Unsat => Outcome::Valid,
			SatOutcome::Sat(assignment) => Outcome::Invalid(assignment),
			SatOutcome::Unknown(reason) => Outcome::Unknown(reason),
		})
	}

	fn check_sat(
		&self,
		formula: &LiaTerm,
		universal: &BTreeSet<LiaVar>,
		existential: &BTreeSet<LiaVar>,
		timeout: &Timeout,
	) -> Result<SatOutcome> {
		self.solve(formula, universal, existential, Query::Satisfy, timeout)
	}
}

enum Numerals<'c> {
	Int(Vec<Int<'c>>),
	Real(Vec<Real<'c>>),
}

/// Symbol tables of one z3 context.
pub struct Z3Env<'c> {
	ctx: &'c Context,
	vars: RefCell<BTreeMap<String, Dynamic<'c>>>,
	funcs: RefCell<BTreeMap<(String, Vec<String>, String), FuncDecl<'c>>>,
}

fn mismatch(term: &Dynamic<'_>, expected: &str) -> Error {
	Error::DecisionProcedure(format!("expected {}, got {} of sort {}", expected, term, term.get_sort()))
}

fn is_numeric(term: &Dynamic<'_>) -> bool {
	matches!(term.sort_kind(), SortKind::Int | SortKind::Real)
}

impl<'c> Z3Env<'c> {
	pub fn new(ctx: &'c Context) -> Self {
		Z3Env { ctx, vars: RefCell::new(BTreeMap::new()), funcs: RefCell::new(BTreeMap::new()) }
	}

	fn sort(&self, ty: LiaType) -> Sort<'c> {
		match ty {
			LiaType::Int | LiaType::Nat => Sort::int(self.ctx),
			LiaType::Real => Sort::real(self.ctx),
			LiaType::Str | LiaType::Char => Sort::string(self.ctx),
		}
	}

	pub fn var(&self, v: &LiaVar) -> Dynamic<'c> {
		self.vars
			.borrow_mut()
			.entry(v.name.clone())
			.or_insert_with(|| match v.ty {
				LiaType::Int | LiaType::Nat => Int::new_const(self.ctx, v.name.as_str()).into(),
				LiaType::Real => Real::new_const(self.ctx, v.name.as_str()).into(),
				LiaType::Str | LiaType::Char => ast::String::new_const(self.ctx, v.name.as_str()).into(),
			})
			.clone()
	}

	pub fn nonneg(&self, vars: &BTreeSet<LiaVar>) -> Bool<'c> {
		let zero = Int::from_i64(self.ctx, 0);
		let bounds = vars
			.iter()
			.filter(|v| v.ty == LiaType::Nat)
			.filter_map(|v| self.var(v).as_int())
			.map(|v| v.ge(&zero))
			.collect_vec();
		Bool::and(self.ctx, &bounds.iter().collect_vec())
	}

	fn apply(&self, name: &str, args: &[Dynamic<'c>], range: Sort<'c>) -> Dynamic<'c> {
		let domain = args.iter().map(|a| a.get_sort()).collect_vec();
		let key = (name.to_string(), domain.iter().map(|s| s.to_string()).collect(), range.to_string());
		let mut funcs = self.funcs.borrow_mut();
		let decl = funcs.entry(key).or_insert_with(|| FuncDecl::new(self.ctx, name, &domain.iter().collect_vec(), &range));
		decl.apply(&args.iter().map(|a| a as &dyn Ast).collect_vec())
	}

	pub fn boolean(&self, term: &Dynamic<'c>) -> Result<Bool<'c>> {
		term.as_bool().ok_or_else(|| mismatch(term, "boolean"))
	}

	fn integer(&self, term: &Dynamic<'c>) -> Result<Int<'c>> {
		term.as_int().ok_or_else(|| mismatch(term, "integer"))
	}

	fn real(&self, term: &Dynamic<'c>) -> Result<Real<'c>> {
		match (term.as_real(), term.as_int()) {
			(Some(r), _) => Ok(r),
			(_, Some(i)) => Ok(i.to_real()),
			_ => Err(mismatch(term, "real")),
		}
	}

	// Integers are lifted to reals as soon as one operand is real.
	fn numerals(&self, terms: &[Dynamic<'c>]) -> Result<Numerals<'c>> {
		if terms.iter().any(|t| t.sort_kind() == SortKind::Real) {
			terms.iter().map(|t| self.real(t)).collect::<Result<_>>().map(Numerals::Real)
		} else {
			terms.iter().map(|t| self.integer(t)).collect::<Result<_>>().map(Numerals::Int)
		}
	}

	fn nary(&self, terms: &[Dynamic<'c>], unit: i64, plus: bool) -> Result<Dynamic<'c>> {
		Ok(match (terms, self.numerals(terms)?) {
			([], _) => Int::from_i64(self.ctx, unit).into(),
			([one], _) => one.clone(),
			(_, Numerals::Int(ts)) => {
				let ts = ts.iter().collect_vec();
				if plus { Int::add(self.ctx, &ts).into() } else { Int::mul(self.ctx, &ts).into() }
			},
			(_, Numerals::Real(ts)) => {
				let ts = ts.iter().collect_vec();
				if plus { Real::add(self.ctx, &ts).into() } else { Real::mul(self.ctx, &ts).into() }
			},
		})
	}

	fn compare(&self, a: Dynamic<'c>, b: Dynamic<'c>, strict: bool) -> Result<Dynamic<'c>> {
		if is_numeric(&a) && is_numeric(&b) {
			return Ok(match self.numerals(&[a, b])? {
				Numerals::Int(ts) if strict => ts[0].lt(&ts[1]).into(),
				Numerals::Int(ts) => ts[0].le(&ts[1]).into(),
				Numerals::Real(ts) if strict => ts[0].lt(&ts[1]).into(),
				Numerals::Real(ts) => ts[0].le(&ts[1]).into(),
			});
		}
		if a.sort_kind() == b.sort_kind() && a.as_string().is_some() {
			// Lexicographic order is left uninterpreted.
			let name = if strict { "str<" } else { "str<=" };
			return Ok(self.apply(name, &[a, b], Sort::bool(self.ctx)));
		}
		Err(mismatch(&b, &format!("a value comparable to {}", a)))
	}

	fn equal(&self, a: Dynamic<'c>, b: Dynamic<'c>) -> Result<Bool<'c>> {
		if is_numeric(&a) && is_numeric(&b) {
			return Ok(match self.numerals(&[a, b])? {
				Numerals::Int(ts) => ts[0]._eq(&ts[1]),
				Numerals::Real(ts) => ts[0]._eq(&ts[1]),
			});
		}
		a._safe_eq(&b).map_err(|e| Error::DecisionProcedure(e.to_string()))
	}

	fn branch(&self, c: Bool<'c>, a: Dynamic<'c>, b: Dynamic<'c>) -> Result<Dynamic<'c>> {
		if is_numeric(&a) && is_numeric(&b) {
			return Ok(match self.numerals(&[a, b])? {
				Numerals::Int(ts) => c.ite(&ts[0], &ts[1]).into(),
				Numerals::Real(ts) => c.ite(&ts[0], &ts[1]).into(),
			});
		}
		if a.get_sort() != b.get_sort() {
			return Err(mismatch(&b, &format!("the sort of {}", a)));
		}
		Ok(c.ite(&a, &b))
	}

	fn value(&self, term: &Dynamic<'c>) -> Value {
		let value = match term.sort_kind() {
			SortKind::Int => term.as_int().and_then(|i| i.as_i64()).map(Value::Int),
			SortKind::Real => term.as_real().and_then(|r| r.as_real()).map(|(n, d)| Value::Real(Rational64::new(n, d))),
			_ => term.as_string().and_then(|s| s.as_string()).map(Value::Str),
		};
		value.unwrap_or_else(|| Value::Unknown(term.to_string()))
	}

	pub fn assignment(&self, model: &Model<'c>, vars: &BTreeSet<LiaVar>) -> Assignment {
		vars.iter()
			.filter_map(|v| {
				let value = model.eval(&self.var(v), true)?;
				Some((v.name.clone(), self.value(&value)))
			})
			.collect()
	}
}

impl<'c> Eval<&LiaTerm, Result<Dynamic<'c>>> for &Z3Env<'c> {
	fn eval(self, source: &LiaTerm) -> Result<Dynamic<'c>> {
		let ctx = self.ctx;
		let all = |ts: &imbl::Vector<LiaTerm>| ts.iter().map(|t| self.eval(t)).collect::<Result<Vec<_>>>();
		let bools = |ts: &imbl::Vector<LiaTerm>| -> Result<Vec<Bool<'c>>> {
			ts.iter().map(|t| self.boolean(&self.eval(t)?)).collect()
		};
		Ok(match source {
			LiaTerm::Const(c) if c.is_integer() => Int::from_i64(ctx, *c.numer()).into(),
			LiaTerm::Const(c) => Real::from_real_str(ctx, &c.numer().to_string(), &c.denom().to_string())
				.ok_or_else(|| Error::DecisionProcedure(format!("cannot encode rational {}", c)))?
				.into(),
			LiaTerm::Bool(b) => Bool::from_bool(ctx, *b).into(),
			LiaTerm::Var(v) => self.var(v),
			LiaTerm::Plus(ts) => self.nary(&all(ts)?, 0, true)?,
			LiaTerm::Mul(ts) => self.nary(&all(ts)?, 1, false)?,
			LiaTerm::Minus(a, b) => match self.numerals(&[self.eval(a.as_ref())?, self.eval(b.as_ref())?])? {
				Numerals::Int(ts) => Int::sub(ctx, &[&ts[0], &ts[1]]).into(),
				Numerals::Real(ts) => Real::sub(ctx, &[&ts[0], &ts[1]]).into(),
			},
			LiaTerm::Div(a, b) => self.real(&self.eval(a.as_ref())?)?.div(&self.real(&self.eval(b.as_ref())?)?).into(),
			LiaTerm::Ite(c, a, b) => {
				let c = self.boolean(&self.eval(c.as_ref())?)?;
				self.branch(c, self.eval(a.as_ref())?, self.eval(b.as_ref())?)?
			},
			LiaTerm::Eq(a, b) => self.equal(self.eval(a.as_ref())?, self.eval(b.as_ref())?)?.into(),
			LiaTerm::Le(a, b) => self.compare(self.eval(a.as_ref())?, self.eval(b.as_ref())?, false)?,
			LiaTerm::Lt(a, b) => self.compare(self.eval(a.as_ref())?, self.eval(b.as_ref())?, true)?,
			LiaTerm::Not(a) => self.boolean(&self.eval(a.as_ref())?)?.not().into(),
			LiaTerm::And(ts) => Bool::and(ctx, &bools(ts)?.iter().collect_vec()).into(),
			LiaTerm::Or(ts) => Bool::or(ctx, &bools(ts)?.iter().collect_vec()).into(),
			LiaTerm::Func(name, args, LiaType::Real) if name == "sqrt" && args.len() == 1 => {
				let arg = self.real(&self.eval(&args[0])?)?;
				arg.power(&Real::from_real(ctx, 1, 2)).into()
			},
			LiaTerm::Func(name, args, ty) => self.apply(name, &all(args)?, self.sort(*ty)),
			LiaTerm::Sum(sum) => {
				return Err(Error::DecisionProcedure(format!(
					"iterated sum over ({}) has no quantifier-free encoding",
					sum.outer.iter().map(|v| &v.name).format(", ")
				)));
			},
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn int(name: &str) -> LiaTerm {
		LiaTerm::Var(LiaVar::new(name, LiaType::Int))
	}

	fn nat(name: &str) -> LiaTerm {
		LiaTerm::Var(LiaVar::new(name, LiaType::Nat))
	}

	fn valid(claim: &LiaTerm, existential: &[LiaVar]) -> Outcome {
		let existential = existential.iter().cloned().collect();
		Z3Bridge::default().check_valid(claim, &BTreeSet::new(), &existential, &Timeout::never()).unwrap()
	}

	#[test]
	fn naturals_are_nonnegative() {
		assert_eq!(valid(&LiaTerm::le(LiaTerm::zero(), nat("n")), &[]), Outcome::Valid);
		match valid(&LiaTerm::le(LiaTerm::zero(), int("i")), &[]) {
			Outcome::Invalid(assignment) => match assignment.get("i") {
				Some(Value::Int(i)) => assert!(*i < 0),
				other => panic!("unexpected witness {:?}", other),
			},
			other => panic!("expected a counterexample, got {:?}", other),
		}
	}

	#[test]
	fn existential_variables_are_chosen_per_universal() {
		let y = LiaVar::new("y", LiaType::Int);
		let claim = LiaTerm::eq(LiaTerm::var(&y), LiaTerm::Plus(imbl::vector![int("x"), LiaTerm::one()]));
		assert_eq!(valid(&claim, &[y.clone()]), Outcome::Valid);
		assert!(matches!(valid(&claim, &[]), Outcome::Invalid(_)));
	}

	#[test]
	fn sat_reports_universal_witness() {
		let formula = LiaTerm::and([LiaTerm::lt(LiaTerm::int(2), nat("n")), LiaTerm::lt(nat("n"), LiaTerm::int(4))]);
		let outcome = Z3Bridge::default().check_sat(&formula, &BTreeSet::new(), &BTreeSet::new(), &Timeout::never()).unwrap();
		match outcome {
			SatOutcome::Sat(assignment) => assert_eq!(assignment.get("n"), Some(&Value::Int(3))),
			other => panic!("expected sat, got {:?}", other),
		}
		let unsat = LiaTerm::lt(nat("n"), LiaTerm::zero());
		let outcome = Z3Bridge::default().check_sat(&unsat, &BTreeSet::new(), &BTreeSet::new(), &Timeout::never()).unwrap();
		assert_eq!(outcome, SatOutcome::Unsat);
	}

	#[test]
	fn mixed_sorts_are_unknown() {
		let s = LiaTerm::Var(LiaVar::new("s", LiaType::Str));
		assert!(matches!(valid(&LiaTerm::eq(s.clone(), LiaTerm::one()), &[]), Outcome::Unknown(_)));
		let strings = LiaTerm::implies(LiaTerm::lt(s.clone(), s.clone()), LiaTerm::le(s.clone(), s));
		assert!(matches!(valid(&strings, &[]), Outcome::Invalid(_)));
	}

	#[test]
	fn reals_mix_with_integers() {
		let r = LiaTerm::Var(LiaVar::new("r", LiaType::Real));
		let half = LiaTerm::Const(Rational64::new(1, 2));
		let claim = LiaTerm::implies(LiaTerm::eq(r.clone(), half), LiaTerm::lt(r, LiaTerm::one()));
		assert_eq!(valid(&claim, &[]), Outcome::Valid);
	}

	#[test]
	fn interrupted_queries_time_out() {
		let timeout = Timeout::never();
		timeout.interrupter().store(true, Ordering::SeqCst);
		let claim = LiaTerm::Bool(true);
		let err = Z3Bridge::default().check_valid(&claim, &BTreeSet::new(), &BTreeSet::new(), &timeout).unwrap_err();
		assert!(err.is_timeout());
	}
}
