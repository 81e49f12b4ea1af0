use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use imbl::Vector;
use itertools::Itertools;
use num::{One, Zero};

use super::bvm::{Bvm, LayerSum};
use super::error::{Error, Result};
use super::lia::{LiaSum, LiaTerm, LiaType, LiaVar};
use super::shared::{Eval, Schema, SchemaMap, Side, attr_name, isnull_name, table_atom_name};
use super::timeout::Timeout;
use super::uexpr::{PredKind, UTerm, UVar};

/// Functions whose value is always a natural number.
const NONNEG_INTEGRAL: &[&str] = &["count", "count_distinct", "length", "char_length", "abs"];

/// A tuple introduced while resolving a layer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TupleInfo {
	pub name: String,
	pub table: Option<String>,
	pub schema: Option<Schema>,
}

/// LIA* claim that two terms differ, with the tuples it ranges over.
#[derive(Clone, Debug)]
pub struct LiaFormula {
	pub term: LiaTerm,
	pub tuples: Vec<TupleInfo>,
}

impl Display for LiaFormula {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.term)
	}
}

#[derive(Clone, Debug)]
struct TupleEq {
	left: String,
	right: String,
	columns: Vec<(String, String)>,
	cond: LiaTerm,
}

/// Translates summation-free terms, one instance per formula.
pub struct LiaTranslator {
	schemas: RefCell<SchemaMap>,
	counts: RefCell<BTreeSet<String>>,
	fresh: Cell<usize>,
	naturals: RefCell<BTreeMap<UTerm, LiaVar>>,
	strings: RefCell<BTreeMap<String, LiaVar>>,
	nulls: RefCell<BTreeMap<(String, String), LiaVar>>,
	tuple_eqs: RefCell<Vec<TupleEq>>,
}

impl LiaTranslator {
	pub fn new(schemas: &SchemaMap) -> Self {
		LiaTranslator {
			schemas: RefCell::new(schemas.clone()),
			counts: RefCell::new(BTreeSet::new()),
			fresh: Cell::new(0),
			naturals: RefCell::new(BTreeMap::new()),
			strings: RefCell::new(BTreeMap::new()),
			nulls: RefCell::new(BTreeMap::new()),
			tuple_eqs: RefCell::new(vec![]),
		}
	}

	pub fn fresh(&self, prefix: &str) -> String {
		let n = self.fresh.get();
		self.fresh.set(n + 1);
		format!("{}{}", prefix, n)
	}

	/// A placeholder standing for a stripped summation.
	pub fn fresh_count(&self) -> String {
		let name = self.fresh("#u");
		self.counts.borrow_mut().insert(name.clone());
		name
	}

	fn is_count(&self, name: &str) -> bool {
		self.counts.borrow().contains(name)
	}

	pub fn schema_of(&self, base: &str) -> Option<Schema> {
		self.schemas.borrow().get(base).cloned()
	}

	pub fn bind_schema(&self, base: &str, schema: Schema) {
		self.schemas.borrow_mut().insert(base.to_string(), schema);
	}

	// Columns are named after their tuple, so a column of the output tuple is
	// one variable in every layer and on both sides.
	fn attr_var(&self, base: &str, attr: &str) -> LiaVar {
		let ty = match self.schemas.borrow().get(base).and_then(|s| s.ty_of(attr)) {
			Some(ty) => ty.into(),
			None => {
				log::debug!("No type for {}; assuming integer", attr_name(base, attr));
				LiaType::Int
			},
		};
		LiaVar::new(attr_name(base, attr), ty)
	}

	fn null_var(&self, base: &str, attr: &str) -> LiaVar {
		self.nulls
			.borrow_mut()
			.entry((base.to_string(), attr.to_string()))
			.or_insert_with(|| LiaVar::new(isnull_name(base, attr), LiaType::Nat))
			.clone()
	}

	fn string(&self, s: &str) -> LiaVar {
		if let Some(v) = self.strings.borrow().get(s) {
			return v.clone();
		}
		let v = LiaVar::new(self.fresh("#s"), LiaType::Str);
		self.strings.borrow_mut().insert(s.to_string(), v.clone());
		v
	}

	fn natural(&self, name: &str, app: &UTerm) -> LiaVar {
		if let Some(v) = self.naturals.borrow().get(app) {
			return v.clone();
		}
		let v = LiaVar::new(self.fresh(&format!("{}#", name)), LiaType::Nat);
		self.naturals.borrow_mut().insert(app.clone(), v.clone());
		v
	}

	fn tuple_eq(&self, x: &str, y: &str) -> Result<LiaTerm> {
		let columns = {
			let schemas = self.schemas.borrow();
			let (Some(sx), Some(sy)) = (schemas.get(x), schemas.get(y)) else {
				return Err(Error::Unsupported(format!("equality of tuples {} and {} without schema", x, y)));
			};
			if sx.columns.len() != sy.columns.len() {
				return Err(Error::StructuralMismatch(format!("tuples {} {} and {} {} differ in arity", x, sx, y, sy)));
			}
			sx.columns.iter().zip(&sy.columns).map(|(cx, cy)| (cx.name.clone(), cy.name.clone())).collect_vec()
		};
		let cond = LiaTerm::and(
			columns.iter().map(|(cx, cy)| LiaTerm::eq(LiaTerm::Var(self.attr_var(x, cx)), LiaTerm::Var(self.attr_var(y, cy)))),
		);
		self.tuple_eqs.borrow_mut().push(TupleEq { left: x.to_string(), right: y.to_string(), columns, cond: cond.clone() });
		Ok(cond)
	}

	/// Equal tuples agree on which columns are null.
	pub fn congruence(&self) -> Vec<LiaTerm> {
		let eqs = self.tuple_eqs.take();
		let mut out = vec![];
		for TupleEq { left, right, columns, cond } in eqs {
			for (cx, cy) in columns {
				let tracked = {
					let nulls = self.nulls.borrow();
					nulls.contains_key(&(left.clone(), cx.clone())) || nulls.contains_key(&(right.clone(), cy.clone()))
				};
				if tracked {
					let nx = LiaTerm::eq(LiaTerm::Var(self.null_var(&left, &cx)), LiaTerm::zero());
					let ny = LiaTerm::eq(LiaTerm::Var(self.null_var(&right, &cy)), LiaTerm::zero());
					out.push(LiaTerm::implies(cond.clone(), LiaTerm::iff(nx, ny)));
				}
			}
		}
		out
	}

	/// Distinct string literals denote distinct values.
	pub fn distinctness(&self) -> Vec<LiaTerm> {
		self.strings
			.borrow()
			.values()
			.tuple_combinations()
			.map(|(a, b)| LiaTerm::not(LiaTerm::eq(LiaTerm::var(a), LiaTerm::var(b))))
			.collect()
	}

	fn unary_pred(&self, name: Option<&str>, arg: &UTerm) -> Result<LiaTerm> {
		if let UTerm::Var(UVar::Proj(attr, base)) = arg {
			let p = match name {
				None => self.null_var(base, attr),
				Some(name) => LiaVar::new(format!("{}!{}", name, attr_name(base, attr)), LiaType::Nat),
			};
			return Ok(LiaTerm::ite(LiaTerm::eq(LiaTerm::Var(p), LiaTerm::zero()), LiaTerm::zero(), LiaTerm::one()));
		}
		let app = LiaTerm::Func(name.unwrap_or("isnull").to_string(), Vector::unit(self.eval(arg)?), LiaType::Int);
		Ok(LiaTerm::indicator(LiaTerm::not(LiaTerm::eq(app, LiaTerm::zero()))))
	}

	fn binary_pred(&self, kind: &PredKind, a: &UTerm, b: &UTerm) -> Result<LiaTerm> {
		if let (UTerm::Var(UVar::Base(x)), UTerm::Var(UVar::Base(y))) = (a, b)
			&& !self.is_count(x)
			&& !self.is_count(y)
		{
			let eq = self.tuple_eq(x, y)?;
			return match kind {
				PredKind::Eq => Ok(LiaTerm::indicator(eq)),
				PredKind::Ne => Ok(LiaTerm::indicator(LiaTerm::not(eq))),
				kind => Err(Error::Unsupported(format!("ordering {} between tuples {} and {}", kind, x, y))),
			};
		}
		let (a, b) = (self.eval(a)?, self.eval(b)?);
		let cmp = match kind {
			PredKind::Eq => LiaTerm::eq(a, b),
			PredKind::Ne => LiaTerm::not(LiaTerm::eq(a, b)),
			PredKind::Lt => LiaTerm::lt(a, b),
			PredKind::Le => LiaTerm::le(a, b),
			PredKind::Gt => LiaTerm::lt(b, a),
			PredKind::Ge => LiaTerm::le(b, a),
			kind @ (PredKind::IsNull | PredKind::Named(_)) => {
				return Err(Error::StructuralMismatch(format!("{} is not a comparison", kind)));
			},
		};
		Ok(LiaTerm::indicator(cmp))
	}

	fn pred(&self, kind: &PredKind, args: &Vector<UTerm>) -> Result<LiaTerm> {
		match (kind, args.len()) {
			(PredKind::IsNull, 1) => self.unary_pred(None, &args[0]),
			(PredKind::Named(name), 1) => self.unary_pred(Some(name), &args[0]),
			(PredKind::Named(name), _) => {
				let args = args.iter().map(|a| self.eval(a)).collect::<Result<Vector<_>>>()?;
				let app = LiaTerm::Func(name.clone(), args, LiaType::Int);
				Ok(LiaTerm::indicator(LiaTerm::not(LiaTerm::eq(app, LiaTerm::zero()))))
			},
			(PredKind::IsNull, n) => Err(Error::StructuralMismatch(format!("isnull takes one argument, got {}", n))),
			(kind, 2) => self.binary_pred(kind, &args[0], &args[1]),
			(kind, n) => Err(Error::StructuralMismatch(format!("{} takes two arguments, got {}", kind, n))),
		}
	}

	fn func(&self, name: &str, args: &Vector<UTerm>, app: &UTerm) -> Result<LiaTerm> {
		let lower = name.to_lowercase();
		let eval_all = || args.iter().map(|a| self.eval(a)).collect::<Result<Vector<_>>>();
		Ok(match (lower.as_str(), args.len()) {
			("divide" | "/", 2) => LiaTerm::Div(Box::new(self.eval(&args[0])?), Box::new(self.eval(&args[1])?)),
			("minus" | "-", 2) => LiaTerm::Minus(Box::new(self.eval(&args[0])?), Box::new(self.eval(&args[1])?)),
			("minus" | "-", 1) => LiaTerm::Minus(Box::new(LiaTerm::zero()), Box::new(self.eval(&args[0])?)),
			("plus" | "+", _) => LiaTerm::Plus(eval_all()?),
			("times" | "*", _) => LiaTerm::Mul(eval_all()?),
			(f, _) if NONNEG_INTEGRAL.contains(&f) => LiaTerm::Var(self.natural(f, app)),
			("sqrt", 1) => LiaTerm::Func("sqrt".to_string(), eval_all()?, LiaType::Real),
			_ => {
				let args = eval_all()?;
				let ty = if args.iter().any(|a| a.ty() == LiaType::Real) { LiaType::Real } else { LiaType::Int };
				LiaTerm::Func(name.to_string(), args, ty)
			},
		})
	}
}

impl Eval<&UTerm, Result<LiaTerm>> for &LiaTranslator {
	fn eval(self, source: &UTerm) -> Result<LiaTerm> {
		Ok(match source {
			UTerm::Summation(vars, _) => {
				return Err(Error::Unsupported(format!(
					"summation over {{{}}} was not stripped before translation",
					vars.iter().format(", ")
				)));
			},
			UTerm::Add(ts) => LiaTerm::Plus(ts.iter().map(|t| self.eval(t)).collect::<Result<_>>()?),
			UTerm::Mul(ts) => {
				let mut factors = Vector::new();
				for t in ts {
					match self.eval(t)? {
						f if f.as_const().is_some_and(|c| c.is_zero()) => return Ok(LiaTerm::zero()),
						f if f.as_const().is_some_and(|c| c.is_one()) => {},
						f => factors.push_back(f),
					}
				}
				LiaTerm::Mul(factors)
			},
			UTerm::Neg(body) => {
				LiaTerm::ite(LiaTerm::eq(self.eval(body.as_ref())?, LiaTerm::zero()), LiaTerm::one(), LiaTerm::zero())
			},
			UTerm::Squash(body) => {
				LiaTerm::ite(LiaTerm::eq(self.eval(body.as_ref())?, LiaTerm::zero()), LiaTerm::zero(), LiaTerm::one())
			},
			UTerm::Pred(kind, args) => self.pred(kind, args)?,
			UTerm::Var(UVar::Proj(attr, base)) => LiaTerm::Var(self.attr_var(base, attr)),
			UTerm::Var(UVar::Base(name)) if self.is_count(name) => LiaTerm::Var(LiaVar::new(name.clone(), LiaType::Int)),
			UTerm::Var(UVar::Base(name)) => {
				return Err(Error::Unsupported(format!("tuple {} used as a value", name)));
			},
			UTerm::Const(c) => LiaTerm::Const(*c),
			UTerm::Table(table, UVar::Base(base)) => LiaTerm::Var(LiaVar::new(table_atom_name(table, base), LiaType::Nat)),
			UTerm::Table(table, v) => {
				return Err(Error::Unsupported(format!("membership of column {} in {}", v, table)));
			},
			UTerm::Func(name, args) => self.func(name, args, source)?,
			UTerm::Str(s) => LiaTerm::Var(self.string(s)),
		})
	}
}

/// Translates a pair of terms under a matching into one LIA* formula.
pub struct LiaStarTranslator<'a> {
	terms: LiaTranslator,
	bvm: Bvm,
	timeout: &'a Timeout,
	tuples: RefCell<Vec<TupleInfo>>,
}

impl<'a> LiaStarTranslator<'a> {
	pub fn new(schemas: &SchemaMap, bvm: &'a Bvm, timeout: &'a Timeout) -> Self {
		LiaStarTranslator { terms: LiaTranslator::new(schemas), bvm: bvm.clone(), timeout, tuples: RefCell::new(vec![]) }
	}

	fn strip(&self, term: &UTerm, side: Side) -> (UTerm, Vec<(LiaVar, LayerSum)>) {
		let (stripped, sums) = term.strip_summations(&mut || self.terms.fresh_count());
		let scope = sums
			.into_iter()
			.map(|(name, vars, body)| (LiaVar::new(name, LiaType::Int), LayerSum { side, vars, body }))
			.collect();
		(stripped, scope)
	}

	/// Alpha-equivalent summations are first aligned to one peeling order.
	pub fn translate(mut self, left: &UTerm, right: &UTerm) -> Result<LiaFormula> {
		self.timeout.check()?;
		let aligned = self.bvm.aligned(left, right);
		if aligned != self.bvm {
			log::debug!("Translating {} as {}", self.bvm, aligned);
			self.bvm = aligned;
		}
		let (l, mut scope) = self.strip(left, Side::Left);
		let (r, right_scope) = self.strip(right, Side::Right);
		scope.extend(right_scope);
		let mut conj = vec![LiaTerm::not(LiaTerm::eq((&self.terms).eval(&l)?, (&self.terms).eval(&r)?))];
		conj.extend(self.terms.congruence());
		conj.extend(self.layer(0, scope)?);
		conj.extend(self.terms.distinctness());
		let term = LiaTerm::and(conj).simplify();
		Ok(LiaFormula { term, tuples: self.tuples.into_inner() })
	}

	fn layer(&self, depth: usize, scope: Vec<(LiaVar, LayerSum)>) -> Result<Vec<LiaTerm>> {
		self.timeout.check()?;
		let matched = scope.iter().map(|(_, s)| self.bvm.matched_in(depth, s).cloned()).collect_vec();
		let mut groups: Vec<(Option<Schema>, Vec<usize>)> = vec![];
		let mut locals = vec![];
		for (i, m) in matched.iter().enumerate() {
			match m {
				Some(v) => {
					let schema = self.terms.schema_of(v.base());
					match groups.iter_mut().find(|(s, _)| *s == schema) {
						Some((_, members)) => members.push(i),
						None => groups.push((schema, vec![i])),
					}
				},
				None => locals.push(i),
			}
		}

		let mut stars = vec![];
		for (schema, members) in groups {
			let tuple = self.terms.fresh("#ct");
			let first = &scope[members[0]].1;
			let table = matched[members[0]].as_ref().and_then(|v| first.table_of(v)).map(str::to_string);
			if let Some(schema) = &schema {
				self.terms.bind_schema(&tuple, schema.clone());
			}
			log::trace!("Layer {} tuple {} unifies {}", depth, tuple, members.iter().filter_map(|&i| matched[i].as_ref()).format(", "));
			self.tuples.borrow_mut().push(TupleInfo { name: tuple.clone(), table, schema });
			let members = members.iter().map(|&i| (&scope[i].0, &scope[i].1, matched[i].as_ref())).collect_vec();
			stars.push(self.star(depth, &members, &tuple)?);
		}
		for i in locals {
			let (u, sum) = &scope[i];
			for v in &sum.vars {
				let info = TupleInfo {
					name: v.base().to_string(),
					table: sum.table_of(v).map(str::to_string),
					schema: self.terms.schema_of(v.base()),
				};
				self.tuples.borrow_mut().push(info);
			}
			stars.push(self.star(depth, &[(u, sum, None)], "")?);
		}
		Ok(stars)
	}

	fn star(&self, depth: usize, members: &[(&LiaVar, &LayerSum, Option<&UVar>)], tuple: &str) -> Result<LiaTerm> {
		let mut outer = Vector::new();
		let mut inner = Vector::new();
		let mut sides = Vector::new();
		let mut conj = vec![];
		let mut below = vec![];
		for (u, sum, matched) in members {
			let (stripped, next) = self.strip(&sum.rest(*matched, tuple), sum.side);
			let v = LiaVar::new(self.terms.fresh("#v"), LiaType::Int);
			conj.push(LiaTerm::eq(LiaTerm::var(&v), (&self.terms).eval(&stripped)?));
			outer.push_back((*u).clone());
			inner.push_back(v);
			sides.push_back(sum.side);
			below.extend(next);
		}
		conj.extend(self.terms.congruence());
		conj.extend(self.layer(depth + 1, below)?);
		conj.extend(self.terms.distinctness());
		Ok(LiaTerm::Sum(Box::new(LiaSum { outer, inner, sides, body: LiaTerm::and(conj) })))
	}
}
