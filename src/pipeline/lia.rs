use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use imbl::{Vector, vector};
use itertools::Itertools;
use num::rational::Rational64;
use num::{One, Zero};
use serde::{Deserialize, Serialize};

use super::shared::{DataType, Side};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum LiaType {
	Int,
	Nat,
	Real,
	Char,
	Str,
}

impl LiaType {
	pub fn is_numeric(self) -> bool {
		matches!(self, LiaType::Int | LiaType::Nat | LiaType::Real)
	}
}

impl From<DataType> for LiaType {
	fn from(ty: DataType) -> Self {
		match ty {
			DataType::Integer => LiaType::Int,
			DataType::Natural => LiaType::Nat,
			DataType::Real => LiaType::Real,
			DataType::String => LiaType::Str,
			DataType::Char => LiaType::Char,
		}
	}
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct LiaVar {
	pub name: String,
	pub ty: LiaType,
}

impl LiaVar {
	pub fn new(name: impl Into<String>, ty: LiaType) -> Self {
		LiaVar { name: name.into(), ty }
	}
}

/// Iterated sum: `outer` is a finite sum of vectors `inner` each satisfying `body`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct LiaSum {
	pub outer: Vector<LiaVar>,
	pub inner: Vector<LiaVar>,
	/// Which input term each component counts for.
	pub sides: Vector<Side>,
	pub body: LiaTerm,
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum LiaTerm {
	Const(Rational64),
	Bool(bool),
	Var(LiaVar),
	Plus(Vector<LiaTerm>),
	Minus(Box<LiaTerm>, Box<LiaTerm>),
	Mul(Vector<LiaTerm>),
	Div(Box<LiaTerm>, Box<LiaTerm>),
	Ite(Box<LiaTerm>, Box<LiaTerm>, Box<LiaTerm>),
	Eq(Box<LiaTerm>, Box<LiaTerm>),
	Le(Box<LiaTerm>, Box<LiaTerm>),
	Lt(Box<LiaTerm>, Box<LiaTerm>),
	Not(Box<LiaTerm>),
	And(Vector<LiaTerm>),
	Or(Vector<LiaTerm>),
	Func(String, Vector<LiaTerm>, LiaType),
	Sum(Box<LiaSum>),
}

impl LiaTerm {
	pub fn int(i: i64) -> LiaTerm {
		LiaTerm::Const(Rational64::from_integer(i))
	}

	pub fn zero() -> LiaTerm {
		LiaTerm::int(0)
	}

	pub fn one() -> LiaTerm {
		LiaTerm::int(1)
	}

	pub fn var(v: &LiaVar) -> LiaTerm {
		LiaTerm::Var(v.clone())
	}

	pub fn eq(a: LiaTerm, b: LiaTerm) -> LiaTerm {
		LiaTerm::Eq(Box::new(a), Box::new(b))
	}

	pub fn le(a: LiaTerm, b: LiaTerm) -> LiaTerm {
		LiaTerm::Le(Box::new(a), Box::new(b))
	}

	pub fn lt(a: LiaTerm, b: LiaTerm) -> LiaTerm {
		LiaTerm::Lt(Box::new(a), Box::new(b))
	}

	pub fn not(a: LiaTerm) -> LiaTerm {
		LiaTerm::Not(Box::new(a))
	}

	pub fn and(terms: impl IntoIterator<Item = LiaTerm>) -> LiaTerm {
		LiaTerm::And(terms.into_iter().collect())
	}

	pub fn or(terms: impl IntoIterator<Item = LiaTerm>) -> LiaTerm {
		LiaTerm::Or(terms.into_iter().collect())
	}

	pub fn implies(a: LiaTerm, b: LiaTerm) -> LiaTerm {
		LiaTerm::or([LiaTerm::not(a), b])
	}

	pub fn iff(a: LiaTerm, b: LiaTerm) -> LiaTerm {
		LiaTerm::and([LiaTerm::implies(a.clone(), b.clone()), LiaTerm::implies(b, a)])
	}

	pub fn ite(c: LiaTerm, a: LiaTerm, b: LiaTerm) -> LiaTerm {
		LiaTerm::Ite(Box::new(c), Box::new(a), Box::new(b))
	}

	/// `1` when `c` holds, `0` otherwise.
	pub fn indicator(c: LiaTerm) -> LiaTerm {
		LiaTerm::ite(c, LiaTerm::one(), LiaTerm::zero())
	}

	pub fn as_const(&self) -> Option<Rational64> {
		match self {
			LiaTerm::Const(c) => Some(*c),
			_ => None,
		}
	}

	pub fn ty(&self) -> LiaType {
		match self {
			LiaTerm::Const(c) if c.is_integer() => LiaType::Int,
			LiaTerm::Const(_) | LiaTerm::Div(..) => LiaType::Real,
			LiaTerm::Var(v) => v.ty,
			LiaTerm::Func(_, _, ty) => *ty,
			LiaTerm::Plus(ts) | LiaTerm::Mul(ts) => {
				if ts.iter().any(|t| t.ty() == LiaType::Real) { LiaType::Real } else { LiaType::Int }
			},
			LiaTerm::Minus(a, b) => {
				if a.ty() == LiaType::Real || b.ty() == LiaType::Real { LiaType::Real } else { LiaType::Int }
			},
			LiaTerm::Ite(_, a, b) => match (a.ty(), b.ty()) {
				(LiaType::Real, _) | (_, LiaType::Real) => LiaType::Real,
				(LiaType::Nat, LiaType::Nat) => LiaType::Nat,
				(ty, _) => ty,
			},
			LiaTerm::Bool(_)
			| LiaTerm::Eq(..)
			| LiaTerm::Le(..)
			| LiaTerm::Lt(..)
			| LiaTerm::Not(_)
			| LiaTerm::And(_)
			| LiaTerm::Or(_)
			| LiaTerm::Sum(_) => LiaType::Int,
		}
	}

	pub fn children(&self) -> Vec<&LiaTerm> {
		match self {
			LiaTerm::Const(_) | LiaTerm::Bool(_) | LiaTerm::Var(_) => vec![],
			LiaTerm::Plus(ts) | LiaTerm::Mul(ts) | LiaTerm::And(ts) | LiaTerm::Or(ts) | LiaTerm::Func(_, ts, _) => {
				ts.iter().collect()
			},
			LiaTerm::Minus(a, b) | LiaTerm::Div(a, b) | LiaTerm::Eq(a, b) | LiaTerm::Le(a, b) | LiaTerm::Lt(a, b) => {
				vec![a, b]
			},
			LiaTerm::Ite(c, a, b) => vec![c, a, b],
			LiaTerm::Not(a) => vec![a],
			LiaTerm::Sum(sum) => vec![&sum.body],
		}
	}

	pub fn map_children(&self, f: &mut impl FnMut(&LiaTerm) -> LiaTerm) -> LiaTerm {
		let mut b = |t: &LiaTerm| Box::new(f(t));
		match self {
			LiaTerm::Const(_) | LiaTerm::Bool(_) | LiaTerm::Var(_) => self.clone(),
			LiaTerm::Plus(ts) => LiaTerm::Plus(ts.iter().map(|t| *b(t)).collect()),
			LiaTerm::Mul(ts) => LiaTerm::Mul(ts.iter().map(|t| *b(t)).collect()),
			LiaTerm::And(ts) => LiaTerm::And(ts.iter().map(|t| *b(t)).collect()),
			LiaTerm::Or(ts) => LiaTerm::Or(ts.iter().map(|t| *b(t)).collect()),
			LiaTerm::Func(name, ts, ty) => LiaTerm::Func(name.clone(), ts.iter().map(|t| *b(t)).collect(), *ty),
			LiaTerm::Minus(x, y) => LiaTerm::Minus(b(x), b(y)),
			LiaTerm::Div(x, y) => LiaTerm::Div(b(x), b(y)),
			LiaTerm::Eq(x, y) => LiaTerm::Eq(b(x), b(y)),
			LiaTerm::Le(x, y) => LiaTerm::Le(b(x), b(y)),
			LiaTerm::Lt(x, y) => LiaTerm::Lt(b(x), b(y)),
			LiaTerm::Ite(c, x, y) => LiaTerm::Ite(b(c), b(x), b(y)),
			LiaTerm::Not(x) => LiaTerm::Not(b(x)),
			LiaTerm::Sum(sum) => LiaTerm::Sum(Box::new(LiaSum { body: *b(&sum.body), ..sum.as_ref().clone() })),
		}
	}

	/// Variables free in the term; the components of an iterated sum are bound by it.
	pub fn free_vars(&self) -> BTreeSet<LiaVar> {
		match self {
			LiaTerm::Var(v) => BTreeSet::from([v.clone()]),
			LiaTerm::Sum(sum) => {
				let mut vars = sum.body.free_vars();
				for v in &sum.inner {
					vars.remove(v);
				}
				vars.extend(sum.outer.iter().cloned());
				vars
			},
			t => t.children().into_iter().flat_map(LiaTerm::free_vars).collect(),
		}
	}

	pub fn has_sum(&self) -> bool {
		matches!(self, LiaTerm::Sum(_)) || self.children().into_iter().any(LiaTerm::has_sum)
	}

	/// Replaces every iterated sum by a single summand: `body ∧ outer = inner`.
	pub fn under_approximate(&self) -> LiaTerm {
		match self {
			LiaTerm::Sum(sum) => {
				let mut conj = vector![sum.body.under_approximate()];
				conj.extend(sum.outer.iter().zip(&sum.inner).map(|(u, v)| LiaTerm::eq(LiaTerm::var(u), LiaTerm::var(v))));
				LiaTerm::And(conj)
			},
			t => t.map_children(&mut LiaTerm::under_approximate),
		}
	}

	/// Constant folding and unit/zero elimination, bottom-up.
	pub fn simplify(&self) -> LiaTerm {
		use LiaTerm::*;
		match self.map_children(&mut LiaTerm::simplify) {
			Plus(ts) => {
				let (consts, rest): (Vec<_>, Vec<_>) =
					ts.into_iter().flat_map(|t| if let Plus(inner) = t { inner } else { vector![t] }).partition(|t| t.as_const().is_some());
				let c: Rational64 = consts.iter().filter_map(LiaTerm::as_const).sum();
				let mut terms: Vector<LiaTerm> = rest.into_iter().collect();
				if !c.is_zero() {
					terms.push_back(Const(c));
				}
				match terms.len() {
					0 => LiaTerm::zero(),
					1 => terms.pop_front().unwrap_or_else(LiaTerm::zero),
					_ => Plus(terms),
				}
			},
			Mul(ts) => {
				let (consts, rest): (Vec<_>, Vec<_>) =
					ts.into_iter().flat_map(|t| if let Mul(inner) = t { inner } else { vector![t] }).partition(|t| t.as_const().is_some());
				let c: Rational64 = consts.iter().filter_map(LiaTerm::as_const).product();
				if c.is_zero() {
					return LiaTerm::zero();
				}
				let mut terms: Vector<LiaTerm> = rest.into_iter().collect();
				if !c.is_one() {
					terms.push_front(Const(c));
				}
				match terms.len() {
					0 => LiaTerm::one(),
					1 => terms.pop_front().unwrap_or_else(LiaTerm::one),
					_ => Mul(terms),
				}
			},
			Minus(a, b) => match (a.as_const(), b.as_const()) {
				(Some(x), Some(y)) => Const(x - y),
				(_, Some(y)) if y.is_zero() => *a,
				_ => Minus(a, b),
			},
			Div(a, b) => match (a.as_const(), b.as_const()) {
				(Some(x), Some(y)) if !y.is_zero() => Const(x / y),
				(_, Some(y)) if y.is_one() => *a,
				_ => Div(a, b),
			},
			Ite(c, a, b) => match *c {
				Bool(true) => *a,
				Bool(false) => *b,
				_ if a == b => *a,
				c => Ite(Box::new(c), a, b),
			},
			Eq(a, b) if a == b => Bool(true),
			Eq(a, b) => match (a.as_const(), b.as_const()) {
				(Some(x), Some(y)) => Bool(x == y),
				_ => Eq(a, b),
			},
			Le(a, b) => match (a.as_const(), b.as_const()) {
				(Some(x), Some(y)) => Bool(x <= y),
				_ if a == b => Bool(true),
				_ => Le(a, b),
			},
			Lt(a, b) => match (a.as_const(), b.as_const()) {
				(Some(x), Some(y)) => Bool(x < y),
				_ if a == b => Bool(false),
				_ => Lt(a, b),
			},
			Not(a) => match *a {
				Bool(b) => Bool(!b),
				Not(inner) => *inner,
				a => Not(Box::new(a)),
			},
			And(ts) => {
				let ts = ts.into_iter().flat_map(|t| if let And(inner) = t { inner } else { vector![t] });
				let mut out = Vector::new();
				for t in ts {
					match t {
						Bool(true) => {},
						Bool(false) => return Bool(false),
						t if !out.contains(&t) => out.push_back(t),
						_ => {},
					}
				}
				match out.len() {
					0 => Bool(true),
					1 => out.pop_front().unwrap_or(Bool(true)),
					_ => And(out),
				}
			},
			Or(ts) => {
				let ts = ts.into_iter().flat_map(|t| if let Or(inner) = t { inner } else { vector![t] });
				let mut out = Vector::new();
				for t in ts {
					match t {
						Bool(false) => {},
						Bool(true) => return Bool(true),
						t if !out.contains(&t) => out.push_back(t),
						_ => {},
					}
				}
				match out.len() {
					0 => Bool(false),
					1 => out.pop_front().unwrap_or(Bool(false)),
					_ => Or(out),
				}
			},
			t => t,
		}
	}
}

impl Display for LiaVar {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.name)
	}
}

impl Display for LiaTerm {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		let nary = |f: &mut Formatter<'_>, op: &str, ts: &Vector<LiaTerm>| write!(f, "({} {})", op, ts.iter().format(" "));
		match self {
			LiaTerm::Const(c) => write!(f, "{}", c),
			LiaTerm::Bool(b) => write!(f, "{}", b),
			LiaTerm::Var(v) => write!(f, "{}", v),
			LiaTerm::Plus(ts) => nary(f, "+", ts),
			LiaTerm::Mul(ts) => nary(f, "*", ts),
			LiaTerm::And(ts) => nary(f, "and", ts),
			LiaTerm::Or(ts) => nary(f, "or", ts),
			LiaTerm::Minus(a, b) => write!(f, "(- {} {})", a, b),
			LiaTerm::Div(a, b) => write!(f, "(/ {} {})", a, b),
			LiaTerm::Eq(a, b) => write!(f, "(= {} {})", a, b),
			LiaTerm::Le(a, b) => write!(f, "(<= {} {})", a, b),
			LiaTerm::Lt(a, b) => write!(f, "(< {} {})", a, b),
			LiaTerm::Ite(c, a, b) => write!(f, "(ite {} {} {})", c, a, b),
			LiaTerm::Not(a) => write!(f, "(not {})", a),
			LiaTerm::Func(name, ts, _) => write!(f, "({} {})", name, ts.iter().format(" ")),
			LiaTerm::Sum(sum) => write!(
				f,
				"(sum ({}) ({}) {})",
				sum.outer.iter().format(" "),
				sum.inner.iter().format(" "),
				sum.body
			),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn nat(name: &str) -> LiaTerm {
		LiaTerm::Var(LiaVar::new(name, LiaType::Nat))
	}

	#[test]
	fn simplify_folds_constants_and_units() {
		let t = LiaTerm::Mul(vector![nat("r"), LiaTerm::indicator(LiaTerm::eq(LiaTerm::one(), LiaTerm::one()))]);
		assert_eq!(t.simplify(), nat("r"));
		let t = LiaTerm::Plus(vector![LiaTerm::int(2), nat("r"), LiaTerm::int(-2)]);
		assert_eq!(t.simplify(), nat("r"));
		let t = LiaTerm::Mul(vector![nat("r"), LiaTerm::indicator(LiaTerm::lt(LiaTerm::one(), LiaTerm::zero()))]);
		assert_eq!(t.simplify(), LiaTerm::zero());
		assert_eq!(LiaTerm::and([LiaTerm::Bool(true), LiaTerm::eq(nat("a"), nat("a"))]).simplify(), LiaTerm::Bool(true));
	}

	#[test]
	fn sum_binds_inner_vector() {
		let u = LiaVar::new("u", LiaType::Int);
		let v = LiaVar::new("v", LiaType::Int);
		let sum = LiaTerm::Sum(Box::new(LiaSum {
			outer: vector![u.clone()],
			inner: vector![v.clone()],
			sides: vector![Side::Left],
			body: LiaTerm::eq(LiaTerm::var(&v), nat("r")),
		}));
		let free = sum.free_vars();
		assert!(free.contains(&u) && !free.contains(&v));
		assert!(sum.has_sum());
		let under = sum.under_approximate();
		assert!(!under.has_sum());
		assert!(under.free_vars().contains(&v));
	}
}
