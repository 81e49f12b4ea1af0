use std::collections::hash_map::DefaultHasher;
use std::fmt::{Display, Formatter, Write};
use std::hash::{Hash, Hasher};

use imbl::{OrdSet, Vector};
use indenter::indented;
use itertools::Itertools;
use num::rational::Rational64;
use serde::{Deserialize, Serialize};

use super::shared::SchemaMap;

/// Tuple variable identity, compared structurally.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[serde(rename_all = "lowercase")]
pub enum UVar {
	Base(String),
	/// Column `.0` of the base tuple `.1`.
	Proj(String, String),
}

impl UVar {
	pub fn base(&self) -> &str {
		match self {
			UVar::Base(b) | UVar::Proj(_, b) => b,
		}
	}

	pub fn attr(&self) -> Option<&str> {
		match self {
			UVar::Base(_) => None,
			UVar::Proj(a, _) => Some(a),
		}
	}

	pub fn renamed(&self, from: &str, to: &str) -> UVar {
		match self {
			UVar::Base(b) if b == from => UVar::Base(to.to_string()),
			UVar::Proj(a, b) if b == from => UVar::Proj(a.clone(), to.to_string()),
			v => v.clone(),
		}
	}
}

impl Display for UVar {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			UVar::Base(b) => write!(f, "{}", b),
			UVar::Proj(a, b) => write!(f, "{}({})", a, b),
		}
	}
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[serde(rename_all = "lowercase")]
pub enum PredKind {
	Eq,
	Ne,
	Lt,
	Le,
	Gt,
	Ge,
	IsNull,
	Named(String),
}

impl Display for PredKind {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			PredKind::Eq => write!(f, "="),
			PredKind::Ne => write!(f, "<>"),
			PredKind::Lt => write!(f, "<"),
			PredKind::Le => write!(f, "<="),
			PredKind::Gt => write!(f, ">"),
			PredKind::Ge => write!(f, ">="),
			PredKind::IsNull => write!(f, "isnull"),
			PredKind::Named(name) => write!(f, "{}", name),
		}
	}
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum UKind {
	Summation,
	Add,
	Mul,
	Neg,
	Squash,
	Pred,
	Var,
	Const,
	Table,
	Func,
	Str,
}

/// Sum-of-products form of a bag-semantics query output.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[serde(rename_all = "lowercase")]
pub enum UTerm {
	#[serde(rename = "sum")]
	Summation(OrdSet<UVar>, Box<UTerm>),
	Add(Vector<UTerm>),
	Mul(Vector<UTerm>),
	Neg(Box<UTerm>),
	Squash(Box<UTerm>),
	Pred(PredKind, Vector<UTerm>),
	Var(UVar),
	Const(Rational64),
	Table(String, UVar),
	Func(String, Vector<UTerm>),
	Str(String),
}

/// A top-level summation cut out of a term and the placeholder standing for it.
pub type Stripped = (String, OrdSet<UVar>, UTerm);

impl UTerm {
	pub fn sum<'a>(vars: impl IntoIterator<Item = &'a str>, body: UTerm) -> UTerm {
		UTerm::Summation(vars.into_iter().map(|v| UVar::Base(v.to_string())).collect(), Box::new(body))
	}

	pub fn mul(terms: impl IntoIterator<Item = UTerm>) -> UTerm {
		UTerm::Mul(terms.into_iter().collect())
	}

	pub fn add(terms: impl IntoIterator<Item = UTerm>) -> UTerm {
		UTerm::Add(terms.into_iter().collect())
	}

	pub fn neg(term: UTerm) -> UTerm {
		UTerm::Neg(Box::new(term))
	}

	pub fn squash(term: UTerm) -> UTerm {
		UTerm::Squash(Box::new(term))
	}

	pub fn table(name: &str, var: &str) -> UTerm {
		UTerm::Table(name.to_string(), UVar::Base(var.to_string()))
	}

	pub fn pred(kind: PredKind, args: impl IntoIterator<Item = UTerm>) -> UTerm {
		UTerm::Pred(kind, args.into_iter().collect())
	}

	pub fn eq(a: UTerm, b: UTerm) -> UTerm {
		UTerm::pred(PredKind::Eq, [a, b])
	}

	pub fn tuple(base: &str) -> UTerm {
		UTerm::Var(UVar::Base(base.to_string()))
	}

	pub fn attr(attr: &str, base: &str) -> UTerm {
		UTerm::Var(UVar::Proj(attr.to_string(), base.to_string()))
	}

	pub fn int(i: i64) -> UTerm {
		UTerm::Const(Rational64::from_integer(i))
	}

	pub fn func(name: &str, args: impl IntoIterator<Item = UTerm>) -> UTerm {
		UTerm::Func(name.to_string(), args.into_iter().collect())
	}

	pub fn kind(&self) -> UKind {
		match self {
			UTerm::Summation(..) => UKind::Summation,
			UTerm::Add(_) => UKind::Add,
			UTerm::Mul(_) => UKind::Mul,
			UTerm::Neg(_) => UKind::Neg,
			UTerm::Squash(_) => UKind::Squash,
			UTerm::Pred(..) => UKind::Pred,
			UTerm::Var(_) => UKind::Var,
			UTerm::Const(_) => UKind::Const,
			UTerm::Table(..) => UKind::Table,
			UTerm::Func(..) => UKind::Func,
			UTerm::Str(_) => UKind::Str,
		}
	}

	pub fn children(&self) -> Vec<&UTerm> {
		match self {
			UTerm::Summation(_, body) | UTerm::Neg(body) | UTerm::Squash(body) => vec![body.as_ref()],
			UTerm::Add(ts) | UTerm::Mul(ts) | UTerm::Pred(_, ts) | UTerm::Func(_, ts) => ts.iter().collect(),
			UTerm::Var(_) | UTerm::Const(_) | UTerm::Table(..) | UTerm::Str(_) => vec![],
		}
	}

	pub fn map_children(&self, f: &mut impl FnMut(&UTerm) -> UTerm) -> UTerm {
		match self {
			UTerm::Summation(vars, body) => UTerm::Summation(vars.clone(), Box::new(f(body))),
			UTerm::Add(ts) => UTerm::Add(ts.iter().map(|t| f(t)).collect()),
			UTerm::Mul(ts) => UTerm::Mul(ts.iter().map(|t| f(t)).collect()),
			UTerm::Neg(t) => UTerm::Neg(Box::new(f(t))),
			UTerm::Squash(t) => UTerm::Squash(Box::new(f(t))),
			UTerm::Pred(kind, ts) => UTerm::Pred(kind.clone(), ts.iter().map(|t| f(t)).collect()),
			UTerm::Func(name, ts) => UTerm::Func(name.clone(), ts.iter().map(|t| f(t)).collect()),
			UTerm::Var(_) | UTerm::Const(_) | UTerm::Table(..) | UTerm::Str(_) => self.clone(),
		}
	}

	/// Order-sensitive hash of the whole tree, used for dedup and equality shortcuts.
	pub fn structural_hash(&self) -> u64 {
		let mut h = DefaultHasher::new();
		self.hash(&mut h);
		h.finish()
	}

	/// Hash that ignores operand order of commutative nodes, used for bag-difference scoring.
	pub fn sort_hash(&self) -> u64 {
		let mut h = DefaultHasher::new();
		std::mem::discriminant(self).hash(&mut h);
		match self {
			UTerm::Summation(vars, body) => {
				vars.hash(&mut h);
				body.sort_hash().hash(&mut h);
			},
			UTerm::Add(ts) | UTerm::Mul(ts) => {
				ts.iter().map(UTerm::sort_hash).sorted().collect_vec().hash(&mut h);
			},
			UTerm::Neg(t) | UTerm::Squash(t) => t.sort_hash().hash(&mut h),
			UTerm::Pred(kind, args) => {
				kind.hash(&mut h);
				let hashes = args.iter().map(UTerm::sort_hash);
				match kind {
					PredKind::Eq | PredKind::Ne => hashes.sorted().collect_vec().hash(&mut h),
					_ => hashes.collect_vec().hash(&mut h),
				}
			},
			UTerm::Func(name, args) => {
				name.hash(&mut h);
				args.iter().map(UTerm::sort_hash).collect_vec().hash(&mut h);
			},
			leaf => leaf.hash(&mut h),
		}
		h.finish()
	}

	pub fn binds(&self, base: &str) -> bool {
		matches!(self, UTerm::Summation(vars, _) if vars.iter().any(|v| v.base() == base))
	}

	pub fn mentions(&self, base: &str) -> bool {
		match self {
			UTerm::Var(v) | UTerm::Table(_, v) => v.base() == base,
			t if t.binds(base) => false,
			t => t.children().into_iter().any(|c| c.mentions(base)),
		}
	}

	/// Renames the base tuple `from` to `to`, stopping at binders that shadow it.
	pub fn rename(&self, from: &str, to: &str) -> UTerm {
		match self {
			UTerm::Var(v) => UTerm::Var(v.renamed(from, to)),
			UTerm::Table(t, v) => UTerm::Table(t.clone(), v.renamed(from, to)),
			t if t.binds(from) => t.clone(),
			t => t.map_children(&mut |c| c.rename(from, to)),
		}
	}

	/// Renames the base tuple `from` everywhere, binders included.
	pub fn rename_bound(&self, from: &str, to: &str) -> UTerm {
		match self {
			UTerm::Summation(vars, body) => UTerm::Summation(
				vars.iter().map(|v| v.renamed(from, to)).collect(),
				Box::new(body.rename_bound(from, to)),
			),
			UTerm::Var(v) => UTerm::Var(v.renamed(from, to)),
			UTerm::Table(t, v) => UTerm::Table(t.clone(), v.renamed(from, to)),
			t => t.map_children(&mut |c| c.rename_bound(from, to)),
		}
	}

	/// Leaves of the sum-product skeleton: predicates, table atoms, values.
	pub fn atoms(&self) -> Vec<&UTerm> {
		fn go<'a>(term: &'a UTerm, out: &mut Vec<&'a UTerm>) {
			match term {
				UTerm::Summation(_, b) | UTerm::Neg(b) | UTerm::Squash(b) => go(b, out),
				UTerm::Add(ts) | UTerm::Mul(ts) => ts.iter().for_each(|t| go(t, out)),
				_ => out.push(term),
			}
		}
		let mut out = vec![];
		go(self, &mut out);
		out
	}

	/// Every node of the tree in preorder.
	pub fn subterms(&self) -> Vec<&UTerm> {
		let mut out = vec![self];
		let mut i = 0;
		while i < out.len() {
			let t = out[i];
			out.extend(t.children());
			i += 1;
		}
		out
	}

	pub fn size(&self) -> usize {
		self.subterms().len()
	}

	/// Summations not nested inside another summation.
	pub fn summations(&self) -> Vec<(&OrdSet<UVar>, &UTerm)> {
		fn go<'a>(term: &'a UTerm, out: &mut Vec<(&'a OrdSet<UVar>, &'a UTerm)>) {
			match term {
				UTerm::Summation(vars, body) => out.push((vars, body)),
				t => t.children().into_iter().for_each(|c| go(c, out)),
			}
		}
		let mut out = vec![];
		go(self, &mut out);
		out
	}

	/// Replaces every top-level summation by a fresh count placeholder.
	pub fn strip_summations<F: FnMut() -> String>(&self, fresh: &mut F) -> (UTerm, Vec<Stripped>) {
		match self {
			UTerm::Summation(vars, body) => {
				let name = fresh();
				(UTerm::tuple(&name), vec![(name, vars.clone(), body.as_ref().clone())])
			},
			t => {
				let mut stripped = vec![];
				let term = t.map_children(&mut |c| {
					let (c, s) = c.strip_summations(&mut *fresh);
					stripped.extend(s);
					c
				});
				(term, stripped)
			},
		}
	}

	/// Table whose membership atom over `base` is a factor of this product.
	pub fn table_of(&self, base: &str) -> Option<&str> {
		match self {
			UTerm::Table(t, UVar::Base(b)) if b == base => Some(t),
			UTerm::Mul(ts) => ts.iter().find_map(|t| t.table_of(base)),
			_ => None,
		}
	}

	/// Gives every bound variable a unique name, registering the new names' schemas.
	pub fn freshen(&self, schemas: &mut SchemaMap, counter: &mut usize) -> UTerm {
		match self {
			UTerm::Summation(vars, body) => {
				let mut body = body.as_ref().clone();
				let mut fresh = OrdSet::new();
				for v in vars {
					let name = format!("{}#{}", v.base(), *counter);
					*counter += 1;
					if let Some(schema) = schemas.get(v.base()).cloned() {
						schemas.insert(name.clone(), schema);
					}
					body = body.rename(v.base(), &name);
					fresh.insert(UVar::Base(name));
				}
				UTerm::Summation(fresh, Box::new(body.freshen(schemas, counter)))
			},
			t => t.map_children(&mut |c| c.freshen(schemas, counter)),
		}
	}
}

impl Display for UTerm {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			UTerm::Summation(vars, body) => {
				writeln!(f, "∑{{{}}} {{", vars.iter().format(", "))?;
				writeln!(indented(f).with_str("\t"), "{}", body)?;
				write!(f, "}}")
			},
			UTerm::Add(ts) => write!(f, "({})", ts.iter().format(" + ")),
			UTerm::Mul(ts) => write!(f, "({})", ts.iter().format(" × ")),
			UTerm::Neg(t) => write!(f, "not({})", t),
			UTerm::Squash(t) => write!(f, "‖{}‖", t),
			UTerm::Pred(kind @ (PredKind::IsNull | PredKind::Named(_)), args) => {
				write!(f, "[{}({})]", kind, args.iter().format(", "))
			},
			UTerm::Pred(kind, args) => write!(f, "[{}]", args.iter().format(&format!(" {} ", kind))),
			UTerm::Var(v) => write!(f, "{}", v),
			UTerm::Const(c) => write!(f, "{}", c),
			UTerm::Table(t, v) => write!(f, "{}({})", t, v),
			UTerm::Func(name, args) => write!(f, "{}({})", name, args.iter().format(", ")),
			UTerm::Str(s) => write!(f, "'{}'", s),
		}
	}
}
