use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use imbl::OrdSet;
use itertools::Itertools;

use super::error::{Error, Result};
use super::matcher::HeuristicBoundVarMatcher;
use super::shared::Side;
use super::timeout::Timeout;
use super::uexpr::{UTerm, UVar};

/// Bound-variable matching: per nesting layer, the variables unified across both terms.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Bvm {
	layers: Vec<BTreeSet<UVar>>,
}

impl Display for Bvm {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "[{}]", self.layers.iter().map(|l| format!("{{{}}}", l.iter().format(", "))).format(", "))
	}
}

/// Largest summation whose variable orders are searched when aligning.
const MAX_ALIGNED: usize = 5;

#[inline]
pub fn placeholder(depth: usize) -> String {
	format!("#bv{}", depth)
}

impl Bvm {
	pub fn new(layers: Vec<BTreeSet<UVar>>) -> Self {
		Bvm { layers }
	}

	pub fn layers(&self) -> &[BTreeSet<UVar>] {
		&self.layers
	}

	pub fn layer(&self, depth: usize) -> Option<&BTreeSet<UVar>> {
		self.layers.get(depth)
	}

	pub fn depth(&self) -> usize {
		self.layers.len()
	}

	pub fn layer_of(&self, var: &UVar) -> Option<usize> {
		self.layers.iter().position(|l| l.contains(var))
	}

	/// The variable of `sum` unified at `depth`, if any.
	pub fn matched_in<'s>(&self, depth: usize, sum: &'s LayerSum) -> Option<&'s UVar> {
		let layer = self.layer(depth)?;
		sum.vars.iter().find(|v| layer.contains(v))
	}

	/// Exchanges the layer memberships of two variables.
	pub fn swap(&self, a: &UVar, b: &UVar) -> Bvm {
		let layers = self
			.layers
			.iter()
			.map(|layer| match (layer.contains(a), layer.contains(b)) {
				(true, false) => layer.iter().filter(|v| *v != a).chain([b]).cloned().collect(),
				(false, true) => layer.iter().filter(|v| *v != b).chain([a]).cloned().collect(),
				_ => layer.clone(),
			})
			.collect();
		Bvm { layers }
	}

	/// Replaces every matched variable by the placeholder of its layer.
	pub fn apply(&self, term: &UTerm) -> UTerm {
		self.layers.iter().enumerate().fold(term.clone(), |term, (depth, layer)| {
			let tuple = placeholder(depth);
			layer.iter().fold(term, |term, v| term.rename_bound(v.base(), &tuple))
		})
	}

	fn equates(&self, a: &UTerm, b: &UTerm) -> bool {
		self.apply(a).sort_hash() == self.apply(b).sort_hash()
	}

	/// Reorders the variables of each right summation to follow an
	/// alpha-equivalent left summation.
	///
	/// The variables of one summation may be resolved in any order, so only
	/// their layers are permuted and the matching stays valid.
	pub fn aligned(&self, left: &UTerm, right: &UTerm) -> Bvm {
		fn binders(term: &UTerm) -> Vec<(Vec<UVar>, &UTerm)> {
			term.subterms()
				.into_iter()
				.filter_map(|t| match t {
					UTerm::Summation(vars, body) => Some((vars.iter().cloned().collect(), body.as_ref())),
					_ => None,
				})
				.collect()
		}
		let lefts = binders(left);
		let mut bvm = self.clone();
		for (rvars, rbody) in binders(right) {
			if rvars.len() < 2 || rvars.len() > MAX_ALIGNED {
				continue;
			}
			let Some(rdepths) = rvars.iter().map(|v| bvm.layer_of(v)).collect::<Option<Vec<_>>>() else {
				continue;
			};
			for (lvars, lbody) in &lefts {
				let Some(ldepths) = lvars.iter().map(|v| bvm.layer_of(v)).collect::<Option<Vec<_>>>() else {
					continue;
				};
				if ldepths.iter().sorted().ne(rdepths.iter().sorted()) {
					continue;
				}
				if bvm.equates(lbody, rbody) {
					break;
				}
				let found = rvars
					.iter()
					.permutations(rvars.len())
					.map(|order| {
						let mut layers = bvm.layers.clone();
						for layer in layers.iter_mut() {
							layer.retain(|v| !rvars.contains(v));
						}
						for (v, &depth) in order.into_iter().zip(&ldepths) {
							layers[depth].insert(v.clone());
						}
						Bvm { layers }
					})
					.find(|candidate| candidate.equates(lbody, rbody) && candidate.validate(left, right).is_ok());
				if let Some(candidate) = found {
					log::trace!("Realigned {{{}}}: {} -> {}", rvars.iter().format(", "), bvm, candidate);
					bvm = candidate;
					break;
				}
			}
		}
		bvm
	}

	/// Layers must be disjoint and each variable of layer `i` bound at depth `i`.
	pub fn validate(&self, left: &UTerm, right: &UTerm) -> Result<()> {
		let mut seen = BTreeSet::new();
		for v in self.layers.iter().flatten() {
			if !seen.insert(v) {
				return Err(Error::StructuralMismatch(format!("{} occurs in more than one layer", v)));
			}
		}
		let mut scope = LayerSum::scope(left, right);
		for (depth, layer) in self.layers.iter().enumerate() {
			let bound: BTreeSet<&UVar> = scope.iter().flat_map(|s| s.vars.iter()).collect();
			if let Some(v) = layer.iter().find(|v| !bound.contains(v)) {
				return Err(Error::StructuralMismatch(format!("{} is not bound at depth {}", v, depth)));
			}
			let tuple = placeholder(depth);
			scope = scope.iter().flat_map(|s| s.peel(self.matched_in(depth, s), &tuple)).collect();
		}
		Ok(())
	}
}

/// A summation still to be resolved at the current layer.
///
/// A summation over several variables is resolved one variable per layer:
/// once its matched variable is renamed to the layer's common tuple, the
/// remaining variables form a summation of the next layer. A summation with
/// no matched variable keeps all its variables local to the layer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LayerSum {
	pub side: Side,
	pub vars: OrdSet<UVar>,
	pub body: UTerm,
}

impl LayerSum {
	pub fn of(term: &UTerm, side: Side) -> Vec<LayerSum> {
		term.summations()
			.into_iter()
			.map(|(vars, body)| LayerSum { side, vars: vars.clone(), body: body.clone() })
			.collect()
	}

	pub fn scope(left: &UTerm, right: &UTerm) -> Vec<LayerSum> {
		let mut scope = LayerSum::of(left, Side::Left);
		scope.extend(LayerSum::of(right, Side::Right));
		scope
	}

	pub fn table_of(&self, var: &UVar) -> Option<&str> {
		self.body.table_of(var.base())
	}

	/// What is left to resolve below this layer.
	pub fn rest(&self, matched: Option<&UVar>, tuple: &str) -> UTerm {
		match matched {
			Some(v) => {
				let body = self.body.rename(v.base(), tuple);
				let vars = self.vars.without(v);
				if vars.is_empty() { body } else { UTerm::Summation(vars, Box::new(body)) }
			},
			None => self.body.clone(),
		}
	}

	pub fn peel(&self, matched: Option<&UVar>, tuple: &str) -> Vec<LayerSum> {
		LayerSum::of(&self.rest(matched, tuple), self.side)
	}
}

/// Builds the first matching top-down, one common tuple per layer.
pub struct HeuristicSeedGenerator<'a> {
	left: &'a UTerm,
	right: &'a UTerm,
	output: &'a str,
	timeout: &'a Timeout,
}

impl<'a> HeuristicSeedGenerator<'a> {
	pub fn new(left: &'a UTerm, right: &'a UTerm, output: &'a str, timeout: &'a Timeout) -> Self {
		HeuristicSeedGenerator { left, right, output, timeout }
	}

	pub fn generate(&self) -> Result<Bvm> {
		let mut scope = LayerSum::scope(self.left, self.right);
		let mut layers = vec![];
		while !scope.is_empty() {
			self.timeout.check()?;
			let tuple = placeholder(layers.len());
			let matching = HeuristicBoundVarMatcher::new(&scope, &tuple, self.output, self.timeout).decide()?;
			let layer: BTreeSet<UVar> = matching.iter().flatten().cloned().collect();
			log::trace!("Layer {} matched {{{}}} over {} summations", layers.len(), layer.iter().format(", "), scope.len());
			scope = scope.iter().zip(&matching).flat_map(|(s, m)| s.peel(m.as_ref(), &tuple)).collect();
			layers.push(layer);
		}
		Ok(Bvm::new(layers))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::pipeline::uexpr::PredKind;

	fn var(name: &str) -> UVar {
		UVar::Base(name.to_string())
	}

	fn pair() -> UTerm {
		UTerm::sum(["x1", "x2"], UTerm::mul([UTerm::table("r", "x1"), UTerm::table("r", "x2")]))
	}

	#[test]
	fn swap_exchanges_layers() {
		let bvm = Bvm::new(vec![[var("x1"), var("y1")].into(), [var("x2")].into()]);
		let swapped = bvm.swap(&var("x1"), &var("x2"));
		assert_eq!(swapped.layer_of(&var("x2")), Some(0));
		assert_eq!(swapped.layer_of(&var("x1")), Some(1));
		assert_eq!(swapped.layer_of(&var("y1")), Some(0));
		assert_eq!(swapped.swap(&var("x1"), &var("x2")), bvm);
	}

	#[test]
	fn validate_checks_depth_and_disjointness() {
		let t = pair();
		assert!(Bvm::new(vec![[var("x1")].into(), [var("x2")].into()]).validate(&t, &t).is_ok());
		assert!(Bvm::new(vec![[var("x1")].into(), [var("x1")].into()]).validate(&t, &t).is_err());
		// x1 is consumed locally at depth 0, so nothing is bound at depth 1.
		assert!(Bvm::new(vec![[].into(), [var("x2")].into()]).validate(&t, &t).is_err());
	}

	#[test]
	fn aligned_follows_alpha_equivalent_summations() {
		let body = |a: &str, b: &str| {
			UTerm::mul([UTerm::table("r", a), UTerm::table("r", b), UTerm::pred(PredKind::Gt, [UTerm::attr("k", b), UTerm::int(0)])])
		};
		let left = UTerm::sum(["x1", "x2"], body("x1", "x2"));
		let right = UTerm::sum(["y1", "y2"], body("y1", "y2"));
		let crossed = Bvm::new(vec![[var("x1"), var("y2")].into(), [var("x2"), var("y1")].into()]);
		assert!(crossed.validate(&left, &right).is_ok());
		let aligned = crossed.aligned(&left, &right);
		assert_eq!(aligned, Bvm::new(vec![[var("x1"), var("y1")].into(), [var("x2"), var("y2")].into()]));
		assert_eq!(aligned.aligned(&left, &right), aligned);
	}

	#[test]
	fn peel_shrinks_multi_variable_summations() {
		let sum = &LayerSum::of(&pair(), Side::Left)[0];
		let next = sum.peel(Some(&var("x1")), "#bv0");
		assert_eq!(next.len(), 1);
		assert_eq!(next[0].vars, OrdSet::unit(var("x2")));
		assert_eq!(next[0].body, UTerm::mul([UTerm::table("r", "#bv0"), UTerm::table("r", "x2")]));
		assert!(sum.peel(None, "#bv0").is_empty());
	}
}
