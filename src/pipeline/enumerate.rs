use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

use itertools::Itertools;

use super::bvm::Bvm;
use super::evaluation::BvmEvaluation;
use super::sumtree::{BoundVar, USumTree};
use super::uexpr::UTerm;

/// Lazy source of alternative matchings.
pub trait BvmEnumerator {
	/// The matching `next` would return; never advances.
	fn peek(&self) -> Option<&Bvm>;
	/// Consumes the current matching, or `None` once exhausted or at the limit.
	fn next(&mut self) -> Option<Bvm>;
	fn yielded(&self) -> usize;
}

/// Best-first local search from a seed matching over same-table swaps.
pub struct HeuristicBvmEnumerator<'a> {
	left: &'a UTerm,
	right: &'a UTerm,
	eval: BvmEvaluation<'a>,
	nodes: Vec<Vec<BoundVar>>,
	heap: BinaryHeap<Reverse<(usize, usize, Bvm)>>,
	visited: HashSet<Bvm>,
	seq: usize,
	yielded: usize,
	limit: usize,
}

impl<'a> HeuristicBvmEnumerator<'a> {
	pub fn new(left: &'a UTerm, right: &'a UTerm, seed: Bvm, limit: usize) -> Self {
		let mut forest = USumTree::forest(left);
		forest.extend(USumTree::forest(right));
		let nodes = USumTree::nodes(&forest).into_iter().map(<[BoundVar]>::to_vec).collect();
		let mut enumerator = HeuristicBvmEnumerator {
			left,
			right,
			eval: BvmEvaluation::new(left, right),
			nodes,
			heap: BinaryHeap::new(),
			visited: HashSet::new(),
			seq: 0,
			yielded: 0,
			limit,
		};
		enumerator.visited.insert(seed.clone());
		enumerator.push(seed);
		enumerator
	}

	fn push(&mut self, bvm: Bvm) {
		let score = self.eval.score(&bvm);
		self.heap.push(Reverse((score, self.seq, bvm)));
		self.seq += 1;
	}

	fn neighbors(&self, bvm: &Bvm) -> Vec<Bvm> {
		self.nodes
			.iter()
			.flat_map(|node| node.iter().tuple_combinations())
			.filter(|(a, b)| a.table == b.table && bvm.layer_of(&a.var) != bvm.layer_of(&b.var))
			.map(|(a, b)| bvm.swap(&a.var, &b.var))
			.filter(|swapped| swapped.validate(self.left, self.right).is_ok())
			.collect()
	}
}

impl BvmEnumerator for HeuristicBvmEnumerator<'_> {
	fn peek(&self) -> Option<&Bvm> {
		if self.yielded >= self.limit {
			return None;
		}
		self.heap.peek().map(|Reverse((_, _, bvm))| bvm)
	}

	fn next(&mut self) -> Option<Bvm> {
		if self.yielded >= self.limit {
			return None;
		}
		let Reverse((score, _, bvm)) = self.heap.pop()?;
		self.yielded += 1;
		for neighbor in self.neighbors(&bvm) {
			if self.visited.insert(neighbor.clone()) {
				self.push(neighbor);
			}
		}
		log::debug!("Matching #{} (score {}): {}", self.yielded, score, bvm);
		Some(bvm)
	}

	fn yielded(&self) -> usize {
		self.yielded
	}
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeSet;

	use super::*;
	use crate::pipeline::uexpr::UVar;

	fn var(name: &str) -> UVar {
		UVar::Base(name.to_string())
	}

	fn triple(vars: [&str; 3]) -> UTerm {
		UTerm::sum(vars, UTerm::mul(vars.map(|v| UTerm::table("r", v))))
	}

	#[test]
	fn peek_is_idempotent_and_next_respects_limit() {
		let left = triple(["x1", "x2", "x3"]);
		let right = triple(["y1", "y2", "y3"]);
		let seed = Bvm::new(vec![
			BTreeSet::from([var("x1"), var("y1")]),
			BTreeSet::from([var("x2"), var("y2")]),
			BTreeSet::from([var("x3"), var("y3")]),
		]);
		let mut bvms = HeuristicBvmEnumerator::new(&left, &right, seed.clone(), 4);
		assert_eq!(bvms.peek(), Some(&seed));
		assert_eq!(bvms.peek(), Some(&seed));
		assert_eq!(bvms.yielded(), 0);
		let mut seen = HashSet::new();
		while let Some(bvm) = bvms.next() {
			assert!(seen.insert(bvm));
		}
		assert_eq!(seen.len(), 4);
		assert_eq!(bvms.yielded(), 4);
		assert!(bvms.peek().is_none());
	}
}
