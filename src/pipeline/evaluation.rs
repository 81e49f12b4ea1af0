use itertools::Itertools;

use super::bag::Bag;
use super::bvm::Bvm;
use super::uexpr::UTerm;

/// Scores a matching by how far apart both terms remain once it is applied; lower is better.
pub struct BvmEvaluation<'a> {
	left: &'a UTerm,
	right: &'a UTerm,
}

fn shape(term: &UTerm) -> Bag<u64> {
	term.subterms().into_iter().map(UTerm::sort_hash).collect()
}

impl<'a> BvmEvaluation<'a> {
	pub fn new(left: &'a UTerm, right: &'a UTerm) -> Self {
		BvmEvaluation { left, right }
	}

	pub fn distance(a: &UTerm, b: &UTerm) -> usize {
		shape(a).difference_size(&shape(b))
	}

	pub fn score(&self, bvm: &Bvm) -> usize {
		let left = bvm.apply(self.left);
		let right = bvm.apply(self.right);
		let lefts = left.summations().into_iter().map(|(vars, body)| UTerm::Summation(vars.clone(), Box::new(body.clone()))).collect_vec();
		let mut rights = right.summations().into_iter().map(|(vars, body)| Some(UTerm::Summation(vars.clone(), Box::new(body.clone())))).collect_vec();
		let mut score = 0;
		for l in &lefts {
			let closest = rights
				.iter()
				.enumerate()
				.filter_map(|(j, r)| r.as_ref().map(|r| (j, Self::distance(l, r))))
				.min_by_key(|(_, d)| *d);
			match closest {
				Some((j, d)) => {
					rights[j] = None;
					score += d;
				},
				None => score += l.size(),
			}
		}
		score + rights.iter().flatten().map(UTerm::size).sum::<usize>()
	}
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeSet;

	use super::*;
	use crate::pipeline::uexpr::{PredKind, UVar};

	fn var(name: &str) -> UVar {
		UVar::Base(name.to_string())
	}

	#[test]
	fn aligned_matching_scores_lower() {
		let body = |a: &str, b: &str| {
			UTerm::mul([UTerm::table("r", a), UTerm::table("r", b), UTerm::pred(PredKind::Lt, [UTerm::attr("k", a), UTerm::attr("k", b)])])
		};
		let left = UTerm::sum(["x1", "x2"], body("x1", "x2"));
		let right = UTerm::sum(["y1", "y2"], body("y1", "y2"));
		let eval = BvmEvaluation::new(&left, &right);
		let aligned = Bvm::new(vec![BTreeSet::from([var("x1"), var("y1")]), BTreeSet::from([var("x2"), var("y2")])]);
		let crossed = aligned.swap(&var("x1"), &var("x2"));
		assert_eq!(eval.score(&aligned), 0);
		assert!(eval.score(&crossed) > 0);
	}
}
