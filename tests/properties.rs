use std::collections::HashSet;

use proptest::prelude::*;
use uexpr_equiv::pipeline::bag::Bag;
use uexpr_equiv::pipeline::bvm::HeuristicSeedGenerator;
use uexpr_equiv::pipeline::enumerate::{BvmEnumerator, HeuristicBvmEnumerator};
use uexpr_equiv::pipeline::shared::{Column, DataType, Schema, SchemaMap};
use uexpr_equiv::pipeline::timeout::Timeout;
use uexpr_equiv::pipeline::translate::LiaStarTranslator;
use uexpr_equiv::pipeline::uexpr::{PredKind, UTerm};

const TABLES: [&str; 2] = ["r", "s"];

/// A join over one to three tables, projected on its first tuple.
fn query(prefix: &'static str) -> impl Strategy<Value = UTerm> {
	(prop::collection::vec(0..TABLES.len(), 1..=3), prop::option::of((0usize..3, -2i64..3))).prop_map(move |(tables, filter)| {
		let vars = (0..tables.len()).map(|i| format!("{}{}", prefix, i)).collect::<Vec<_>>();
		let mut factors = tables.iter().zip(&vars).map(|(t, v)| UTerm::table(TABLES[*t], v)).collect::<Vec<_>>();
		factors.push(UTerm::eq(UTerm::tuple(&vars[0]), UTerm::tuple("out")));
		if let Some((i, c)) = filter {
			let v = &vars[i % vars.len()];
			factors.push(UTerm::pred(PredKind::Gt, [UTerm::attr("a", v), UTerm::int(c)]));
		}
		UTerm::sum(vars.iter().map(String::as_str), UTerm::mul(factors))
	})
}

fn schemas() -> SchemaMap {
	let schema = Schema::new([Column::new("a", DataType::Integer)]);
	["x0", "x1", "x2", "y0", "y1", "y2", "out"].into_iter().map(|v| (v.to_string(), schema.clone())).collect()
}

proptest! {
	#[test]
	fn bag_measures_agree(a in prop::collection::vec(0u8..4, 0..12), b in prop::collection::vec(0u8..4, 0..12)) {
		let (x, y): (Bag<u8>, Bag<u8>) = (a.iter().copied().collect(), b.iter().copied().collect());
		prop_assert_eq!(x.len(), a.len());
		prop_assert_eq!(x.intersection_size(&y), y.intersection_size(&x));
		let diff: usize = (0..4).map(|i| x.count(&i).abs_diff(y.count(&i))).sum();
		prop_assert_eq!(x.difference_size(&y), diff);
		let mut union = x.clone();
		union.extend_from(&y);
		prop_assert_eq!(union.len(), a.len() + b.len());
	}

	#[test]
	fn enumerator_yields_distinct_valid_matchings(left in query("x"), right in query("y"), limit in 1usize..6) {
		let timeout = Timeout::never();
		let seed = HeuristicSeedGenerator::new(&left, &right, "out", &timeout).generate().unwrap();
		let mut bvms = HeuristicBvmEnumerator::new(&left, &right, seed.clone(), limit);
		prop_assert_eq!(bvms.peek(), Some(&seed));
		let mut seen = HashSet::new();
		loop {
			let peeked = bvms.peek().cloned();
			prop_assert_eq!(bvms.peek().cloned(), peeked.clone());
			let Some(bvm) = bvms.next() else { break };
			prop_assert_eq!(Some(&bvm), peeked.as_ref());
			prop_assert!(bvm.validate(&left, &right).is_ok());
			prop_assert!(seen.insert(bvm));
		}
		prop_assert!(seen.len() <= limit);
		prop_assert_eq!(bvms.yielded(), seen.len());
	}

	#[test]
	fn translation_is_deterministic(left in query("x"), right in query("y")) {
		let timeout = Timeout::never();
		let schemas = schemas();
		let seed = HeuristicSeedGenerator::new(&left, &right, "out", &timeout).generate().unwrap();
		let run = || LiaStarTranslator::new(&schemas, &seed, &timeout)
			.translate(&left, &right)
			.map(|f| (f.to_string(), f.term.under_approximate().has_sum()))
			.map_err(|e| e.to_string());
		let first = run();
		prop_assert_eq!(&first, &run());
		if let Ok((_, summed)) = first {
			prop_assert!(!summed);
		}
	}
}
