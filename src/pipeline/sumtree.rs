use std::fmt::{Display, Formatter, Write};

use indenter::indented;
use itertools::Itertools;

use super::uexpr::{UTerm, UVar};

/// A bound variable together with the table it ranges over, if known.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct BoundVar {
	pub var: UVar,
	pub table: Option<String>,
}

impl Display for BoundVar {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match &self.table {
			Some(t) => write!(f, "{}: {}", self.var, t),
			None => write!(f, "{}", self.var),
		}
	}
}

/// Summation nesting of a term: one node per summation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct USumTree {
	pub vars: Vec<BoundVar>,
	pub children: Vec<USumTree>,
}

impl USumTree {
	pub fn forest(term: &UTerm) -> Vec<USumTree> {
		term.summations()
			.into_iter()
			.map(|(vars, body)| USumTree {
				vars: vars
					.iter()
					.map(|v| BoundVar { var: v.clone(), table: body.table_of(v.base()).map(str::to_string) })
					.collect(),
				children: USumTree::forest(body),
			})
			.collect()
	}

	pub fn nodes(forest: &[USumTree]) -> Vec<&[BoundVar]> {
		let mut out = vec![];
		let mut stack = forest.iter().rev().collect_vec();
		while let Some(tree) = stack.pop() {
			out.push(tree.vars.as_slice());
			stack.extend(tree.children.iter().rev());
		}
		out
	}

	pub fn depth(&self) -> usize {
		1 + self.children.iter().map(USumTree::depth).max().unwrap_or(0)
	}
}

impl Display for USumTree {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "{{{}}}", self.vars.iter().format(", "))?;
		for child in &self.children {
			writeln!(f)?;
			write!(indented(f).with_str("\t"), "{}", child)?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn forest_tags_tables_and_nests() {
		let inner = UTerm::sum(["y"], UTerm::mul([UTerm::table("s", "y"), UTerm::eq(UTerm::attr("a", "y"), UTerm::attr("a", "x"))]));
		let term = UTerm::sum(["x", "z"], UTerm::mul([UTerm::table("r", "x"), inner]));
		let forest = USumTree::forest(&term);
		assert_eq!(forest.len(), 1);
		assert_eq!(forest[0].vars, vec![
			BoundVar { var: UVar::Base("x".into()), table: Some("r".into()) },
			BoundVar { var: UVar::Base("z".into()), table: None },
		]);
		assert_eq!(forest[0].children[0].vars[0].table.as_deref(), Some("s"));
		assert_eq!(USumTree::nodes(&forest).len(), 2);
		assert_eq!(forest[0].depth(), 2);
	}
}
