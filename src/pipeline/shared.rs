use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

pub trait Eval<S, T> {
	fn eval(self, source: S) -> T;
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
	#[serde(alias = "int", alias = "integral")]
	Integer,
	#[serde(alias = "nat")]
	Natural,
	Real,
	String,
	Char,
}

impl Display for DataType {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		let name = match self {
			DataType::Integer => "integer",
			DataType::Natural => "natural",
			DataType::Real => "real",
			DataType::String => "string",
			DataType::Char => "char",
		};
		write!(f, "{}", name)
	}
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Column {
	pub name: String,
	pub ty: DataType,
}

impl Column {
	pub fn new(name: impl Into<String>, ty: DataType) -> Self {
		Column { name: name.into(), ty }
	}
}

/// Ordered column descriptors of a tuple variable.
#[derive(Serialize, Deserialize, Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[serde(transparent)]
pub struct Schema {
	pub columns: Vec<Column>,
}

impl Schema {
	pub fn new(columns: impl IntoIterator<Item = Column>) -> Self {
		Schema { columns: columns.into_iter().collect() }
	}

	pub fn ty_of(&self, attr: &str) -> Option<DataType> {
		self.columns.iter().find(|c| c.name == attr).map(|c| c.ty)
	}
}

impl Display for Schema {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "({})", self.columns.iter().map(|c| format!("{}: {}", c.name, c.ty)).format(", "))
	}
}

/// Base tuple variable name to its schema.
pub type SchemaMap = BTreeMap<String, Schema>;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Side {
	Left,
	Right,
}

impl Side {
	pub fn opposite(self) -> Side {
		match self {
			Side::Left => Side::Right,
			Side::Right => Side::Left,
		}
	}
}

// Symbol names shared by the translator, the solver witness and the replay.

#[inline]
pub fn attr_name(base: &str, attr: &str) -> String {
	format!("{}.{}", base, attr)
}

#[inline]
pub fn table_atom_name(table: &str, base: &str) -> String {
	format!("{}!{}", table, base)
}

#[inline]
pub fn isnull_name(base: &str, attr: &str) -> String {
	format!("isnull!{}.{}", base, attr)
}
