use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter, Write};

use imbl::{OrdMap, Vector};
use indenter::indented;
use itertools::Itertools;
use num::rational::Rational64;
use num::{Signed, Zero};
use serde::{Deserialize, Serialize};

use super::shared::{DataType, Eval, SchemaMap, attr_name, isnull_name, table_atom_name};
use super::smt::{Assignment, Value};
use super::translate::TupleInfo;
use super::uexpr::{PredKind, UTerm, UVar};

/// A SQL cell value.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Datum {
	Int(i64),
	Real(Rational64),
	Str(String),
}

impl Display for Datum {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Datum::Int(i) => write!(f, "{}", i),
			Datum::Real(r) => write!(f, "{}", r),
			Datum::Str(s) => write!(f, "{:?}", s),
		}
	}
}

impl Datum {
	fn number(r: Rational64) -> Datum {
		if r.is_integer() { Datum::Int(r.to_integer()) } else { Datum::Real(r) }
	}

	fn as_number(&self) -> Option<Rational64> {
		match self {
			Datum::Int(i) => Some(Rational64::from_integer(*i)),
			Datum::Real(r) => Some(*r),
			Datum::Str(_) => None,
		}
	}

	fn default_of(ty: DataType) -> Datum {
		match ty {
			DataType::Integer | DataType::Natural | DataType::Real => Datum::Int(0),
			DataType::String | DataType::Char => Datum::Str(String::new()),
		}
	}
}

fn positive(value: Option<&Value>) -> Option<i64> {
	match value {
		Some(Value::Int(n)) if *n > 0 => Some(*n),
		Some(Value::Real(r)) if r.is_positive() => Some(r.to_integer().max(1)),
		_ => None,
	}
}

/// A cell: its value and, apart from it, whether the column is null.
///
/// Comparisons only see the value; nullness is only observed by `IS NULL`.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Field {
	pub value: Datum,
	pub null: bool,
}

impl Display for Field {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		if self.null { write!(f, "NULL") } else { write!(f, "{}", self.value) }
	}
}

impl From<Datum> for Field {
	fn from(value: Datum) -> Self {
		Field { value, null: false }
	}
}

/// Column name to cell.
pub type Row = BTreeMap<String, Field>;

/// A concrete database instance together with the output tuple it is probed at.
#[derive(Serialize, Deserialize, Clone, Debug, Default, Eq, PartialEq)]
pub struct Database {
	pub tables: BTreeMap<String, Vec<(Row, usize)>>,
	pub output: Row,
}

impl Display for Database {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		let row = |r: &Row| format!("({})", r.iter().map(|(c, d)| format!("{}: {}", c, d)).format(", "));
		for (table, rows) in &self.tables {
			writeln!(f, "{}:", table)?;
			for (r, n) in rows {
				writeln!(indented(f).with_str("\t"), "{} × {}", row(r), n)?;
			}
		}
		write!(f, "output: {}", row(&self.output))
	}
}

impl Database {
	pub fn insert(&mut self, table: &str, row: Row, multiplicity: usize) {
		let rows = self.tables.entry(table.to_string()).or_default();
		match rows.iter_mut().find(|(r, _)| *r == row) {
			Some((_, n)) => *n += multiplicity,
			None => rows.push((row, multiplicity)),
		}
	}

	pub fn rows(&self, table: &str) -> Vec<&Row> {
		self.tables.get(table).map(|rows| rows.iter().map(|(r, _)| r).collect()).unwrap_or_default()
	}

	pub fn multiplicity(&self, table: &str, row: &Row) -> usize {
		self.tables.get(table).and_then(|rows| rows.iter().find(|(r, _)| r == row)).map_or(0, |(_, n)| *n)
	}

	fn row_of(name: &str, assignment: &Assignment, schemas: &SchemaMap) -> Row {
		let Some(schema) = schemas.get(name) else {
			return Row::new();
		};
		schema
			.columns
			.iter()
			.map(|c| {
				let value = match assignment.get(&attr_name(name, &c.name)) {
					Some(Value::Int(i)) => Datum::Int(*i),
					Some(Value::Real(r)) => Datum::number(*r),
					Some(Value::Str(s)) => Datum::Str(s.clone()),
					Some(Value::Unknown(_)) | None => Datum::default_of(c.ty),
				};
				let null = positive(assignment.get(&isnull_name(name, &c.name))).is_some();
				(c.name.clone(), Field { value, null })
			})
			.collect()
	}

	/// Reads the database a model describes: every tuple present in its table becomes a row.
	pub fn from_assignment(assignment: &Assignment, tuples: &[TupleInfo], output: &str, schemas: &SchemaMap) -> Database {
		let mut schemas = schemas.clone();
		for t in tuples {
			if let Some(schema) = &t.schema {
				schemas.entry(t.name.clone()).or_insert_with(|| schema.clone());
			}
		}
		let mut db = Database { tables: BTreeMap::new(), output: Database::row_of(output, assignment, &schemas) };
		for t in tuples {
			let Some(table) = &t.table else { continue };
			if let Some(n) = positive(assignment.get(&table_atom_name(table, &t.name))) {
				db.insert(table, Database::row_of(&t.name, assignment, &schemas), n as usize);
			}
		}
		db
	}
}

/// Evaluates a term over a database the way its translation reads it.
///
/// A column's null flag is independent of its value, so `a = a` holds even
/// for a null `a`.
#[derive(Clone)]
pub struct Env<'a> {
	db: &'a Database,
	schemas: &'a SchemaMap,
	rows: OrdMap<String, &'a Row>,
}

impl<'a> Env<'a> {
	pub fn new(db: &'a Database, schemas: &'a SchemaMap, output: &str) -> Self {
		Env { db, schemas, rows: OrdMap::unit(output.to_string(), &db.output) }
	}

	fn field(&self, attr: &str, base: &str) -> Option<&Field> {
		self.rows.get(base)?.get(attr)
	}

	fn value(&self, term: &UTerm) -> Option<Datum> {
		match term {
			UTerm::Var(UVar::Proj(attr, base)) => self.field(attr, base).map(|c| c.value.clone()),
			UTerm::Const(c) => Some(Datum::number(*c)),
			UTerm::Str(s) => Some(Datum::Str(s.clone())),
			UTerm::Func(name, args) => self.apply(name, args),
			t => self.eval(t).map(Datum::number),
		}
	}

	fn apply(&self, name: &str, args: &Vector<UTerm>) -> Option<Datum> {
		let name = name.to_lowercase();
		if !matches!(name.as_str(), "divide" | "/" | "minus" | "-" | "plus" | "+" | "times" | "*") {
			return None;
		}
		let nums = args.iter().map(|a| self.value(a)?.as_number()).collect::<Option<Vec<_>>>()?;
		let result = match (name.as_str(), nums.as_slice()) {
			("divide" | "/", [a, b]) if !b.is_zero() => a / b,
			("minus" | "-", [a, b]) => a - b,
			("minus" | "-", [a]) => -a,
			("plus" | "+", ns) => ns.iter().sum(),
			("times" | "*", ns) => ns.iter().product(),
			_ => return None,
		};
		Some(Datum::number(result))
	}

	/// Two tuples are equal when every column agrees on value and nullness.
	fn same_tuple(&self, a: &str, b: &str) -> Option<bool> {
		let (ra, rb) = (self.rows.get(a)?, self.rows.get(b)?);
		let (sa, sb) = (self.schemas.get(a)?, self.schemas.get(b)?);
		if sa.columns.len() != sb.columns.len() {
			return None;
		}
		Some(sa.columns.iter().zip(&sb.columns).all(|(ca, cb)| match (ra.get(&ca.name), rb.get(&cb.name)) {
			(Some(x), Some(y)) => x == y,
			_ => false,
		}))
	}

	fn pred(&self, kind: &PredKind, args: &Vector<UTerm>) -> Option<bool> {
		match (kind, args.len()) {
			(PredKind::IsNull, 1) => match &args[0] {
				UTerm::Var(UVar::Proj(attr, base)) => Some(self.field(attr, base)?.null),
				_ => None,
			},
			(PredKind::IsNull | PredKind::Named(_), _) => None,
			(kind, 2) => {
				if let (UTerm::Var(UVar::Base(a)), UTerm::Var(UVar::Base(b))) = (&args[0], &args[1]) {
					let same = self.same_tuple(a, b)?;
					return match kind {
						PredKind::Eq => Some(same),
						PredKind::Ne => Some(!same),
						_ => None,
					};
				}
				let ord = compare(&self.value(&args[0])?, &self.value(&args[1])?)?;
				Some(match kind {
					PredKind::Eq => ord == Ordering::Equal,
					PredKind::Ne => ord != Ordering::Equal,
					PredKind::Lt => ord == Ordering::Less,
					PredKind::Le => ord != Ordering::Greater,
					PredKind::Gt => ord == Ordering::Greater,
					PredKind::Ge => ord != Ordering::Less,
					PredKind::IsNull | PredKind::Named(_) => return None,
				})
			},
			_ => None,
		}
	}
}

/// `None` when the values are incomparable.
fn compare(a: &Datum, b: &Datum) -> Option<Ordering> {
	match (a, b) {
		(Datum::Str(x), Datum::Str(y)) => Some(x.cmp(y)),
		(x, y) => Some(x.as_number()?.cmp(&y.as_number()?)),
	}
}

fn indicator(b: bool) -> Rational64 {
	if b { Rational64::from_integer(1) } else { Rational64::zero() }
}

impl Eval<&UTerm, Option<Rational64>> for &Env<'_> {
	fn eval(self, source: &UTerm) -> Option<Rational64> {
		match source {
			UTerm::Summation(vars, body) => {
				let domains = vars
					.iter()
					.map(|v| Some((v.base().to_string(), self.db.rows(body.table_of(v.base())?))))
					.collect::<Option<Vec<_>>>()?;
				let mut total = Rational64::zero();
				for choice in domains.iter().map(|(_, rows)| rows.iter()).multi_cartesian_product() {
					let mut env = self.clone();
					for ((name, _), row) in domains.iter().zip(choice) {
						env.rows.insert(name.clone(), *row);
					}
					total += (&env).eval(body.as_ref())?;
				}
				Some(total)
			},
			UTerm::Add(ts) => ts.iter().map(|t| self.eval(t)).sum(),
			UTerm::Mul(ts) => {
				let mut product = Rational64::from_integer(1);
				let mut unknown = false;
				for t in ts {
					match self.eval(t) {
						Some(n) if n.is_zero() => return Some(n),
						Some(n) => product *= n,
						None => unknown = true,
					}
				}
				if unknown { None } else { Some(product) }
			},
			UTerm::Neg(b) => Some(indicator(self.eval(b.as_ref())?.is_zero())),
			UTerm::Squash(b) => Some(indicator(!self.eval(b.as_ref())?.is_zero())),
			UTerm::Pred(kind, args) => self.pred(kind, args).map(indicator),
			UTerm::Table(table, UVar::Base(base)) => {
				let row = self.rows.get(base)?;
				Some(Rational64::from_integer(self.db.multiplicity(table, row) as i64))
			},
			UTerm::Table(..) => None,
			UTerm::Const(c) => Some(*c),
			UTerm::Var(_) | UTerm::Func(..) => self.value(source)?.as_number(),
			UTerm::Str(_) => None,
		}
	}
}

/// Result of a term over a database, when every part of it can be evaluated.
pub fn replay(term: &UTerm, db: &Database, schemas: &SchemaMap, output: &str) -> Option<Rational64> {
	(&Env::new(db, schemas, output)).eval(term)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::pipeline::shared::{Column, Schema};

	fn schemas() -> SchemaMap {
		let schema = Schema::new([Column::new("a", DataType::Integer)]);
		["x", "out", "#ct0"].into_iter().map(|v| (v.to_string(), schema.clone())).collect()
	}

	fn row(a: impl Into<Field>) -> Row {
		Row::from([("a".to_string(), a.into())])
	}

	fn db(a: impl Into<Field>) -> Database {
		let a: Field = a.into();
		let mut db = Database { tables: BTreeMap::new(), output: row(a.clone()) };
		db.insert("t", row(a), 1);
		db
	}

	fn select(filter: Option<UTerm>) -> UTerm {
		let mut factors = vec![UTerm::table("t", "x"), UTerm::eq(UTerm::tuple("x"), UTerm::tuple("out"))];
		factors.extend(filter);
		UTerm::sum(["x"], UTerm::mul(factors))
	}

	#[test]
	fn filters_change_multiplicities() {
		let gt = UTerm::pred(PredKind::Gt, [UTerm::attr("a", "x"), UTerm::int(0)]);
		let db = db(Datum::Int(0));
		assert_eq!(replay(&select(None), &db, &schemas(), "out"), Some(Rational64::from_integer(1)));
		assert_eq!(replay(&select(Some(gt)), &db, &schemas(), "out"), Some(Rational64::zero()));
	}

	#[test]
	fn null_flags_only_answer_isnull() {
		let db = db(Field { value: Datum::Int(0), null: true });
		let le = UTerm::pred(PredKind::Le, [UTerm::attr("a", "x"), UTerm::int(0)]);
		let gt = UTerm::pred(PredKind::Gt, [UTerm::attr("a", "x"), UTerm::int(0)]);
		let isnull = UTerm::pred(PredKind::IsNull, [UTerm::attr("a", "x")]);
		let each = |p: UTerm| replay(&UTerm::sum(["x"], UTerm::mul([UTerm::table("t", "x"), p])), &db, &schemas(), "out");
		let reflexive = UTerm::eq(UTerm::attr("a", "x"), UTerm::attr("a", "x"));
		assert_eq!(each(le), Some(Rational64::from_integer(1)));
		assert_eq!(each(gt), Some(Rational64::zero()));
		assert_eq!(each(isnull), Some(Rational64::from_integer(1)));
		assert_eq!(each(reflexive), Some(Rational64::from_integer(1)));
		assert_eq!(replay(&select(None), &db, &schemas(), "out"), Some(Rational64::from_integer(1)));
		// Equal tuples also agree on nullness.
		let mixed = Database { output: row(Datum::Int(0)), ..db.clone() };
		assert_eq!(replay(&select(None), &mixed, &schemas(), "out"), Some(Rational64::zero()));
	}

	#[test]
	fn untagged_summations_cannot_be_replayed() {
		let term = UTerm::sum(["x"], UTerm::eq(UTerm::attr("a", "x"), UTerm::int(1)));
		assert_eq!(replay(&term, &db(Datum::Int(1)), &schemas(), "out"), None);
		let opaque = UTerm::sum(["x"], UTerm::mul([UTerm::table("t", "x"), UTerm::func("f", [UTerm::attr("a", "x")])]));
		assert_eq!(replay(&opaque, &db(Datum::Int(1)), &schemas(), "out"), None);
	}

	#[test]
	fn models_become_databases() {
		let assignment: Assignment = [
			("t!#ct0".to_string(), Value::Int(2)),
			("#ct0.a".to_string(), Value::Int(-3)),
			("t!x".to_string(), Value::Int(1)),
			("x.a".to_string(), Value::Int(-3)),
			("out.a".to_string(), Value::Int(5)),
			("isnull!out.a".to_string(), Value::Int(1)),
		]
		.into_iter()
		.collect();
		let tuples = ["#ct0", "x"]
			.into_iter()
			.map(|name| TupleInfo { name: name.to_string(), table: Some("t".to_string()), schema: None })
			.collect_vec();
		let db = Database::from_assignment(&assignment, &tuples, "out", &schemas());
		assert_eq!(db.tables["t"], vec![(row(Datum::Int(-3)), 3)]);
		assert_eq!(db.output, row(Field { value: Datum::Int(5), null: true }));
		assert!(db.to_string().contains("a: NULL"));
		assert!(db.to_string().contains("× 3"));
	}
}
