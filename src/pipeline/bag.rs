use std::collections::BTreeMap;
use std::iter::FromIterator;

/// A multiset with the size measures used for structural scoring.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Bag<T: Ord>(BTreeMap<T, usize>);

impl<T: Ord> Default for Bag<T> {
	fn default() -> Self {
		Bag(BTreeMap::new())
	}
}

impl<T: Ord> Bag<T> {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&mut self, item: T) {
		*self.0.entry(item).or_insert(0) += 1;
	}

	pub fn count(&self, item: &T) -> usize {
		self.0.get(item).copied().unwrap_or(0)
	}

	pub fn len(&self) -> usize {
		self.0.values().sum()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn extend_from(&mut self, other: &Bag<T>)
	where T: Clone {
		for (item, n) in &other.0 {
			*self.0.entry(item.clone()).or_insert(0) += n;
		}
	}

	/// Size of the multiset intersection.
	pub fn intersection_size(&self, other: &Bag<T>) -> usize {
		self.0.iter().map(|(item, n)| (*n).min(other.count(item))).sum()
	}

	/// Size of the symmetric multiset difference.
	pub fn difference_size(&self, other: &Bag<T>) -> usize {
		self.len() + other.len() - 2 * self.intersection_size(other)
	}
}

impl<T: Ord> FromIterator<T> for Bag<T> {
	fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
		let mut bag = Bag::new();
		for item in iter {
			bag.insert(item);
		}
		bag
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn multiplicities_count_in_difference() {
		let a: Bag<u64> = [1, 1, 2, 3].into_iter().collect();
		let b: Bag<u64> = [1, 2, 2].into_iter().collect();
		assert_eq!(a.intersection_size(&b), 2);
		assert_eq!(a.difference_size(&b), 3);
		assert_eq!(a.difference_size(&a), 0);
		assert_eq!(Bag::<u64>::new().difference_size(&a), 4);
	}
}
