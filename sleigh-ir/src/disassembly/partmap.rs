use std::borrow::Borrow;
use std::collections::btree_map::{Entry, RangeMut};
use std::collections::BTreeMap as Map;
use std::ops::RangeBounds;

/// A piecewise-constant map: each key starts a run that lasts until the
/// next key; points before the first key take the default.
#[derive(Debug, Clone)]
pub struct PartMap<K: Ord, V> {
    mapping: Map<K, V>,
    default: V,
}

impl<K, V> PartMap<K, V>
where
    K: Clone + Ord,
    V: Clone,
{
    pub fn new(default: V) -> Self {
        Self {
            mapping: Map::new(),
            default,
        }
    }

    pub fn default_value(&self) -> &V {
        &self.default
    }

    pub fn default_value_mut(&mut self) -> &mut V {
        &mut self.default
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn clear(&mut self) {
        self.mapping.clear();
    }

    pub fn get(&self, point: &K) -> Option<&V> {
        self.mapping.range(..=point).next_back().map(|(_, v)| v)
    }

    pub fn get_or_default(&self, point: &K) -> &V {
        self.get(point).unwrap_or(&self.default)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.mapping.iter()
    }

    pub fn range_mut<'a, T, R>(&'a mut self, range: R) -> RangeMut<'a, K, V>
    where
        K: Borrow<T> + 'a,
        R: RangeBounds<T> + 'a,
        T: Ord + ?Sized + 'a,
    {
        self.mapping.range_mut(range)
    }

    /// Ensures a run starts exactly at `at`, inheriting the value in force
    /// there.
    pub fn split_mut(&mut self, at: &K) -> &mut V {
        let inherited = self.get_or_default(at).clone();
        match self.mapping.entry(at.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(inherited),
        }
    }

    pub fn split(&mut self, at: &K) {
        self.split_mut(at);
    }
}
