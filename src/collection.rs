//! Ordered views over source containers and the keyed containers results are
//! collected into.
//!
//! An [`OrderedView`] is the only thing the engines iterate. It is a plain list
//! of `(Key, value)` entries in the container's natural order: positional for
//! lists, sets and key-value maps, insertion order for records. The engines
//! never sort it.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

use crate::core::{Key, Shape};

/// A read-only, ordered sequence of entries drawn from a source container.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedView<V> {
    shape: Shape,
    entries: Vec<(Key, V)>,
}

impl<V> OrderedView<V> {
    /// A missing, null, or non-container source. Engines treat it as a
    /// silent no-op and complete immediately with an empty result.
    pub fn absent() -> Self {
        Self {
            shape: Shape::Sequential,
            entries: Vec::new(),
        }
    }

    /// A sequential container, keyed by position.
    pub fn sequence(items: impl IntoIterator<Item = V>) -> Self {
        Self {
            shape: Shape::Sequential,
            entries: items
                .into_iter()
                .enumerate()
                .map(|(index, item)| (Key::Index(index), item))
                .collect(),
        }
    }

    /// An associative record, keyed by property name in insertion order.
    ///
    /// Repeating a name replaces the earlier value but keeps its original
    /// position, the way re-assigning an object property does.
    pub fn record<N>(items: impl IntoIterator<Item = (N, V)>) -> Self
    where
        N: Into<String>,
    {
        let mut entries: Vec<(Key, V)> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();

        for (name, item) in items {
            match positions.entry(name.into()) {
                Entry::Occupied(found) => entries[*found.get()].1 = item,
                Entry::Vacant(vacant) => {
                    let key = Key::from(vacant.key().as_str());
                    vacant.insert(entries.len());
                    entries.push((key, item));
                }
            }
        }

        Self {
            shape: Shape::Associative,
            entries,
        }
    }

    /// A unique-value set in insertion order, keyed by position. Repeated
    /// values after the first are dropped.
    pub fn set(items: impl IntoIterator<Item = V>) -> Self
    where
        V: Hash + Eq,
    {
        let items: Vec<V> = items.into_iter().collect();

        let keep: Vec<bool> = {
            let mut seen = HashSet::with_capacity(items.len());
            items.iter().map(|item| seen.insert(item)).collect()
        };

        Self::sequence(
            items
                .into_iter()
                .zip(keep)
                .filter_map(|(item, keep)| keep.then_some(item)),
        )
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &V)> {
        self.entries.iter().map(|(key, value)| (key, value))
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.entries.iter().map(|(key, _)| key)
    }

    pub(crate) fn into_parts(self) -> (Shape, Vec<(Key, V)>) {
        (self.shape, self.entries)
    }
}

impl<K, W> OrderedView<(K, W)> {
    /// A key-value map in insertion order. Each value is the `(key, value)`
    /// pair itself, and the entry key is its position.
    pub fn pairs(items: impl IntoIterator<Item = (K, W)>) -> Self
    where
        K: Hash + Eq + Clone,
    {
        let mut pairs: Vec<(K, W)> = Vec::new();
        let mut positions: HashMap<K, usize> = HashMap::new();

        for (key, value) in items {
            match positions.entry(key) {
                Entry::Occupied(found) => pairs[*found.get()].1 = value,
                Entry::Vacant(vacant) => {
                    let key = vacant.key().clone();
                    vacant.insert(pairs.len());
                    pairs.push((key, value));
                }
            }
        }

        Self::sequence(pairs)
    }
}

impl<V> Default for OrderedView<V> {
    fn default() -> Self {
        Self::absent()
    }
}

impl<V> From<Vec<V>> for OrderedView<V> {
    fn from(value: Vec<V>) -> Self {
        Self::sequence(value)
    }
}

impl<V, T> From<Option<T>> for OrderedView<V>
where
    T: Into<OrderedView<V>>,
{
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or_default()
    }
}

/// An associative container keyed by original [`Key`], kept in source order.
#[derive(Debug, Clone)]
pub struct Keyed<T> {
    entries: Vec<(Key, T)>,
    /// Position of each key's first entry.
    index: HashMap<Key, usize>,
}

impl<T> Keyed<T> {
    pub fn new() -> Self {
        Self::from_entries(Vec::new())
    }

    fn from_entries(entries: Vec<(Key, T)>) -> Self {
        let mut index = HashMap::with_capacity(entries.len());
        for (position, (key, _)) in entries.iter().enumerate() {
            index.entry(key.clone()).or_insert(position);
        }

        Self { entries, index }
    }

    pub fn get(&self, key: impl Into<Key>) -> Option<&T> {
        let position = *self.index.get(&key.into())?;
        self.entries.get(position).map(|(_, value)| value)
    }

    pub fn contains_key(&self, key: impl Into<Key>) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &T)> {
        self.entries.iter().map(|(key, value)| (key, value))
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.entries.iter().map(|(key, _)| key)
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|(_, value)| value)
    }
}

impl<T: PartialEq> PartialEq for Keyed<T> {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl<T> Default for Keyed<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> FromIterator<(K, T)> for Keyed<T>
where
    K: Into<Key>,
{
    fn from_iter<I: IntoIterator<Item = (K, T)>>(iter: I) -> Self {
        Self::from_entries(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl<T> IntoIterator for Keyed<T> {
    type Item = (Key, T);
    type IntoIter = std::vec::IntoIter<(Key, T)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<T: Serialize> Serialize for Keyed<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// Results of a run, shaped after the source container.
#[derive(Debug, Clone, PartialEq)]
pub enum Collected<T> {
    /// Indexed by original position. Entries that never produced a value
    /// (because the run stopped early) are left as gaps.
    Sequential(Vec<Option<T>>),
    /// Keyed by original name.
    Associative(Keyed<T>),
}

impl<T> Collected<T> {
    pub fn empty(shape: Shape) -> Self {
        match shape {
            Shape::Sequential => Collected::Sequential(Vec::new()),
            Shape::Associative => Collected::Associative(Keyed::new()),
        }
    }

    pub fn shape(&self) -> Shape {
        match self {
            Collected::Sequential(_) => Shape::Sequential,
            Collected::Associative(_) => Shape::Associative,
        }
    }

    pub fn get(&self, key: impl Into<Key>) -> Option<&T> {
        match (self, key.into()) {
            (Collected::Sequential(items), Key::Index(index)) => {
                items.get(index).and_then(Option::as_ref)
            }
            (Collected::Associative(keyed), key) => keyed.get(key),
            (Collected::Sequential(_), Key::Name(_)) => None,
        }
    }

    /// Number of entries holding a value.
    pub fn len(&self) -> usize {
        match self {
            Collected::Sequential(items) => items.iter().filter(|item| item.is_some()).count(),
            Collected::Associative(keyed) => keyed.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flattens into `(key, value)` pairs in source order, skipping gaps.
    pub fn into_keyed(self) -> Keyed<T> {
        match self {
            Collected::Sequential(items) => Keyed::from_entries(
                items
                    .into_iter()
                    .enumerate()
                    .filter_map(|(index, item)| item.map(|item| (Key::Index(index), item)))
                    .collect(),
            ),
            Collected::Associative(keyed) => keyed,
        }
    }
}

impl<T: Serialize> Serialize for Collected<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Collected::Sequential(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Collected::Associative(keyed) => keyed.serialize(serializer),
        }
    }
}

/// Per-position result storage used while a run is in progress.
pub(crate) struct Slots<T> {
    shape: Shape,
    slots: Vec<Option<(Key, T)>>,
}

impl<T> Slots<T> {
    pub(crate) fn new(shape: Shape, len: usize) -> Self {
        Self {
            shape,
            slots: std::iter::repeat_with(|| None).take(len).collect(),
        }
    }

    pub(crate) fn record(&mut self, position: usize, key: Key, value: T) {
        if let Some(slot) = self.slots.get_mut(position) {
            *slot = Some((key, value));
        }
    }

    /// Moves everything recorded so far out, leaving the slots empty.
    pub(crate) fn take(&mut self) -> Collected<T> {
        let slots = std::mem::take(&mut self.slots);

        match self.shape {
            Shape::Sequential => {
                Collected::Sequential(slots.into_iter().map(|slot| slot.map(|(_, v)| v)).collect())
            }
            Shape::Associative => {
                Collected::Associative(Keyed::from_entries(slots.into_iter().flatten().collect()))
            }
        }
    }
}
