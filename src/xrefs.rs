//! Bidirectional cross-reference index.

use std::collections::{BTreeMap, BTreeSet};

use crate::Address;

/// Many-to-many relation `from -> to`, queryable from both ends.
///
/// Both projections always hold the same set of pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XRefs {
    forward: BTreeMap<Address, BTreeSet<Address>>,
    backward: BTreeMap<Address, BTreeSet<Address>>,
}

impl XRefs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `from -> to`. Returns false if the pair was already present.
    pub fn add_reference(&mut self, from: Address, to: Address) -> bool {
        let inserted = self.forward.entry(from).or_default().insert(to);
        if inserted {
            self.backward.entry(to).or_default().insert(from);
        }
        inserted
    }

    /// Drop one pair from both projections.
    pub fn remove_reference(&mut self, from: &Address, to: &Address) -> bool {
        let removed = detach(&mut self.forward, from, to);
        if removed {
            detach(&mut self.backward, to, from);
        }
        removed
    }

    /// Drop every pair whose source is `address`. Returns how many went away.
    pub fn remove_references_from(&mut self, address: &Address) -> usize {
        let Some(targets) = self.forward.remove(address) else {
            return 0;
        };
        for to in &targets {
            detach(&mut self.backward, to, address);
        }
        targets.len()
    }

    /// Drop every pair with `address` at either end.
    pub fn remove_references_involving(&mut self, address: &Address) -> usize {
        let mut removed = self.remove_references_from(address);
        if let Some(sources) = self.backward.remove(address) {
            for from in &sources {
                detach(&mut self.forward, from, address);
            }
            removed += sources.len();
        }
        removed
    }

    /// Addresses referenced by `address`, in order.
    pub fn from(&self, address: &Address) -> Vec<Address> {
        self.forward
            .get(address)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Addresses referencing `address`, in order.
    pub fn to(&self, address: &Address) -> Vec<Address> {
        self.backward
            .get(address)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, from: &Address, to: &Address) -> bool {
        self.forward.get(from).is_some_and(|set| set.contains(to))
    }

    /// Every pair, ordered by source then target.
    pub fn all_pairs(&self) -> impl Iterator<Item = (Address, Address)> + '_ {
        self.forward
            .iter()
            .flat_map(|(from, targets)| targets.iter().map(move |to| (*from, *to)))
    }

    pub fn len(&self) -> usize {
        self.forward.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    pub fn clear(&mut self) {
        self.forward.clear();
        self.backward.clear();
    }
}

fn detach(map: &mut BTreeMap<Address, BTreeSet<Address>>, key: &Address, value: &Address) -> bool {
    let Some(set) = map.get_mut(key) else {
        return false;
    };
    let removed = set.remove(value);
    if set.is_empty() {
        map.remove(key);
    }
    removed
}
