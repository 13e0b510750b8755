//! Grouping of transfers by transaction hash.
//!
//! All transfers sharing a hash belong to one atomic operation (a swap, a
//! payment plus delivery). Groups come back in first-seen order and keep
//! source order inside each group, so every matcher built on top is
//! deterministic.

use std::collections::HashMap;
use std::hash::Hash;

use realt_data::Transfer;

/// Transfers sharing one transaction hash.
#[derive(Debug, Clone, PartialEq)]
pub struct HashGroup<'a> {
    pub hash: &'a str,
    pub transfers: Vec<&'a Transfer>,
}

/// Groups items by key, preserving first-seen key order and source order.
pub fn group_by_key<T, K, F>(items: impl IntoIterator<Item = T>, key: F) -> Vec<(K, Vec<T>)>
where
    K: Eq + Hash + Clone,
    F: Fn(&T) -> K,
{
    let mut index: HashMap<K, usize> = HashMap::new();
    let mut groups: Vec<(K, Vec<T>)> = Vec::new();

    for item in items {
        let k = key(&item);
        match index.get(&k) {
            Some(&i) => groups[i].1.push(item),
            None => {
                index.insert(k.clone(), groups.len());
                groups.push((k, vec![item]));
            }
        }
    }

    groups
}

/// Groups transfers by transaction hash.
pub fn group_by_hash<'a>(transfers: impl IntoIterator<Item = &'a Transfer>) -> Vec<HashGroup<'a>> {
    group_by_key(transfers, |t| t.hash.as_str())
        .into_iter()
        .map(|(hash, transfers)| HashGroup { hash, transfers })
        .collect()
}
