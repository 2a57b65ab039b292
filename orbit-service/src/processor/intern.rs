//! Content-addressed id assignment for interned client data.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;

/// Assigns a stable id to every distinct value it sees.
///
/// Ids start at 1; 0 is reserved as the invalid id on the client.
#[derive(Debug)]
pub struct InternPool<T> {
    next_id: u64,
    ids: HashMap<T, u64>,
}

impl<T: Hash + Eq + Clone> InternPool<T> {
    #[must_use]
    pub fn new() -> Self {
        Self { next_id: 1, ids: HashMap::new() }
    }

    /// Return the id of `entry` and whether it was assigned by this call.
    pub fn get_or_assign_id<Q>(&mut self, entry: &Q) -> (u64, bool)
    where
        T: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = T> + ?Sized,
    {
        if let Some(&id) = self.ids.get(entry) {
            return (id, false);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.ids.insert(entry.to_owned(), id);
        (id, true)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl<T: Hash + Eq + Clone> Default for InternPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_start_at_one_and_are_stable() {
        let mut pool: InternPool<String> = InternPool::new();
        assert_eq!(pool.get_or_assign_id("a"), (1, true));
        assert_eq!(pool.get_or_assign_id("b"), (2, true));
        assert_eq!(pool.get_or_assign_id("a"), (1, false));
        assert_eq!(pool.len(), 2);
    }
}
