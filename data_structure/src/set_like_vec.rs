use crate::FxHashMap;

/// A vector that only stores unique elements.
///
/// Remembers the order of insertion. Used as a stack (depth-first search)
/// and as a worklist (dataflow analyses) where pushing an element that is
/// already pending must not schedule it twice.
pub struct SetLikeVec<T: Copy> {
    vec: Vec<T>,
    map: FxHashMap<T, usize>,
}

impl<T> SetLikeVec<T>
where
    T: Copy,
{
    pub fn new() -> Self {
        Self {
            vec: Vec::default(),
            map: FxHashMap::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}

impl<T> Default for SetLikeVec<T>
where
    T: Copy,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SetLikeVec<T>
where
    T: Copy + Eq + std::hash::Hash,
{
    /// Inserts `value` unless it is already present.
    ///
    /// Returns `true` if the value was newly inserted.
    pub fn insert(&mut self, value: T) -> bool {
        if self.map.contains_key(&value) {
            return false;
        }
        self.map.insert(value, self.vec.len());
        self.vec.push(value);
        true
    }

    pub fn push(&mut self, value: T) {
        self.insert(value);
    }

    /// Removes the most recently inserted element that is still present.
    pub fn pop(&mut self) -> Option<T> {
        while let Some(value) = self.vec.pop() {
            // Entries removed through `remove` stay in `vec` until they are popped.
            if self.map.get(&value) == Some(&self.vec.len()) {
                self.map.remove(&value);
                return Some(value);
            }
        }
        None
    }

    pub fn get<Q>(&self, value: &Q) -> Option<usize>
    where
        T: std::borrow::Borrow<Q>,
        Q: ?Sized + std::hash::Hash + Eq,
    {
        self.map.get(value).copied()
    }

    pub fn contains<Q>(&self, value: &Q) -> bool
    where
        T: std::borrow::Borrow<Q>,
        Q: ?Sized + std::hash::Hash + Eq,
    {
        self.map.contains_key(value)
    }

    pub fn remove<Q>(&mut self, value: &Q) -> Option<usize>
    where
        T: std::borrow::Borrow<Q>,
        Q: ?Sized + std::hash::Hash + Eq,
    {
        self.map.remove(value)
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            iter: self.vec.iter().enumerate(),
            set: &self.map,
        }
    }
}

impl<T: Copy + Eq + std::hash::Hash> Extend<T> for SetLikeVec<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for value in iter {
            self.insert(value);
        }
    }
}

impl<T: Copy + Eq + std::hash::Hash> FromIterator<T> for SetLikeVec<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}

pub struct Iter<'a, T> {
    iter: std::iter::Enumerate<std::slice::Iter<'a, T>>,
    set: &'a FxHashMap<T, usize>,
}

impl<'a, T: Copy + Eq + std::hash::Hash> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        // A value is live only if the map still points at this very slot.
        self.iter
            .find(|(pos, value)| self.set.get(*value) == Some(pos))
            .map(|(_, value)| value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_skips_removed_entries() {
        let mut set: SetLikeVec<u32> = [1, 2, 3].into_iter().collect();
        assert!(!set.insert(2));
        set.remove(&3);
        assert_eq!(set.pop(), Some(2));
        assert_eq!(set.pop(), Some(1));
        assert_eq!(set.pop(), None);
        assert!(set.is_empty());
    }

    #[test]
    fn reinsert_after_pop() {
        let mut set = SetLikeVec::new();
        set.insert(7u32);
        assert_eq!(set.pop(), Some(7));
        assert!(set.insert(7));
        assert_eq!(set.iter().copied().collect::<Vec<_>>(), vec![7]);
    }
}
