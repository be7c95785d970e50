//! Ordered append list and bounded slice views.
//!
//! The workflow graph keeps every node in one [`AppendList`]. Plugin scopes
//! write through a [`Slice`], which only ever inserts inside its own region
//! so indices before that region stay stable.

/// A sequence supporting append, positional insert and indexed reads.
pub trait OrderedList<T> {
    /// Number of elements visible through this list.
    fn len(&self) -> usize;

    /// Returns the element at `index`, if any.
    fn at(&self, index: usize) -> Option<&T>;

    /// Inserts `value` at `index`, shifting later elements back.
    fn insert_at(&mut self, index: usize, value: T) -> &T;

    /// Appends `value` at the end of this list.
    fn append(&mut self, value: T) -> &T {
        let index = self.len();
        self.insert_at(index, value)
    }

    /// Returns `true` if the list holds no elements.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates front to back over the current contents.
    fn iter(&self) -> Iter<'_, T>
    where
        Self: Sized,
    {
        Iter {
            list: self,
            next: 0,
        }
    }

    /// Iterates backwards starting at `index` (inclusive) down to the first element.
    ///
    /// An `index` past the end is clamped to the last element.
    fn reverse_iter_from(&self, index: usize) -> ReverseIter<'_, T>
    where
        Self: Sized,
    {
        let next = if self.is_empty() {
            None
        } else {
            Some(index.min(self.len() - 1))
        };
        ReverseIter { list: self, next }
    }
}

/// Forward iterator over an [`OrderedList`].
pub struct Iter<'a, T> {
    list: &'a dyn OrderedList<T>,
    next: usize,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.list.at(self.next)?;
        self.next += 1;
        Some(item)
    }
}

/// Descending iterator over an [`OrderedList`].
pub struct ReverseIter<'a, T> {
    list: &'a dyn OrderedList<T>,
    next: Option<usize>,
}

impl<'a, T> Iterator for ReverseIter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.next?;
        self.next = index.checked_sub(1);
        self.list.at(index)
    }
}

/// Growable list backed by a `Vec`.
#[derive(Debug, Clone)]
pub struct AppendList<T> {
    items: Vec<T>,
}

impl<T> Default for AppendList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> AppendList<T> {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Returns the contents as a slice.
    pub fn as_slice(&self) -> &[T] {
        &self.items
    }
}

impl<T> OrderedList<T> for AppendList<T> {
    fn len(&self) -> usize {
        self.items.len()
    }

    fn at(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    fn insert_at(&mut self, index: usize, value: T) -> &T {
        let index = index.min(self.items.len());
        self.items.insert(index, value);
        &self.items[index]
    }
}

/// A bounded view over another list.
///
/// Reads and writes are relative to `start`. `append` targets
/// `start + len`, where `len` counts what this slice has received so far,
/// so it never depends on how long the underlying list currently is.
pub struct Slice<'a, T> {
    inner: &'a mut dyn OrderedList<T>,
    start: usize,
    len: usize,
}

impl<'a, T> Slice<'a, T> {
    /// Creates an empty slice starting at `start` in `inner`.
    pub fn new(inner: &'a mut dyn OrderedList<T>, start: usize) -> Self {
        Self::resume(inner, start, 0)
    }

    /// Re-opens a slice that already owns `len` elements from `start`.
    pub fn resume(inner: &'a mut dyn OrderedList<T>, start: usize, len: usize) -> Self {
        Self { inner, start, len }
    }

    /// Index in the underlying list where this slice begins.
    pub fn start(&self) -> usize {
        self.start
    }
}

impl<T> OrderedList<T> for Slice<'_, T> {
    fn len(&self) -> usize {
        self.len
    }

    fn at(&self, index: usize) -> Option<&T> {
        if index >= self.len {
            return None;
        }
        self.inner.at(self.start + index)
    }

    fn insert_at(&mut self, index: usize, value: T) -> &T {
        let index = index.min(self.len);
        self.len += 1;
        self.inner.insert_at(self.start + index, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_of(values: &[i32]) -> AppendList<i32> {
        let mut list = AppendList::new();
        for value in values {
            list.append(*value);
        }
        list
    }

    #[test]
    fn test_append_and_at() {
        let list = list_of(&[1, 2, 3]);
        assert_eq!(list.len(), 3);
        assert_eq!(list.at(0), Some(&1));
        assert_eq!(list.at(2), Some(&3));
        assert_eq!(list.at(3), None);
    }

    #[test]
    fn test_insert_shifts_following_elements() {
        let mut list = list_of(&[1, 3]);
        list.insert_at(1, 2);
        assert_eq!(list.iter().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_reverse_iter_from_is_inclusive() {
        let list = list_of(&[1, 2, 3, 4]);
        let values: Vec<_> = list.reverse_iter_from(2).copied().collect();
        assert_eq!(values, vec![3, 2, 1]);

        let clamped: Vec<_> = list.reverse_iter_from(99).copied().collect();
        assert_eq!(clamped, vec![4, 3, 2, 1]);

        let empty = AppendList::<i32>::new();
        assert_eq!(empty.reverse_iter_from(0).count(), 0);
    }

    #[test]
    fn test_slice_appends_inside_its_region() {
        let mut list = list_of(&[10, 20, 30]);
        {
            let mut slice = Slice::new(&mut list, 1);
            slice.append(11);
            slice.append(12);
            assert_eq!(slice.len(), 2);
            assert_eq!(slice.at(0), Some(&11));
            assert_eq!(slice.at(2), None);
        }
        assert_eq!(
            list.iter().copied().collect::<Vec<_>>(),
            vec![10, 11, 12, 20, 30]
        );
    }

    #[test]
    fn test_nested_slices_grow_their_parent() {
        let mut list = list_of(&[0, 100]);
        let parent_len = {
            let mut parent = Slice::new(&mut list, 1);
            parent.append(1);
            {
                let mut child = Slice::new(&mut parent, 1);
                child.append(2);
                child.append(3);
            }
            parent.append(4);
            parent.len()
        };
        assert_eq!(parent_len, 4);
        assert_eq!(
            list.iter().copied().collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 4, 100]
        );
    }

    #[test]
    fn test_slice_reverse_iter_stays_in_region() {
        let mut list = list_of(&[1, 2]);
        let mut slice = Slice::new(&mut list, 2);
        slice.append(3);
        slice.append(4);
        let values: Vec<_> = slice.reverse_iter_from(1).copied().collect();
        assert_eq!(values, vec![4, 3]);
    }
}
