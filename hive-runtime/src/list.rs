//! Doubly linked lists whose nodes live in a [`Pool`].
//!
//! A [`List`] is only a head/tail/length triple; the nodes and their links
//! are stored in a shared `Pool<Node<T>>` and referred to by slot index. Many
//! lists (one mailbox per actor, one link list per actor, ...) draw from the
//! same pool, which bounds the total number of entries across all of them.

use crate::pool::Pool;

/// A list node stored in a pool slot.
#[derive(Debug)]
pub struct Node<T> {
    value: T,
    prev: Option<usize>,
    next: Option<usize>,
}

impl<T> Node<T> {
    /// The stored value.
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Index of the following node.
    pub fn next(&self) -> Option<usize> {
        self.next
    }
}

/// Head of an index-linked list.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct List {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl List {
    /// An empty list.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// No nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Index of the first node.
    #[must_use]
    pub fn head(&self) -> Option<usize> {
        self.head
    }

    /// Append `value` at the tail.
    ///
    /// # Errors
    ///
    /// Gives the value back when the pool is full.
    pub fn append<T>(&mut self, pool: &mut Pool<Node<T>>, value: T) -> Result<usize, T> {
        let node = Node {
            value,
            prev: self.tail,
            next: None,
        };
        let index = pool.alloc(node).map_err(|node| node.value)?;
        match self.tail {
            Some(tail) => {
                if let Some(t) = pool.get_mut(tail) {
                    t.next = Some(index);
                }
            }
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;
        Ok(index)
    }

    /// Unlink node `index` from this list and free it.
    ///
    /// `index` must belong to this list; an unoccupied index returns `None`.
    pub fn remove<T>(&mut self, pool: &mut Pool<Node<T>>, index: usize) -> Option<T> {
        let node = pool.free(index)?;
        match node.prev {
            Some(prev) => {
                if let Some(p) = pool.get_mut(prev) {
                    p.next = node.next;
                }
            }
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => {
                if let Some(n) = pool.get_mut(next) {
                    n.prev = node.prev;
                }
            }
            None => self.tail = node.prev,
        }
        self.len -= 1;
        Some(node.value)
    }

    /// Remove and return the head value.
    pub fn pop_front<T>(&mut self, pool: &mut Pool<Node<T>>) -> Option<T> {
        let head = self.head?;
        self.remove(pool, head)
    }

    /// Index of the first node whose value satisfies `pred`.
    pub fn find<T>(&self, pool: &Pool<Node<T>>, mut pred: impl FnMut(&T) -> bool) -> Option<usize> {
        self.iter(pool).find(|(_, v)| pred(v)).map(|(i, _)| i)
    }

    /// Remove and return the first value satisfying `pred`.
    pub fn find_remove<T>(
        &mut self,
        pool: &mut Pool<Node<T>>,
        pred: impl FnMut(&T) -> bool,
    ) -> Option<T> {
        let index = self.find(pool, pred)?;
        self.remove(pool, index)
    }

    /// Free every node.
    pub fn clear<T>(&mut self, pool: &mut Pool<Node<T>>) {
        while self.pop_front(pool).is_some() {}
    }

    /// Iterate `(index, &value)` from head to tail.
    pub fn iter<'a, T>(&self, pool: &'a Pool<Node<T>>) -> Iter<'a, T> {
        Iter {
            pool,
            cursor: self.head,
        }
    }
}

/// Iterator returned by [`List::iter`].
#[derive(Debug)]
pub struct Iter<'a, T> {
    pool: &'a Pool<Node<T>>,
    cursor: Option<usize>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (usize, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let node = self.pool.get(index)?;
        self.cursor = node.next;
        Some((index, &node.value))
    }
}
