//! `Pool.next()` (§4.9): a stable cyclic round-robin over task-worker
//! ids, skipping ones that have been removed (crashed and not yet
//! replaced).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub struct Pool<T: Clone> {
    items: Mutex<Vec<T>>,
    cursor: AtomicUsize,
}

impl<T: Clone + PartialEq> Pool<T> {
    pub fn new(items: Vec<T>) -> Self {
        Pool { items: Mutex::new(items), cursor: AtomicUsize::new(0) }
    }

    /// Returns the next item in cyclic order, or `None` if the pool is
    /// currently empty.
    pub fn next(&self) -> Option<T> {
        let items = self.items.lock().unwrap();
        if items.is_empty() {
            return None;
        }
        let i = self.cursor.fetch_add(1, Ordering::SeqCst) % items.len();
        Some(items[i].clone())
    }

    pub fn push(&self, item: T) {
        self.items.lock().unwrap().push(item);
    }

    pub fn remove(&self, item: &T) {
        self.items.lock().unwrap().retain(|x| x != item);
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycles_in_stable_order() {
        let pool = Pool::new(vec![1, 2, 3]);
        let picked: Vec<i32> = (0..6).map(|_| pool.next().unwrap()).collect();
        assert_eq!(picked, vec![1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn removed_items_are_skipped() {
        let pool = Pool::new(vec![1, 2, 3]);
        pool.next();
        pool.remove(&2);
        let picked: Vec<i32> = (0..4).map(|_| pool.next().unwrap()).collect();
        assert_eq!(picked, vec![3, 1, 3, 1]);
    }

    #[test]
    fn empty_pool_yields_none() {
        let pool: Pool<i32> = Pool::new(vec![]);
        assert!(pool.next().is_none());
    }
}
