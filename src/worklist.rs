//! Bounded retry queue used in place of a topological sort.
//!
//! The live foreign-key graph can contain cycles through nullable columns, so
//! per-table work is attempted inside savepoints and requeued on failure. The
//! queue carries its own consecutive-failure budget; exceeding it means no
//! ordering of the remaining items can succeed.

use std::collections::VecDeque;
use std::fmt;

use crate::{Error, Result};

pub struct RetryQueue<T> {
    items: VecDeque<T>,
    budget: u32,
    consecutive_failures: u32,
}

impl<T: fmt::Display> RetryQueue<T> {
    /// Budget is twice the initial length: enough for any acyclic ordering to
    /// shake out, finite for genuine cycles.
    pub fn new(items: Vec<T>) -> Self {
        let budget = (items.len() as u32) * 2;
        Self {
            items: items.into(),
            budget,
            consecutive_failures: 0,
        }
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Reset the failure counter; any success proves progress is possible.
    pub fn succeeded(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Push a failed item back to the tail. Errors once the consecutive
    /// failure count exceeds the budget.
    pub fn requeue(&mut self, item: T) -> Result<()> {
        self.items.push_back(item);
        self.consecutive_failures += 1;
        if self.consecutive_failures > self.budget {
            return Err(Error::DependencyCycle {
                failures: self.consecutive_failures,
                remaining: self.items.iter().map(|i| i.to_string()).collect(),
            });
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_in_order() {
        let mut queue = RetryQueue::new(vec!["a", "b", "c"]);
        assert_eq!(queue.pop(), Some("a"));
        queue.succeeded();
        assert_eq!(queue.pop(), Some("b"));
        queue.succeeded();
        assert_eq!(queue.pop(), Some("c"));
        queue.succeeded();
        assert!(queue.is_empty());
    }

    #[test]
    fn cycle_detected_within_twice_the_item_count() {
        let mut queue = RetryQueue::new(vec!["a", "b", "c"]);
        let mut attempts = 0;
        let err = loop {
            let item = queue.pop().expect("queue never drains in a cycle");
            attempts += 1;
            if let Err(e) = queue.requeue(item) {
                break e;
            }
            assert!(attempts <= 7, "should abort within 2 x item count");
        };
        match err {
            Error::DependencyCycle { remaining, .. } => assert_eq!(remaining.len(), 3),
            other => panic!("wrong error: {other:?}"),
        }
    }

    #[test]
    fn success_resets_the_budget() {
        let mut queue = RetryQueue::new(vec!["a", "b"]);
        for _ in 0..4 {
            let item = queue.pop().unwrap();
            queue.requeue(item).unwrap();
        }
        // A single success buys another full budget.
        queue.succeeded();
        for _ in 0..4 {
            let item = queue.pop().unwrap();
            queue.requeue(item).unwrap();
        }
        let item = queue.pop().unwrap();
        assert!(queue.requeue(item).is_err());
    }
}
