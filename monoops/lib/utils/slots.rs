use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use crate::{MonoopsError, MonoopsResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A fixed-size counter of in-flight operations that rejects instead of queueing.
#[derive(Debug, Clone)]
pub struct OperationSlots {
    operation: &'static str,
    limit: usize,
    active: Arc<AtomicUsize>,
}

/// Holds one slot; releases it when dropped.
#[derive(Debug)]
pub struct SlotGuard {
    active: Arc<AtomicUsize>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl OperationSlots {
    /// Creates a counter allowing `limit` concurrent `operation`s.
    pub fn new(operation: &'static str, limit: usize) -> Self {
        Self {
            operation,
            limit,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Takes a slot or fails with `TooManyConcurrentOperations`.
    pub fn try_acquire(&self) -> MonoopsResult<SlotGuard> {
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if current >= self.limit {
                return Err(MonoopsError::TooManyConcurrentOperations {
                    operation: self.operation.to_string(),
                    limit: self.limit,
                });
            }

            match self.active.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Ok(SlotGuard {
                        active: Arc::clone(&self.active),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// The number of slots currently held.
    pub fn in_use(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_reject_past_limit_and_release_on_drop() {
        let slots = OperationSlots::new("backup", 2);
        let a = slots.try_acquire().unwrap();
        let _b = slots.try_acquire().unwrap();

        assert!(matches!(
            slots.try_acquire(),
            Err(MonoopsError::TooManyConcurrentOperations { limit: 2, .. })
        ));

        drop(a);
        assert_eq!(slots.in_use(), 1);
        assert!(slots.try_acquire().is_ok());
    }
}
