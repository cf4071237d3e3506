//! Live resource accounting
//!
//! Each adapter component holds a [`ResourceToken`] for as long as it is
//! allocated. Dropping or releasing the token decrements the counter, so a
//! failed or finished teardown can be checked for leaks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Display,
    Cursor,
    Registry,
    Painter,
    LegacyCompat,
}

impl Resource {
    const COUNT: usize = 5;

    fn slot(self) -> usize {
        match self {
            Resource::Display => 0,
            Resource::Cursor => 1,
            Resource::Registry => 2,
            Resource::Painter => 3,
            Resource::LegacyCompat => 4,
        }
    }
}

#[derive(Debug, Default)]
pub struct ResourceLedger {
    live: [AtomicUsize; Resource::COUNT],
}

impl ResourceLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn acquire(self: &Arc<Self>, resource: Resource) -> ResourceToken {
        self.live[resource.slot()].fetch_add(1, Ordering::SeqCst);
        ResourceToken {
            ledger: Arc::clone(self),
            resource,
        }
    }

    pub fn live(&self, resource: Resource) -> usize {
        self.live[resource.slot()].load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.live.iter().map(|c| c.load(Ordering::SeqCst)).sum()
    }
}

#[derive(Debug)]
pub struct ResourceToken {
    ledger: Arc<ResourceLedger>,
    resource: Resource,
}

impl ResourceToken {
    pub fn resource(&self) -> Resource {
        self.resource
    }
}

impl Drop for ResourceToken {
    fn drop(&mut self) {
        self.ledger.live[self.resource.slot()].fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_balance() {
        let ledger = ResourceLedger::new();
        let a = ledger.acquire(Resource::Cursor);
        let b = ledger.acquire(Resource::Cursor);
        let c = ledger.acquire(Resource::Painter);
        assert_eq!(ledger.live(Resource::Cursor), 2);
        assert_eq!(ledger.total(), 3);
        drop(a);
        drop(c);
        assert_eq!(ledger.live(Resource::Cursor), 1);
        assert_eq!(ledger.live(Resource::Painter), 0);
        assert_eq!(b.resource(), Resource::Cursor);
        drop(b);
        assert_eq!(ledger.total(), 0);
    }
}
