#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Mutex;
use tk_core::ids::ClientId;

/// Entities with an outstanding network request or resolution.
///
/// Local writes never take a lease: they only need the store lock, and a resolution reads the
/// record and replaces its queue under that same lock, so an edit that lands while a request or
/// lookup is out is part of what gets merged.
#[derive(Debug, Default)]
pub(crate) struct LeaseTable {
    held: Mutex<BTreeSet<ClientId>>,
}

impl LeaseTable {
    pub fn try_acquire(&self, client_id: &ClientId) -> Option<Lease<'_>> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(client_id.clone()) {
            return None;
        }
        Some(Lease {
            table: self,
            client_id: client_id.clone(),
        })
    }

    #[cfg(test)]
    fn is_held(&self, client_id: &ClientId) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(client_id)
    }
}

#[derive(Debug)]
pub(crate) struct Lease<'a> {
    table: &'a LeaseTable,
    client_id: ClientId,
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        let mut held = self.table.held.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(&self.client_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_lease_per_entity_until_dropped() {
        let table = LeaseTable::default();
        let c1 = ClientId::try_new("c1").expect("id");
        let c2 = ClientId::try_new("c2").expect("id");

        let lease = table.try_acquire(&c1).expect("first lease");
        assert!(table.try_acquire(&c1).is_none());
        assert!(table.try_acquire(&c2).is_some());
        assert!(table.is_held(&c1));
        assert!(!table.is_held(&c2));

        drop(lease);
        assert!(!table.is_held(&c1));
        assert!(table.try_acquire(&c1).is_some());
    }
}
