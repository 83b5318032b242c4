//! In-memory set of resolved ticket ids, optionally mirrored to a
//! persistent [`ProcessedStore`].
//!
//! Membership is monotonic within a process lifetime only for tickets
//! that were actually resolved (merged, direct-committed, or
//! permanently failed) — the sequential and parallel engines are the
//! ones that decide *when* to call [`ProcessedSet::mark`]; this type
//! only enforces the storage invariant (reads never block writers for
//! long, writes mirror best-effort to the store).

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::RwLock;

use anyhow::Result;

use crate::model::TicketId;
use crate::traits::ProcessedStore;

pub struct ProcessedSet {
    ids: RwLock<HashSet<TicketId>>,
    store: Option<Arc<dyn ProcessedStore>>,
}

impl ProcessedSet {
    pub fn new(store: Option<Arc<dyn ProcessedStore>>) -> Self {
        Self {
            ids: RwLock::new(HashSet::new()),
            store,
        }
    }

    /// Load every previously-marked id from the attached store, if any.
    /// Called once before the scheduler's first tick.
    pub async fn rehydrate(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let loaded = store.load_all().await?;
        let mut ids = self.ids.write().expect("processed set lock poisoned");
        ids.extend(loaded);
        Ok(())
    }

    pub fn is_processed(&self, id: &TicketId) -> bool {
        self.ids.read().expect("processed set lock poisoned").contains(id)
    }

    /// Mark a ticket resolved. Inserts into the in-memory set first —
    /// that insertion is authoritative for this process — then mirrors
    /// to the store on a best-effort basis; a store failure is logged
    /// by the caller (this method surfaces it as `Err` so the caller
    /// can decide whether to log or propagate) but never un-marks the
    /// in-memory entry.
    pub async fn mark(&self, id: &TicketId, outcome_tag: &str) -> Result<()> {
        {
            let mut ids = self.ids.write().expect("processed set lock poisoned");
            ids.insert(id.clone());
        }
        if let Some(store) = &self.store {
            store.mark(id, outcome_tag).await?;
        }
        Ok(())
    }

    /// The public `ClearProcessed` API: lets an operator re-offer a
    /// ticket after manually clearing a `failed` label.
    pub async fn clear(&self, id: &TicketId) -> Result<()> {
        {
            let mut ids = self.ids.write().expect("processed set lock poisoned");
            ids.remove(id);
        }
        if let Some(store) = &self.store {
            store.unmark(id).await?;
        }
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.ids.read().expect("processed set lock poisoned").len()
    }

    pub async fn reset(&self) -> Result<()> {
        let drained: Vec<TicketId> = {
            let mut ids = self.ids.write().expect("processed set lock poisoned");
            ids.drain().collect()
        };
        if let Some(store) = &self.store {
            for id in &drained {
                store.unmark(id).await?;
            }
        }
        Ok(())
    }
}
