// Audit trail of an item

//! # History
//!
//! Every performed transition appends an [`Event`] under `AuditTrail/<id>`.
//! Event ids are allocated per item as one more than the highest id visible
//! to the locker, so several events staged in one transaction get distinct
//! ids through the transaction manager's read-through listing.

use std::sync::Arc;
use tracing::debug;

use super::transaction::{Locker, TransactionManager};
use crate::models::records::AUDIT_TRAIL;
use crate::models::{Event, ItemId, Record};
use crate::{LifecycleError, Result};

pub struct History {
    storage: Arc<TransactionManager>,
    item: ItemId,
}

impl History {
    pub fn new(storage: Arc<TransactionManager>, item: ItemId) -> Self {
        History { storage, item }
    }

    /// Highest event id visible to the locker, `None` for an empty trail
    pub async fn last_event_id(&self, locker: Option<&Locker>) -> Result<Option<i32>> {
        let ids = self.storage.list_children(self.item, AUDIT_TRAIL, locker).await?;
        Ok(ids.iter().filter_map(|id| id.parse::<i32>().ok()).max())
    }

    /// Assign the next event id and stage the event under `locker`
    pub async fn add_event(&self, mut event: Event, locker: &Locker) -> Result<Event> {
        event.id = self.last_event_id(Some(locker)).await?.map_or(0, |id| id + 1);
        debug!(item = %self.item, event = event.id, transition = %event.transition_name, "appending event");
        self.storage
            .put(self.item, Record::Event(event.clone()), Some(locker))
            .await?;
        Ok(event)
    }

    pub async fn event(&self, id: i32, locker: Option<&Locker>) -> Result<Event> {
        match self
            .storage
            .get(self.item, &format!("{}/{}", AUDIT_TRAIL, id), locker)
            .await?
        {
            Record::Event(event) => Ok(event),
            other => Err(LifecycleError::InvalidData(format!(
                "{} does not hold an event",
                other.cluster_path()
            ))),
        }
    }

    /// All events in id order
    pub async fn events(&self, locker: Option<&Locker>) -> Result<Vec<Event>> {
        let mut ids: Vec<i32> = self
            .storage
            .list_children(self.item, AUDIT_TRAIL, locker)
            .await?
            .iter()
            .filter_map(|id| id.parse().ok())
            .collect();
        ids.sort_unstable();

        let mut events = Vec::with_capacity(ids.len());
        for id in ids {
            events.push(self.event(id, locker).await?);
        }
        Ok(events)
    }
}
