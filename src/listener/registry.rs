use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

use super::errors::CollisionError;
use crate::store::{DocumentStore, StoreError, ViewName};

const LOG_TARGET: &str = "couchbus::listener::registry";

/// One-shot namespace check over every registration document in the
/// database.
pub struct CommandRegistry {
    store: Arc<dyn DocumentStore>,
    view: ViewName,
}

impl CommandRegistry {
    pub fn new(store: Arc<dyn DocumentStore>, view: ViewName) -> Self {
        Self { store, view }
    }

    /// Looks for names in `names` claimed more than once. `own_id` is the
    /// registration being validated; it is already stored and is left out of
    /// the reported holders.
    pub async fn find_collision(
        &self,
        own_id: &str,
        names: &[String],
    ) -> Result<Option<CollisionError>, StoreError> {
        let counts = self.store.aggregate(&self.view).await?;
        let colliding: Vec<String> = counts
            .into_iter()
            .filter(|row| row.count > 1 && names.contains(&row.key))
            .map(|row| row.key)
            .collect();
        if colliding.is_empty() {
            debug!(target: LOG_TARGET, registration = own_id, "No command collisions");
            return Ok(None);
        }

        let rows = self.store.view_rows(&self.view, &colliding).await?;
        let mut names = BTreeSet::new();
        let mut holders = BTreeSet::new();
        for row in rows.into_iter().filter(|row| row.id != own_id) {
            names.insert(row.key);
            holders.insert(row.id);
        }
        if holders.is_empty() {
            return Ok(None);
        }

        let collision = CollisionError {
            names: names.into_iter().collect(),
            holders: holders.into_iter().collect(),
        };
        warn!(target: LOG_TARGET, registration = own_id, %collision, "Command collision detected");
        Ok(Some(collision))
    }

    /// Deletes the peer registrations named in `collision`. Already-removed
    /// documents are ignored.
    pub async fn evict(&self, collision: &CollisionError) -> Result<(), StoreError> {
        for holder in &collision.holders {
            match self.store.delete(holder).await {
                Ok(()) => warn!(target: LOG_TARGET, registration = %holder, "Removed colliding registration"),
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
