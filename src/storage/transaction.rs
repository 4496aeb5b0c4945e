//! Scoped transaction guard.

use tracing::warn;

use crate::storage::traits::{HistoryStore, StorageError};

/// An open transaction on a [`HistoryStore`].
///
/// Dropping the guard without calling [`Transaction::commit`] rolls the
/// transaction back, so an early return through `?` never leaves partial rows.
#[must_use = "dropping a transaction rolls it back"]
pub struct Transaction<'a> {
    store: &'a dyn HistoryStore,
    finished: bool,
}

impl<'a> Transaction<'a> {
    /// Opens a transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the store refuses to begin, e.g. because a
    /// transaction is already open.
    pub fn begin(store: &'a dyn HistoryStore) -> Result<Self, StorageError> {
        store.begin()?;
        Ok(Self {
            store,
            finished: false,
        })
    }

    /// The store the transaction runs on.
    #[must_use]
    pub fn store(&self) -> &'a dyn HistoryStore {
        self.store
    }

    /// Commits the transaction.
    ///
    /// # Errors
    ///
    /// Returns the store's error; the store has then discarded the writes.
    pub fn commit(mut self) -> Result<(), StorageError> {
        self.finished = true;
        self.store.commit()
    }

    /// Rolls the transaction back explicitly.
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub fn rollback(mut self) -> Result<(), StorageError> {
        self.finished = true;
        self.store.rollback()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.store.rollback() {
            warn!(error = %e, "rollback of abandoned transaction failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimension::DimensionKind;
    use crate::storage::InMemoryHistoryStore;

    fn insert_then_fail(store: &dyn HistoryStore) -> Result<(), StorageError> {
        let tx = Transaction::begin(store)?;
        tx.store().insert_dimension(DimensionKind::City, "Lyon")?;
        tx.store().insert_dimension(DimensionKind::City, "Lyon")?;
        tx.commit()
    }

    #[test]
    fn test_drop_rolls_back() {
        let store = InMemoryHistoryStore::new();
        assert!(insert_then_fail(&store).unwrap_err().is_duplicate());
        assert_eq!(store.counts().dimensions, 0);

        // The store is usable for a fresh transaction afterwards.
        let tx = Transaction::begin(&store).unwrap();
        tx.store().insert_dimension(DimensionKind::City, "Lyon").unwrap();
        tx.commit().unwrap();
        assert_eq!(store.counts().dimensions, 1);
    }

    #[test]
    fn test_explicit_rollback() {
        let store = InMemoryHistoryStore::new();
        let tx = Transaction::begin(&store).unwrap();
        tx.store().insert_dimension(DimensionKind::City, "Nice").unwrap();
        tx.rollback().unwrap();
        assert_eq!(store.counts().dimensions, 0);
    }
}
