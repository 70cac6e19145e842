//! Row ownership cross-check
//!
//! Records which session owns the uncommitted action on a row. Table locks
//! are the primary exclusion mechanism; this map guards deletes against a
//! row that another session still has pending.

use hashbrown::HashMap;
use ironlock_common::{Error, Result, RowId, SessionId};

#[derive(Debug, Default)]
pub struct RowOwnership {
    owners: HashMap<RowId, SessionId>,
}

impl RowOwnership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail with OVERWRITE when another session owns `row`
    pub fn check(&self, session: SessionId, row: RowId) -> Result<()> {
        match self.owners.get(&row) {
            Some(owner) if *owner != session => Err(Error::OverwriteConflict { row }),
            _ => Ok(()),
        }
    }

    /// Check every row of a delete set
    pub fn check_all<I>(&self, session: SessionId, rows: I) -> Result<()>
    where
        I: IntoIterator<Item = RowId>,
    {
        rows.into_iter().try_for_each(|row| self.check(session, row))
    }

    pub fn claim(&mut self, session: SessionId, row: RowId) {
        self.owners.insert(row, session);
    }

    pub fn owner(&self, row: RowId) -> Option<SessionId> {
        self.owners.get(&row).copied()
    }

    /// Drop ownership of rows whose actions have been committed or undone
    pub fn release_rows<'a, I>(&mut self, rows: I)
    where
        I: IntoIterator<Item = &'a RowId>,
    {
        for row in rows {
            self.owners.remove(row);
        }
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}
