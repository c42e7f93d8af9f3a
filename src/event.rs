//! Notifications emitted while the database is mutated.

use std::collections::BTreeSet;
use std::ops::{Deref, DerefMut};

use crate::{Address, Database};

/// Addresses touched by one logical write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdatedCells {
    addresses: BTreeSet<Address>,
}

impl UpdatedCells {
    pub fn new(addresses: impl IntoIterator<Item = Address>) -> Self {
        Self { addresses: addresses.into_iter().collect() }
    }

    pub fn modified_addresses(&self) -> impl Iterator<Item = &Address> + '_ {
        self.addresses.iter()
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

/// Observer of database writes.
///
/// Handlers cannot veto a write; a `false` return is only logged.
pub trait EventHandler: Send {
    fn on_cells_updated(&mut self, update: &UpdatedCells) -> bool;
}

impl<F> EventHandler for F
where
    F: FnMut(&UpdatedCells) -> bool + Send,
{
    fn on_cells_updated(&mut self, update: &UpdatedCells) -> bool {
        self(update)
    }
}

/// Logs every updated address at debug level.
#[derive(Debug, Default)]
pub struct LogEventHandler;

impl EventHandler for LogEventHandler {
    fn on_cells_updated(&mut self, update: &UpdatedCells) -> bool {
        for address in update.modified_addresses() {
            log::debug!("updated cell: {}", address);
        }
        true
    }
}

/// Subscription held for the length of a scope.
///
/// Dereferences to the database; dropping it stops event handling on every
/// exit path, including early returns and panics.
pub struct EventScope<'a> {
    database: &'a mut Database,
}

impl<'a> EventScope<'a> {
    pub(crate) fn new(database: &'a mut Database, handler: Box<dyn EventHandler>) -> Self {
        database.start_event_handling(handler);
        Self { database }
    }
}

impl Deref for EventScope<'_> {
    type Target = Database;

    fn deref(&self) -> &Database {
        self.database
    }
}

impl DerefMut for EventScope<'_> {
    fn deref_mut(&mut self) -> &mut Database {
        self.database
    }
}

impl Drop for EventScope<'_> {
    fn drop(&mut self) {
        self.database.stop_event_handling();
    }
}
