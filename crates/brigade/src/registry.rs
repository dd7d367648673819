//! Worker handles and the registry of on-duty workers.

use crate::{CapabilitySet, Error, Result, WorkerId};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{Mutex, MutexGuard};

/// A registered worker: its identity, its declared capabilities, and the
/// connection used to exchange jobs with it.
///
/// The connection sits behind an async mutex (the exchange lock). Holding it
/// for the send-payload/receive-result pair keeps a worker on one job at a
/// time; concurrent jobs routed to the same worker wait their turn.
#[derive(Debug)]
pub struct WorkerHandle<C> {
    id: WorkerId,
    capabilities: CapabilitySet,
    connection: Mutex<C>,
}

impl<C> WorkerHandle<C> {
    pub fn new(id: WorkerId, capabilities: CapabilitySet, connection: C) -> Self {
        Self {
            id,
            capabilities,
            connection: Mutex::new(connection),
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    /// Acquires the exchange lock.
    pub(crate) async fn exchange(&self) -> MutexGuard<'_, C> {
        self.connection.lock().await
    }

    /// Consumes the handle and returns its connection.
    pub fn into_connection(self) -> C {
        self.connection.into_inner()
    }
}

/// Mapping from worker identifier to handle: the single source of truth for
/// who is on duty.
///
/// Handles are stored behind [`Arc`] so an exchange already in flight keeps
/// its worker's connection alive even if the worker leaves meanwhile.
#[derive(Debug)]
pub struct Registry<C> {
    workers: HashMap<WorkerId, Arc<WorkerHandle<C>>>,
}

impl<C> Default for Registry<C> {
    fn default() -> Self {
        Self {
            workers: HashMap::new(),
        }
    }
}

impl<C> Registry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `handle` under its identifier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateRegistration`] if the identifier is already
    /// on duty. The existing entry is left untouched.
    pub fn join(&mut self, handle: Arc<WorkerHandle<C>>) -> Result<()> {
        if self.workers.contains_key(handle.id()) {
            return Err(Error::DuplicateRegistration {
                id: handle.id().clone(),
            });
        }
        self.workers.insert(handle.id().clone(), handle);
        Ok(())
    }

    /// Removes and returns the handle for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if `id` is not on duty.
    pub fn leave(&mut self, id: &WorkerId) -> Result<Arc<WorkerHandle<C>>> {
        self.workers
            .remove(id)
            .ok_or_else(|| Error::NotFound { id: id.clone() })
    }

    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if `id` is not on duty.
    pub fn lookup(&self, id: &WorkerId) -> Result<&Arc<WorkerHandle<C>>> {
        self.workers
            .get(id)
            .ok_or_else(|| Error::NotFound { id: id.clone() })
    }

    pub fn contains(&self, id: &WorkerId) -> bool {
        self.workers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Handles of every on-duty worker, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<WorkerHandle<C>>> {
        self.workers.values()
    }

    /// Removes every handle, leaving the registry empty.
    pub fn drain(&mut self) -> Vec<Arc<WorkerHandle<C>>> {
        self.workers.drain().map(|(_, handle)| handle).collect()
    }
}
