//! The dispatch session: registration, fair selection and job relay.
//!
//! A [`Dispatcher`] bundles a [`Registry`] and a [`CapabilityIndex`] behind a
//! single [`parking_lot::Mutex`]. Every structural change (going on duty,
//! going off duty, selecting a worker) happens inside one critical section
//! with no suspension point, so concurrent jobs for the same tag observe a
//! strict FIFO hand-off through the rotation.
//!
//! The relay itself (receive payload, forward to worker, read result, answer
//! the caller) runs without the state lock. A worker's connection is guarded
//! by its own exchange lock, so a worker picked while still serving finishes
//! its current job before it sees the next payload.
//!
//! ## Failure policy
//!
//! - The caller disappears before its payload arrives, or before the result
//!   can be returned: [`Error::RequestCancelled`]. The worker stays on duty.
//! - The caller's payload cannot be decoded: [`Error::InvalidRequest`]. The
//!   worker stays on duty, but its turn in the rotation is spent.
//! - The worker goes off duty between being selected and the exchange
//!   starting: [`Error::NotFound`]. Nothing is sent to it.
//! - The worker's connection fails between forwarding the payload and reading
//!   the result: the worker is taken off duty and the job fails with
//!   [`Error::WorkerDisconnected`].
//! - The job future is dropped in that same window: the worker's message
//!   stream is no longer in step with the dispatcher, so it is taken off duty.
//! - The session is torn down: in-flight jobs fail with
//!   [`Error::SessionClosed`], as does every later operation.

use crate::{
    Capability, CapabilityIndex, CapabilitySet, Connection, Error, Registry, Rejected, Result,
    WorkerHandle, WorkerId,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
mod tests;

struct State<C> {
    registry: Registry<C>,
    index: CapabilityIndex,
}

impl<C> State<C> {
    /// Adds `handle` to the registry and then the index.
    fn insert(&mut self, handle: &Arc<WorkerHandle<C>>) -> Result<()> {
        self.registry.join(Arc::clone(handle))?;
        if let Err(error) = self.index.register(handle.id(), handle.capabilities()) {
            // Roll the join back so the registry never holds a worker the
            // index does not know.
            let _ = self.registry.leave(handle.id());
            return Err(error);
        }
        Ok(())
    }

    /// Whether `handle` is the one currently registered under its id.
    fn holds(&self, handle: &Arc<WorkerHandle<C>>) -> bool {
        self.registry
            .lookup(handle.id())
            .is_ok_and(|registered| Arc::ptr_eq(registered, handle))
    }

    /// Removes `id` from the index and then the registry.
    fn remove(&mut self, id: &WorkerId) -> Result<Arc<WorkerHandle<C>>> {
        let handle = Arc::clone(self.registry.lookup(id)?);
        debug_assert!(
            handle
                .capabilities()
                .iter()
                .all(|tag| self.index.contains(tag.as_str(), id)),
            "capability index diverged from registry for worker {id}"
        );
        self.index.deregister(id, handle.capabilities())?;
        self.registry.leave(id)
    }
}

struct Inner<C> {
    state: Mutex<State<C>>,
    shutdown_token: CancellationToken,
}

/// One dispatch session.
///
/// Cloning is cheap and yields another handle to the same session. The
/// session starts empty and ends with [`Dispatcher::shutdown`].
pub struct Dispatcher<C> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for Dispatcher<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> Default for Dispatcher<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Dispatcher<C> {
    /// Starts a new, empty session.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    registry: Registry::new(),
                    index: CapabilityIndex::new(),
                }),
                shutdown_token: CancellationToken::new(),
            }),
        }
    }

    /// Puts a worker on duty and appends it to the rotation of every tag it
    /// declares.
    ///
    /// The declaration is normalized before any state is touched, and the
    /// registry and index are updated together under one lock, so on failure
    /// neither has changed.
    ///
    /// # Errors
    ///
    /// The connection is handed back inside [`Rejected`] alongside:
    /// - [`Error::InvalidCapability`] if the declaration is an empty set.
    /// - [`Error::DuplicateRegistration`] if `id` is already on duty.
    /// - [`Error::SessionClosed`] if the session has ended.
    pub fn on_duty(
        &self,
        id: impl Into<WorkerId>,
        capability: Capability,
        connection: C,
    ) -> Result<(), Rejected<C>> {
        let id = id.into();
        let capabilities = match capability.normalize() {
            Ok(capabilities) => capabilities,
            Err(error) => return Err(Rejected { error, connection }),
        };
        let handle = Arc::new(WorkerHandle::new(id, capabilities, connection));

        let mut state = self.inner.state.lock();
        let registered = if self.inner.shutdown_token.is_cancelled() {
            Err(Error::SessionClosed)
        } else {
            state.insert(&handle)
        };
        drop(state);

        match registered {
            Ok(()) => {
                #[cfg(feature = "tracing")]
                tracing::info!(
                    worker = %handle.id(),
                    capabilities = ?handle.capabilities(),
                    "Worker on duty"
                );
                Ok(())
            }
            Err(error) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(worker = %handle.id(), %error, "Worker rejected");
                Err(Rejected {
                    error,
                    connection: reclaim(handle),
                })
            }
        }
    }

    /// Takes a worker off duty, removing it from every rotation it was in.
    ///
    /// Returns the worker's connection, or `None` if a job still holds it.
    /// A job that has selected the worker but not yet started the exchange
    /// fails without sending anything; one already exchanging finishes
    /// first. Either way the connection is dropped once that job ends.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if `id` is not on duty.
    /// - [`Error::SessionClosed`] if the session has ended.
    pub fn off_duty(&self, id: &WorkerId) -> Result<Option<C>> {
        let handle = {
            let mut state = self.inner.state.lock();
            if self.inner.shutdown_token.is_cancelled() {
                return Err(Error::SessionClosed);
            }
            state.remove(id)?
        };

        #[cfg(feature = "tracing")]
        tracing::info!(worker = %id, "Worker off duty");

        Ok(Arc::try_unwrap(handle)
            .ok()
            .map(WorkerHandle::into_connection))
    }

    pub fn is_on_duty(&self, id: &WorkerId) -> bool {
        self.inner.state.lock().registry.contains(id)
    }

    pub fn worker_count(&self) -> usize {
        self.inner.state.lock().registry.len()
    }

    /// Snapshot of every on-duty worker and its capabilities, ordered by
    /// identifier.
    pub fn workers(&self) -> Vec<(WorkerId, CapabilitySet)> {
        let mut workers: Vec<_> = self
            .inner
            .state
            .lock()
            .registry
            .iter()
            .map(|handle| (handle.id().clone(), handle.capabilities().clone()))
            .collect();
        workers.sort_by(|(a, _), (b, _)| a.cmp(b));
        workers
    }

    /// The capability set `id` declared when it went on duty.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if `id` is not on duty.
    pub fn capabilities_of(&self, id: &WorkerId) -> Result<CapabilitySet> {
        let state = self.inner.state.lock();
        Ok(state.registry.lookup(id)?.capabilities().clone())
    }

    /// Current rotation for `tag`, next worker to serve first.
    pub fn rotation(&self, tag: &str) -> Vec<WorkerId> {
        self.inner.state.lock().index.rotation(tag)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown_token.is_cancelled()
    }

    /// Ends the session.
    ///
    /// In-flight jobs fail with [`Error::SessionClosed`], every worker is
    /// taken off duty, and all further operations are refused. Returns the
    /// identifiers of the workers that were still on duty.
    pub fn shutdown(&self) -> Vec<WorkerId> {
        #[cfg(feature = "tracing")]
        tracing::info!("Closing dispatch session");

        self.inner.shutdown_token.cancel();

        let mut state = self.inner.state.lock();
        state.index.clear();
        let released: Vec<WorkerId> = state
            .registry
            .drain()
            .into_iter()
            .map(|handle| handle.id().clone())
            .collect();

        #[cfg(feature = "tracing")]
        tracing::info!(workers = released.len(), "Dispatch session closed");

        released
    }

    /// Picks the next worker for `tag` and resolves its handle, as one step.
    fn select(&self, tag: &str) -> Result<Arc<WorkerHandle<C>>> {
        let mut state = self.inner.state.lock();
        if self.inner.shutdown_token.is_cancelled() {
            return Err(Error::SessionClosed);
        }
        let id = state.index.next(tag)?;
        let handle = state.registry.lookup(&id).cloned();
        debug_assert!(
            handle.is_ok(),
            "capability index references worker {id} missing from registry"
        );
        handle
    }

    /// Fails unless `handle` is still the registered worker for its id.
    fn ensure_on_duty(&self, handle: &Arc<WorkerHandle<C>>) -> Result<()> {
        let state = self.inner.state.lock();
        if self.inner.shutdown_token.is_cancelled() {
            return Err(Error::SessionClosed);
        }
        if state.holds(handle) {
            Ok(())
        } else {
            Err(Error::NotFound {
                id: handle.id().clone(),
            })
        }
    }

    /// Takes `handle` off duty after a failed exchange.
    ///
    /// Only the exact handle is removed: if its identifier has meanwhile been
    /// reused by a new worker, that worker is left alone.
    fn evict(&self, handle: &Arc<WorkerHandle<C>>) {
        let mut state = self.inner.state.lock();
        if state.holds(handle) && state.remove(handle.id()).is_ok() {
            #[cfg(feature = "tracing")]
            tracing::warn!(worker = %handle.id(), "Worker taken off duty after failed exchange");
        }
    }
}

impl<C: Connection> Dispatcher<C> {
    /// Routes one job to the next worker declaring `tag` and relays it.
    ///
    /// The payload is read from `incoming`, forwarded to the selected worker,
    /// and the worker's reply is sent back on `incoming`.
    ///
    /// # Errors
    ///
    /// - [`Error::NoAvailableWorker`] if no worker declares `tag`; nothing is
    ///   read from `incoming` and the session is unchanged.
    /// - [`Error::RequestCancelled`] if `incoming` fails.
    /// - [`Error::InvalidRequest`] if the payload on `incoming` cannot be
    ///   decoded.
    /// - [`Error::NotFound`] if the selected worker went off duty before the
    ///   exchange started.
    /// - [`Error::WorkerDisconnected`] if the worker fails mid-exchange.
    /// - [`Error::SessionClosed`] if the session ends before or during the
    ///   exchange.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(tag = tag)))]
    pub async fn handle_job<I>(&self, tag: &str, incoming: &mut I) -> Result<()>
    where
        I: Connection<Message = C::Message>,
    {
        let handle = self.select(tag)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(worker = %handle.id(), "Worker selected");

        let shutdown_token = self.inner.shutdown_token.clone();
        tokio::select! {
            biased;
            () = shutdown_token.cancelled() => Err(Error::SessionClosed),
            result = self.relay(&handle, incoming) => result,
        }
    }

    async fn relay<I>(&self, handle: &Arc<WorkerHandle<C>>, incoming: &mut I) -> Result<()>
    where
        I: Connection<Message = C::Message>,
    {
        let payload = incoming.recv().await.map_err(|error| match error {
            Error::InvalidRequest { .. } => error,
            _ => Error::RequestCancelled,
        })?;

        let reply = {
            let mut worker = handle.exchange().await;
            self.ensure_on_duty(handle)?;
            let guard = EvictOnDrop {
                dispatcher: self,
                handle,
                armed: true,
            };
            let disconnected = || Error::WorkerDisconnected {
                id: handle.id().clone(),
            };

            worker.send(payload).await.map_err(|_| disconnected())?;
            let reply = worker.recv().await.map_err(|_| disconnected())?;
            guard.defuse();
            reply
        };

        incoming
            .send(reply)
            .await
            .map_err(|_| Error::RequestCancelled)
    }
}

/// Evicts a worker whose exchange did not run to completion.
///
/// Armed once the exchange lock is held and defused after the worker's reply
/// has been read. Any early return or drop of the job future in between
/// leaves the worker's stream out of step with ours.
struct EvictOnDrop<'a, C> {
    dispatcher: &'a Dispatcher<C>,
    handle: &'a Arc<WorkerHandle<C>>,
    armed: bool,
}

impl<C> EvictOnDrop<'_, C> {
    fn defuse(mut self) {
        self.armed = false;
    }
}

impl<C> Drop for EvictOnDrop<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            self.dispatcher.evict(self.handle);
        }
    }
}

/// Recovers the connection from a handle that was never shared.
fn reclaim<C>(handle: Arc<WorkerHandle<C>>) -> C {
    match Arc::try_unwrap(handle) {
        Ok(handle) => handle.into_connection(),
        Err(_) => unreachable!("rejected worker handle was shared"),
    }
}
