//! Capability index with fair round-robin rotation.
//!
//! For every tag the index keeps a [`VecDeque`] of the workers declaring it.
//! Selection pops the front and pushes it to the back, so a worker that just
//! served a tag is the least eligible for the next job bearing that tag. The
//! index stores identifiers only; handles live in the
//! [`Registry`](crate::Registry).
//!
//! Both `register` and `deregister` validate every tag before mutating any
//! queue, so a failing call leaves the index exactly as it was.

use crate::{CapabilitySet, Error, Result, Tag, WorkerId};
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Default)]
pub struct CapabilityIndex {
    rotations: HashMap<Tag, VecDeque<WorkerId>>,
}

impl CapabilityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `id` to the back of the rotation for every tag in
    /// `capabilities`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateRegistration`] if `id` is already queued for
    /// any of the tags.
    pub fn register(&mut self, id: &WorkerId, capabilities: &CapabilitySet) -> Result<()> {
        if capabilities.iter().any(|tag| self.contains(tag.as_str(), id)) {
            return Err(Error::DuplicateRegistration { id: id.clone() });
        }
        for tag in capabilities {
            self.rotations
                .entry(tag.clone())
                .or_default()
                .push_back(id.clone());
        }
        Ok(())
    }

    /// Removes `id` from the rotation of every tag in `capabilities`.
    ///
    /// Tags left without workers are dropped from the index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if `id` is missing from any of the listed
    /// rotations. That only happens if the index and registry have diverged.
    pub fn deregister(&mut self, id: &WorkerId, capabilities: &CapabilitySet) -> Result<()> {
        if !capabilities.iter().all(|tag| self.contains(tag.as_str(), id)) {
            return Err(Error::NotFound { id: id.clone() });
        }
        for tag in capabilities {
            let emptied = match self.rotations.get_mut(tag.as_str()) {
                Some(queue) => {
                    queue.retain(|queued| queued != id);
                    queue.is_empty()
                }
                None => false,
            };
            if emptied {
                self.rotations.remove(tag.as_str());
            }
        }
        Ok(())
    }

    /// Selects the worker at the front of `tag`'s rotation and moves it to the
    /// back.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoAvailableWorker`] if no worker declares `tag`.
    pub fn next(&mut self, tag: &str) -> Result<WorkerId> {
        self.rotations
            .get_mut(tag)
            .and_then(|queue| {
                let id = queue.pop_front()?;
                queue.push_back(id.clone());
                Some(id)
            })
            .ok_or_else(|| Error::NoAvailableWorker {
                tag: tag.to_owned(),
            })
    }

    /// Current rotation for `tag`, front (next to serve) first.
    pub fn rotation(&self, tag: &str) -> Vec<WorkerId> {
        self.rotations
            .get(tag)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, tag: &str, id: &WorkerId) -> bool {
        self.rotations
            .get(tag)
            .is_some_and(|queue| queue.contains(id))
    }

    /// Tags with at least one worker.
    pub fn tags(&self) -> impl Iterator<Item = &Tag> {
        self.rotations.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.rotations.is_empty()
    }

    pub fn clear(&mut self) {
        self.rotations.clear();
    }
}
