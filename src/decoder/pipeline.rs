// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bounded hand-off of slice descriptors to the reconstruction backend.
//!
//! Every descriptor travels inside a [`Task`] that holds one of the pool's slots. The slot
//! returns to the pool when the task is dropped, so the parser can never run more than
//! [`MAX_TASK_SIZE`] descriptors ahead of the backend.

use std::ops::Deref;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::SyncSender;
use std::sync::Arc;

use anyhow::Context;
use log::trace;

/// Number of slice descriptors that may be in flight at once.
pub const MAX_TASK_SIZE: usize = 2;

pub struct TaskPool {
    slots: Receiver<()>,
    release: SyncSender<()>,
    depth: usize,
    in_flight: Arc<AtomicUsize>,
}

impl TaskPool {
    pub fn new(depth: usize) -> Self {
        let (release, slots) = mpsc::sync_channel(depth);
        for _ in 0..depth {
            // Cannot fail: the channel has room for exactly `depth` slots.
            let _ = release.try_send(());
        }

        Self {
            slots,
            release,
            depth,
            in_flight: Default::default(),
        }
    }

    /// Number of tasks handed out and not yet released.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    fn wrap<D>(&self, payload: D) -> Task<D> {
        let in_flight = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        trace!("Task acquired, {} in flight", in_flight);

        Task {
            payload,
            release: Some(self.release.clone()),
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Wraps `payload` into a task, waiting for a previous task to be released if all the
    /// slots are taken.
    pub fn acquire<D>(&self, payload: D) -> anyhow::Result<Task<D>> {
        self.slots.recv().context("mpsc::Receiver::recv")?;
        Ok(self.wrap(payload))
    }

    /// Like [`TaskPool::acquire`], but gives `payload` back instead of waiting.
    #[cfg(test)]
    pub fn try_acquire<D>(&self, payload: D) -> Result<Task<D>, D> {
        match self.slots.try_recv() {
            Ok(()) => Ok(self.wrap(payload)),
            Err(mpsc::TryRecvError::Empty) | Err(mpsc::TryRecvError::Disconnected) => Err(payload),
        }
    }

    /// Blocks until every task has been released.
    pub fn wait_idle(&self) -> anyhow::Result<()> {
        for _ in 0..self.depth {
            self.slots.recv().context("mpsc::Receiver::recv")?;
        }
        for _ in 0..self.depth {
            self.release
                .try_send(())
                .context("mpsc::SyncSender::try_send")?;
        }

        Ok(())
    }
}

impl Default for TaskPool {
    fn default() -> Self {
        Self::new(MAX_TASK_SIZE)
    }
}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPool")
            .field("depth", &self.depth)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// A unit of work for the backend. Dropping it, or calling [`Task::complete`], frees its
/// slot in the pool.
pub struct Task<D> {
    payload: D,
    release: Option<SyncSender<()>>,
    in_flight: Arc<AtomicUsize>,
}

impl<D> Task<D> {
    pub fn payload(&self) -> &D {
        &self.payload
    }

    /// Signals that the backend is done with this task.
    pub fn complete(self) {}
}

impl<D> Deref for Task<D> {
    type Target = D;

    fn deref(&self) -> &D {
        &self.payload
    }
}

impl<D> Drop for Task<D> {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            // The pool may already be gone, in which case nobody waits for the slot.
            let _ = release.send(());
        }
    }
}

impl<D: std::fmt::Debug> std::fmt::Debug for Task<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("payload", &self.payload)
            .finish()
    }
}
