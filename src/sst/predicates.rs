/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The predicate loop: a single thread that repeatedly evaluates registered
//! `(predicate, action)` handles over the state table's rows.
//!
//! Predicates must be side-effect free and idempotent; they are evaluated in registration order
//! on every round of row scans. Actions run inline on the predicate thread and must not block:
//! the protocol components register actions that enqueue events onto their own queues and return.
//!
//! A handle registered as [`OneShot`](PredicateMode::OneShot) deregisters itself after its action
//! fires once; [`Recurring`](PredicateMode::Recurring) handles fire on every round their
//! predicate holds, until explicitly deregistered.
//!
//! Actions must not register or deregister predicates; they run with the registry locked.

use std::sync::{
    mpsc::{Receiver, TryRecvError},
    Arc, Mutex,
};
use std::thread::{self, JoinHandle};

use super::{fabric::Fabric, SharedStateTable};

/// Whether a predicate handle stays registered after it fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PredicateMode {
    OneShot,
    Recurring,
}

/// Identifies a registered predicate, for deregistration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PredicateHandle(u64);

type Predicate<F> = Box<dyn Fn(&SharedStateTable<F>) -> bool + Send>;
type Action<F> = Box<dyn FnMut(&SharedStateTable<F>) + Send>;

struct Registered<F: Fabric> {
    id: u64,
    predicate: Predicate<F>,
    action: Action<F>,
    mode: PredicateMode,
}

/// The registry of predicate handles evaluated by the predicate thread.
pub struct Predicates<F: Fabric> {
    inner: Mutex<Inner<F>>,
}

struct Inner<F: Fabric> {
    registered: Vec<Registered<F>>,
    next_id: u64,
}

impl<F: Fabric> Predicates<F> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                registered: Vec::new(),
                next_id: 0,
            }),
        }
    }

    /// Register a predicate handle. Evaluation order is registration order.
    pub fn register(
        &self,
        predicate: Predicate<F>,
        action: Action<F>,
        mode: PredicateMode,
    ) -> PredicateHandle {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.registered.push(Registered {
            id,
            predicate,
            action,
            mode,
        });
        PredicateHandle(id)
    }

    /// Remove a registered handle. Removing a handle that already fired as one-shot is a no-op.
    pub fn deregister(&self, handle: PredicateHandle) {
        let mut inner = self.inner.lock().unwrap();
        inner.registered.retain(|r| r.id != handle.0);
    }

    /// Evaluate one round: every registered predicate, in order, firing actions where predicates
    /// hold. Returns how many actions fired.
    pub(crate) fn evaluate_round(&self, table: &SharedStateTable<F>) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let mut fired = 0;
        let mut fired_one_shots = Vec::new();
        for registered in inner.registered.iter_mut() {
            if (registered.predicate)(table) {
                (registered.action)(table);
                fired += 1;
                if registered.mode == PredicateMode::OneShot {
                    fired_one_shots.push(registered.id);
                }
            }
        }
        if !fired_one_shots.is_empty() {
            inner
                .registered
                .retain(|r| !fired_one_shots.contains(&r.id));
        }
        fired
    }
}

impl<F: Fabric> Default for Predicates<F> {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the predicate thread for one table. The thread, the registry, and the table all belong
/// to one view and are torn down together at view install.
pub(crate) fn start_predicate_thread<F: Fabric>(
    table: Arc<SharedStateTable<F>>,
    predicates: Arc<Predicates<F>>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("Predicate thread disconnected from its owner")
            }
        }

        if predicates.evaluate_round(&table) == 0 {
            thread::yield_now()
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::types::data_types::{NodeId, PayloadSize, ViewId, WindowSize};

    use super::super::{
        fabric::NullFabric,
        layout::{RowLayout, SstGeometry},
    };
    use super::*;

    fn table() -> SharedStateTable<NullFabric> {
        let geometry = SstGeometry {
            num_members: 1,
            num_subgroups: 1,
            sender_slots: 1,
            changes_capacity: 4,
            window_size: WindowSize::new(2),
            max_inline_payload: PayloadSize::new(8),
            sender_slot_bases: vec![vec![0]],
        };
        SharedStateTable::new(
            ViewId::init(),
            RowLayout::new(geometry),
            vec![NodeId::new(0)],
            0,
            NullFabric,
        )
    }

    #[test]
    fn one_shot_fires_once_and_recurring_fires_until_deregistered() {
        let table = table();
        let predicates = Predicates::new();
        let one_shot_count = Arc::new(AtomicUsize::new(0));
        let recurring_count = Arc::new(AtomicUsize::new(0));

        let count = one_shot_count.clone();
        predicates.register(
            Box::new(|_| true),
            Box::new(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            }),
            PredicateMode::OneShot,
        );
        let count = recurring_count.clone();
        let recurring = predicates.register(
            Box::new(|_| true),
            Box::new(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            }),
            PredicateMode::Recurring,
        );

        predicates.evaluate_round(&table);
        predicates.evaluate_round(&table);
        assert_eq!(one_shot_count.load(Ordering::SeqCst), 1);
        assert_eq!(recurring_count.load(Ordering::SeqCst), 2);

        predicates.deregister(recurring);
        predicates.evaluate_round(&table);
        assert_eq!(recurring_count.load(Ordering::SeqCst), 2);
    }
}
