// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Unit and team directory, plus the two collectives the active message
//! queue itself calls: a barrier and a fixed-size exchange used to
//! distribute window handles and reference addresses across a team.
//!
//! There is no real network fabric backing any of this: every "unit" is a
//! logical endpoint inside one process, usually driven from its own thread.
//! The directory and collective contracts are still total and exercised the
//! same way a real communicator would be.

use std::sync::{Arc, Barrier, Mutex, Weak};

use amq_rma::Window;
use log::trace;

/// A unit's ID, either team-relative or global depending on context.
pub type UnitId = u32;

/// A named subset of units sharing a [`Communicator`].
///
/// `global_ids[r]` is the global ID of the unit at team-relative rank `r`.
/// [`Team::world`] builds the one team where relative and global IDs
/// coincide; other teams would be constructed as sub-ranges or explicit
/// subsets of `world`'s unit list (not needed by anything in this crate, so
/// not implemented).
pub struct Team {
    global_ids: Vec<UnitId>,
    comm: Communicator,
    /// Lets `unit()` hand out a `UnitHandle` holding its own `Arc<Team>`
    /// from a plain `&self`, without requiring callers to pass the `Arc`
    /// they built this team from back in.
    self_ref: Weak<Team>,
}

impl Team {
    /// Builds the one implicit "world" team containing every unit the
    /// process knows about, indexed `0..n`.
    pub fn world(n: usize) -> Arc<Team> {
        assert!(n > 0, "a team must have at least one unit");
        Arc::new_cyclic(|self_ref| Team {
            global_ids: (0..n as UnitId).collect(),
            comm: Communicator::new(n),
            self_ref: self_ref.clone(),
        })
    }

    /// Number of units participating in this team.
    pub fn size(&self) -> usize {
        self.global_ids.len()
    }

    /// Resolves a team-relative ID to the corresponding global ID.
    pub fn global_id(&self, relative: UnitId) -> UnitId {
        self.global_ids[relative as usize]
    }

    /// The communicator backing this team's collectives.
    pub fn communicator(&self) -> &Communicator {
        &self.comm
    }

    /// Builds a handle for the unit at team-relative rank `relative_id`.
    pub fn unit(&self, relative_id: UnitId) -> UnitHandle {
        assert!((relative_id as usize) < self.size(), "relative id out of range");
        UnitHandle {
            team: self
                .self_ref
                .upgrade()
                .expect("team is still alive while unit() is being called on it"),
            relative_id,
        }
    }
}

/// A unit's handle to its own identity within a team: total, failure-free
/// accessors for its team-relative ID, its global ID, and the team itself.
#[derive(Clone)]
pub struct UnitHandle {
    team: Arc<Team>,
    relative_id: UnitId,
}

impl UnitHandle {
    /// This unit's ID relative to its team.
    pub fn relative_id(&self) -> UnitId {
        self.relative_id
    }

    /// This unit's process-global ID.
    pub fn global_id(&self) -> UnitId {
        self.team.global_id(self.relative_id)
    }

    /// The team this handle belongs to.
    pub fn team(&self) -> &Arc<Team> {
        &self.team
    }
}

type WindowPair = (Arc<Window>, Arc<Window>);

/// The two collectives the active message queue depends on: an all-to-all
/// exchange (used both to distribute window handles at queue-open time and
/// to distribute reference addresses at init time) and a barrier.
pub struct Communicator {
    size: usize,
    barrier: Barrier,
    u64_slots: Mutex<Vec<u64>>,
    window_slots: Mutex<Vec<Option<WindowPair>>>,
}

impl Communicator {
    fn new(size: usize) -> Self {
        Communicator {
            size,
            barrier: Barrier::new(size),
            u64_slots: Mutex::new(vec![0; size]),
            window_slots: Mutex::new(vec![None; size]),
        }
    }

    /// Number of participants in this communicator.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Blocks until every participant has called `barrier`.
    ///
    /// Reusable across phases: open, close, sync, and init each call this
    /// once, and calls do not need to be separated in any other way as long
    /// as every unit issues them in the same collective order (the ordinary
    /// rule for collectives).
    pub fn barrier(&self) {
        trace!("entering barrier ({} participants)", self.size);
        self.barrier.wait();
    }

    /// All-to-all exchange of one `u64` per unit. Every participant supplies
    /// its own value at `relative_id` and receives the full, rank-ordered
    /// vector once every participant has contributed.
    pub fn allgather_u64(&self, relative_id: usize, value: u64) -> Vec<u64> {
        {
            let mut slots = self.u64_slots.lock().unwrap();
            slots[relative_id] = value;
        }
        self.barrier.wait();
        let result = self.u64_slots.lock().unwrap().clone();
        trace!("allgather_u64 complete: {result:?}");
        result
    }

    /// Collective window-pair exchange: every unit allocates its own tail
    /// and ring windows locally and contributes them here; every unit gets
    /// back the full, rank-ordered vector of window pairs once allocation
    /// has completed everywhere. Mirrors `MPI_Win_allocate`'s guarantee that
    /// no unit may access the window until every unit has finished
    /// allocating its own piece.
    pub fn exchange_windows(
        &self,
        relative_id: usize,
        tail: Arc<Window>,
        ring: Arc<Window>,
    ) -> Vec<WindowPair> {
        {
            let mut slots = self.window_slots.lock().unwrap();
            slots[relative_id] = Some((tail, ring));
        }
        self.barrier.wait();
        let slots = self.window_slots.lock().unwrap();
        let pairs: Vec<_> = slots
            .iter()
            .cloned()
            .map(|slot| slot.expect("every unit must contribute its windows before this point"))
            .collect();
        trace!("exchange_windows complete: {} pairs", pairs.len());
        pairs
    }
}
