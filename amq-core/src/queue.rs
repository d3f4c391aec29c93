// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The active message queue itself: collective open/close, the sender, and
//! the drainer.

use std::sync::{Arc, Mutex};

use amq_rma::{AtomicOp, Window};
use amq_team::{Team, UnitHandle, UnitId};
use log::{debug, info, warn};

use crate::context::AmqContext;
use crate::error::AmqError;
use crate::frame;
use crate::handler::{Handler, HandlerId, HandlerMode};

/// A fixed-capacity, per-unit, remote-writable ring-slot region.
///
/// One `Queue` is opened collectively on a team; every unit may `trysend`
/// into any other unit's queue from any thread, and at most one thread per
/// unit may `process` (drain) that unit's own queue at a time.
pub struct Queue {
    ctx: Arc<AmqContext>,
    team: Arc<Team>,
    unit: UnitHandle,
    mode: HandlerMode,
    capacity: usize,

    /// This unit's own tail and ring windows (what peers write into).
    tail: Arc<Window>,
    ring: Arc<Window>,

    /// Every unit's tail/ring windows, indexed by team-relative id, so this
    /// unit can `trysend` into any of them.
    peer_tails: Vec<Arc<Window>>,
    peer_rings: Vec<Arc<Window>>,

    /// Local, non-exposed snapshot buffer used by `process`.
    scratch: Mutex<Vec<u8>>,
}

impl Queue {
    /// Opens a queue of `capacity` bytes, collective on `unit`'s team.
    ///
    /// Blocks until every unit in the team has completed its own window
    /// allocation (mirrors `MPI_Win_allocate`'s collective guarantee: no
    /// unit may access a window until all units have finished allocating).
    pub fn open(capacity: usize, unit: UnitHandle, ctx: Arc<AmqContext>, mode: HandlerMode) -> Result<Queue, AmqError> {
        if capacity == 0 {
            return Err(AmqError::Inval("queue capacity must be non-zero".into()));
        }

        let tail = Arc::new(Window::alloc(8)?);
        let ring = Arc::new(Window::alloc(capacity)?);

        let team = Arc::clone(unit.team());
        let pairs = team
            .communicator()
            .exchange_windows(unit.relative_id() as usize, Arc::clone(&tail), Arc::clone(&ring));

        let (peer_tails, peer_rings): (Vec<_>, Vec<_>) = pairs.into_iter().unzip();

        debug!(
            "unit {}: opened queue of {capacity} bytes across {} units",
            unit.relative_id(),
            peer_tails.len()
        );

        Ok(Queue {
            ctx,
            team,
            unit,
            mode,
            capacity,
            tail,
            ring,
            peer_tails,
            peer_rings,
            scratch: Mutex::new(vec![0u8; capacity]),
        })
    }

    /// Attempts to enqueue `data` at `target_rel`'s queue, to be dispatched
    /// to `handler` on that unit's next drain.
    ///
    /// Returns `AmqError::Again` if the target's ring does not currently
    /// have room for this record; the target's tail is left exactly as it
    /// was before this call.
    pub fn trysend(&self, target_rel: UnitId, handler: Handler, data: &[u8]) -> Result<(), AmqError> {
        let target = target_rel as usize;
        let target_tail = self
            .peer_tails
            .get(target)
            .ok_or_else(|| AmqError::Inval(format!("no such target unit {target_rel}")))?;
        let target_ring = &self.peer_rings[target];

        let handler_value = self.resolve_handler(target_rel, handler)?;
        let len = frame::record_len(data.len());
        let l = len as u64;

        let tail_guard = target_tail.lock();
        let prev_tail = tail_guard.fetch_and_op(AtomicOp::Sum, l);

        if prev_tail + l > self.capacity as u64 {
            // Revert: restore the tail to what it was before our reservation.
            tail_guard.fetch_and_op(AtomicOp::Replace, prev_tail);
            drop(tail_guard);
            debug!(
                "unit {}: no room for {len}-byte record at unit {target_rel} (tail was {prev_tail})",
                self.unit.relative_id()
            );
            return Err(AmqError::Again);
        }

        // Acquire the ring lock before releasing the tail lock: a
        // concurrent drainer must not observe our reservation in the tail
        // while our bytes are not yet in the ring.
        let ring_guard = target_ring.lock();
        drop(tail_guard);

        let mut record = vec![0u8; len];
        frame::encode(&mut record, self.unit.relative_id(), handler_value, data);
        ring_guard.put(prev_tail as usize, &record);
        drop(ring_guard);

        info!(
            "unit {}: sent {len}-byte record to unit {target_rel} at offset {prev_tail}",
            self.unit.relative_id()
        );
        Ok(())
    }

    fn resolve_handler(&self, target_rel: UnitId, handler: Handler) -> Result<u64, AmqError> {
        match (self.mode, handler) {
            (HandlerMode::Registry, Handler::Registry(id)) => Ok(id.0 as u64),
            (HandlerMode::Translated, Handler::Translated(f)) => {
                let local_addr = f as usize as u64;
                let global_id = self.team.global_id(target_rel);
                self.ctx.translate(local_addr, global_id)
            }
            _ => Err(AmqError::Inval(
                "handler kind does not match this queue's handler mode".into(),
            )),
        }
    }

    /// Snapshots and clears this unit's own queue, then dispatches every
    /// record found in the snapshot.
    ///
    /// Returns `AmqError::Again` without touching the queue if another
    /// thread in this unit is already draining some queue built against
    /// the same [`AmqContext`].
    pub fn process(&self) -> Result<(), AmqError> {
        let _drain_guard = self.ctx.try_lock_drain().ok_or(AmqError::Again)?;

        let tail_guard = self.tail.lock();
        // Read the tail without disturbing it: adding zero.
        let t = tail_guard.fetch_and_op(AtomicOp::Sum, 0);

        if t == 0 {
            return Ok(());
        }
        let t = t as usize;

        let ring_guard = self.ring.lock();
        let mut scratch = self.scratch.lock().unwrap_or_else(|p| p.into_inner());
        ring_guard.get(0, &mut scratch[..t]);
        drop(ring_guard);

        // Reset the tail while still holding its lock, so a sender that
        // raced the tail read above (acquiring the lock right after we
        // released it... ) cannot happen: we hold the tail lock across the
        // entire snapshot-plus-reset window, the same way the source does.
        tail_guard.fetch_and_op(AtomicOp::Replace, 0);
        drop(tail_guard);

        debug!("unit {}: draining {t} bytes", self.unit.relative_id());
        self.dispatch(&scratch[..t])
    }

    fn dispatch(&self, mut buf: &[u8]) -> Result<(), AmqError> {
        let mut invoked = 0usize;
        while !buf.is_empty() {
            let (record, consumed) = match frame::decode(buf) {
                Ok(ok) => ok,
                Err(e) => {
                    warn!(
                        "unit {}: drain aborted after {invoked} records, corrupted snapshot: {e}",
                        self.unit.relative_id()
                    );
                    return Err(e);
                }
            };

            match self.mode {
                HandlerMode::Registry => {
                    let id = HandlerId(record.handler as u32);
                    match self.ctx.handler(id) {
                        Some(f) => f(record.data),
                        None => {
                            return Err(AmqError::Inval(format!(
                                "no handler registered for id {}",
                                record.handler
                            )))
                        }
                    }
                }
                HandlerMode::Translated => {
                    // SAFETY: `record.handler` was produced by `trysend`
                    // either as a raw `HandlerFn` address (homogeneous
                    // case) or as that address plus this unit's offset
                    // (heterogeneous case); either way it is a valid
                    // `HandlerFn` in this unit's address space.
                    let f: crate::handler::HandlerFn =
                        unsafe { std::mem::transmute::<usize, crate::handler::HandlerFn>(record.handler as usize) };
                    f(record.data);
                }
            }

            invoked += 1;
            buf = &buf[consumed..];
        }
        debug!("unit {}: invoked {invoked} handlers", self.unit.relative_id());
        Ok(())
    }

    /// Collective barrier on this queue's team, followed by a local
    /// `process`: "everyone has finished sending for this phase; drain
    /// what arrived."
    pub fn sync(&self) -> Result<(), AmqError> {
        self.team.communicator().barrier();
        self.process()
    }

    /// Closes the queue, collective on its team.
    ///
    /// Does not guarantee delivery of unprocessed in-flight messages;
    /// callers that care must `process` (or `sync`) before closing.
    pub fn close(self) -> Result<(), AmqError> {
        self.team.communicator().barrier();
        Ok(())
    }

    /// Total capacity of this queue's ring, in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amq_team::Team;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static INVOCATIONS: AtomicUsize = AtomicUsize::new(0);
    static LAST_PAYLOAD_LEN: AtomicUsize = AtomicUsize::new(0);

    fn counting_handler(data: &[u8]) {
        INVOCATIONS.fetch_add(1, Ordering::SeqCst);
        LAST_PAYLOAD_LEN.store(data.len(), Ordering::SeqCst);
    }

    fn open_team_of_queues(n: usize, capacity: usize) -> Vec<(Queue, Arc<AmqContext>)> {
        let team = Team::world(n);
        let ctxs: Vec<_> = (0..n)
            .map(|r| Arc::new(AmqContext::new(team.unit(r as UnitId))))
            .collect();
        for ctx in &ctxs {
            ctx.init().unwrap();
        }

        let queues: Vec<Option<Queue>> = (0..n).map(|_| None).collect();
        let queues = std::sync::Mutex::new(queues);

        std::thread::scope(|scope| {
            for r in 0..n {
                let team = Arc::clone(&team);
                let ctx = Arc::clone(&ctxs[r]);
                let queues = &queues;
                scope.spawn(move || {
                    let unit = team.unit(r as UnitId);
                    let q = Queue::open(capacity, unit, ctx, HandlerMode::Registry).unwrap();
                    queues.lock().unwrap()[r] = Some(q);
                });
            }
        });

        queues
            .into_inner()
            .unwrap()
            .into_iter()
            .zip(ctxs)
            .map(|(q, ctx)| (q.unwrap(), ctx))
            .collect()
    }

    #[test]
    fn two_units_no_contention_delivers_once() {
        INVOCATIONS.store(0, Ordering::SeqCst);
        let mut queues = open_team_of_queues(2, 1024);
        let (q0, ctx0) = &mut queues[0];
        let handler_id = ctx0.register_handler(counting_handler);
        {
            let (q1, ctx1) = &mut queues[1];
            let id1 = ctx1.register_handler(counting_handler);
            assert_eq!(id1, handler_id);
            q0.trysend(1, Handler::Registry(handler_id), &[1u8; 16]).unwrap();
            q1.process().unwrap();
        }
        assert_eq!(INVOCATIONS.load(Ordering::SeqCst), 1);
        assert_eq!(LAST_PAYLOAD_LEN.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn overflow_returns_again_then_drain_resets_tail() {
        INVOCATIONS.store(0, Ordering::SeqCst);
        let mut queues = open_team_of_queues(2, 64);
        let handler_id = queues[0].1.register_handler(counting_handler);
        let _ = queues[1].1.register_handler(counting_handler);

        let payload = vec![0u8; 28]; // 28 + 20-byte header = 48 bytes
        let (q0, _) = &queues[0];
        assert!(q0
            .trysend(1, Handler::Registry(handler_id), &payload)
            .is_ok());
        assert_eq!(
            q0.trysend(1, Handler::Registry(handler_id), &payload)
                .unwrap_err()
                .to_string(),
            AmqError::Again.to_string()
        );

        let (q1, _) = &queues[1];
        q1.process().unwrap();
        assert_eq!(INVOCATIONS.load(Ordering::SeqCst), 1);

        // A third send of the same size now succeeds because the drain
        // reset the target's tail to zero.
        assert!(q0
            .trysend(1, Handler::Registry(handler_id), &payload)
            .is_ok());
    }

    #[test]
    fn concurrent_senders_all_delivered() {
        INVOCATIONS.store(0, Ordering::SeqCst);
        let queues = open_team_of_queues(4, 1024);
        let handler_id = queues[1].1.register_handler(counting_handler);

        std::thread::scope(|scope| {
            for sender in [0usize, 2, 3] {
                let q = &queues[sender].0;
                scope.spawn(move || {
                    q.trysend(1, Handler::Registry(handler_id), &[7u8; 20]).unwrap();
                });
            }
        });

        queues[1].0.process().unwrap();
        assert_eq!(INVOCATIONS.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn concurrent_drain_contention_returns_again() {
        INVOCATIONS.store(0, Ordering::SeqCst);
        let queues = open_team_of_queues(2, 1024);
        let handler_id = queues[1].1.register_handler(counting_handler);
        queues[0]
            .0
            .trysend(1, Handler::Registry(handler_id), &[1u8; 8])
            .unwrap();

        let results = std::sync::Mutex::new(Vec::new());
        std::thread::scope(|scope| {
            for _ in 0..2 {
                let q = &queues[1].0;
                let results = &results;
                scope.spawn(move || {
                    let r = q.process();
                    results.lock().unwrap().push(r);
                });
            }
        });

        let results = results.into_inner().unwrap();
        let ok_count = results.iter().filter(|r| r.is_ok()).count();
        let again_count = results
            .iter()
            .filter(|r| matches!(r, Err(AmqError::Again)))
            .count();
        assert_eq!(ok_count, 1);
        assert_eq!(again_count, 1);
        assert_eq!(INVOCATIONS.load(Ordering::SeqCst), 1);
    }

    fn open_translated_team_of_queues(n: usize, capacity: usize) -> Vec<Queue> {
        let team = Team::world(n);
        let queues: Vec<Option<Queue>> = (0..n).map(|_| None).collect();
        let queues = std::sync::Mutex::new(queues);

        std::thread::scope(|scope| {
            for r in 0..n {
                let team = Arc::clone(&team);
                let queues = &queues;
                scope.spawn(move || {
                    let unit = team.unit(r as UnitId);
                    let ctx = Arc::new(AmqContext::new(unit.clone()));
                    ctx.init().unwrap();
                    let q = Queue::open(capacity, unit, ctx, HandlerMode::Translated).unwrap();
                    queues.lock().unwrap()[r] = Some(q);
                });
            }
        });

        queues.into_inner().unwrap().into_iter().map(|q| q.unwrap()).collect()
    }

    #[test]
    fn translated_mode_delivers_to_raw_handler() {
        INVOCATIONS.store(0, Ordering::SeqCst);
        let queues = open_translated_team_of_queues(2, 256);

        queues[0]
            .trysend(1, Handler::Translated(counting_handler), &[9u8; 4])
            .unwrap();
        queues[1].process().unwrap();
        assert_eq!(INVOCATIONS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn mismatched_handler_kind_is_invalid() {
        let queues = open_team_of_queues(2, 256);
        let err = queues[0]
            .0
            .trysend(1, Handler::Translated(counting_handler), &[0u8; 4])
            .unwrap_err();
        assert!(matches!(err, AmqError::Inval(_)));
    }

    #[test]
    fn out_of_range_target_is_invalid_not_a_panic() {
        let queues = open_translated_team_of_queues(2, 256);

        let err = queues[0]
            .trysend(7, Handler::Translated(counting_handler), &[0u8; 4])
            .unwrap_err();
        assert!(matches!(err, AmqError::Inval(_)));
    }
}
