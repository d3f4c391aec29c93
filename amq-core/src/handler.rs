// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The default handler-dispatch mode: a per-process table mapping a stable,
//! cross-unit-identical index to a local function pointer, installed in the
//! same order by every unit's application code. See [`crate::Handler`] for
//! the alternate, translated-pointer mode kept for fidelity with the
//! original pointer-distribution design.

/// A handler invoked by the drainer with a reference to a record's payload.
/// Valid only for the duration of the call.
pub type HandlerFn = fn(&[u8]);

/// A stable index into the process-wide [`HandlerTable`], carried on the
/// wire in place of a raw function pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub(crate) u32);

/// Which of the two dispatch strategies a [`crate::Queue`] uses. Chosen once
/// at [`crate::Queue::open`] and fixed for the queue's lifetime; every
/// `trysend` against that queue must pass the matching [`Handler`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerMode {
    /// The default mode: the wire carries a [`HandlerId`] looked up in the
    /// local [`HandlerTable`] at drain time. Requires no cross-unit address
    /// translation.
    Registry,
    /// Fidelity mode: the wire carries a (possibly translated) raw function
    /// address, reproducing the original pointer-distribution design this
    /// queue is modeled on.
    Translated,
}

/// A handler reference passed to `trysend`, tagged with the dispatch
/// strategy it belongs to. The tag must match the target queue's
/// [`HandlerMode`].
#[derive(Debug, Clone, Copy)]
pub enum Handler {
    /// Look up `HandlerId` in the registry at the target.
    Registry(HandlerId),
    /// Translate (if needed) and carry a raw function pointer.
    Translated(HandlerFn),
}

/// Registry mapping [`HandlerId`]s to local function pointers.
///
/// Built up by identical-order `register` calls on every unit; immutable in
/// spirit once all units have finished registering, though nothing prevents
/// registering more handlers later (callers are responsible for keeping
/// registration order consistent across units).
#[derive(Default)]
pub struct HandlerTable {
    entries: Vec<HandlerFn>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `f`, returning the `HandlerId` assigned to it. Ids are
    /// assigned in registration order starting at 0, so calling this in the
    /// same order on every unit yields identical ids everywhere.
    pub fn register(&mut self, f: HandlerFn) -> HandlerId {
        let id = self.entries.len() as u32;
        self.entries.push(f);
        HandlerId(id)
    }

    /// Looks up a previously registered handler by id.
    pub fn get(&self, id: HandlerId) -> Option<HandlerFn> {
        self.entries.get(id.0 as usize).copied()
    }

    /// Number of handlers registered so far.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
