// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The active message queue (AMQ): a fixed-capacity, per-unit,
//! remote-writable ring-slot region that lets any unit enqueue a serialized
//! procedure invocation into any other unit's memory via one-sided remote
//! memory access, with atomic offset reservation and no active
//! participation of the target.
//!
//! Built on [`amq_rma`]'s window primitives and [`amq_team`]'s unit/team
//! directory and collectives. See `SPEC_FULL.md` at the workspace root for
//! the full component breakdown; this crate implements components C
//! through G (handler registry/translation, sender, drainer, lifecycle,
//! sync).

mod context;
mod error;
mod frame;
mod handler;
mod queue;

pub use context::AmqContext;
pub use error::AmqError;
pub use handler::{Handler, HandlerFn, HandlerId, HandlerMode, HandlerTable};
pub use queue::Queue;

pub use amq_team::{Communicator, Team, UnitHandle, UnitId};
