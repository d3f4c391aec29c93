// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Process-wide active message state: the one-shot handler-translation
//! bootstrap, the handler registry, and the drain mutex shared by every
//! queue built against this context.
//!
//! In the source this state is a handful of module-scope statics (`static
//! bool initialized`, `static int64_t *offsets`, a single
//! `pthread_mutex_t`). This crate's demo models each PGAS "unit" as a
//! logical endpoint inside one OS process rather than a separate process,
//! so true process-wide statics would be shared by every unit and would
//! make the drain mutex meaningless. `AmqContext` is therefore one instance
//! *per unit*, which is the generalization of "process-wide" that matches
//! this crate's simulated topology: a real deployment with one OS process
//! per unit would have exactly one `AmqContext` per process, recovering the
//! source's behavior exactly.

use std::fmt;
use std::sync::{Mutex, MutexGuard, OnceLock, TryLockError};

use amq_team::UnitHandle;
use log::{debug, info};

use crate::error::AmqError;
use crate::handler::{HandlerFn, HandlerId, HandlerTable};

/// The outcome of the one-shot base-address exchange in [`AmqContext::init`].
enum Translation {
    /// Every unit's reference address matched; no translation needed.
    Disabled,
    /// `offsets[global_id]` added to a local handler address yields that
    /// handler's address on unit `global_id`.
    Offsets(Vec<i64>),
}

impl fmt::Debug for Translation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "Translation::Disabled"),
            Self::Offsets(v) => write!(f, "Translation::Offsets({} peers)", v.len()),
        }
    }
}

/// Per-unit process-wide state for the active message subsystem.
pub struct AmqContext {
    unit: UnitHandle,
    handlers: Mutex<HandlerTable>,
    translation: OnceLock<Translation>,
    drain_mutex: Mutex<()>,
}

impl AmqContext {
    /// Builds an uninitialized context for `unit`. Does not itself perform
    /// the collective handshake; call [`AmqContext::init`] before opening
    /// any queue that uses [`crate::HandlerMode::Translated`].
    pub fn new(unit: UnitHandle) -> Self {
        AmqContext {
            unit,
            handlers: Mutex::new(HandlerTable::new()),
            translation: OnceLock::new(),
            drain_mutex: Mutex::new(()),
        }
    }

    /// Registers `f` in this unit's handler table, for use with
    /// [`crate::HandlerMode::Registry`] queues. Callers must register
    /// handlers in the same order on every unit so that the assigned
    /// [`HandlerId`]s line up across the team.
    pub fn register_handler(&self, f: HandlerFn) -> HandlerId {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .register(f)
    }

    pub(crate) fn handler(&self, id: HandlerId) -> Option<HandlerFn> {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(id)
    }

    /// Performs the one-shot collective base-address handshake, using the
    /// address of [`crate::queue::Queue::open`] as the reference symbol —
    /// the same choice the source makes (it uses its own `dart_amsg_openq`
    /// entry point).
    ///
    /// Idempotent: a second call on an already-initialized context is a
    /// no-op returning `Ok(())`, without re-entering the collective exchange
    /// (so callers may call this as often as they like without every unit
    /// needing to re-synchronize).
    pub fn init(&self) -> Result<(), AmqError> {
        let reference = crate::queue::Queue::open as usize as u64;
        self.init_with_reference(reference)
    }

    /// As [`AmqContext::init`], but lets callers supply the reference
    /// address explicitly. Production code should use [`AmqContext::init`];
    /// this exists so tests can simulate heterogeneous address layouts
    /// without needing separate OS processes (every unit in this crate's
    /// demo shares one address space, so the real reference address is
    /// always identical across units).
    pub fn init_with_reference(&self, local_ref_addr: u64) -> Result<(), AmqError> {
        if self.translation.get().is_some() {
            debug!("amq init is a no-op: translation table already built");
            return Ok(());
        }

        let comm = self.unit.team().communicator();
        let bases = comm.allgather_u64(self.unit.relative_id() as usize, local_ref_addr);

        let translation = if bases.iter().all(|&b| b == local_ref_addr) {
            Translation::Disabled
        } else {
            info!(
                "unit {}: heterogeneous reference addresses detected, building offset table",
                self.unit.relative_id()
            );
            Translation::Offsets(
                bases
                    .iter()
                    .map(|&b| local_ref_addr as i64 - b as i64)
                    .collect(),
            )
        };

        // If another caller raced us and already set it, keep theirs: both
        // were computed from the same collective round and are equivalent.
        let _ = self.translation.set(translation);
        Ok(())
    }

    /// `true` once [`AmqContext::init`] has completed.
    pub fn is_initialized(&self) -> bool {
        self.translation.get().is_some()
    }

    /// Translates a local handler address to its target-valid form, or
    /// returns it unchanged if translation is disabled.
    ///
    /// # Errors
    /// Returns [`AmqError::NotInit`] if called before [`AmqContext::init`].
    pub(crate) fn translate(&self, local_addr: u64, target_global_id: u32) -> Result<u64, AmqError> {
        match self.translation.get().ok_or(AmqError::NotInit)? {
            Translation::Disabled => Ok(local_addr),
            Translation::Offsets(offsets) => {
                let offset = offsets
                    .get(target_global_id as usize)
                    .ok_or_else(|| AmqError::Inval(format!("no such global id {target_global_id}")))?;
                Ok((local_addr as i64 + offset) as u64)
            }
        }
    }

    pub(crate) fn unit(&self) -> &UnitHandle {
        &self.unit
    }

    /// Tries to acquire the drain mutex without blocking, returning `None`
    /// on contention (another thread in this unit is already draining some
    /// queue built against this context).
    pub(crate) fn try_lock_drain(&self) -> Option<MutexGuard<'_, ()>> {
        match self.drain_mutex.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::WouldBlock) => None,
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
        }
    }
}
