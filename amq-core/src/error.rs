// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fmt;

/// Errors surfaced through the active message queue API.
#[derive(Debug)]
pub enum AmqError {
    /// Retryable: the target's queue cannot currently accept a record of
    /// this size, or another thread in this process is already draining.
    Again,

    /// Bad arguments, or a decoded record overran the observed tail
    /// (queue corruption detected during drain).
    Inval(String),

    /// The subsystem has not completed `init`, or `init`'s collective
    /// exchange failed.
    NotInit,

    /// A failure in the underlying one-sided substrate (window allocation,
    /// a poisoned lock, ...). The queue is left in a best-effort consistent
    /// state; callers should not assume recovery.
    Substrate(std::io::Error),
}

impl fmt::Display for AmqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Again => write!(f, "operation would need to be retried"),
            Self::Inval(msg) => write!(f, "invalid argument or corrupted queue: {msg}"),
            Self::NotInit => write!(f, "active message subsystem is not initialized"),
            Self::Substrate(e) => write!(f, "substrate error: {e}"),
        }
    }
}

impl std::error::Error for AmqError {}

impl From<std::io::Error> for AmqError {
    fn from(e: std::io::Error) -> Self {
        Self::Substrate(e)
    }
}
