// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! One-sided remote-memory window primitives.
//!
//! A [`Window`] is the minimal substrate a one-sided active message queue
//! needs: an exposed region of memory, an exclusive per-window lock, and a
//! small set of operations (`fetch_and_op`, `put`, `get`) that are only valid
//! while the lock is held. This mirrors the MPI one-sided window contract the
//! queue is built against, backed here by an anonymous shared mapping so the
//! whole system is runnable in a single process with many logical units.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use log::trace;

/// The operation applied by [`WindowGuard::fetch_and_op`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicOp {
    /// Add the operand to the current value.
    Sum,
    /// Replace the current value with the operand.
    Replace,
}

/// A single exposed memory region with its own exclusive-lock domain.
///
/// A queue uses two of these per unit: an 8-byte tail counter and an
/// N-byte payload ring. Both share this type because both support the same
/// small set of one-sided operations under the same lock/unlock discipline.
pub struct Window {
    addr: *mut u8,
    len: usize,
    lock: Mutex<()>,
}

// SAFETY: `addr` points at an anonymous mapping owned exclusively by this
// `Window`; all access to it is mediated by `lock`.
unsafe impl Send for Window {}
unsafe impl Sync for Window {}

impl Window {
    /// Allocates a zero-initialized window of `len` bytes.
    pub fn alloc(len: usize) -> io::Result<Self> {
        assert!(len > 0, "window length must be non-zero");

        // SAFETY: requests an anonymous, process-private-but-shareable
        // mapping with no backing file. The returned pointer is exclusively
        // owned by the `Window` constructed below until it is dropped.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_SHARED,
                -1,
                0,
            )
        };

        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        trace!("mapped {len}-byte window at {addr:p}");

        Ok(Self {
            addr: addr as *mut u8,
            len,
            lock: Mutex::new(()),
        })
    }

    /// Size of this window in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Acquires this window's exclusive lock, blocking until it is free.
    ///
    /// Mirrors `MPI_Win_lock(MPI_LOCK_EXCLUSIVE, ...)`: while the guard is
    /// held, the caller has exclusive one-sided access to the window.
    pub fn lock(&self) -> WindowGuard<'_> {
        let guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        WindowGuard {
            window: self,
            _guard: guard,
        }
    }
}

impl Drop for Window {
    fn drop(&mut self) {
        trace!("unmapping {}-byte window at {:p}", self.len, self.addr);
        // SAFETY: `addr`/`len` describe exactly the mapping created in
        // `alloc`, and no `WindowGuard` can outlive `self`.
        unsafe {
            libc::munmap(self.addr as *mut libc::c_void, self.len);
        }
    }
}

/// An exclusive lock on a [`Window`], obtained via [`Window::lock`].
///
/// Only while holding a `WindowGuard` may a caller perform atomic, `put`, or
/// `get` operations against the underlying memory.
pub struct WindowGuard<'a> {
    window: &'a Window,
    _guard: MutexGuard<'a, ()>,
}

impl WindowGuard<'_> {
    /// Atomically applies `op` with `operand` to the 8-byte integer at the
    /// window's origin, returning the value observed *before* the operation.
    ///
    /// # Panics
    /// Panics if the window is smaller than 8 bytes.
    pub fn fetch_and_op(&self, op: AtomicOp, operand: u64) -> u64 {
        assert!(
            self.window.len >= 8,
            "fetch_and_op requires at least an 8-byte window"
        );

        // SAFETY: the window is at least 8 bytes and page-aligned (mmap
        // mappings are always page-aligned, so certainly 8-byte aligned);
        // the lock held by this guard makes this the only live accessor.
        let cell = unsafe { &*(self.window.addr as *const AtomicU64) };

        match op {
            AtomicOp::Sum => cell.fetch_add(operand, Ordering::AcqRel),
            AtomicOp::Replace => cell.swap(operand, Ordering::AcqRel),
        }
    }

    /// Copies `src` into the window at byte offset `offset`.
    ///
    /// # Panics
    /// Panics if `[offset, offset + src.len())` is out of bounds.
    pub fn put(&self, offset: usize, src: &[u8]) {
        let end = offset.checked_add(src.len()).expect("offset overflow");
        assert!(end <= self.window.len, "put out of bounds");

        // SAFETY: bounds were just checked against `self.window.len`; the
        // lock held by this guard excludes concurrent accessors.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.window.addr.add(offset), src.len());
        }
    }

    /// Copies `dst.len()` bytes starting at byte offset `offset` out of the
    /// window.
    ///
    /// # Panics
    /// Panics if `[offset, offset + dst.len())` is out of bounds.
    pub fn get(&self, offset: usize, dst: &mut [u8]) {
        let end = offset.checked_add(dst.len()).expect("offset overflow");
        assert!(end <= self.window.len, "get out of bounds");

        // SAFETY: bounds were just checked against `self.window.len`; the
        // lock held by this guard excludes concurrent accessors.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.window.addr.add(offset),
                dst.as_mut_ptr(),
                dst.len(),
            );
        }
    }
}
