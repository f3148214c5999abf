//! Single-slot handoff for one direction.
//!
//! Each direction of a channel owns a [`SlotSync`] in its own resource. The
//! record itself lives in the segment; the slot only decides whose turn it
//! is to touch it:
//!
//! ```text
//!             begin_write                 end_write
//!   Idle/empty ──────────► WriterActive ──────────► Idle/full
//!       ▲                      │ abort_write            │ begin_read
//!       │                      ▼                        ▼
//!       └────────────────── Idle/empty ◄──────── ReaderActive
//!                                       end_read
//! ```
//!
//! All transitions happen under the slot's process-shared mutex. A writer
//! can only start on an empty slot and a reader only on a full one, so a
//! record is never read before its `end_write` and never overwritten
//! before its `end_read`.

use crate::backend::{Region, ResourceBackend};
use crate::error::{ShmError, ShmResult};
use crate::sync::{ShmCondvar, ShmMutex, ShmMutexGuard};
use duplex::consts::SLOT_MAGIC;
use duplex::layout::RecordLayout;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;
use tracing::trace;

/// Whose turn it is on a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u32)]
pub enum TurnState {
    /// Nobody holds the record.
    Idle = 0,
    /// The writer is filling the record.
    WriterActive = 1,
    /// The reader is consuming the record.
    ReaderActive = 2,
}

impl TurnState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => TurnState::WriterActive,
            2 => TurnState::ReaderActive,
            _ => TurnState::Idle,
        }
    }
}

/// Synchronization state of one slot, placed at offset 0 of its resource.
#[repr(C, align(64))]
pub struct SlotSync {
    magic: AtomicU64,
    record: RecordLayout,
    state: AtomicU32,
    has_data: AtomicU32,
    published: AtomicU64,
    consumed: AtomicU64,
    mutex: ShmMutex,
    cond: ShmCondvar,
}

/// Point-in-time view of a slot, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotSnapshot {
    /// Current turn.
    pub state: TurnState,
    /// A published record awaits its reader.
    pub has_data: bool,
    /// Records published so far.
    pub published: u64,
    /// Records consumed so far.
    pub consumed: u64,
}

/// Result of a successful `begin_read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadStart {
    /// A published record is now held by the reader.
    pub has_record: bool,
    /// The termination flag was set when the wait ended.
    pub finished: bool,
}

/// Mapped slot resource.
#[derive(Debug)]
pub struct Slot {
    name: String,
    region: Region,
}

impl Slot {
    /// Create and initialise a slot carrying records of `record` layout.
    pub fn create(
        backend: &dyn ResourceBackend,
        name: &str,
        record: RecordLayout,
    ) -> ShmResult<Self> {
        let region = backend.create(name, core::mem::size_of::<SlotSync>())?;
        let sync = sync_ptr(&region, name)?;

        // SAFETY: freshly created, exclusively owned, zeroed and large enough;
        // attachers ignore it until `magic` is published.
        unsafe {
            let s = sync.as_ptr();
            ShmMutex::init(&raw mut (*s).mutex)?;
            ShmCondvar::init(&raw mut (*s).cond)?;
            (*s).record = record;
            (*s).magic.store(SLOT_MAGIC, Ordering::Release);
        }

        Ok(Self {
            name: name.to_string(),
            region,
        })
    }

    /// Open an initialised slot and check its record layout.
    pub fn attach(
        backend: &dyn ResourceBackend,
        name: &str,
        record: RecordLayout,
    ) -> ShmResult<Self> {
        let region = backend.open(name)?;
        let sync = sync_ptr(&region, name)?;
        // SAFETY: the struct fits in the region.
        let s = unsafe { sync.as_ref() };
        match s.magic.load(Ordering::Acquire) {
            0 => {
                return Err(ShmError::NotFound {
                    name: name.to_string(),
                });
            }
            SLOT_MAGIC => {}
            other => {
                return Err(ShmError::IncompatibleLayout {
                    name: name.to_string(),
                    expected: format!("magic {SLOT_MAGIC:#018x}"),
                    found: format!("magic {other:#018x}"),
                });
            }
        }
        if !s.record.matches(&record) {
            return Err(ShmError::IncompatibleLayout {
                name: name.to_string(),
                expected: record.to_string(),
                found: s.record.to_string(),
            });
        }
        Ok(Self {
            name: name.to_string(),
            region,
        })
    }

    /// Resource name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn sync(&self) -> &SlotSync {
        // SAFETY: validated at create/attach; the region outlives `self`.
        unsafe { &*self.region.as_ptr().cast::<SlotSync>() }
    }

    fn state(&self) -> TurnState {
        TurnState::from_raw(self.sync().state.load(Ordering::Relaxed))
    }

    fn has_data(&self) -> bool {
        self.sync().has_data.load(Ordering::Relaxed) != 0
    }

    fn set(&self, state: TurnState, has_data: bool) {
        let s = self.sync();
        s.state.store(state as u32, Ordering::Relaxed);
        s.has_data.store(has_data as u32, Ordering::Relaxed);
    }

    fn wait(
        &self,
        guard: &mut ShmMutexGuard<'_>,
        deadline: Option<Instant>,
        operation: &'static str,
    ) -> ShmResult<()> {
        match deadline {
            None => self.sync().cond.wait(guard),
            Some(d) => {
                if Instant::now() >= d {
                    return Err(ShmError::WaitTimeout { operation });
                }
                self.sync().cond.wait_until(guard, d).map(|_| ())
            }
        }
    }

    fn misuse(&self, reason: String) -> ShmError {
        ShmError::InvalidState {
            slot: self.name.clone(),
            reason,
        }
    }

    /// Wait for an empty idle slot and take the writer's turn.
    ///
    /// Returns [`ShmError::Finished`] if the slot is still occupied once
    /// `finished` is set, since nobody will drain it.
    pub fn begin_write(&self, finished: &AtomicBool, deadline: Option<Instant>) -> ShmResult<()> {
        let s = self.sync();
        let mut guard = s.mutex.lock()?;
        loop {
            if self.state() == TurnState::Idle && !self.has_data() {
                self.set(TurnState::WriterActive, false);
                trace!("{}: writer turn", self.name);
                return Ok(());
            }
            if finished.load(Ordering::SeqCst) {
                return Err(ShmError::Finished);
            }
            self.wait(&mut guard, deadline, "send_begin")?;
        }
    }

    /// Publish the record and hand the turn to the reader. Returns the record's sequence number.
    pub fn end_write(&self) -> ShmResult<u64> {
        let s = self.sync();
        let _guard = s.mutex.lock()?;
        if self.state() != TurnState::WriterActive {
            return Err(self.misuse(format!("end_write in state {:?}", self.state())));
        }
        self.set(TurnState::Idle, true);
        let seq = s.published.fetch_add(1, Ordering::Relaxed) + 1;
        s.cond.notify_all();
        trace!("{}: published #{}", self.name, seq);
        Ok(seq)
    }

    /// Give up the writer's turn without publishing.
    pub fn abort_write(&self) -> ShmResult<()> {
        let s = self.sync();
        let _guard = s.mutex.lock()?;
        if self.state() != TurnState::WriterActive {
            return Err(self.misuse(format!("abort_write in state {:?}", self.state())));
        }
        self.set(TurnState::Idle, false);
        s.cond.notify_all();
        Ok(())
    }

    /// Wait for a published record or for `finished`.
    ///
    /// A pending record is handed out even when `finished` is already set,
    /// so the last message before termination is not lost.
    pub fn begin_read(
        &self,
        finished: &AtomicBool,
        deadline: Option<Instant>,
    ) -> ShmResult<ReadStart> {
        let s = self.sync();
        let mut guard = s.mutex.lock()?;
        loop {
            let done = finished.load(Ordering::SeqCst);
            if self.state() == TurnState::Idle && self.has_data() {
                self.set(TurnState::ReaderActive, true);
                trace!("{}: reader turn", self.name);
                return Ok(ReadStart {
                    has_record: true,
                    finished: done,
                });
            }
            if done {
                return Ok(ReadStart {
                    has_record: false,
                    finished: true,
                });
            }
            self.wait(&mut guard, deadline, "recv_begin")?;
        }
    }

    /// Release the consumed record and hand the slot back to the writer.
    pub fn end_read(&self) -> ShmResult<u64> {
        let s = self.sync();
        let _guard = s.mutex.lock()?;
        if self.state() != TurnState::ReaderActive {
            return Err(self.misuse(format!("end_read in state {:?}", self.state())));
        }
        self.set(TurnState::Idle, false);
        let seq = s.consumed.fetch_add(1, Ordering::Relaxed) + 1;
        s.cond.notify_all();
        Ok(seq)
    }

    /// Wake every waiter so it re-checks the termination flag.
    pub fn wake_all(&self) -> ShmResult<()> {
        let s = self.sync();
        let _guard = s.mutex.lock()?;
        s.cond.notify_all();
        Ok(())
    }

    /// Current state, read without taking the mutex.
    pub fn snapshot(&self) -> SlotSnapshot {
        let s = self.sync();
        SlotSnapshot {
            state: TurnState::from_raw(s.state.load(Ordering::Acquire)),
            has_data: s.has_data.load(Ordering::Acquire) != 0,
            published: s.published.load(Ordering::Acquire),
            consumed: s.consumed.load(Ordering::Acquire),
        }
    }
}

fn sync_ptr(region: &Region, name: &str) -> ShmResult<std::ptr::NonNull<SlotSync>> {
    region.ptr_at::<SlotSync>(0).ok_or_else(|| ShmError::NotFound {
        name: name.to_string(),
    })
}
