//! Typed endpoints over a resource group.
//!
//! One side of a channel is the **producer** (it writes the inbound record
//! and reads the outbound one), the other the **consumer**. Both sides use
//! the same [`Endpoint`] type with the record types swapped:
//!
//! ```rust
//! use duplex::apb::{ApbInput, ApbOutput};
//! use duplex::channel::ResourceNames;
//! use duplex_shared_memory::{
//!     CreateOptions, Endpoint, MemoryBackend, ResourceBackend, ResourceGroup,
//! };
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let backend: Arc<dyn ResourceBackend> = Arc::new(MemoryBackend::new());
//! let names = ResourceNames::unique("doc");
//!
//! let group = ResourceGroup::create::<ApbInput, ApbOutput>(
//!     Arc::clone(&backend),
//!     &names,
//!     CreateOptions::default(),
//! )?;
//! let mut consumer = Endpoint::<ApbOutput, ApbInput>::consumer(group)?;
//! let mut producer = Endpoint::<ApbInput, ApbOutput>::producer(
//!     ResourceGroup::attach::<ApbInput, ApbOutput>(backend, &names)?,
//! )?;
//!
//! let mut out = producer.send_begin()?;
//! out.a = 3;
//! out.b = 4;
//! out.end()?;
//!
//! let input = consumer.recv_begin()?;
//! let sum = input.record().map(|r| r.sum());
//! input.end()?;
//! assert_eq!(sum, Some(7));
//! # Ok(())
//! # }
//! ```
//!
//! A [`SendGuard`] dropped without [`SendGuard::end`] publishes nothing.
//! A [`RecvGuard`] releases the record on drop.

use crate::error::{ShmError, ShmResult};
use crate::group::ResourceGroup;
use crate::slot::{Slot, SlotSnapshot};
use duplex::channel::ResourceNames;
use duplex::layout::{RecordLayout, ShmRecord};
use serde::Serialize;
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::time::Instant;
use tracing::{debug, warn};

/// Which side of the channel an endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Role {
    /// Writes inbound, reads outbound.
    Producer,
    /// Writes outbound, reads inbound.
    Consumer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Producer => f.write_str("producer"),
            Role::Consumer => f.write_str("consumer"),
        }
    }
}

/// One side of a channel, sending `Tx` records and receiving `Rx` records.
pub struct Endpoint<Tx: ShmRecord, Rx: ShmRecord> {
    group: ResourceGroup,
    role: Role,
    finished_seen: Cell<bool>,
    finish_on_drop: bool,
    _records: PhantomData<fn(Tx) -> Rx>,
}

impl<Tx: ShmRecord, Rx: ShmRecord> Endpoint<Tx, Rx> {
    /// Wrap `group` as the producer side.
    pub fn producer(group: ResourceGroup) -> ShmResult<Self> {
        Self::new(group, Role::Producer)
    }

    /// Wrap `group` as the consumer side.
    pub fn consumer(group: ResourceGroup) -> ShmResult<Self> {
        Self::new(group, Role::Consumer)
    }

    /// Wrap `group` in the given role, checking `Tx`/`Rx` match its records.
    pub fn new(group: ResourceGroup, role: Role) -> ShmResult<Self> {
        let seg = *group.segment().layout();
        let (tx, rx) = match role {
            Role::Producer => (seg.inbound, seg.outbound),
            Role::Consumer => (seg.outbound, seg.inbound),
        };
        for (have, want, dir) in [
            (tx, RecordLayout::of::<Tx>(), "send"),
            (rx, RecordLayout::of::<Rx>(), "receive"),
        ] {
            if !have.matches(&want) {
                return Err(ShmError::IncompatibleLayout {
                    name: group.names().segment.clone(),
                    expected: format!("{role} {dir} {want}"),
                    found: format!("{role} {dir} {have}"),
                });
            }
        }
        debug!("{} endpoint on {}", role, group.names());
        Ok(Self {
            group,
            role,
            finished_seen: Cell::new(false),
            finish_on_drop: false,
            _records: PhantomData,
        })
    }

    /// Role of this endpoint.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Resource names of the underlying group.
    pub fn names(&self) -> &ResourceNames {
        self.group.names()
    }

    /// Underlying group.
    pub fn group(&self) -> &ResourceGroup {
        &self.group
    }

    /// Release the endpoint, keeping the group.
    pub fn into_group(self) -> ResourceGroup {
        let this = std::mem::ManuallyDrop::new(self);
        // SAFETY: `this` is never used or dropped again; the other fields need no drop.
        unsafe { std::ptr::read(&this.group) }
    }

    /// Set the termination flag when this endpoint is dropped.
    pub fn set_finish_on_drop(&mut self, enabled: bool) {
        self.finish_on_drop = enabled;
    }

    fn tx(&self) -> (&Slot, NonNull<Tx>) {
        let seg = self.group.segment();
        match self.role {
            Role::Producer => (self.group.inbound(), seg.inbound_ptr().cast()),
            Role::Consumer => (self.group.outbound(), seg.outbound_ptr().cast()),
        }
    }

    fn rx(&self) -> (&Slot, NonNull<Rx>) {
        let seg = self.group.segment();
        match self.role {
            Role::Producer => (self.group.outbound(), seg.outbound_ptr().cast()),
            Role::Consumer => (self.group.inbound(), seg.inbound_ptr().cast()),
        }
    }

    /// Block until the outgoing slot is free and take the writer's turn.
    pub fn send_begin(&mut self) -> ShmResult<SendGuard<'_, Tx>> {
        self.send_begin_inner(None)
    }

    /// [`Endpoint::send_begin`] giving up at `deadline` with `WaitTimeout`.
    pub fn send_begin_until(&mut self, deadline: Instant) -> ShmResult<SendGuard<'_, Tx>> {
        self.send_begin_inner(Some(deadline))
    }

    fn send_begin_inner(&mut self, deadline: Option<Instant>) -> ShmResult<SendGuard<'_, Tx>> {
        let (slot, record) = self.tx();
        slot.begin_write(self.group.finished_flag(), deadline)?;
        Ok(SendGuard {
            slot,
            record,
            ended: false,
            _borrow: PhantomData,
        })
    }

    /// Block until a record arrives or the channel is finished.
    pub fn recv_begin(&mut self) -> ShmResult<RecvGuard<'_, Rx>> {
        self.recv_begin_inner(None)
    }

    /// [`Endpoint::recv_begin`] giving up at `deadline` with `WaitTimeout`.
    pub fn recv_begin_until(&mut self, deadline: Instant) -> ShmResult<RecvGuard<'_, Rx>> {
        self.recv_begin_inner(Some(deadline))
    }

    fn recv_begin_inner(&mut self, deadline: Option<Instant>) -> ShmResult<RecvGuard<'_, Rx>> {
        let (slot, record) = self.rx();
        let start = slot.begin_read(self.group.finished_flag(), deadline)?;
        if start.finished {
            self.finished_seen.set(true);
        }
        Ok(RecvGuard {
            slot,
            record: start.has_record.then_some(record),
            finished: start.finished,
            ended: false,
            _borrow: PhantomData,
        })
    }

    /// Copy `record` into the outgoing slot and publish it.
    pub fn send(&mut self, record: Tx) -> ShmResult<()> {
        let mut guard = self.send_begin()?;
        *guard = record;
        guard.end()
    }

    /// Wait for and copy out the next record; `None` once finished with nothing pending.
    pub fn recv(&mut self) -> ShmResult<Option<Rx>> {
        let guard = self.recv_begin()?;
        let record = guard.record().copied();
        guard.end()?;
        Ok(record)
    }

    /// Set the shared termination flag and wake every waiter.
    pub fn set_finished(&self) -> ShmResult<()> {
        self.group.set_finished()?;
        self.finished_seen.set(true);
        Ok(())
    }

    /// Whether the termination flag has been observed. Once `true`, stays `true`.
    pub fn get_finished(&self) -> bool {
        if !self.finished_seen.get() && self.group.is_finished() {
            self.finished_seen.set(true);
        }
        self.finished_seen.get()
    }

    /// State of the outgoing and incoming slots.
    pub fn snapshot(&self) -> (SlotSnapshot, SlotSnapshot) {
        (self.tx().0.snapshot(), self.rx().0.snapshot())
    }
}

impl<Tx: ShmRecord, Rx: ShmRecord> fmt::Debug for Endpoint<Tx, Rx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("role", &self.role)
            .field("names", self.group.names())
            .field("finished", &self.finished_seen.get())
            .finish()
    }
}

impl<Tx: ShmRecord, Rx: ShmRecord> Drop for Endpoint<Tx, Rx> {
    fn drop(&mut self) {
        if self.finish_on_drop {
            if let Err(e) = self.group.set_finished() {
                warn!("Failed to set finished on drop: {}", e);
            }
        }
    }
}

/// Writer's turn on the outgoing record. Derefs to the record.
pub struct SendGuard<'a, T> {
    slot: &'a Slot,
    record: NonNull<T>,
    ended: bool,
    _borrow: PhantomData<&'a mut T>,
}

impl<T> SendGuard<'_, T> {
    /// Publish the record and hand the slot to the reader.
    pub fn end(mut self) -> ShmResult<()> {
        self.ended = true;
        self.slot.end_write().map(|_| ())
    }
}

impl<T: fmt::Debug> fmt::Debug for SendGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendGuard")
            .field("slot", &self.slot.name())
            .field("record", &**self)
            .finish()
    }
}

impl<T> Deref for SendGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the writer's turn gives exclusive access to the record.
        unsafe { self.record.as_ref() }
    }
}

impl<T> DerefMut for SendGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above.
        unsafe { self.record.as_mut() }
    }
}

impl<T> Drop for SendGuard<'_, T> {
    fn drop(&mut self) {
        if !self.ended {
            warn!("{}: send abandoned without SendEnd, nothing published", self.slot.name());
            if let Err(e) = self.slot.abort_write() {
                warn!("{}: abort failed: {}", self.slot.name(), e);
            }
        }
    }
}

/// Reader's turn on the incoming record.
pub struct RecvGuard<'a, T> {
    slot: &'a Slot,
    record: Option<NonNull<T>>,
    finished: bool,
    ended: bool,
    _borrow: PhantomData<&'a T>,
}

impl<T> RecvGuard<'_, T> {
    /// The published record, or `None` if the wait ended on termination.
    pub fn record(&self) -> Option<&T> {
        // SAFETY: the reader's turn keeps the writer away until end.
        self.record.map(|p| unsafe { &*p.as_ptr() })
    }

    /// Whether the termination flag was set when the wait ended.
    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Release the record and hand the slot back to the writer.
    pub fn end(mut self) -> ShmResult<()> {
        self.ended = true;
        match self.record {
            Some(_) => self.slot.end_read().map(|_| ()),
            None => Ok(()),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for RecvGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecvGuard")
            .field("slot", &self.slot.name())
            .field("record", &self.record())
            .field("finished", &self.finished)
            .finish()
    }
}

impl<T> Drop for RecvGuard<'_, T> {
    fn drop(&mut self) {
        if !self.ended && self.record.is_some() {
            if let Err(e) = self.slot.end_read() {
                warn!("{}: release on drop failed: {}", self.slot.name(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, ResourceBackend};
    use crate::group::CreateOptions;
    use duplex::apb::{ApbInput, ApbOutput};
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    type Producer = Endpoint<ApbInput, ApbOutput>;
    type Consumer = Endpoint<ApbOutput, ApbInput>;

    fn pair() -> (Consumer, Producer) {
        let backend: Arc<dyn ResourceBackend> = Arc::new(MemoryBackend::new());
        let names = ResourceNames::unique("ep");
        let group = ResourceGroup::create::<ApbInput, ApbOutput>(
            Arc::clone(&backend),
            &names,
            CreateOptions::default(),
        )
        .unwrap();
        let peer = ResourceGroup::attach::<ApbInput, ApbOutput>(backend, &names).unwrap();
        (Consumer::consumer(group).unwrap(), Producer::producer(peer).unwrap())
    }

    #[test]
    fn wrong_role_types_rejected() {
        let backend: Arc<dyn ResourceBackend> = Arc::new(MemoryBackend::new());
        let names = ResourceNames::unique("ep");
        let group = ResourceGroup::create::<ApbInput, ApbOutput>(
            backend,
            &names,
            CreateOptions::default(),
        )
        .unwrap();
        // Producer types used with the consumer role
        assert!(matches!(
            Endpoint::<ApbInput, ApbOutput>::consumer(group),
            Err(ShmError::IncompatibleLayout { .. })
        ));
    }

    #[test]
    fn three_plus_four() {
        let (mut consumer, mut producer) = pair();

        let mut out = producer.send_begin().unwrap();
        out.a = 3;
        out.b = 4;
        out.end().unwrap();

        let input = consumer.recv_begin().unwrap();
        let sum = input.record().unwrap().sum();
        input.end().unwrap();

        let mut reply = consumer.send_begin().unwrap();
        reply.c = sum;
        reply.end().unwrap();

        assert_eq!(producer.recv().unwrap(), Some(ApbOutput { c: 7 }));
    }

    #[test]
    fn guards_debug_format_and_timeouts_unwrap() {
        let (mut consumer, mut producer) = pair();
        let err = consumer.recv_begin_until(Instant::now()).unwrap_err();
        assert!(matches!(err, ShmError::WaitTimeout { .. }));

        let mut out = producer.send_begin().unwrap();
        out.a = 9;
        assert!(format!("{out:?}").contains("a: 9"));
        out.end().unwrap();

        let input = consumer.recv_begin().unwrap();
        assert!(format!("{input:?}").contains("finished: false"));
        input.end().unwrap();
    }

    #[test]
    fn dropped_send_guard_publishes_nothing() {
        let (mut consumer, mut producer) = pair();
        {
            let mut out = producer.send_begin().unwrap();
            out.a = 99;
        }
        assert!(matches!(
            consumer.recv_begin_until(Instant::now() + Duration::from_millis(10)),
            Err(ShmError::WaitTimeout { .. })
        ));
        producer.send(ApbInput { a: 1, b: 2 }).unwrap();
        assert_eq!(consumer.recv().unwrap(), Some(ApbInput { a: 1, b: 2 }));
    }

    #[test]
    fn dropped_recv_guard_releases_slot() {
        let (mut consumer, mut producer) = pair();
        producer.send(ApbInput { a: 1, b: 1 }).unwrap();
        {
            let input = consumer.recv_begin().unwrap();
            assert!(input.record().is_some());
        }
        // Slot is free again
        producer
            .send_begin_until(Instant::now())
            .unwrap()
            .end()
            .unwrap();
    }

    #[test]
    fn second_send_blocks_until_consumed() {
        let (mut consumer, mut producer) = pair();
        producer.send(ApbInput { a: 1, b: 0 }).unwrap();
        assert!(matches!(
            producer.send_begin_until(Instant::now() + Duration::from_millis(20)),
            Err(ShmError::WaitTimeout { operation: "send_begin" })
        ));
        consumer.recv().unwrap();
        producer.send(ApbInput { a: 2, b: 0 }).unwrap();
    }

    #[test]
    fn finished_wakes_blocked_receiver() {
        let (consumer, mut producer) = pair();
        let (tx, rx) = mpsc::channel();
        let waiter = thread::spawn(move || {
            let guard = producer.recv_begin().unwrap();
            tx.send((guard.record().is_none(), guard.finished())).unwrap();
            drop(guard);
            producer.get_finished()
        });

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        consumer.set_finished().unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), (true, true));
        assert!(waiter.join().unwrap());
        assert!(consumer.get_finished());
    }

    #[test]
    fn get_finished_latches() {
        let (consumer, producer) = pair();
        assert!(!producer.get_finished());
        consumer.set_finished().unwrap();
        assert!(producer.get_finished());
        assert!(producer.get_finished());
    }

    #[test]
    fn finish_on_drop_signals_peer() {
        let (consumer, mut producer) = pair();
        producer.set_finish_on_drop(true);
        drop(producer);
        assert!(consumer.get_finished());
    }

    #[test]
    fn into_group_keeps_resources() {
        let (consumer, _producer) = pair();
        let group = consumer.into_group();
        assert!(group.is_owner());
        assert!(!group.is_finished());
    }
}
