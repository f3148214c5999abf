//! Resource group: the four named resources of one channel.
//!
//! The creator makes the segment, both slots and finally the lockable, and
//! publishes each object's magic only after initialising it. An attacher
//! opens the lockable first, so seeing it initialised means the whole
//! group is ready. Any failure half-way through `create` removes what was
//! made so far.
//!
//! Teardown is idempotent and never fails: every name is unlinked (with a
//! short retry), and anything that could not be removed is reported and
//! logged rather than raised.

use crate::backend::{Region, ResourceBackend};
use crate::error::{ShmError, ShmResult};
use crate::platform;
use crate::segment::{Segment, SegmentLayout};
use crate::slot::Slot;
use crate::sync::ShmMutex;
use duplex::channel::{ResourceKind, ResourceNames};
use duplex::consts::LOCKABLE_MAGIC;
use duplex::layout::{RecordLayout, ShmRecord};
use duplex::prelude::ATTACH_POLL_INTERVAL;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const REMOVE_ATTEMPTS: u32 = 3;
const REMOVE_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Group-wide state, placed at offset 0 of the lockable resource.
#[repr(C, align(64))]
pub struct GroupSync {
    magic: AtomicU64,
    finished: AtomicBool,
    creator_pid: AtomicU32,
    peer_pid: AtomicU32,
    attach_count: AtomicU32,
    finished_by: AtomicU32,
    mutex: ShmMutex,
}

/// Options for [`ResourceGroup::create`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateOptions {
    /// Remove leftover resources with the same names first.
    pub replace_stale: bool,
}

/// A name that could not be removed during teardown.
#[derive(Debug, Clone, Serialize)]
pub struct TeardownFailure {
    /// Resource name.
    pub name: String,
    /// Last error seen.
    pub error: String,
}

/// What a teardown pass did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TeardownReport {
    /// Names that were unlinked.
    pub removed: Vec<String>,
    /// Names that were already absent.
    pub missing: Vec<String>,
    /// Names that could not be removed.
    pub failed: Vec<TeardownFailure>,
}

impl TeardownReport {
    /// Nothing failed.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// An established group, either created or attached by this process.
#[derive(Debug)]
pub struct ResourceGroup {
    names: ResourceNames,
    backend: Arc<dyn ResourceBackend>,
    segment: Segment,
    inbound: Slot,
    outbound: Slot,
    lockable: Region,
    owner: bool,
    destroyed: AtomicBool,
}

impl ResourceGroup {
    /// Create all four resources for records `I` (inbound) and `O` (outbound).
    ///
    /// Fails with `AlreadyExists` if any name is live, unless
    /// `options.replace_stale` is set.
    pub fn create<I: ShmRecord, O: ShmRecord>(
        backend: Arc<dyn ResourceBackend>,
        names: &ResourceNames,
        options: CreateOptions,
    ) -> ShmResult<Self> {
        names.validate()?;
        let layout = SegmentLayout::new(RecordLayout::of::<I>(), RecordLayout::of::<O>());

        if options.replace_stale {
            let report = Self::remove_resources(&*backend, names);
            if !report.removed.is_empty() {
                warn!("Replaced stale resources: {:?}", report.removed);
            }
        }

        let mut created: Vec<&str> = Vec::with_capacity(4);
        let result = (|| -> ShmResult<(Segment, Slot, Slot, Region)> {
            let segment = Segment::create(&*backend, &names.segment, layout)?;
            created.push(&names.segment);
            let inbound = Slot::create(&*backend, &names.inbound, layout.inbound)?;
            created.push(&names.inbound);
            let outbound = Slot::create(&*backend, &names.outbound, layout.outbound)?;
            created.push(&names.outbound);
            let lockable = create_lockable(&*backend, &names.lockable)?;
            created.push(&names.lockable);
            Ok((segment, inbound, outbound, lockable))
        })();

        match result {
            Ok((segment, inbound, outbound, lockable)) => {
                info!("Created channel {}", names);
                Ok(Self {
                    names: names.clone(),
                    backend,
                    segment,
                    inbound,
                    outbound,
                    lockable,
                    owner: true,
                    destroyed: AtomicBool::new(false),
                })
            }
            Err(e) => {
                for name in created {
                    if let Err(re) = remove_with_retry(&*backend, name) {
                        warn!("Rollback of {} failed: {}", name, re);
                    }
                }
                Err(e)
            }
        }
    }

    /// Attach to a group created by another process (or thread).
    ///
    /// Fails with `NotFound` while the group is absent or still being
    /// initialised, and with `IncompatibleLayout` if the records differ.
    pub fn attach<I: ShmRecord, O: ShmRecord>(
        backend: Arc<dyn ResourceBackend>,
        names: &ResourceNames,
    ) -> ShmResult<Self> {
        names.validate()?;
        let layout = SegmentLayout::new(RecordLayout::of::<I>(), RecordLayout::of::<O>());

        let lockable = open_lockable(&*backend, &names.lockable)?;
        let segment = Segment::attach(&*backend, &names.segment, layout)?;
        let inbound = Slot::attach(&*backend, &names.inbound, layout.inbound)?;
        let outbound = Slot::attach(&*backend, &names.outbound, layout.outbound)?;

        let group = Self {
            names: names.clone(),
            backend,
            segment,
            inbound,
            outbound,
            lockable,
            owner: false,
            destroyed: AtomicBool::new(false),
        };

        {
            let sync = group.sync();
            let _guard = sync.mutex.lock()?;
            sync.attach_count.fetch_add(1, Ordering::Relaxed);
            let pid = platform::get_current_pid();
            sync.peer_pid.store(pid, Ordering::Release);
        }
        debug!("Attached to channel {}", group.names);
        Ok(group)
    }

    /// Retry [`ResourceGroup::attach`] while the group is not ready yet.
    pub fn attach_with_retry<I: ShmRecord, O: ShmRecord>(
        backend: Arc<dyn ResourceBackend>,
        names: &ResourceNames,
        timeout: Duration,
    ) -> ShmResult<Self> {
        let deadline = Instant::now() + timeout;
        loop {
            match Self::attach::<I, O>(Arc::clone(&backend), names) {
                Err(e) if e.is_not_ready() => {
                    if Instant::now() >= deadline {
                        return Err(ShmError::AttachTimeout { timeout });
                    }
                    std::thread::sleep(ATTACH_POLL_INTERVAL);
                }
                other => return other,
            }
        }
    }

    /// Resource names.
    pub fn names(&self) -> &ResourceNames {
        &self.names
    }

    /// Whether this handle created the group (and so tears it down).
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Backend the resources live in.
    pub fn backend(&self) -> &Arc<dyn ResourceBackend> {
        &self.backend
    }

    /// Segment holding both records.
    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    /// Producer to consumer slot.
    pub fn inbound(&self) -> &Slot {
        &self.inbound
    }

    /// Consumer to producer slot.
    pub fn outbound(&self) -> &Slot {
        &self.outbound
    }

    fn sync(&self) -> &GroupSync {
        // SAFETY: validated at create/attach; the region outlives `self`.
        unsafe { &*self.lockable.as_ptr().cast::<GroupSync>() }
    }

    /// The shared termination flag.
    pub fn finished_flag(&self) -> &AtomicBool {
        &self.sync().finished
    }

    /// Current value of the termination flag.
    pub fn is_finished(&self) -> bool {
        self.sync().finished.load(Ordering::SeqCst)
    }

    /// Set the termination flag and wake every waiter on both slots.
    ///
    /// Returns `true` if this call changed the flag. The flag never goes
    /// back to `false`.
    pub fn set_finished(&self) -> ShmResult<bool> {
        let sync = self.sync();
        let changed = {
            let _guard = sync.mutex.lock()?;
            let was = sync.finished.swap(true, Ordering::SeqCst);
            if !was {
                let pid = platform::get_current_pid();
                sync.finished_by.store(pid, Ordering::Relaxed);
            }
            !was
        };
        self.inbound.wake_all()?;
        self.outbound.wake_all()?;
        if changed {
            info!("Channel {} finished", self.names);
        }
        Ok(changed)
    }

    /// Pid of the process that created the group.
    pub fn creator_pid(&self) -> u32 {
        self.sync().creator_pid.load(Ordering::Acquire)
    }

    /// Pid of the most recent attacher, or 0.
    pub fn peer_pid(&self) -> u32 {
        self.sync().peer_pid.load(Ordering::Acquire)
    }

    /// Number of live attachments.
    pub fn attach_count(&self) -> u32 {
        self.sync().attach_count.load(Ordering::Acquire)
    }

    /// Pid of the process that first set the termination flag, or 0.
    pub fn finished_by(&self) -> u32 {
        self.sync().finished_by.load(Ordering::Relaxed)
    }

    /// Remove all four resources. Safe to call repeatedly.
    ///
    /// Mappings held by this or other processes stay valid until dropped.
    pub fn destroy(&self) -> TeardownReport {
        self.destroyed.store(true, Ordering::SeqCst);
        let report = Self::remove_resources(&*self.backend, &self.names);
        if report.removed.is_empty() {
            debug!("Channel {} already destroyed", self.names);
        } else {
            info!("Destroyed channel {}", self.names);
        }
        report
    }

    /// Remove the named resources without attaching to them.
    ///
    /// The lockable goes first so new attachers stop seeing a ready group.
    pub fn remove_resources(
        backend: &dyn ResourceBackend,
        names: &ResourceNames,
    ) -> TeardownReport {
        let mut report = TeardownReport::default();
        for kind in [
            ResourceKind::Lockable,
            ResourceKind::Segment,
            ResourceKind::Inbound,
            ResourceKind::Outbound,
        ] {
            let name = names.get(kind);
            match remove_with_retry(backend, name) {
                Ok(true) => report.removed.push(name.to_string()),
                Ok(false) => report.missing.push(name.to_string()),
                Err(e) => {
                    warn!("Failed to remove {} {}: {}", kind, name, e);
                    report.failed.push(TeardownFailure {
                        name: name.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    }
}

impl Drop for ResourceGroup {
    fn drop(&mut self) {
        if self.owner {
            if !self.destroyed.load(Ordering::SeqCst) {
                let report = self.destroy();
                if !report.is_clean() {
                    warn!("Channel {} left resources behind", self.names);
                }
            }
        } else {
            match self.sync().mutex.lock() {
                Ok(_guard) => {
                    let sync = self.sync();
                    let _ = sync
                        .attach_count
                        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
                }
                Err(e) => warn!("Detach from {} failed: {}", self.names, e),
            }
        }
    }
}

fn remove_with_retry(backend: &dyn ResourceBackend, name: &str) -> ShmResult<bool> {
    let mut attempt = 1;
    loop {
        match backend.remove(name) {
            Ok(removed) => return Ok(removed),
            Err(e) if attempt >= REMOVE_ATTEMPTS => return Err(e),
            Err(e) => {
                debug!("Remove {} attempt {} failed: {}", name, attempt, e);
                attempt += 1;
                std::thread::sleep(REMOVE_RETRY_DELAY);
            }
        }
    }
}

fn create_lockable(backend: &dyn ResourceBackend, name: &str) -> ShmResult<Region> {
    let region = backend.create(name, core::mem::size_of::<GroupSync>())?;
    let ptr = region
        .ptr_at::<GroupSync>(0)
        .ok_or_else(|| ShmError::NotFound {
            name: name.to_string(),
        })?;
    // SAFETY: freshly created, exclusively owned, zeroed and large enough.
    unsafe {
        let g = ptr.as_ptr();
        ShmMutex::init(&raw mut (*g).mutex)?;
        (*g).creator_pid
            .store(platform::get_current_pid(), Ordering::Relaxed);
        (*g).magic.store(LOCKABLE_MAGIC, Ordering::Release);
    }
    Ok(region)
}

fn open_lockable(backend: &dyn ResourceBackend, name: &str) -> ShmResult<Region> {
    let region = backend.open(name)?;
    let ptr = region
        .ptr_at::<GroupSync>(0)
        .ok_or_else(|| ShmError::NotFound {
            name: name.to_string(),
        })?;
    // SAFETY: the struct fits in the region.
    let magic = unsafe { ptr.as_ref() }.magic.load(Ordering::Acquire);
    match magic {
        LOCKABLE_MAGIC => Ok(region),
        0 => Err(ShmError::NotFound {
            name: name.to_string(),
        }),
        other => Err(ShmError::IncompatibleLayout {
            name: name.to_string(),
            expected: format!("magic {LOCKABLE_MAGIC:#018x}"),
            found: format!("magic {other:#018x}"),
        }),
    }
}
