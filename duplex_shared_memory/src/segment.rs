//! Segment resource: header plus one record per direction.
//!
//! ```text
//! offset 0          64                        align_up(64 + in.size, 64)
//!        ┌──────────┬─────────────────────────┬──────────────────────┐
//!        │ header   │ inbound record          │ outbound record      │
//!        └──────────┴─────────────────────────┴──────────────────────┘
//! ```
//!
//! The header stamps both record layouts and the creator's pid. `magic` is
//! stored last with release ordering, so an attacher that observes it also
//! observes every other header field.

use crate::backend::{Region, ResourceBackend};
use crate::error::{ShmError, ShmResult};
use crate::platform;
use duplex::consts::{CACHE_LINE_SIZE, SEGMENT_FORMAT_VERSION, SEGMENT_MAGIC};
use duplex::layout::{RecordLayout, align_up};
use serde::Serialize;
use static_assertions::const_assert_eq;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Segment header with cache-line alignment
#[repr(C, align(64))]
pub struct SegmentHeader {
    /// Magic number, written last
    pub magic: AtomicU64,
    /// Header format version
    pub format_version: u32,
    /// Creator process ID
    pub creator_pid: u32,
    /// Creation timestamp (ns since the Unix epoch)
    pub created_ts: u64,
    /// Layout of the producer to consumer record
    pub inbound: RecordLayout,
    /// Layout of the consumer to producer record
    pub outbound: RecordLayout,
    /// Byte offset of the inbound record
    pub inbound_offset: u32,
    /// Byte offset of the outbound record
    pub outbound_offset: u32,
    /// Total resource size
    pub total_size: u64,
}

const_assert_eq!(core::mem::size_of::<SegmentHeader>(), CACHE_LINE_SIZE);

/// Offsets of both records for a given pair of layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SegmentLayout {
    /// Inbound record layout.
    pub inbound: RecordLayout,
    /// Outbound record layout.
    pub outbound: RecordLayout,
    /// Inbound record offset.
    pub inbound_offset: usize,
    /// Outbound record offset.
    pub outbound_offset: usize,
    /// Bytes to allocate.
    pub total_size: usize,
}

impl SegmentLayout {
    /// Place both records on cache-line boundaries after the header.
    pub fn new(inbound: RecordLayout, outbound: RecordLayout) -> Self {
        let header = core::mem::size_of::<SegmentHeader>();
        let in_align = (inbound.align as usize).max(CACHE_LINE_SIZE);
        let out_align = (outbound.align as usize).max(CACHE_LINE_SIZE);
        let inbound_offset = align_up(header, in_align);
        let outbound_offset = align_up(inbound_offset + inbound.size as usize, out_align);
        let total_size = align_up(outbound_offset + outbound.size as usize, CACHE_LINE_SIZE);
        Self {
            inbound,
            outbound,
            inbound_offset,
            outbound_offset,
            total_size,
        }
    }
}

/// Header fields as seen by discovery.
#[derive(Debug, Clone, Serialize)]
pub struct SegmentInfo {
    /// Creator process ID.
    pub creator_pid: u32,
    /// Creation timestamp (ns since the Unix epoch).
    pub created_ts: u64,
    /// Stamped inbound layout.
    pub inbound: RecordLayout,
    /// Stamped outbound layout.
    pub outbound: RecordLayout,
}

/// Mapped segment resource.
#[derive(Debug)]
pub struct Segment {
    name: String,
    region: Region,
    layout: SegmentLayout,
}

impl Segment {
    /// Create and stamp a fresh segment.
    pub fn create(
        backend: &dyn ResourceBackend,
        name: &str,
        layout: SegmentLayout,
    ) -> ShmResult<Self> {
        let region = backend.create(name, layout.total_size)?;
        let header = header_ptr(&region, name)?;

        let created_ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);

        // SAFETY: the region was just created exclusively and is large enough
        // for the header; nobody else can observe it before `magic` is set.
        unsafe {
            let h = header.as_ptr();
            (*h).format_version = SEGMENT_FORMAT_VERSION;
            (*h).creator_pid = platform::get_current_pid();
            (*h).created_ts = created_ts;
            (*h).inbound = layout.inbound;
            (*h).outbound = layout.outbound;
            (*h).inbound_offset = layout.inbound_offset as u32;
            (*h).outbound_offset = layout.outbound_offset as u32;
            (*h).total_size = layout.total_size as u64;
            (*h).magic.store(SEGMENT_MAGIC, Ordering::Release);
        }

        debug!(
            "Created segment {} ({} bytes, inbound {}, outbound {})",
            name, layout.total_size, layout.inbound, layout.outbound
        );

        Ok(Self {
            name: name.to_string(),
            region,
            layout,
        })
    }

    /// Open an existing segment and check it matches `expected`.
    pub fn attach(
        backend: &dyn ResourceBackend,
        name: &str,
        expected: SegmentLayout,
    ) -> ShmResult<Self> {
        let region = backend.open(name)?;
        let header = read_header(&region, name)?;

        let mismatch = |what: &str, expected: String, found: String| ShmError::IncompatibleLayout {
            name: name.to_string(),
            expected: format!("{what} {expected}"),
            found: format!("{what} {found}"),
        };

        if header.format_version != SEGMENT_FORMAT_VERSION {
            return Err(mismatch(
                "format",
                SEGMENT_FORMAT_VERSION.to_string(),
                header.format_version.to_string(),
            ));
        }
        if !header.inbound.matches(&expected.inbound) {
            return Err(mismatch(
                "inbound",
                expected.inbound.to_string(),
                header.inbound.to_string(),
            ));
        }
        if !header.outbound.matches(&expected.outbound) {
            return Err(mismatch(
                "outbound",
                expected.outbound.to_string(),
                header.outbound.to_string(),
            ));
        }
        if header.inbound_offset as usize != expected.inbound_offset
            || header.outbound_offset as usize != expected.outbound_offset
            || (header.total_size as usize) < expected.total_size
            || region.len() < expected.total_size
        {
            return Err(mismatch(
                "size",
                expected.total_size.to_string(),
                region.len().to_string(),
            ));
        }

        Ok(Self {
            name: name.to_string(),
            region,
            layout: expected,
        })
    }

    /// Read header fields without validating layouts.
    pub fn peek(backend: &dyn ResourceBackend, name: &str) -> ShmResult<SegmentInfo> {
        let region = backend.open(name)?;
        let h = read_header(&region, name)?;
        Ok(SegmentInfo {
            creator_pid: h.creator_pid,
            created_ts: h.created_ts,
            inbound: h.inbound,
            outbound: h.outbound,
        })
    }

    /// Resource name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record offsets.
    pub fn layout(&self) -> &SegmentLayout {
        &self.layout
    }

    /// Creator process ID stamped in the header.
    pub fn creator_pid(&self) -> u32 {
        // SAFETY: validated at create/attach.
        unsafe { (*self.region.as_ptr().cast::<SegmentHeader>()).creator_pid }
    }

    /// Pointer to the inbound record.
    pub fn inbound_ptr(&self) -> NonNull<u8> {
        self.record_ptr(self.layout.inbound_offset)
    }

    /// Pointer to the outbound record.
    pub fn outbound_ptr(&self) -> NonNull<u8> {
        self.record_ptr(self.layout.outbound_offset)
    }

    fn record_ptr(&self, offset: usize) -> NonNull<u8> {
        // SAFETY: offsets were checked against the region length at create/attach.
        unsafe { NonNull::new_unchecked(self.region.as_ptr().add(offset)) }
    }
}

fn header_ptr(region: &Region, name: &str) -> ShmResult<NonNull<SegmentHeader>> {
    region.ptr_at::<SegmentHeader>(0).ok_or_else(|| ShmError::NotFound {
        name: name.to_string(),
    })
}

struct HeaderCopy {
    format_version: u32,
    creator_pid: u32,
    created_ts: u64,
    inbound: RecordLayout,
    outbound: RecordLayout,
    inbound_offset: u32,
    outbound_offset: u32,
    total_size: u64,
}

/// Copy header fields once `magic` shows the creator has finished.
fn read_header(region: &Region, name: &str) -> ShmResult<HeaderCopy> {
    // A zero-length file is a segment whose creator has not sized it yet
    let header = header_ptr(region, name)?;
    // SAFETY: the header fits in the region.
    let h = unsafe { header.as_ref() };
    match h.magic.load(Ordering::Acquire) {
        0 => Err(ShmError::NotFound {
            name: name.to_string(),
        }),
        SEGMENT_MAGIC => Ok(HeaderCopy {
            format_version: h.format_version,
            creator_pid: h.creator_pid,
            created_ts: h.created_ts,
            inbound: h.inbound,
            outbound: h.outbound,
            inbound_offset: h.inbound_offset,
            outbound_offset: h.outbound_offset,
            total_size: h.total_size,
        }),
        other => Err(ShmError::IncompatibleLayout {
            name: name.to_string(),
            expected: format!("magic {SEGMENT_MAGIC:#018x}"),
            found: format!("magic {other:#018x}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use duplex::apb::{ApbInput, ApbOutput};

    fn apb_layout() -> SegmentLayout {
        SegmentLayout::new(RecordLayout::of::<ApbInput>(), RecordLayout::of::<ApbOutput>())
    }

    #[test]
    fn records_are_cache_line_aligned() {
        let layout = apb_layout();
        assert_eq!(layout.inbound_offset, 64);
        assert_eq!(layout.outbound_offset, 128);
        assert_eq!(layout.total_size, 192);
    }

    #[test]
    fn attach_sees_creator_stamp() {
        let backend = MemoryBackend::new();
        let created = Segment::create(&backend, "seg", apb_layout()).unwrap();
        let attached = Segment::attach(&backend, "seg", apb_layout()).unwrap();
        assert_eq!(attached.creator_pid(), platform::get_current_pid());
        assert_eq!(
            created.inbound_ptr().as_ptr() as usize % CACHE_LINE_SIZE,
            0
        );
        let info = Segment::peek(&backend, "seg").unwrap();
        assert!(info.inbound.matches(&RecordLayout::of::<ApbInput>()));
    }

    #[test]
    fn swapped_records_are_incompatible() {
        let backend = MemoryBackend::new();
        let _seg = Segment::create(&backend, "seg", apb_layout()).unwrap();
        let swapped =
            SegmentLayout::new(RecordLayout::of::<ApbOutput>(), RecordLayout::of::<ApbInput>());
        match Segment::attach(&backend, "seg", swapped) {
            Err(ShmError::IncompatibleLayout { name, expected, found }) => {
                assert_eq!(name, "seg");
                assert!(expected.starts_with("inbound"));
                assert_ne!(expected, found);
            }
            other => panic!("expected IncompatibleLayout, got {other:?}"),
        }
    }

    #[test]
    fn unstamped_segment_is_not_ready() {
        let backend = MemoryBackend::new();
        let _raw = backend.create("seg", 256).unwrap();
        assert!(matches!(
            Segment::attach(&backend, "seg", apb_layout()),
            Err(ShmError::NotFound { .. })
        ));
    }

    #[test]
    fn foreign_bytes_are_incompatible() {
        let backend = MemoryBackend::new();
        let raw = backend.create("seg", 256).unwrap();
        // SAFETY: 256 bytes mapped, u64-aligned base.
        unsafe { raw.as_ptr().cast::<u64>().write(0xDEAD_BEEF) };
        assert!(matches!(
            Segment::attach(&backend, "seg", apb_layout()),
            Err(ShmError::IncompatibleLayout { .. })
        ));
    }
}
