//! Record layout description and compatibility hashing.
//!
//! Both peers compile the same record definitions; there is no runtime
//! schema negotiation. The creator stamps each record's [`RecordLayout`]
//! into the segment header and an attaching peer compares it against its
//! own build, refusing to exchange data on mismatch.

use serde::{Deserialize, Serialize};

/// Marker for plain-old-data records that may live in shared memory.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]`, contain no pointers, references or
/// heap-owning fields, and be valid when every byte is zero.
pub unsafe trait ShmRecord: Copy + Send + 'static {
    /// Bump when field meaning changes without a size/alignment change.
    const LAYOUT_VERSION: u32 = 1;

    /// All-zero value, the state of a freshly created slot.
    fn zeroed() -> Self {
        // SAFETY: guaranteed by the trait contract.
        unsafe { core::mem::zeroed() }
    }
}

/// Size, alignment and hash of one record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(C)]
pub struct RecordLayout {
    /// `size_of::<T>()`.
    pub size: u32,
    /// `align_of::<T>()`.
    pub align: u32,
    /// [`struct_version_hash`] mixed with `T::LAYOUT_VERSION`.
    pub hash: u32,
}

impl RecordLayout {
    /// Layout of `T` as compiled into this binary.
    pub const fn of<T: ShmRecord>() -> Self {
        Self {
            size: core::mem::size_of::<T>() as u32,
            align: core::mem::align_of::<T>() as u32,
            hash: struct_version_hash::<T>() ^ T::LAYOUT_VERSION.wrapping_mul(0x85EB_CA6B),
        }
    }

    /// Whether a peer's stamped layout is exchangeable with this one.
    pub const fn matches(&self, other: &RecordLayout) -> bool {
        self.size == other.size && self.align == other.align && self.hash == other.hash
    }
}

impl std::fmt::Display for RecordLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "size={} align={} hash={:#010x}",
            self.size, self.align, self.hash
        )
    }
}

/// Compile-time hash of a type's size and alignment.
///
/// Does not detect field reordering within the same size and alignment;
/// `LAYOUT_VERSION` covers that case.
pub const fn struct_version_hash<T>() -> u32 {
    let size = core::mem::size_of::<T>() as u32;
    let align = core::mem::align_of::<T>() as u32;
    size.wrapping_mul(0x9E37_79B9) ^ align.wrapping_mul(0x517C_C1B7)
}

/// Round `size` up to a multiple of `align` (a power of two).
pub const fn align_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy)]
    #[repr(C)]
    struct Small {
        v: u32,
    }
    // SAFETY: repr(C) integers only; all-zero is a valid value.
    unsafe impl ShmRecord for Small {}

    #[derive(Clone, Copy)]
    #[repr(C)]
    struct SmallV2 {
        v: u32,
    }
    // SAFETY: as above.
    unsafe impl ShmRecord for SmallV2 {
        const LAYOUT_VERSION: u32 = 2;
    }

    #[derive(Clone, Copy)]
    #[repr(C)]
    struct Wide {
        v: u64,
        w: u64,
    }
    // SAFETY: as above.
    unsafe impl ShmRecord for Wide {}

    #[test]
    fn layout_is_deterministic() {
        assert_eq!(RecordLayout::of::<Small>(), RecordLayout::of::<Small>());
        assert!(RecordLayout::of::<Small>().matches(&RecordLayout::of::<Small>()));
    }

    #[test]
    fn size_change_breaks_match() {
        let a = RecordLayout::of::<Small>();
        let b = RecordLayout::of::<Wide>();
        assert_eq!(b.size, 16);
        assert!(!a.matches(&b));
    }

    #[test]
    fn version_bump_breaks_match() {
        let a = RecordLayout::of::<Small>();
        let b = RecordLayout::of::<SmallV2>();
        assert_eq!(a.size, b.size);
        assert!(!a.matches(&b));
    }

    #[test]
    fn zeroed_record() {
        assert_eq!(Wide::zeroed().v, 0);
        assert_eq!(Wide::zeroed().w, 0);
    }

    #[test]
    fn align_up_rounds() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
    }
}
