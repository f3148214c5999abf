//! a-plus-b workload records.
//!
//! The producer (simulation side) publishes two operands on the inbound
//! slot; the consumer (decision side) answers with their sum on the
//! outbound slot. Both binaries are built from these definitions.

use crate::layout::ShmRecord;
use static_assertions::const_assert_eq;

/// Producer to consumer record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct ApbInput {
    /// First operand.
    pub a: u32,
    /// Second operand.
    pub b: u32,
}

/// Consumer to producer record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct ApbOutput {
    /// `a + b` of the last input.
    pub c: u32,
}

const_assert_eq!(core::mem::size_of::<ApbInput>(), 8);
const_assert_eq!(core::mem::size_of::<ApbOutput>(), 4);

// SAFETY: repr(C) integers only; all-zero is a valid value.
unsafe impl ShmRecord for ApbInput {}
// SAFETY: as above.
unsafe impl ShmRecord for ApbOutput {}

impl ApbInput {
    /// Wrapping sum, the answer the consumer is expected to send back.
    pub const fn sum(&self) -> u32 {
        self.a.wrapping_add(self.b)
    }
}
