//! Stack frame layout construction (`spec.md` §3.4, §4.1).

use super::mir::{FrameLayout, SpillSlot, StackLocal};

/// Default slot size/alignment for 64-bit locals and spills.
pub const SLOT_SIZE_BYTES: i32 = 8;

/// Centralises AArch64 frame layout: local allocas, spill slots, and the
/// outgoing-argument area, all assigned FP-relative offsets that grow downward
/// (`spec.md` §4.1).
pub struct FrameBuilder {
    locals: Vec<StackLocal>,
    spills: Vec<SpillSlot>,
    max_outgoing_bytes: i32,
    next_offset: i32,
}

impl FrameBuilder {
    pub fn new() -> Self {
        FrameBuilder {
            locals: Vec::new(),
            spills: Vec::new(),
            max_outgoing_bytes: 0,
            next_offset: -SLOT_SIZE_BYTES,
        }
    }

    /// Declare a local stack slot for an alloca's IL temp id.
    pub fn add_local(&mut self, temp_id: u32, size_bytes: i32, align_bytes: i32) {
        if self.locals.iter().any(|l| l.temp_id == temp_id) {
            return;
        }
        let offset = self.assign_aligned_slot(size_bytes, align_bytes);
        self.locals.push(StackLocal { temp_id, size: size_bytes, align: align_bytes, offset });
    }

    /// The FP-relative offset of a local, or `0` ("not a local") if `temp_id`
    /// was never declared via [`add_local`](Self::add_local).
    pub fn local_offset(&self, temp_id: u32) -> i32 {
        self.locals.iter().find(|l| l.temp_id == temp_id).map(|l| l.offset).unwrap_or(0)
    }

    /// Ensure a spill slot exists for `key` (a vreg id, or an IL temp id offset
    /// into the cross-block reserved range). Idempotent: repeated calls with the
    /// same key return the same offset.
    pub fn ensure_spill(&mut self, key: u32, size_bytes: i32, align_bytes: i32) -> i32 {
        if let Some(s) = self.spills.iter().find(|s| s.key == key) {
            return s.offset;
        }
        let offset = self.assign_aligned_slot(size_bytes, align_bytes);
        self.spills.push(SpillSlot { key, size: size_bytes, align: align_bytes, offset });
        offset
    }

    pub fn set_max_outgoing_bytes(&mut self, bytes: i32) {
        if bytes > self.max_outgoing_bytes {
            self.max_outgoing_bytes = bytes;
        }
    }

    /// Round the total frame size to a multiple of 16 bytes and produce the
    /// finalised layout.
    pub fn finalize(self) -> FrameLayout {
        let used = -self.next_offset - SLOT_SIZE_BYTES;
        let used = used.max(0);
        let raw_total = used + self.max_outgoing_bytes;
        let total_bytes = round_up(raw_total, 16);
        FrameLayout {
            locals: self.locals,
            spills: self.spills,
            total_bytes,
            max_outgoing_bytes: self.max_outgoing_bytes,
        }
    }

    fn assign_aligned_slot(&mut self, size_bytes: i32, align_bytes: i32) -> i32 {
        let align_bytes = align_bytes.max(1);
        let mut candidate = self.next_offset;
        while candidate % align_bytes != 0 {
            candidate -= 1;
        }
        self.next_offset = candidate - size_bytes;
        candidate
    }
}

impl Default for FrameBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn round_up(value: i32, multiple: i32) -> i32 {
    let rem = value % multiple;
    if rem == 0 {
        value
    } else {
        value + (multiple - rem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_are_negative_and_decreasing() {
        let mut fb = FrameBuilder::new();
        let a = fb.ensure_spill(0, 8, 8);
        let b = fb.ensure_spill(1, 8, 8);
        assert!(a < 0 && b < 0);
        assert!(b < a);
    }

    #[test]
    fn ensure_spill_is_idempotent() {
        let mut fb = FrameBuilder::new();
        let a = fb.ensure_spill(7, 8, 8);
        let b = fb.ensure_spill(7, 8, 8);
        assert_eq!(a, b);
    }

    #[test]
    fn local_offset_defaults_to_zero() {
        let fb = FrameBuilder::new();
        assert_eq!(fb.local_offset(999), 0);
    }

    #[test]
    fn finalize_rounds_to_16_bytes() {
        let mut fb = FrameBuilder::new();
        fb.ensure_spill(0, 8, 8);
        let layout = fb.finalize();
        assert_eq!(layout.total_bytes % 16, 0);
        assert!(layout.total_bytes >= 8);
    }

    #[test]
    fn outgoing_bytes_included_in_total() {
        let mut fb = FrameBuilder::new();
        fb.set_max_outgoing_bytes(24);
        let layout = fb.finalize();
        assert!(layout.total_bytes >= 24);
        assert_eq!(layout.max_outgoing_bytes, 24);
    }
}
