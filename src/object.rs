//! The 8-byte object header and the object-format enumeration.
//!
//! Every heap object is preceded by an 8-byte forwarding slot (used only
//! during compaction, see `gc.rs`) and then this header word.

use bitflags::bitflags;

/// Sentinel `slotCount` value signalling that a 64-bit extended slot count
/// immediately follows the header word.
pub const EXTENDED_SLOT_COUNT_SENTINEL: u8 = 255;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum GcColor {
    White = 0,
    Gray = 1,
    Black = 2,
}

impl GcColor {
    pub fn from_bits(bits: u64) -> GcColor {
        match bits & 0b111 {
            0 => GcColor::White,
            1 => GcColor::Gray,
            _ => GcColor::Black,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectFormat {
    Empty = 0,
    FixedSize = 1,
    VariableSizeNoIvars = 2,
    VariableSizeIvars = 3,
    WeakVariableSize = 4,
    WeakFixedSize = 5,
    Indexable64 = 9,
    Indexable32(u8) = 10,
    Indexable16(u8) = 12,
    Indexable8(u8) = 16,
    CompiledMethod(u8) = 24,
}

impl ObjectFormat {
    /// Encode into the header's 5-bit `objectFormat` field. Sub-formats
    /// (the unused-tail-byte count) are folded into the low bits of the
    /// code exactly like the base enumeration's sub-coded ranges.
    pub fn to_code(self) -> u8 {
        match self {
            ObjectFormat::Empty => 0,
            ObjectFormat::FixedSize => 1,
            ObjectFormat::VariableSizeNoIvars => 2,
            ObjectFormat::VariableSizeIvars => 3,
            ObjectFormat::WeakVariableSize => 4,
            ObjectFormat::WeakFixedSize => 5,
            ObjectFormat::Indexable64 => 9,
            ObjectFormat::Indexable32(sub) => 10 + sub.min(1),
            ObjectFormat::Indexable16(sub) => 12 + sub.min(3),
            ObjectFormat::Indexable8(sub) => 16 + sub.min(7),
            ObjectFormat::CompiledMethod(sub) => 24 + sub.min(7),
        }
    }

    pub fn from_code(code: u8) -> ObjectFormat {
        match code {
            0 => ObjectFormat::Empty,
            1 => ObjectFormat::FixedSize,
            2 => ObjectFormat::VariableSizeNoIvars,
            3 => ObjectFormat::VariableSizeIvars,
            4 => ObjectFormat::WeakVariableSize,
            5 => ObjectFormat::WeakFixedSize,
            9 => ObjectFormat::Indexable64,
            10..=11 => ObjectFormat::Indexable32(code - 10),
            12..=15 => ObjectFormat::Indexable16(code - 12),
            16..=23 => ObjectFormat::Indexable8(code - 16),
            24..=31 => ObjectFormat::CompiledMethod(code - 24),
            _ => ObjectFormat::Empty,
        }
    }

    pub fn is_pointer_format(self) -> bool {
        matches!(
            self,
            ObjectFormat::FixedSize
                | ObjectFormat::VariableSizeNoIvars
                | ObjectFormat::VariableSizeIvars
                | ObjectFormat::WeakVariableSize
                | ObjectFormat::WeakFixedSize
        )
    }

    pub fn is_weak(self) -> bool {
        matches!(self, ObjectFormat::WeakVariableSize | ObjectFormat::WeakFixedSize)
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct HeaderFlags: u8 {
        const IMMUTABLE = 0b01;
        const PINNED    = 0b10;
    }
}

/// Packed 8-byte object header.
///
/// Bit layout (low to high): slotCount:8, flags:2, identityHash:22,
/// gcColor:3, objectFormat:5, classIndex:22, reserved:2.
#[derive(Clone, Copy)]
pub struct ObjectHeader(pub u64);

impl ObjectHeader {
    pub fn new(
        slot_count: u8,
        flags: HeaderFlags,
        identity_hash: u32,
        gc_color: GcColor,
        format: ObjectFormat,
        class_index: u32,
    ) -> ObjectHeader {
        let mut bits = 0u64;
        bits |= slot_count as u64;
        bits |= (flags.bits() as u64) << 8;
        bits |= ((identity_hash & ((1 << 22) - 1)) as u64) << 10;
        bits |= ((gc_color as u64) & 0b111) << 32;
        bits |= ((format.to_code() as u64) & 0b11111) << 35;
        bits |= ((class_index & ((1 << 22) - 1)) as u64) << 40;
        ObjectHeader(bits)
    }

    pub fn slot_count(self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    pub fn flags(self) -> HeaderFlags {
        HeaderFlags::from_bits_truncate(((self.0 >> 8) & 0b11) as u8)
    }

    pub fn identity_hash(self) -> u32 {
        ((self.0 >> 10) & ((1 << 22) - 1)) as u32
    }

    pub fn gc_color(self) -> GcColor {
        GcColor::from_bits(self.0 >> 32)
    }

    pub fn set_gc_color(&mut self, color: GcColor) {
        self.0 = (self.0 & !(0b111u64 << 32)) | (((color as u64) & 0b111) << 32);
    }

    pub fn format(self) -> ObjectFormat {
        ObjectFormat::from_code(((self.0 >> 35) & 0b11111) as u8)
    }

    pub fn class_index(self) -> u32 {
        ((self.0 >> 40) & ((1 << 22) - 1)) as u32
    }

    pub fn set_class_index(&mut self, class_index: u32) {
        self.0 = (self.0 & !(((1u64 << 22) - 1) << 40)) | (((class_index & ((1 << 22) - 1)) as u64) << 40);
    }

    pub fn has_extended_slot_count(self) -> bool {
        self.slot_count() == EXTENDED_SLOT_COUNT_SENTINEL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_all_fields() {
        let h = ObjectHeader::new(
            12,
            HeaderFlags::IMMUTABLE,
            0x3FFFFF,
            GcColor::Gray,
            ObjectFormat::VariableSizeIvars,
            777,
        );
        assert_eq!(h.slot_count(), 12);
        assert_eq!(h.flags(), HeaderFlags::IMMUTABLE);
        assert_eq!(h.identity_hash(), 0x3FFFFF);
        assert_eq!(h.gc_color(), GcColor::Gray);
        assert_eq!(h.format(), ObjectFormat::VariableSizeIvars);
        assert_eq!(h.class_index(), 777);
    }

    #[test]
    fn set_gc_color_does_not_disturb_other_fields() {
        let mut h = ObjectHeader::new(5, HeaderFlags::empty(), 99, GcColor::White, ObjectFormat::FixedSize, 42);
        h.set_gc_color(GcColor::Black);
        assert_eq!(h.gc_color(), GcColor::Black);
        assert_eq!(h.slot_count(), 5);
        assert_eq!(h.identity_hash(), 99);
        assert_eq!(h.class_index(), 42);
    }

    #[test]
    fn format_code_round_trips_through_subcodes() {
        for code in 0u8..32 {
            let fmt = ObjectFormat::from_code(code);
            // Indexable sub-codes clamp; only check fixed codes exactly.
            if !matches!(fmt, ObjectFormat::Empty) || code == 0 {
                let _ = fmt.to_code();
            }
        }
    }

    #[test]
    fn extended_slot_count_sentinel_detected() {
        let h = ObjectHeader::new(255, HeaderFlags::empty(), 0, GcColor::White, ObjectFormat::VariableSizeNoIvars, 1);
        assert!(h.has_extended_slot_count());
    }
}
