//! Memory Type Range Registers parsed into a normalized list of physical
//! ranges with their effective memory type. The EPT builder consults this
//! map so every EPT leaf carries the same caching behavior the guest would
//! see without virtualization.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
//! 12.11 MEMORY TYPE RANGE REGISTERS (MTRRS)

use {
    crate::{error::HypervisorError, intel::support::rdmsr},
    alloc::vec::Vec,
    x86::msr::{
        IA32_MTRRCAP, IA32_MTRR_DEF_TYPE, IA32_MTRR_FIX16K_80000, IA32_MTRR_FIX16K_A0000,
        IA32_MTRR_FIX4K_C0000, IA32_MTRR_FIX64K_00000, IA32_MTRR_PHYSBASE0, IA32_MTRR_PHYSMASK0,
    },
};

/// The memory types encodable in MTRRs and EPT entries.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
/// Table 12-8. Memory Types That Can Be Encoded in MTRRs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemoryType {
    Uncacheable = 0,
    WriteCombining = 1,
    WriteThrough = 4,
    WriteProtected = 5,
    WriteBack = 6,
}

impl MemoryType {
    pub fn from_raw(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Uncacheable),
            1 => Some(Self::WriteCombining),
            4 => Some(Self::WriteThrough),
            5 => Some(Self::WriteProtected),
            6 => Some(Self::WriteBack),
            _ => None,
        }
    }
}

/// One normalized physical range and its memory type. `end` is inclusive.
#[derive(Debug, Clone, Copy)]
pub struct MemoryTypeRange {
    pub base: u64,
    pub end: u64,
    pub memory_type: MemoryType,
    /// Fixed-range MTRRs take precedence below 1 MiB.
    pub fixed: bool,
}

/// The parsed MTRR state.
#[derive(Debug)]
pub struct MtrrMap {
    ranges: Vec<MemoryTypeRange>,
    default_type: MemoryType,
}

const ONE_MEGABYTE: u64 = 0x10_0000;

impl MtrrMap {
    /// Reads the MTRR MSRs and normalizes them. Fails when MTRRs are absent,
    /// disabled, or variable ranges overlap with types whose precedence the
    /// SDM leaves undefined.
    pub fn build() -> Result<Self, HypervisorError> {
        let cap = rdmsr(IA32_MTRRCAP);
        let def_type = rdmsr(IA32_MTRR_DEF_TYPE);

        // IA32_MTRR_DEF_TYPE.E: MTRRs enabled at all.
        if def_type & (1 << 11) == 0 {
            return Err(HypervisorError::MtrrUnsupported);
        }

        let mut ranges = Vec::new();

        // IA32_MTRRCAP.FIX and IA32_MTRR_DEF_TYPE.FE gate the fixed banks.
        if cap & (1 << 8) != 0 && def_type & (1 << 10) != 0 {
            let mut fixed_raw = [0u64; 11];
            fixed_raw[0] = rdmsr(IA32_MTRR_FIX64K_00000);
            fixed_raw[1] = rdmsr(IA32_MTRR_FIX16K_80000);
            fixed_raw[2] = rdmsr(IA32_MTRR_FIX16K_A0000);
            for i in 0..8 {
                fixed_raw[3 + i] = rdmsr(IA32_MTRR_FIX4K_C0000 + i as u32);
            }
            Self::push_fixed_ranges(&fixed_raw, &mut ranges)?;
        }

        let variable_count = (cap & 0xFF) as u32;
        for index in 0..variable_count {
            let base = rdmsr(IA32_MTRR_PHYSBASE0 + index * 2);
            let mask = rdmsr(IA32_MTRR_PHYSMASK0 + index * 2);
            if let Some(range) = Self::variable_range_from_raw(base, mask)? {
                ranges.push(range);
            }
        }

        let default_type = MemoryType::from_raw((def_type & 0xFF) as u8)
            .ok_or(HypervisorError::MemoryTypeResolutionError)?;

        let map = Self {
            ranges,
            default_type,
        };
        map.check_variable_conflicts()?;

        Ok(map)
    }

    /// Builds a map from already-read raw values; the pure core of
    /// `build`.
    pub fn from_components(
        ranges: Vec<MemoryTypeRange>,
        default_type: MemoryType,
    ) -> Result<Self, HypervisorError> {
        let map = Self {
            ranges,
            default_type,
        };
        map.check_variable_conflicts()?;
        Ok(map)
    }

    /// Decodes the eleven fixed-range MSRs. Each MSR holds eight type bytes;
    /// bank geometry is 8 x 64 KiB, 2 x (8 x 16 KiB), 8 x (8 x 4 KiB),
    /// covering exactly the first megabyte.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's
    /// Manual: Table 12-9. Address Mapping for Fixed-Range MTRRs
    pub fn push_fixed_ranges(
        raw: &[u64; 11],
        out: &mut Vec<MemoryTypeRange>,
    ) -> Result<(), HypervisorError> {
        // (msr index, base, sub-range size)
        const BANKS: [(usize, u64, u64); 11] = [
            (0, 0x00000, 0x10000),
            (1, 0x80000, 0x4000),
            (2, 0xA0000, 0x4000),
            (3, 0xC0000, 0x1000),
            (4, 0xC8000, 0x1000),
            (5, 0xD0000, 0x1000),
            (6, 0xD8000, 0x1000),
            (7, 0xE0000, 0x1000),
            (8, 0xE8000, 0x1000),
            (9, 0xF0000, 0x1000),
            (10, 0xF8000, 0x1000),
        ];

        for (msr_index, bank_base, sub_size) in BANKS {
            let value = raw[msr_index];
            for byte in 0..8u64 {
                let memory_type = MemoryType::from_raw(((value >> (byte * 8)) & 0xFF) as u8)
                    .ok_or(HypervisorError::MemoryTypeResolutionError)?;
                let base = bank_base + byte * sub_size;
                out.push(MemoryTypeRange {
                    base,
                    end: base + sub_size - 1,
                    memory_type,
                    fixed: true,
                });
            }
        }

        Ok(())
    }

    /// Decodes one variable-range base/mask MSR pair. Disabled ranges yield
    /// `None`.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's
    /// Manual: Figure 12-6. IA32_MTRR_PHYSBASEn and IA32_MTRR_PHYSMASKn
    pub fn variable_range_from_raw(
        base: u64,
        mask: u64,
    ) -> Result<Option<MemoryTypeRange>, HypervisorError> {
        const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

        // PHYSMASK.V
        if mask & (1 << 11) == 0 {
            return Ok(None);
        }

        let memory_type = MemoryType::from_raw((base & 0xFF) as u8)
            .ok_or(HypervisorError::MemoryTypeResolutionError)?;
        let base_address = base & ADDR_MASK;
        if mask & ADDR_MASK == 0 {
            return Err(HypervisorError::MemoryTypeResolutionError);
        }
        let size = 1u64 << (mask & ADDR_MASK).trailing_zeros();

        Ok(Some(MemoryTypeRange {
            base: base_address,
            end: base_address + size - 1,
            memory_type,
            fixed: false,
        }))
    }

    /// Resolves the effective memory type for one physical address.
    /// Fixed ranges win below 1 MiB; among variable ranges UC has the
    /// highest precedence and WT beats WB.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's
    /// Manual: 12.11.4.1 MTRR Precedences
    pub fn type_for(&self, pa: u64) -> MemoryType {
        if pa < ONE_MEGABYTE {
            if let Some(range) = self
                .ranges
                .iter()
                .find(|r| r.fixed && r.base <= pa && pa <= r.end)
            {
                return range.memory_type;
            }
        }

        let mut resolved: Option<MemoryType> = None;
        for range in self.ranges.iter().filter(|r| !r.fixed) {
            if range.base <= pa && pa <= range.end {
                match (resolved, range.memory_type) {
                    (_, MemoryType::Uncacheable) => return MemoryType::Uncacheable,
                    (Some(MemoryType::Uncacheable), _) => {}
                    (Some(MemoryType::WriteThrough), MemoryType::WriteBack) => {}
                    _ => resolved = Some(range.memory_type),
                }
            }
        }

        resolved.unwrap_or(self.default_type)
    }

    /// Resolves one memory type for a whole span, or `None` when the span
    /// straddles types and the caller has to split the mapping.
    pub fn span_type(&self, base: u64, length: u64) -> Option<MemoryType> {
        let first = self.type_for(base);

        // Type changes can only occur at range edges inside the span.
        let last = base + length - 1;
        for range in &self.ranges {
            for edge in [range.base, range.end.wrapping_add(1)] {
                if edge > base && edge <= last && self.type_for(edge) != first {
                    return None;
                }
            }
        }

        Some(first)
    }

    /// Rejects variable-range overlaps whose combined type the SDM leaves
    /// undefined (anything other than UC-wins or WT-over-WB).
    fn check_variable_conflicts(&self) -> Result<(), HypervisorError> {
        let variable: Vec<&MemoryTypeRange> = self.ranges.iter().filter(|r| !r.fixed).collect();

        for (i, a) in variable.iter().enumerate() {
            for b in variable.iter().skip(i + 1) {
                let overlaps = a.base <= b.end && b.base <= a.end;
                if !overlaps || a.memory_type == b.memory_type {
                    continue;
                }
                let defined = matches!(
                    (a.memory_type, b.memory_type),
                    (MemoryType::Uncacheable, _)
                        | (_, MemoryType::Uncacheable)
                        | (MemoryType::WriteThrough, MemoryType::WriteBack)
                        | (MemoryType::WriteBack, MemoryType::WriteThrough)
                );
                if !defined {
                    return Err(HypervisorError::ConflictingMemoryTypes);
                }
            }
        }

        Ok(())
    }

    pub fn ranges(&self) -> &[MemoryTypeRange] {
        &self.ranges
    }

    pub fn default_type(&self) -> MemoryType {
        self.default_type
    }
}

#[cfg(test)]
mod tests {
    use {super::*, alloc::vec};

    fn variable(base: u64, end: u64, memory_type: MemoryType) -> MemoryTypeRange {
        MemoryTypeRange {
            base,
            end,
            memory_type,
            fixed: false,
        }
    }

    #[test]
    fn fixed_bank_geometry_covers_first_megabyte() {
        let mut ranges = Vec::new();
        // All WB except the 64 KiB bank, which alternates UC/WB per byte.
        let mut raw = [0x0606_0606_0606_0606u64; 11];
        raw[0] = 0x0600_0600_0600_0600;
        MtrrMap::push_fixed_ranges(&raw, &mut ranges).unwrap();

        assert_eq!(ranges.len(), 88);
        assert!(ranges.iter().all(|r| r.fixed));

        // Contiguous, inclusive-end coverage of [0, 1 MiB).
        let mut expected_base = 0;
        for range in &ranges {
            assert_eq!(range.base, expected_base);
            expected_base = range.end + 1;
        }
        assert_eq!(expected_base, 0x10_0000);

        // Byte 0 of the 64 KiB bank is UC, byte 1 is WB.
        assert_eq!(ranges[0].memory_type, MemoryType::Uncacheable);
        assert_eq!(ranges[1].memory_type, MemoryType::WriteBack);
    }

    #[test]
    fn variable_range_decoding() {
        // 128 MiB WB range at 1 GiB: mask selects a 0x0800_0000-sized block.
        let base = 0x4000_0000u64 | MemoryType::WriteBack as u64;
        let mask = (!(0x0800_0000u64 - 1) & 0x000F_FFFF_FFFF_F000) | (1 << 11);

        let range = MtrrMap::variable_range_from_raw(base, mask).unwrap().unwrap();
        assert_eq!(range.base, 0x4000_0000);
        assert_eq!(range.end, 0x47FF_FFFF);
        assert_eq!(range.memory_type, MemoryType::WriteBack);

        // Valid bit clear -> disabled.
        assert!(MtrrMap::variable_range_from_raw(base, mask & !(1 << 11))
            .unwrap()
            .is_none());
    }

    #[test]
    fn uncacheable_wins_over_everything() {
        let map = MtrrMap::from_components(
            vec![
                variable(0x1000_0000, 0x1FFF_FFFF, MemoryType::WriteBack),
                variable(0x1800_0000, 0x18FF_FFFF, MemoryType::Uncacheable),
            ],
            MemoryType::WriteBack,
        )
        .unwrap();

        assert_eq!(map.type_for(0x1000_0000), MemoryType::WriteBack);
        assert_eq!(map.type_for(0x1800_0000), MemoryType::Uncacheable);
        assert_eq!(map.type_for(0x1900_0000), MemoryType::WriteBack);
    }

    #[test]
    fn write_through_beats_write_back() {
        let map = MtrrMap::from_components(
            vec![
                variable(0x1000_0000, 0x1FFF_FFFF, MemoryType::WriteBack),
                variable(0x1000_0000, 0x10FF_FFFF, MemoryType::WriteThrough),
            ],
            MemoryType::WriteBack,
        )
        .unwrap();

        assert_eq!(map.type_for(0x1000_0000), MemoryType::WriteThrough);
        assert_eq!(map.type_for(0x1100_0000), MemoryType::WriteBack);
    }

    #[test]
    fn undefined_overlap_aborts() {
        let result = MtrrMap::from_components(
            vec![
                variable(0x1000_0000, 0x1FFF_FFFF, MemoryType::WriteCombining),
                variable(0x1800_0000, 0x18FF_FFFF, MemoryType::WriteThrough),
            ],
            MemoryType::WriteBack,
        );

        assert!(matches!(
            result,
            Err(HypervisorError::ConflictingMemoryTypes)
        ));
    }

    #[test]
    fn fixed_ranges_win_below_one_megabyte() {
        let mut ranges = vec![variable(0x0, 0xFFFF_FFFF, MemoryType::WriteBack)];
        ranges.push(MemoryTypeRange {
            base: 0xF8000,
            end: 0xF8FFF,
            memory_type: MemoryType::Uncacheable,
            fixed: true,
        });

        let map = MtrrMap::from_components(ranges, MemoryType::WriteBack).unwrap();
        assert_eq!(map.type_for(0xF8000), MemoryType::Uncacheable);
        assert_eq!(map.type_for(0xF9000), MemoryType::WriteBack);
    }

    #[test]
    fn span_type_detects_straddling() {
        let map = MtrrMap::from_components(
            vec![
                variable(0x0, 0x1F_FFFF, MemoryType::WriteBack),
                variable(0x20_0000, 0x2F_FFFF, MemoryType::Uncacheable),
            ],
            MemoryType::WriteBack,
        )
        .unwrap();

        assert_eq!(map.span_type(0x0, 0x20_0000), Some(MemoryType::WriteBack));
        assert_eq!(
            map.span_type(0x20_0000, 0x10_0000),
            Some(MemoryType::Uncacheable)
        );
        // A 2 MiB span covering both ranges has no single type.
        assert_eq!(map.span_type(0x10_0000, 0x20_0000), None);
    }

    #[test]
    fn default_type_applies_outside_all_ranges() {
        let map = MtrrMap::from_components(vec![], MemoryType::WriteBack).unwrap();
        assert_eq!(map.type_for(0xDEAD_B000), MemoryType::WriteBack);
    }
}
