//! The extended page table engine: an identity map of guest physical memory
//! with MTRR-correct memory types, 2 MiB leaves split to 4 KiB on demand
//! from pre-allocated tables, and the leaf mutators the hidden-hook engine
//! multiplexes shadow pages through.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
//! 29.3 THE EXTENDED PAGE TABLE MECHANISM (EPT)

use {
    crate::{
        error::HypervisorError,
        intel::{
            addresses::PhysicalAddress,
            mtrr::{MemoryType, MtrrMap},
            support::rdmsr,
        },
    },
    bitfield::bitfield,
    core::ptr::addr_of,
    log::*,
    x86::{
        bits64::paging::{
            pd_index, pdpt_index, pt_index, VAddr, BASE_PAGE_SHIFT, BASE_PAGE_SIZE,
            LARGE_PAGE_SIZE,
        },
        msr::IA32_VMX_EPT_VPID_CAP,
    },
};

/// Physical address of a hypervisor-owned paging structure.
fn table_pa<T>(table: &T) -> u64 {
    PhysicalAddress::pa_from_va(addr_of!(*table) as u64)
}

/// Capability bits this engine requires from IA32_VMX_EPT_VPID_CAP.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
/// A.10 VPID AND EPT CAPABILITIES
mod cap {
    pub const EXECUTE_ONLY: u64 = 1 << 0;
    pub const PAGE_WALK_LENGTH_4: u64 = 1 << 6;
    pub const MEMORY_TYPE_UC: u64 = 1 << 8;
    pub const MEMORY_TYPE_WB: u64 = 1 << 14;
    pub const LARGE_PDE: u64 = 1 << 16;
    pub const INVEPT: u64 = 1 << 20;
    pub const INVEPT_SINGLE_CONTEXT: u64 = 1 << 25;
    pub const INVEPT_ALL_CONTEXTS: u64 = 1 << 26;
    pub const INVVPID: u64 = 1 << 32;
}

/// The whole EPT hierarchy. One PML4 entry covers 512 GiB through a fully
/// populated PDPT/PD set with 2 MiB leaves; the first 2 MiB is eagerly
/// backed by the built-in page table so the fixed-range MTRRs map exactly.
#[repr(C, align(4096))]
pub struct Ept {
    pml4: Pml4,
    pdpt: Pdpt,
    pd: [Pd; 512],
    pt: Pt,
}

impl Ept {
    /// Verifies the EPT and TLB-management features this engine depends on.
    pub fn check_features() -> Result<(), HypervisorError> {
        let cap_msr = rdmsr(IA32_VMX_EPT_VPID_CAP);

        let required = cap::PAGE_WALK_LENGTH_4
            | cap::EXECUTE_ONLY
            | cap::LARGE_PDE
            | cap::INVEPT
            | cap::INVEPT_SINGLE_CONTEXT
            | cap::INVEPT_ALL_CONTEXTS
            | cap::INVVPID;

        if cap_msr & required != required {
            return Err(HypervisorError::EptCapabilityMissing);
        }

        if cap_msr & (cap::MEMORY_TYPE_WB | cap::MEMORY_TYPE_UC) == 0 {
            return Err(HypervisorError::EptCapabilityMissing);
        }

        Ok(())
    }

    /// Builds the identity mapping with memory types resolved against the
    /// MTRR map. Every PDE is a 2 MiB RWX leaf except the first, which
    /// points at the built-in PT with per-4 KiB types.
    pub fn build_identity(&mut self, mtrr: &MtrrMap) -> Result<(), HypervisorError> {
        trace!("Initializing EPT identity mapping");

        let mut pa = 0u64;

        self.pml4.0.entries[0].set_readable(true);
        self.pml4.0.entries[0].set_writable(true);
        self.pml4.0.entries[0].set_executable(true);
        self.pml4.0.entries[0].set_pfn(table_pa(&self.pdpt) >> BASE_PAGE_SHIFT);

        for (i, pdpte) in self.pdpt.0.entries.iter_mut().enumerate() {
            pdpte.set_readable(true);
            pdpte.set_writable(true);
            pdpte.set_executable(true);
            pdpte.set_pfn(table_pa(&self.pd[i]) >> BASE_PAGE_SHIFT);

            for pde in &mut self.pd[i].0.entries {
                if pa == 0 {
                    // First 2 MiB: 4 KiB granularity for the fixed ranges.
                    pde.set_readable(true);
                    pde.set_writable(true);
                    pde.set_executable(true);
                    pde.set_pfn(table_pa(&self.pt) >> BASE_PAGE_SHIFT);

                    for pte in &mut self.pt.0.entries {
                        pte.set_readable(true);
                        pte.set_writable(true);
                        pte.set_executable(true);
                        pte.set_memory_type(mtrr.type_for(pa) as u64);
                        pte.set_pfn(pa >> BASE_PAGE_SHIFT);
                        pa += BASE_PAGE_SIZE as u64;
                    }
                } else {
                    // A straddling span above the low megabyte collapses to
                    // UC if any byte of it is UC; caching correctness beats
                    // performance there.
                    let memory_type = match mtrr.span_type(pa, LARGE_PAGE_SIZE as u64) {
                        Some(memory_type) => memory_type,
                        None => {
                            if (0..LARGE_PAGE_SIZE as u64)
                                .step_by(BASE_PAGE_SIZE)
                                .any(|off| mtrr.type_for(pa + off) == MemoryType::Uncacheable)
                            {
                                MemoryType::Uncacheable
                            } else {
                                mtrr.type_for(pa)
                            }
                        }
                    };

                    pde.set_readable(true);
                    pde.set_writable(true);
                    pde.set_executable(true);
                    pde.set_memory_type(memory_type as u64);
                    pde.set_large(true);
                    pde.set_pfn(pa >> BASE_PAGE_SHIFT);
                    pa += LARGE_PAGE_SIZE as u64;
                }
            }
        }

        Ok(())
    }

    /// Splits the 2 MiB leaf containing `guest_pa` into 512 4 KiB entries in
    /// `pt`, each inheriting the parent's permissions and memory type.
    /// Idempotent: an already-split directory entry reports
    /// `PageAlreadySplit` and leaves everything untouched.
    pub fn split_2mb_to_4kb(&mut self, guest_pa: u64, pt: &mut Pt) -> Result<(), HypervisorError> {
        trace!("Splitting 2mb page into 4kb pages: {:#x}", guest_pa);

        let guest_pa = VAddr::from(guest_pa);

        let pdpt_index = pdpt_index(guest_pa);
        let pd_index = pd_index(guest_pa);
        let pde = &mut self.pd[pdpt_index].0.entries[pd_index];

        if !pde.large() {
            trace!("Page is already split: {:#x}.", guest_pa);
            return Err(HypervisorError::PageAlreadySplit);
        }

        let memory_type = pde.memory_type();
        let readable = pde.readable();
        let writable = pde.writable();
        let executable = pde.executable();
        let base = guest_pa.align_down_to_large_page();

        for (i, pte) in pt.0.entries.iter_mut().enumerate() {
            *pte = Entry(0);

            let pa = base.as_u64() + (i * BASE_PAGE_SIZE) as u64;
            pte.set_readable(readable);
            pte.set_writable(writable);
            pte.set_executable(executable);
            pte.set_memory_type(memory_type);
            pte.set_pfn(pa >> BASE_PAGE_SHIFT);
        }

        // Turn the leaf into a directory pointer. Memory type bits are
        // reserved (must be zero) in a PDE that references a PT.
        *pde = Entry(0);
        pde.set_readable(true);
        pde.set_writable(true);
        pde.set_executable(true);
        pde.set_pfn(table_pa(pt) >> BASE_PAGE_SHIFT);

        Ok(())
    }

    /// Replaces the permission bits of the leaf covering `guest_pa`. For a
    /// 4 KiB leaf the hosting `pt` must be the one installed by
    /// `split_2mb_to_4kb`.
    pub fn modify_page_permissions(
        &mut self,
        guest_pa: u64,
        access_type: AccessType,
        pt: &mut Pt,
    ) -> Result<(), HypervisorError> {
        let guest_pa = VAddr::from(guest_pa);

        if !guest_pa.is_large_page_aligned() && !guest_pa.is_base_page_aligned() {
            error!("Page is not aligned: {:#x}", guest_pa);
            return Err(HypervisorError::UnalignedAddressError);
        }

        let pdpt_index = pdpt_index(guest_pa);
        let pd_index = pd_index(guest_pa);
        let pt_index = pt_index(guest_pa);

        let pde = &mut self.pd[pdpt_index].0.entries[pd_index];

        if pde.large() {
            pde.set_readable(access_type.contains(AccessType::READ));
            pde.set_writable(access_type.contains(AccessType::WRITE));
            pde.set_executable(access_type.contains(AccessType::EXECUTE));
        } else {
            let pte = &mut pt.0.entries[pt_index];
            pte.set_readable(access_type.contains(AccessType::READ));
            pte.set_writable(access_type.contains(AccessType::WRITE));
            pte.set_executable(access_type.contains(AccessType::EXECUTE));
        }

        Ok(())
    }

    /// Redirects the 4 KiB leaf for `guest_pa` at a new host frame,
    /// preserving permissions and memory type. Returns the previous host
    /// physical address.
    pub fn remap_gpa_to_hpa(
        &mut self,
        guest_pa: u64,
        host_pa: u64,
        pt: &mut Pt,
    ) -> Result<u64, HypervisorError> {
        trace!("Remapping GPA {:#x} to HPA {:#x}", guest_pa, host_pa);

        let guest_pa = VAddr::from(guest_pa);
        let host_pa = VAddr::from(host_pa);

        if !guest_pa.is_base_page_aligned() || !host_pa.is_base_page_aligned() {
            error!("Addresses are not aligned: GPA {:#x}, HPA {:#x}", guest_pa, host_pa);
            return Err(HypervisorError::UnalignedAddressError);
        }

        let pdpt_index = pdpt_index(guest_pa);
        let pd_index = pd_index(guest_pa);
        let pt_index = pt_index(guest_pa);

        if self.pd[pdpt_index].0.entries[pd_index].large() {
            error!("Cannot remap a large page: GPA {:#x}", guest_pa);
            return Err(HypervisorError::LargePageRemapError);
        }

        let pte = &mut pt.0.entries[pt_index];
        let old_hpa = pte.pfn() << BASE_PAGE_SHIFT;
        pte.set_pfn(host_pa.as_u64() >> BASE_PAGE_SHIFT);

        Ok(old_hpa)
    }

    /// Atomically reconfigures the leaf for `guest_pa`: permissions, then
    /// target frame, then TLB invalidation. This is the single mechanism
    /// the hook engine uses to flip between the data and exec
    /// configurations.
    #[rustfmt::skip]
    pub fn swap_page(&mut self, guest_pa: u64, host_pa: u64, access_type: AccessType, pt: &mut Pt) -> Result<(), HypervisorError> {
        self.modify_page_permissions(guest_pa, access_type, pt)?;
        self.remap_gpa_to_hpa(guest_pa, host_pa, pt)?;

        // Same-core invalidation before the next VMRESUME. Prefer the
        // single-context flavor keyed on the active EPTP. (Host test builds
        // have no VMCS or TLB to talk to.)
        #[cfg(not(test))]
        {
            use crate::intel::{
                invept::{invept_all_contexts, invept_single_context},
                invvpid::{invvpid_single_context, VPID_TAG},
                support::vmread,
            };

            let eptp = vmread(x86::vmx::vmcs::control::EPTP_FULL);
            if eptp != 0 {
                invept_single_context(eptp);
            } else {
                invept_all_contexts();
            }
            invvpid_single_context(VPID_TAG);
        }

        Ok(())
    }

    /// Reads the 4 KiB leaf for `guest_pa` out of `pt`.
    pub fn pte(&self, guest_pa: u64, pt: &Pt) -> Entry {
        pt.0.entries[pt_index(VAddr::from(guest_pa))]
    }

    /// Writes the 4 KiB leaf for `guest_pa` in `pt` byte-for-byte. Used by
    /// unhook to restore the pre-install entry.
    pub fn set_pte(&mut self, guest_pa: u64, entry: Entry, pt: &mut Pt) {
        pt.0.entries[pt_index(VAddr::from(guest_pa))] = entry;
    }

    /// Walks the owned structures for `gpa` and returns the mapped host
    /// physical address. Split leaves live in pool-owned tables and are
    /// resolved by the hook engine instead.
    pub fn translate(&self, gpa: u64) -> Option<u64> {
        let addr = VAddr::from(gpa);
        let pdpte = self.pdpt.0.entries[pdpt_index(addr)];
        if !pdpte.readable() && !pdpte.executable() {
            return None;
        }

        let pde = self.pd[pdpt_index(addr)].0.entries[pd_index(addr)];
        if pde.large() {
            let base = pde.pfn() << BASE_PAGE_SHIFT;
            return Some(base | (gpa & (LARGE_PAGE_SIZE as u64 - 1)));
        }

        // Only the built-in first-2MiB table is reachable from here.
        if gpa < LARGE_PAGE_SIZE as u64 {
            let pte = self.pt.0.entries[pt_index(addr)];
            return Some((pte.pfn() << BASE_PAGE_SHIFT) | (gpa & (BASE_PAGE_SIZE as u64 - 1)));
        }

        None
    }

    /// Memory type of the leaf covering `gpa` (built-in tables only).
    pub fn leaf_memory_type(&self, gpa: u64) -> Option<MemoryType> {
        let addr = VAddr::from(gpa);
        let pde = self.pd[pdpt_index(addr)].0.entries[pd_index(addr)];
        let raw = if pde.large() {
            pde.memory_type()
        } else if gpa < LARGE_PAGE_SIZE as u64 {
            self.pt.0.entries[pt_index(addr)].memory_type()
        } else {
            return None;
        };
        MemoryType::from_raw(raw as u8)
    }

    /// Builds the EPTP for this hierarchy: 4-level walk and the best memory
    /// type IA32_VMX_EPT_VPID_CAP reports (WB preferred, UC fallback).
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's
    /// Manual: 25.6.11 Extended-Page-Table Pointer (EPTP)
    pub fn create_eptp(&self) -> Result<u64, HypervisorError> {
        let pml4_pa = table_pa(&self.pml4);

        if pml4_pa.trailing_zeros() < 12 {
            return Err(HypervisorError::InvalidEptPml4BaseAddress);
        }

        // Page-walk length is encoded as levels minus one.
        const EPT_PAGE_WALK_LENGTH_4: u64 = 3 << 3;

        let cap_msr = rdmsr(IA32_VMX_EPT_VPID_CAP);
        let memory_type = if cap_msr & cap::MEMORY_TYPE_WB != 0 {
            MemoryType::WriteBack as u64
        } else {
            MemoryType::Uncacheable as u64
        };

        Ok(pml4_pa | EPT_PAGE_WALK_LENGTH_4 | memory_type)
    }
}

/// EPT PML4 table referencing the PDPT.
#[derive(Debug, Clone, Copy)]
struct Pml4(Table);

/// EPT page-directory-pointer table referencing the page directories.
#[derive(Debug, Clone, Copy)]
struct Pdpt(Table);

/// EPT page directory: 2 MiB leaves or pointers to page tables.
#[derive(Debug, Clone, Copy)]
struct Pd(Table);

/// EPT page table mapping 4 KiB pages. Instances outside the built-in first
/// 2 MiB come from the hook engine's pre-allocated pool.
#[derive(Debug, Clone, Copy)]
pub struct Pt(Table);

#[repr(C, align(4096))]
#[derive(Debug, Clone, Copy)]
struct Table {
    entries: [Entry; 512],
}

bitfield! {
    /// An EPT paging-structure entry at any level.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's
    /// Manual: Table 29-6. Format of an EPT Page-Table Entry that Maps a
    /// 4-KByte Page
    #[derive(Clone, Copy)]
    pub struct Entry(u64);
    impl Debug;

    pub readable, set_readable: 0;
    pub writable, set_writable: 1;
    pub executable, set_executable: 2;
    pub memory_type, set_memory_type: 5, 3;
    pub large, set_large: 7;
    pub pfn, set_pfn: 51, 12;
}

bitflags::bitflags! {
    /// Permission mask for an EPT leaf.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessType: u8 {
        const READ = 0b001;
        const WRITE = 0b010;
        const EXECUTE = 0b100;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        const READ_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
        const READ_WRITE_EXECUTE = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{allocate::box_zeroed, intel::mtrr::MemoryTypeRange},
        alloc::vec,
    };

    fn test_mtrr() -> MtrrMap {
        // UC VGA hole in the fixed range, UC MMIO window at 3.5 GiB,
        // everything else WB.
        let mut ranges = vec![MemoryTypeRange {
            base: 0xE000_0000,
            end: 0xFFFF_FFFF,
            memory_type: MemoryType::Uncacheable,
            fixed: false,
        }];
        ranges.push(MemoryTypeRange {
            base: 0xA0000,
            end: 0xBFFFF,
            memory_type: MemoryType::Uncacheable,
            fixed: true,
        });
        MtrrMap::from_components(ranges, MemoryType::WriteBack).unwrap()
    }

    #[test]
    fn entry_field_layout() {
        let mut entry = Entry(0);
        entry.set_readable(true);
        entry.set_writable(true);
        entry.set_executable(true);
        entry.set_memory_type(MemoryType::WriteBack as u64);
        entry.set_large(true);
        entry.set_pfn(0x12345000 >> 12);

        // R/W/X in bits 0..2, type WB (6) in bits 5:3, large in bit 7,
        // address in bits 51:12.
        assert_eq!(entry.0, 0b111 | (6 << 3) | (1 << 7) | 0x12345000);
    }

    #[test]
    fn identity_map_covers_ram_with_mtrr_types() {
        let mtrr = test_mtrr();
        let mut ept = unsafe { box_zeroed::<Ept>() };
        ept.build_identity(&mtrr).unwrap();

        // Identity translation at several scales (test builds use an
        // identity VA->PA stub, so table pointers resolve in-process).
        for pa in [0x0u64, 0x1000, 0x9F000, 0x20_0000, 0x7654_3000, 0x1_2345_6000] {
            assert_eq!(ept.translate(pa), Some(pa), "identity at {pa:#x}");
        }

        // Memory types follow the map: VGA hole UC, RAM WB, MMIO UC.
        assert_eq!(ept.leaf_memory_type(0xA0000), Some(MemoryType::Uncacheable));
        assert_eq!(ept.leaf_memory_type(0x1000), Some(MemoryType::WriteBack));
        assert_eq!(ept.leaf_memory_type(0x20_0000), Some(MemoryType::WriteBack));
        assert_eq!(
            ept.leaf_memory_type(0xE000_0000),
            Some(MemoryType::Uncacheable)
        );
    }

    #[test]
    fn split_preserves_type_and_permissions() {
        let mtrr = test_mtrr();
        let mut ept = unsafe { box_zeroed::<Ept>() };
        ept.build_identity(&mtrr).unwrap();

        let mut pt = unsafe { box_zeroed::<Pt>() };
        let guest_pa = 0xE000_0000u64;

        ept.split_2mb_to_4kb(guest_pa, &mut pt).unwrap();

        for (i, pte) in pt.0.entries.iter().enumerate() {
            assert!(pte.readable() && pte.writable() && pte.executable());
            assert_eq!(pte.memory_type(), MemoryType::Uncacheable as u64);
            assert_eq!(
                pte.pfn() << BASE_PAGE_SHIFT,
                guest_pa + (i * BASE_PAGE_SIZE) as u64
            );
        }

        // The PDE now references the PT and is no longer a leaf.
        let second = ept.split_2mb_to_4kb(guest_pa, &mut pt);
        assert!(matches!(second, Err(HypervisorError::PageAlreadySplit)));
    }

    #[test]
    fn permission_mutation_and_remap() {
        let mtrr = test_mtrr();
        let mut ept = unsafe { box_zeroed::<Ept>() };
        ept.build_identity(&mtrr).unwrap();

        let mut pt = unsafe { box_zeroed::<Pt>() };
        let guest_page = 0x7654_3000u64;
        let shadow_page = 0x0BAD_F000u64;

        ept.split_2mb_to_4kb(guest_page & !(LARGE_PAGE_SIZE as u64 - 1), &mut pt)
            .unwrap();

        // Exec configuration: shadow frame, execute-only.
        ept.modify_page_permissions(guest_page, AccessType::EXECUTE, &mut pt)
            .unwrap();
        let old = ept.remap_gpa_to_hpa(guest_page, shadow_page, &mut pt).unwrap();
        assert_eq!(old, guest_page);

        let pte = ept.pte(guest_page, &pt);
        assert!(pte.executable() && !pte.readable() && !pte.writable());
        assert_eq!(pte.pfn() << BASE_PAGE_SHIFT, shadow_page);

        // Never both writable and executable during the flip.
        assert!(!(pte.writable() && pte.executable()));

        // Data configuration: original frame, read-write.
        ept.modify_page_permissions(guest_page, AccessType::READ_WRITE, &mut pt)
            .unwrap();
        let old = ept.remap_gpa_to_hpa(guest_page, guest_page, &mut pt).unwrap();
        assert_eq!(old, shadow_page);

        let pte = ept.pte(guest_page, &pt);
        assert!(pte.readable() && pte.writable() && !pte.executable());
        assert!(!(pte.writable() && pte.executable()));
    }

    #[test]
    fn remap_rejects_unsplit_large_page() {
        let mtrr = test_mtrr();
        let mut ept = unsafe { box_zeroed::<Ept>() };
        ept.build_identity(&mtrr).unwrap();

        let mut pt = unsafe { box_zeroed::<Pt>() };
        let result = ept.remap_gpa_to_hpa(0x4000_0000, 0x5000_0000, &mut pt);
        assert!(matches!(result, Err(HypervisorError::LargePageRemapError)));
    }

    #[test]
    fn pte_save_restore_round_trip() {
        let mtrr = test_mtrr();
        let mut ept = unsafe { box_zeroed::<Ept>() };
        ept.build_identity(&mtrr).unwrap();

        let mut pt = unsafe { box_zeroed::<Pt>() };
        let guest_page = 0x12345000u64;
        ept.split_2mb_to_4kb(guest_page & !(LARGE_PAGE_SIZE as u64 - 1), &mut pt)
            .unwrap();

        let saved = ept.pte(guest_page, &pt);
        ept.modify_page_permissions(guest_page, AccessType::EXECUTE, &mut pt)
            .unwrap();
        ept.remap_gpa_to_hpa(guest_page, 0x0BAD_F000, &mut pt).unwrap();
        assert_ne!(ept.pte(guest_page, &pt).0, saved.0);

        ept.set_pte(guest_page, saved, &mut pt);
        assert_eq!(ept.pte(guest_page, &pt).0, saved.0);
    }
}
