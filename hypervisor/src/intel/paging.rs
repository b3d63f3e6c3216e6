//! Walks an arbitrary address space's 4-level paging structures through
//! physical memory. Nothing here ever loads the target CR3, so there is no
//! CR3 to restore on any path and the helpers cannot fault in VMX root:
//! a non-present entry simply ends the walk.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
//! 4.5 4-LEVEL PAGING AND 5-LEVEL PAGING

use {
    crate::intel::{addresses::PhysicalAddress, support::vmread},
    x86::{bits64::paging::BASE_PAGE_SIZE, vmx::vmcs},
};

const PRESENT: u64 = 1 << 0;
const LARGE: u64 = 1 << 7;
const PFN_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Guest paging walk bound to one CR3 value.
#[derive(Debug, Clone, Copy)]
pub struct GuestPageWalk {
    cr3: u64,
}

impl GuestPageWalk {
    /// A walker for the given directory-table base. CR3 low bits carry PCID
    /// state and are not part of the address.
    pub fn new(cr3: u64) -> Self {
        Self { cr3: cr3 & PFN_MASK }
    }

    /// A walker for the address space the guest is running in right now.
    pub fn current_guest() -> Self {
        Self::new(vmread(vmcs::guest::CR3))
    }

    /// Translates a virtual address, honoring 1 GiB, 2 MiB and 4 KiB
    /// mappings. Returns `None` as soon as any level is non-present.
    pub fn translate(&self, va: u64) -> Option<u64> {
        let pml4e = read_entry(self.cr3, pml4_index(va))?;

        let pdpte = read_entry(pml4e & PFN_MASK, pdpt_index(va))?;
        if pdpte & LARGE != 0 {
            return Some((pdpte & PFN_MASK & !0x3FFF_FFFF) | (va & 0x3FFF_FFFF));
        }

        let pde = read_entry(pdpte & PFN_MASK, pd_index(va))?;
        if pde & LARGE != 0 {
            return Some((pde & PFN_MASK & !0x1F_FFFF) | (va & 0x1F_FFFF));
        }

        let pte = read_entry(pde & PFN_MASK, pt_index(va))?;
        Some((pte & PFN_MASK) | (va & 0xFFF))
    }

    /// Reads one byte of guest memory.
    pub fn read_u8(&self, va: u64) -> Option<u8> {
        let pa = self.translate(va)?;
        Some(unsafe { (PhysicalAddress::va_from_pa(pa) as *const u8).read_volatile() })
    }

    /// Reads guest memory into `buffer`, stopping short at the first
    /// unmapped page. Returns the number of bytes copied; 0 means the very
    /// first page was inaccessible.
    pub fn read_bytes(&self, va: u64, buffer: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < buffer.len() {
            let current = va + copied as u64;
            let Some(pa) = self.translate(current) else {
                break;
            };

            // Stay within the current 4 KiB frame; the next one may map
            // elsewhere or nowhere.
            let in_page = BASE_PAGE_SIZE - (current as usize & (BASE_PAGE_SIZE - 1));
            let chunk = in_page.min(buffer.len() - copied);

            unsafe {
                core::ptr::copy_nonoverlapping(
                    PhysicalAddress::va_from_pa(pa) as *const u8,
                    buffer[copied..].as_mut_ptr(),
                    chunk,
                );
            }
            copied += chunk;
        }
        copied
    }

    /// Writes `bytes` into guest memory, stopping short at the first
    /// unmapped page. Returns the number of bytes written.
    pub fn write_bytes(&self, va: u64, bytes: &[u8]) -> usize {
        let mut written = 0;
        while written < bytes.len() {
            let current = va + written as u64;
            let Some(pa) = self.translate(current) else {
                break;
            };

            let in_page = BASE_PAGE_SIZE - (current as usize & (BASE_PAGE_SIZE - 1));
            let chunk = in_page.min(bytes.len() - written);

            unsafe {
                core::ptr::copy_nonoverlapping(
                    bytes[written..].as_ptr(),
                    PhysicalAddress::va_from_pa(pa) as *mut u8,
                    chunk,
                );
            }
            written += chunk;
        }
        written
    }

    /// Reads a NUL-terminated guest string of at most `max` bytes. Returns
    /// the bytes before the terminator, or `None` when the start is
    /// unmapped.
    pub fn read_c_string(&self, va: u64, buffer: &mut [u8], max: usize) -> Option<usize> {
        let limit = max.min(buffer.len());
        for i in 0..limit {
            let byte = self.read_u8(va + i as u64)?;
            if byte == 0 {
                return Some(i);
            }
            buffer[i] = byte;
        }
        Some(limit)
    }
}

fn read_entry(table_pa: u64, index: usize) -> Option<u64> {
    let entry_pa = table_pa + (index * 8) as u64;
    let entry = unsafe { (PhysicalAddress::va_from_pa(entry_pa) as *const u64).read_volatile() };
    (entry & PRESENT != 0).then_some(entry)
}

fn pml4_index(va: u64) -> usize {
    ((va >> 39) & 0x1FF) as usize
}

fn pdpt_index(va: u64) -> usize {
    ((va >> 30) & 0x1FF) as usize
}

fn pd_index(va: u64) -> usize {
    ((va >> 21) & 0x1FF) as usize
}

fn pt_index(va: u64) -> usize {
    ((va >> 12) & 0x1FF) as usize
}

#[cfg(test)]
mod tests {
    use {super::*, crate::allocate::box_zeroed};

    #[repr(C, align(4096))]
    struct TestTable([u64; 512]);

    // Builds a minimal identity-style hierarchy in host memory; the test
    // configuration's identity PA<->VA stubs let the walker follow real
    // pointers.
    struct TestSpace {
        pml4: alloc::boxed::Box<TestTable>,
        pdpt: alloc::boxed::Box<TestTable>,
        pd: alloc::boxed::Box<TestTable>,
        pt: alloc::boxed::Box<TestTable>,
        data: alloc::boxed::Box<TestTable>,
    }

    impl TestSpace {
        fn new() -> Self {
            let mut space = Self {
                pml4: unsafe { box_zeroed::<TestTable>() },
                pdpt: unsafe { box_zeroed::<TestTable>() },
                pd: unsafe { box_zeroed::<TestTable>() },
                pt: unsafe { box_zeroed::<TestTable>() },
                data: unsafe { box_zeroed::<TestTable>() },
            };

            space.pml4.0[0] = space.pdpt.0.as_ptr() as u64 | PRESENT;
            space.pdpt.0[0] = space.pd.0.as_ptr() as u64 | PRESENT;
            space.pd.0[0] = space.pt.0.as_ptr() as u64 | PRESENT;
            // Map VA 0x3000 at the data page.
            space.pt.0[3] = space.data.0.as_ptr() as u64 | PRESENT;
            space
        }

        fn walker(&self) -> GuestPageWalk {
            GuestPageWalk::new(self.pml4.0.as_ptr() as u64)
        }
    }

    #[test]
    fn translate_resolves_mapped_page() {
        let space = TestSpace::new();
        let data_pa = space.data.0.as_ptr() as u64;

        assert_eq!(space.walker().translate(0x3000), Some(data_pa));
        assert_eq!(space.walker().translate(0x3fff), Some(data_pa + 0xfff));
    }

    #[test]
    fn translate_fails_on_non_present() {
        let space = TestSpace::new();
        assert_eq!(space.walker().translate(0x5000), None);
        assert_eq!(space.walker().translate(0x4000_0000), None);
    }

    #[test]
    fn translate_honors_large_pages() {
        let mut space = TestSpace::new();
        // 2 MiB mapping at VA 0x200000 pointing at PA 0x40000000.
        space.pd.0[1] = 0x4000_0000 | LARGE | PRESENT;

        assert_eq!(
            space.walker().translate(0x200000 + 0x1234),
            Some(0x4000_0000 + 0x1234)
        );
    }

    #[test]
    fn read_stops_at_unmapped_boundary() {
        let mut space = TestSpace::new();
        space.data.0[0] = u64::from_le_bytes(*b"mirage!\0");

        // Pages after 0x3000 are unmapped, so a straddling read truncates.
        let mut buffer = [0u8; 16];
        let copied = space.walker().read_bytes(0x3ffc, &mut buffer);
        assert_eq!(copied, 4);

        let copied = space.walker().read_bytes(0x3000, &mut buffer[..8]);
        assert_eq!(copied, 8);
        assert_eq!(&buffer[..7], b"mirage!");

        // Entirely unmapped start reads zero bytes.
        assert_eq!(space.walker().read_bytes(0x9000, &mut buffer), 0);
    }

    #[test]
    fn write_and_read_round_trip() {
        let space = TestSpace::new();

        let written = space.walker().write_bytes(0x3010, b"hidden");
        assert_eq!(written, 6);

        let mut buffer = [0u8; 6];
        assert_eq!(space.walker().read_bytes(0x3010, &mut buffer), 6);
        assert_eq!(&buffer, b"hidden");
    }

    #[test]
    fn c_string_reads_to_terminator() {
        let space = TestSpace::new();
        space.walker().write_bytes(0x3100, b"ntoskrnl.exe\0garbage");

        let mut buffer = [0u8; 64];
        let len = space.walker().read_c_string(0x3100, &mut buffer, 64).unwrap();
        assert_eq!(&buffer[..len], b"ntoskrnl.exe");
    }
}
