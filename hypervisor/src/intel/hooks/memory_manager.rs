//! Pre-allocated backing memory for EPT hooks: split page tables and shadow
//! pages, reserved up front so hook installation and the data/exec flip
//! never allocate while the core is in VMX root.

use {
    crate::{
        allocate::box_zeroed,
        error::HypervisorError,
        intel::{ept::Pt, page::Page},
    },
    alloc::boxed::Box,
    heapless::{LinearMap, Vec},
    log::trace,
};

/// The maximum number of simultaneously hooked 4 KiB frames.
pub const MAX_HOOK_ENTRIES: usize = 64;

#[derive(Debug)]
pub struct MemoryManager {
    /// Page tables installed for split 2 MiB regions, keyed by the 2 MiB
    /// aligned guest physical address.
    active_page_tables: LinearMap<u64, Box<Pt>, MAX_HOOK_ENTRIES>,

    /// Shadow pages for hooked frames, keyed by the 4 KiB aligned guest
    /// physical address.
    active_shadow_pages: LinearMap<u64, Box<Page>, MAX_HOOK_ENTRIES>,

    free_page_tables: Vec<Box<Pt>, MAX_HOOK_ENTRIES>,
    free_shadow_pages: Vec<Box<Page>, MAX_HOOK_ENTRIES>,
}

impl MemoryManager {
    /// Reserves the full pool. Called once, from VMX non-root, before any
    /// hook can be requested.
    pub fn new() -> Result<Self, HypervisorError> {
        trace!("Pre-allocating page tables and shadow pages");

        let mut free_page_tables = Vec::new();
        let mut free_shadow_pages = Vec::new();

        for _ in 0..MAX_HOOK_ENTRIES {
            free_page_tables
                .push(unsafe { box_zeroed::<Pt>() })
                .map_err(|_| HypervisorError::PageTablesAllocationError)?;
            free_shadow_pages
                .push(unsafe { box_zeroed::<Page>() })
                .map_err(|_| HypervisorError::ShadowPageAllocationError)?;
        }

        Ok(Self {
            active_page_tables: LinearMap::new(),
            active_shadow_pages: LinearMap::new(),
            free_page_tables,
            free_shadow_pages,
        })
    }

    /// A drained manager holding no memory; used at teardown.
    pub fn empty() -> Self {
        Self {
            active_page_tables: LinearMap::new(),
            active_shadow_pages: LinearMap::new(),
            free_page_tables: Vec::new(),
            free_shadow_pages: Vec::new(),
        }
    }

    pub fn is_large_page_split(&self, guest_large_page_pa: u64) -> bool {
        self.active_page_tables.contains_key(&guest_large_page_pa)
    }

    pub fn is_shadow_page_mapped(&self, guest_page_pa: u64) -> bool {
        self.active_shadow_pages.contains_key(&guest_page_pa)
    }

    /// Takes a page table from the free pool for the given 2 MiB region.
    pub fn map_page_table(&mut self, guest_large_page_pa: u64) -> Result<(), HypervisorError> {
        if self.active_page_tables.contains_key(&guest_large_page_pa) {
            return Err(HypervisorError::PageTableAlreadyMapped);
        }
        let pt = self
            .free_page_tables
            .pop()
            .ok_or(HypervisorError::PageTablesUnavailable)?;
        self.active_page_tables
            .insert(guest_large_page_pa, pt)
            .map_err(|_| HypervisorError::PageTableAlreadyMapped)?;
        Ok(())
    }

    /// Takes a shadow page from the free pool for the given 4 KiB frame.
    pub fn map_shadow_page(&mut self, guest_page_pa: u64) -> Result<(), HypervisorError> {
        if self.active_shadow_pages.contains_key(&guest_page_pa) {
            return Err(HypervisorError::ShadowPageAlreadyMapped);
        }
        let page = self
            .free_shadow_pages
            .pop()
            .ok_or(HypervisorError::ShadowPagesUnavailable)?;
        self.active_shadow_pages
            .insert(guest_page_pa, page)
            .map_err(|_| HypervisorError::ShadowPageAlreadyMapped)?;
        Ok(())
    }

    pub fn page_table_as_mut(&mut self, guest_large_page_pa: u64) -> Option<&mut Pt> {
        self.active_page_tables
            .get_mut(&guest_large_page_pa)
            .map(|pt| &mut **pt)
    }

    pub fn shadow_page_ptr(&self, guest_page_pa: u64) -> Option<u64> {
        self.active_shadow_pages
            .get(&guest_page_pa)
            .map(|page| page.as_ptr() as u64)
    }

    pub fn shadow_page_as_mut(&mut self, guest_page_pa: u64) -> Option<&mut Page> {
        self.active_shadow_pages
            .get_mut(&guest_page_pa)
            .map(|page| &mut **page)
    }

    /// Returns a hooked frame's shadow page to the free pool.
    pub fn unmap_shadow_page(&mut self, guest_page_pa: u64) -> Result<(), HypervisorError> {
        let page = self
            .active_shadow_pages
            .remove(&guest_page_pa)
            .ok_or(HypervisorError::ShadowPageNotFound)?;
        // Capacity equals the number of pooled pages, so this cannot fail.
        let _ = self.free_shadow_pages.push(page);
        Ok(())
    }

    /// Returns a split region's page table to the free pool. The caller must
    /// have restored the 2 MiB mapping first.
    pub fn unmap_page_table(&mut self, guest_large_page_pa: u64) -> Result<(), HypervisorError> {
        let pt = self
            .active_page_tables
            .remove(&guest_large_page_pa)
            .ok_or(HypervisorError::PageTableNotFound)?;
        let _ = self.free_page_tables.push(pt);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_bookkeeping_round_trip() {
        let mut manager = MemoryManager::new().unwrap();

        assert!(!manager.is_large_page_split(0x20_0000));
        manager.map_page_table(0x20_0000).unwrap();
        assert!(manager.is_large_page_split(0x20_0000));
        assert!(manager.page_table_as_mut(0x20_0000).is_some());
        assert!(manager.page_table_as_mut(0x40_0000).is_none());

        manager.map_shadow_page(0x20_1000).unwrap();
        assert!(manager.is_shadow_page_mapped(0x20_1000));
        assert!(manager.shadow_page_ptr(0x20_1000).is_some());

        manager.unmap_shadow_page(0x20_1000).unwrap();
        assert!(!manager.is_shadow_page_mapped(0x20_1000));
        manager.unmap_page_table(0x20_0000).unwrap();
        assert!(!manager.is_large_page_split(0x20_0000));
    }

    #[test]
    fn double_map_is_rejected() {
        let mut manager = MemoryManager::new().unwrap();

        manager.map_shadow_page(0x1000).unwrap();
        assert!(matches!(
            manager.map_shadow_page(0x1000),
            Err(HypervisorError::ShadowPageAlreadyMapped)
        ));
    }

    #[test]
    fn exhausted_pool_fails_cleanly() {
        let mut manager = MemoryManager::new().unwrap();

        for i in 0..MAX_HOOK_ENTRIES as u64 {
            manager.map_shadow_page(i << 12).unwrap();
        }
        assert!(matches!(
            manager.map_shadow_page(0xFFFF_F000),
            Err(HypervisorError::ShadowPagesUnavailable)
        ));

        // Freeing one slot makes the pool usable again.
        manager.unmap_shadow_page(0).unwrap();
        manager.map_shadow_page(0xFFFF_F000).unwrap();
    }
}
