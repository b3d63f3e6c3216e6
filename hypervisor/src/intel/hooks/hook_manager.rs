//! The hidden-hook engine. Every hooked 4 KiB guest frame owns a shadow
//! page carrying the modified bytes (a hidden breakpoint or a detour jump)
//! while the original frame keeps serving data reads and writes. The EPT
//! leaf for the frame is only ever in one of two configurations:
//!
//! * "data": original frame, read/write, no execute
//! * "exec": shadow frame, execute only
//!
//! EPT violations flip between them and the monitor trap flag re-arms the
//! opposite configuration after exactly one guest instruction. The same
//! machinery, minus the shadow page, implements refcounted access watches.

use {
    crate::{
        error::HypervisorError,
        intel::{
            addresses::PhysicalAddress,
            ept::{AccessType, Entry, Ept},
            hooks::{
                inline::{jmp_shellcode, DetourHandler, DetourHook, BREAKPOINT_OPCODE, JMP_SHELLCODE_LEN},
                memory_manager::MemoryManager,
            },
            paging::GuestPageWalk,
        },
    },
    alloc::vec::Vec,
    lazy_static::lazy_static,
    log::*,
    spin::Mutex,
    x86::bits64::paging::{BASE_PAGE_SIZE, LARGE_PAGE_SIZE},
};

/// Lifecycle of a hooked page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookState {
    Installed,
    PendingRestore,
    Restored,
}

/// What kind of interception a page is carrying.
#[derive(Debug)]
pub enum HookKind {
    /// Hidden breakpoints: 0xCC planted in the shadow page at each offset.
    Breakpoint { offsets: Vec<u16> },

    /// Hidden detours: an absolute jump in the shadow page into a per-hook
    /// trampoline.
    Detour { hooks: Vec<DetourHook> },

    /// A refcounted access watch; no shadow page involvement.
    AccessWatch { watched: AccessType, refcount: u32 },
}

/// One hooked 4 KiB guest frame.
#[derive(Debug)]
pub struct HookedPage {
    /// 4 KiB aligned guest physical address of the frame.
    pub guest_page_pa: u64,

    /// 2 MiB aligned address of the region split for this hook.
    pub guest_large_page_pa: u64,

    /// CR3 the virtual addresses were resolved under at install time.
    pub cr3: u64,

    /// Virtual addresses hooked on this page.
    pub hooked_vas: Vec<u64>,

    /// The permission mask the installer asked to trap.
    pub requested_mask: AccessType,

    /// The leaf as it was before the hook was applied.
    pub original_pte: Option<Entry>,

    pub kind: HookKind,
    pub state: HookState,
}

impl HookedPage {
    /// Whether the page currently multiplexes a shadow frame.
    pub fn is_hidden(&self) -> bool {
        matches!(self.kind, HookKind::Breakpoint { .. } | HookKind::Detour { .. })
    }
}

/// Which configuration the MTF handler must re-arm after a single step.
#[derive(Debug, Clone, Copy)]
pub enum MtfRearm {
    /// Swap back to the shadow frame, execute-only.
    ExecConfiguration { guest_page_pa: u64 },

    /// Re-clear the watched bits on the original frame.
    WatchConfiguration { guest_page_pa: u64, watched: AccessType },
}

pub struct HookManager {
    pub memory_manager: MemoryManager,
    pub hooked_pages: Vec<HookedPage>,
}

lazy_static! {
    /// The process-wide hook state. The lock is a spin lock taken at
    /// dispatch IRQL or in VMX root; hold times are bounded by one page
    /// operation.
    pub static ref SHARED_HOOK_MANAGER: Mutex<HookManager> =
        Mutex::new(HookManager::new().expect("failed to pre-allocate hook pools"));
}

impl HookManager {
    pub fn new() -> Result<Self, HypervisorError> {
        trace!("Initializing hook manager");

        Ok(Self {
            memory_manager: MemoryManager::new()?,
            hooked_pages: Vec::new(),
        })
    }

    pub fn find_by_pa(&self, guest_pa: u64) -> Option<usize> {
        let page_pa = guest_pa & !(BASE_PAGE_SIZE as u64 - 1);
        self.hooked_pages
            .iter()
            .position(|page| page.guest_page_pa == page_pa && page.state == HookState::Installed)
    }

    pub fn find_by_va(&self, va: u64) -> Option<usize> {
        self.hooked_pages.iter().position(|page| {
            page.state == HookState::Installed && page.hooked_vas.contains(&va)
        })
    }

    /// Installs a hidden breakpoint at `va` resolved under `cr3`. The guest
    /// keeps reading original bytes; executing the byte delivers #BP to the
    /// dispatcher.
    pub fn install_breakpoint(
        &mut self,
        ept: &mut Ept,
        va: u64,
        cr3: u64,
    ) -> Result<(), HypervisorError> {
        let (guest_page_pa, offset) = resolve_target(va, cr3)?;
        debug!("Hidden breakpoint: VA {:#x} -> PA {:#x}+{:#x}", va, guest_page_pa, offset);

        let index = self.prepare_hidden_page(ept, guest_page_pa, cr3)?;

        let shadow = self
            .memory_manager
            .shadow_page_as_mut(guest_page_pa)
            .ok_or(HypervisorError::ShadowPageNotFound)?;
        shadow.0[offset as usize] = BREAKPOINT_OPCODE;

        let page = &mut self.hooked_pages[index];
        match &mut page.kind {
            HookKind::Breakpoint { offsets } => offsets.push(offset),
            _ => return Err(HypervisorError::HookConflict),
        }
        page.hooked_vas.push(va);

        self.apply_exec_configuration(ept, guest_page_pa)
    }

    /// Installs a hidden detour at `va`: executing the function first runs
    /// `handler(regs, va)`, then the displaced original instructions.
    pub fn install_detour(
        &mut self,
        ept: &mut Ept,
        va: u64,
        handler: DetourHandler,
        cr3: u64,
    ) -> Result<(), HypervisorError> {
        let (guest_page_pa, offset) = resolve_target(va, cr3)?;
        debug!("Hidden detour: VA {:#x} -> PA {:#x}+{:#x}", va, guest_page_pa, offset);

        if BASE_PAGE_SIZE - (offset as usize) < JMP_SHELLCODE_LEN {
            // The jump may not straddle the frame; the next page can map
            // anywhere.
            return Err(HypervisorError::HookConflict);
        }

        let index = self.prepare_hidden_page_as_detour(ept, guest_page_pa, cr3)?;
        let fresh_page = self.hooked_pages[index].hooked_vas.is_empty();

        // Decode from the still-unpatched shadow copy. The window is bounded
        // by the frame: instructions may not be displaced across it.
        let mut code_window = [0u8; 64];
        let window_len = (BASE_PAGE_SIZE - offset as usize).min(code_window.len());
        {
            let shadow = self
                .memory_manager
                .shadow_page_as_mut(guest_page_pa)
                .ok_or(HypervisorError::ShadowPageNotFound)?;
            code_window[..window_len]
                .copy_from_slice(&shadow.0[offset as usize..offset as usize + window_len]);
        }

        let hook = match DetourHook::new(va, &code_window[..window_len], handler) {
            Ok(hook) => hook,
            Err(error) => {
                if fresh_page {
                    self.hooked_pages.remove(index);
                    let _ = self.memory_manager.unmap_shadow_page(guest_page_pa);
                }
                return Err(error);
            }
        };

        // Plant the jump over the shadow copy only.
        let shellcode = jmp_shellcode(hook.thunk_va());
        let shadow = self
            .memory_manager
            .shadow_page_as_mut(guest_page_pa)
            .ok_or(HypervisorError::ShadowPageNotFound)?;
        shadow.0[offset as usize..offset as usize + JMP_SHELLCODE_LEN]
            .copy_from_slice(&shellcode);

        let page = &mut self.hooked_pages[index];
        match &mut page.kind {
            HookKind::Detour { hooks } => hooks.push(hook),
            _ => return Err(HypervisorError::HookConflict),
        }
        page.hooked_vas.push(va);

        self.apply_exec_configuration(ept, guest_page_pa)
    }

    /// Installs (or references) an access watch clearing `watched` on the
    /// page containing `va`. Violations are reported upward and the
    /// offending instruction is single-stepped with the bits restored.
    pub fn install_access_watch(
        &mut self,
        ept: &mut Ept,
        va: u64,
        cr3: u64,
        watched: AccessType,
    ) -> Result<(), HypervisorError> {
        let (guest_page_pa, _) = resolve_target(va, cr3)?;
        debug!("Access watch {:?}: VA {:#x} -> PA {:#x}", watched, va, guest_page_pa);

        if let Some(index) = self.find_by_pa(guest_page_pa) {
            let page = &mut self.hooked_pages[index];
            match &mut page.kind {
                HookKind::AccessWatch { watched: existing, refcount } if *existing == watched => {
                    *refcount += 1;
                    page.hooked_vas.push(va);
                    return Ok(());
                }
                // A different mask, or a hidden hook, already owns the
                // frame.
                _ => return Err(HypervisorError::HookConflict),
            }
        }

        self.ensure_split(ept, guest_page_pa)?;

        let large = guest_page_pa & !(LARGE_PAGE_SIZE as u64 - 1);
        let pt = self
            .memory_manager
            .page_table_as_mut(large)
            .ok_or(HypervisorError::PageTableNotFound)?;
        let original_pte = ept.pte(guest_page_pa, pt);

        let mut page = HookedPage {
            guest_page_pa,
            guest_large_page_pa: large,
            cr3,
            hooked_vas: Vec::new(),
            requested_mask: watched,
            original_pte: Some(original_pte),
            kind: HookKind::AccessWatch { watched, refcount: 1 },
            state: HookState::Installed,
        };
        page.hooked_vas.push(va);
        self.hooked_pages.push(page);

        let remaining = AccessType::READ_WRITE_EXECUTE - watched;
        let pt = self
            .memory_manager
            .page_table_as_mut(large)
            .ok_or(HypervisorError::PageTableNotFound)?;
        ept.swap_page(guest_page_pa, guest_page_pa, remaining, pt)?;

        Ok(())
    }

    /// Handles an EPT violation on a hooked page: flips the leaf to the
    /// configuration the access needs and reports what the MTF handler must
    /// re-arm afterwards (if anything).
    pub fn handle_hooked_page(
        &mut self,
        ept: &mut Ept,
        guest_pa: u64,
        caused_by_fetch: bool,
    ) -> Result<Option<MtfRearm>, HypervisorError> {
        let index = self
            .find_by_pa(guest_pa)
            .ok_or(HypervisorError::HookNotFound)?;
        let page = &self.hooked_pages[index];
        let guest_page_pa = page.guest_page_pa;
        let large = page.guest_large_page_pa;

        match &page.kind {
            HookKind::Breakpoint { .. } | HookKind::Detour { .. } => {
                let shadow_pa = self
                    .memory_manager
                    .shadow_page_ptr(guest_page_pa)
                    .map(PhysicalAddress::pa_from_va)
                    .ok_or(HypervisorError::ShadowPageNotFound)?;
                let pt = self
                    .memory_manager
                    .page_table_as_mut(large)
                    .ok_or(HypervisorError::PageTableNotFound)?;

                if caused_by_fetch {
                    // Execution wants the shadow frame.
                    ept.swap_page(guest_page_pa, shadow_pa, AccessType::EXECUTE, pt)?;
                    Ok(None)
                } else {
                    // A read or write wants the original frame. One
                    // instruction later the MTF handler re-arms execution.
                    ept.swap_page(guest_page_pa, guest_page_pa, AccessType::READ_WRITE, pt)?;
                    Ok(Some(MtfRearm::ExecConfiguration { guest_page_pa }))
                }
            }
            HookKind::AccessWatch { watched, .. } => {
                let watched = *watched;
                let pt = self
                    .memory_manager
                    .page_table_as_mut(large)
                    .ok_or(HypervisorError::PageTableNotFound)?;

                // Temporarily restore the watched bits so the faulting
                // access retires, then re-arm after the single step.
                ept.swap_page(
                    guest_page_pa,
                    guest_page_pa,
                    AccessType::READ_WRITE_EXECUTE,
                    pt,
                )?;
                Ok(Some(MtfRearm::WatchConfiguration { guest_page_pa, watched }))
            }
        }
    }

    /// Completes the data/exec toggle after the MTF single step.
    pub fn rearm(&mut self, ept: &mut Ept, rearm: MtfRearm) -> Result<(), HypervisorError> {
        match rearm {
            MtfRearm::ExecConfiguration { guest_page_pa } => {
                self.apply_exec_configuration(ept, guest_page_pa)
            }
            MtfRearm::WatchConfiguration { guest_page_pa, watched } => {
                let large = guest_page_pa & !(LARGE_PAGE_SIZE as u64 - 1);
                let pt = self
                    .memory_manager
                    .page_table_as_mut(large)
                    .ok_or(HypervisorError::PageTableNotFound)?;
                ept.swap_page(
                    guest_page_pa,
                    guest_page_pa,
                    AccessType::READ_WRITE_EXECUTE - watched,
                    pt,
                )
            }
        }
    }

    /// Removes the hook covering `va` (or `pa` when no VA is known),
    /// restoring the original bytes, the saved leaf, and the pool entries.
    pub fn unhook_single_address(
        &mut self,
        ept: &mut Ept,
        va: u64,
        pa: u64,
        cr3: u64,
    ) -> Result<(), HypervisorError> {
        let index = if va != 0 {
            self.find_by_va(va).or_else(|| {
                resolve_target(va, cr3)
                    .ok()
                    .and_then(|(page_pa, _)| self.find_by_pa(page_pa))
            })
        } else {
            self.find_by_pa(pa)
        }
        .ok_or(HypervisorError::HookNotFound)?;

        self.remove_page(ept, index, Some(va))
    }

    /// Removes every installed hook.
    pub fn unhook_all(&mut self, ept: &mut Ept) -> Result<(), HypervisorError> {
        while let Some(index) = self
            .hooked_pages
            .iter()
            .position(|page| page.state == HookState::Installed)
        {
            self.remove_page(ept, index, None)?;
        }
        self.hooked_pages.clear();
        Ok(())
    }

    /// Drops the hook records and the pooled backing memory. Only sound
    /// after every core left VMX operation; nothing can fault into the
    /// engine anymore.
    pub fn release(&mut self) {
        self.hooked_pages.clear();
        self.memory_manager = MemoryManager::empty();
    }

    /// Number of installed hooks, split by hidden and watch flavors.
    pub fn count(&self) -> (usize, usize) {
        let hidden = self
            .hooked_pages
            .iter()
            .filter(|p| p.state == HookState::Installed && p.is_hidden())
            .count();
        let watches = self
            .hooked_pages
            .iter()
            .filter(|p| p.state == HookState::Installed && !p.is_hidden())
            .count();
        (hidden, watches)
    }

    /// `unhooked_va` is `Some` for a single-address uninstall, which on a
    /// refcounted watch drops one reference and leaves the leaf armed;
    /// `None` (teardown of everything) skips the refcount and restores
    /// unconditionally.
    fn remove_page(
        &mut self,
        ept: &mut Ept,
        index: usize,
        unhooked_va: Option<u64>,
    ) -> Result<(), HypervisorError> {
        if let Some(va) = unhooked_va {
            let page = &mut self.hooked_pages[index];
            if let HookKind::AccessWatch { refcount, .. } = &mut page.kind {
                if *refcount > 1 {
                    // Not the last uninstall: the original PTE stays saved
                    // and the watch keeps firing for the remaining holders.
                    *refcount -= 1;
                    if let Some(position) =
                        page.hooked_vas.iter().position(|&hooked| hooked == va)
                    {
                        page.hooked_vas.remove(position);
                    }
                    return Ok(());
                }
            }
        }

        let page = &mut self.hooked_pages[index];
        page.state = HookState::PendingRestore;
        let guest_page_pa = page.guest_page_pa;
        let large = page.guest_large_page_pa;
        let hidden = page.is_hidden();
        let original_pte = page.original_pte.take();

        if hidden {
            // Scrub the shadow copy back to the original bytes before the
            // frame is released.
            if let Some(shadow) = self.memory_manager.shadow_page_as_mut(guest_page_pa) {
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        PhysicalAddress::va_from_pa(guest_page_pa) as *const u8,
                        shadow.as_mut_ptr(),
                        BASE_PAGE_SIZE,
                    );
                }
            }
        }

        if let Some(original) = original_pte {
            let pt = self
                .memory_manager
                .page_table_as_mut(large)
                .ok_or(HypervisorError::PageTableNotFound)?;
            ept.set_pte(guest_page_pa, original, pt);
        }
        #[cfg(not(test))]
        {
            crate::intel::invept::invept_all_contexts();
            crate::intel::invvpid::invvpid_all_contexts();
        }

        if hidden {
            self.memory_manager.unmap_shadow_page(guest_page_pa)?;
        }

        // The split itself stays in place: restoring the saved leaf undoes
        // the hook, and other hooks may share the 2 MiB region.
        self.hooked_pages.remove(index);
        Ok(())
    }

    /// Creates (or finds) the hooked-page record for a hidden breakpoint
    /// page and copies the original frame into its shadow.
    fn prepare_hidden_page(
        &mut self,
        ept: &mut Ept,
        guest_page_pa: u64,
        cr3: u64,
    ) -> Result<usize, HypervisorError> {
        self.prepare_hidden_common(ept, guest_page_pa, cr3, false)
    }

    fn prepare_hidden_page_as_detour(
        &mut self,
        ept: &mut Ept,
        guest_page_pa: u64,
        cr3: u64,
    ) -> Result<usize, HypervisorError> {
        self.prepare_hidden_common(ept, guest_page_pa, cr3, true)
    }

    fn prepare_hidden_common(
        &mut self,
        ept: &mut Ept,
        guest_page_pa: u64,
        cr3: u64,
        detour: bool,
    ) -> Result<usize, HypervisorError> {
        if let Some(index) = self.find_by_pa(guest_page_pa) {
            // Sharing is fine between hooks of the same style; a watch or
            // the other hidden style is a conflict.
            let compatible = match (&self.hooked_pages[index].kind, detour) {
                (HookKind::Breakpoint { .. }, false) => true,
                (HookKind::Detour { .. }, true) => true,
                _ => false,
            };
            return if compatible {
                Ok(index)
            } else {
                Err(HypervisorError::HookConflict)
            };
        }

        self.ensure_split(ept, guest_page_pa)?;

        let large = guest_page_pa & !(LARGE_PAGE_SIZE as u64 - 1);
        let original_pte = {
            let pt = self
                .memory_manager
                .page_table_as_mut(large)
                .ok_or(HypervisorError::PageTableNotFound)?;
            ept.pte(guest_page_pa, pt)
        };

        self.memory_manager.map_shadow_page(guest_page_pa)?;
        let shadow = self
            .memory_manager
            .shadow_page_as_mut(guest_page_pa)
            .ok_or(HypervisorError::ShadowPageNotFound)?;
        unsafe {
            core::ptr::copy_nonoverlapping(
                PhysicalAddress::va_from_pa(guest_page_pa) as *const u8,
                shadow.as_mut_ptr(),
                BASE_PAGE_SIZE,
            );
        }

        self.hooked_pages.push(HookedPage {
            guest_page_pa,
            guest_large_page_pa: large,
            cr3,
            hooked_vas: Vec::new(),
            requested_mask: AccessType::EXECUTE,
            original_pte: Some(original_pte),
            kind: if detour {
                HookKind::Detour { hooks: Vec::new() }
            } else {
                HookKind::Breakpoint { offsets: Vec::new() }
            },
            state: HookState::Installed,
        });

        Ok(self.hooked_pages.len() - 1)
    }

    /// Points the leaf at the shadow frame, execute-only.
    fn apply_exec_configuration(
        &mut self,
        ept: &mut Ept,
        guest_page_pa: u64,
    ) -> Result<(), HypervisorError> {
        let shadow_pa = self
            .memory_manager
            .shadow_page_ptr(guest_page_pa)
            .map(PhysicalAddress::pa_from_va)
            .ok_or(HypervisorError::ShadowPageNotFound)?;

        let large = guest_page_pa & !(LARGE_PAGE_SIZE as u64 - 1);
        let pt = self
            .memory_manager
            .page_table_as_mut(large)
            .ok_or(HypervisorError::PageTableNotFound)?;

        ept.swap_page(guest_page_pa, shadow_pa, AccessType::EXECUTE, pt)
    }

    /// Splits the hosting 2 MiB region using a pooled table, once.
    fn ensure_split(&mut self, ept: &mut Ept, guest_page_pa: u64) -> Result<(), HypervisorError> {
        let large = guest_page_pa & !(LARGE_PAGE_SIZE as u64 - 1);
        if self.memory_manager.is_large_page_split(large) {
            return Ok(());
        }

        self.memory_manager.map_page_table(large)?;
        let pt = self
            .memory_manager
            .page_table_as_mut(large)
            .ok_or(HypervisorError::PageTableNotFound)?;
        ept.split_2mb_to_4kb(large, pt)
    }
}

/// Resolves a hook target to its guest frame and in-page offset under the
/// given address space.
fn resolve_target(va: u64, cr3: u64) -> Result<(u64, u16), HypervisorError> {
    let pa = GuestPageWalk::new(cr3)
        .translate(va)
        .ok_or(HypervisorError::GuestVirtualTranslationFailed)?;
    Ok((
        pa & !(BASE_PAGE_SIZE as u64 - 1),
        (pa & (BASE_PAGE_SIZE as u64 - 1)) as u16,
    ))
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            allocate::box_zeroed,
            intel::{
                hooks::inline::DetourRegisters,
                mtrr::{MemoryType, MemoryTypeRange, MtrrMap},
                page::Page,
            },
        },
        alloc::{boxed::Box, vec},
        x86::bits64::paging::BASE_PAGE_SHIFT,
    };

    const PRESENT: u64 = 1;

    #[repr(C, align(4096))]
    struct TestTable([u64; 512]);

    // A synthetic guest address space mapping VA 0x3000 at a heap frame,
    // walkable through the test build's identity PA<->VA view.
    struct GuestSpace {
        pml4: Box<TestTable>,
        pdpt: Box<TestTable>,
        pd: Box<TestTable>,
        pt: Box<TestTable>,
        frame: Box<Page>,
    }

    impl GuestSpace {
        const HOOK_VA: u64 = 0x3000;

        fn new() -> Self {
            let mut space = Self {
                pml4: unsafe { box_zeroed::<TestTable>() },
                pdpt: unsafe { box_zeroed::<TestTable>() },
                pd: unsafe { box_zeroed::<TestTable>() },
                pt: unsafe { box_zeroed::<TestTable>() },
                frame: unsafe { box_zeroed::<Page>() },
            };
            space.pml4.0[0] = space.pdpt.0.as_ptr() as u64 | PRESENT;
            space.pdpt.0[0] = space.pd.0.as_ptr() as u64 | PRESENT;
            space.pd.0[0] = space.pt.0.as_ptr() as u64 | PRESENT;
            space.pt.0[3] = space.frame.as_ptr() as u64 | PRESENT;

            // A realistic prologue at the hook target.
            space.frame.0[..8].copy_from_slice(&[
                0x48, 0x89, 0x5C, 0x24, 0x08, // mov [rsp+8], rbx
                0x57, // push rdi
                0x31, 0xC0, // xor eax, eax
            ]);
            // Padding the displaced window with single-byte instructions.
            for byte in space.frame.0[8..32].iter_mut() {
                *byte = 0x90;
            }
            space
        }

        fn cr3(&self) -> u64 {
            self.pml4.0.as_ptr() as u64
        }

        fn frame_pa(&self) -> u64 {
            self.frame.as_ptr() as u64
        }
    }

    fn test_ept() -> Box<Ept> {
        let map = MtrrMap::from_components(
            vec![MemoryTypeRange {
                base: 0,
                end: u64::MAX,
                memory_type: MemoryType::WriteBack,
                fixed: false,
            }],
            MemoryType::WriteBack,
        )
        .unwrap();
        let mut ept = unsafe { box_zeroed::<Ept>() };
        ept.build_identity(&map).unwrap();
        ept
    }

    extern "win64" fn nop_handler(_regs: *mut DetourRegisters, _va: u64) {}

    #[test]
    fn breakpoint_hook_keeps_original_bytes_readable() {
        let space = GuestSpace::new();
        let mut ept = test_ept();
        let mut manager = HookManager::new().unwrap();

        manager
            .install_breakpoint(&mut ept, GuestSpace::HOOK_VA, space.cr3())
            .unwrap();

        // The original frame is untouched; only the shadow carries 0xCC.
        assert_eq!(space.frame.0[0], 0x48);
        let shadow_va = manager
            .memory_manager
            .shadow_page_ptr(space.frame_pa())
            .unwrap();
        let shadow = unsafe { &*(shadow_va as *const Page) };
        assert_eq!(shadow.0[0], BREAKPOINT_OPCODE);
        assert_eq!(&shadow.0[1..8], &space.frame.0[1..8]);

        // The leaf is in the exec configuration: shadow frame, execute only.
        let large = space.frame_pa() & !(LARGE_PAGE_SIZE as u64 - 1);
        let pt = manager.memory_manager.page_table_as_mut(large).unwrap();
        let pte = ept.pte(space.frame_pa(), pt);
        assert!(pte.executable() && !pte.readable() && !pte.writable());
        assert_eq!(pte.pfn() << BASE_PAGE_SHIFT, shadow_va);

        assert!(manager.find_by_va(GuestSpace::HOOK_VA).is_some());
        assert_eq!(manager.count(), (1, 0));
    }

    #[test]
    fn violation_flip_and_mtf_rearm_cycle() {
        let space = GuestSpace::new();
        let mut ept = test_ept();
        let mut manager = HookManager::new().unwrap();

        manager
            .install_breakpoint(&mut ept, GuestSpace::HOOK_VA, space.cr3())
            .unwrap();

        // A data read faults against the exec configuration: the engine
        // flips to the original frame read-write and asks for an MTF rearm.
        let rearm = manager
            .handle_hooked_page(&mut ept, space.frame_pa(), false)
            .unwrap()
            .expect("data access must schedule a rearm");

        let large = space.frame_pa() & !(LARGE_PAGE_SIZE as u64 - 1);
        {
            let pt = manager.memory_manager.page_table_as_mut(large).unwrap();
            let pte = ept.pte(space.frame_pa(), pt);
            assert!(pte.readable() && pte.writable() && !pte.executable());
            assert_eq!(pte.pfn() << BASE_PAGE_SHIFT, space.frame_pa());
        }

        // After the single step the exec configuration returns.
        manager.rearm(&mut ept, rearm).unwrap();
        let shadow_pa = manager
            .memory_manager
            .shadow_page_ptr(space.frame_pa())
            .unwrap();
        let pt = manager.memory_manager.page_table_as_mut(large).unwrap();
        let pte = ept.pte(space.frame_pa(), pt);
        assert!(pte.executable() && !pte.readable() && !pte.writable());
        assert_eq!(pte.pfn() << BASE_PAGE_SHIFT, shadow_pa);

        // An instruction fetch against the data configuration needs no MTF.
        manager
            .handle_hooked_page(&mut ept, space.frame_pa(), false)
            .unwrap();
        let fetch_rearm = manager
            .handle_hooked_page(&mut ept, space.frame_pa(), true)
            .unwrap();
        assert!(fetch_rearm.is_none());
    }

    #[test]
    fn detour_hook_plants_jump_in_shadow_only() {
        let space = GuestSpace::new();
        let mut ept = test_ept();
        let mut manager = HookManager::new().unwrap();

        manager
            .install_detour(&mut ept, GuestSpace::HOOK_VA, nop_handler, space.cr3())
            .unwrap();

        let shadow_va = manager
            .memory_manager
            .shadow_page_ptr(space.frame_pa())
            .unwrap();
        let shadow = unsafe { &*(shadow_va as *const Page) };
        assert_eq!(&shadow.0[..2], &[0xff, 0x25]);
        // Original bytes stay pristine for data reads.
        assert_eq!(space.frame.0[0], 0x48);

        match &manager.hooked_pages[0].kind {
            HookKind::Detour { hooks } => {
                assert_eq!(hooks.len(), 1);
                assert_eq!(hooks[0].hooked_va(), GuestSpace::HOOK_VA);
                // 14 bytes of jump displace 5+1+2+nops up to >= 14.
                assert!(hooks[0].displaced_len() >= JMP_SHELLCODE_LEN);
                assert_eq!(
                    hooks[0].return_va(),
                    GuestSpace::HOOK_VA + hooks[0].displaced_len() as u64
                );
            }
            other => panic!("unexpected hook kind: {other:?}"),
        }
    }

    #[test]
    fn incompatible_masks_on_same_frame_are_rejected() {
        let space = GuestSpace::new();
        let mut ept = test_ept();
        let mut manager = HookManager::new().unwrap();

        manager
            .install_breakpoint(&mut ept, GuestSpace::HOOK_VA, space.cr3())
            .unwrap();

        // An access watch cannot share a frame with a hidden exec hook.
        let conflict = manager.install_access_watch(
            &mut ept,
            GuestSpace::HOOK_VA + 0x10,
            space.cr3(),
            AccessType::WRITE,
        );
        assert!(matches!(conflict, Err(HypervisorError::HookConflict)));

        // Another hidden breakpoint on the same frame shares the shadow.
        manager
            .install_breakpoint(&mut ept, GuestSpace::HOOK_VA + 0x20, space.cr3())
            .unwrap();
        assert_eq!(manager.count(), (1, 0));
        assert_eq!(manager.hooked_pages[0].hooked_vas.len(), 2);
    }

    #[test]
    fn access_watch_refcounts_and_conflicts() {
        let space = GuestSpace::new();
        let mut ept = test_ept();
        let mut manager = HookManager::new().unwrap();

        manager
            .install_access_watch(&mut ept, GuestSpace::HOOK_VA, space.cr3(), AccessType::WRITE)
            .unwrap();

        // The data leaf lost only the watched bit.
        let large = space.frame_pa() & !(LARGE_PAGE_SIZE as u64 - 1);
        {
            let pt = manager.memory_manager.page_table_as_mut(large).unwrap();
            let pte = ept.pte(space.frame_pa(), pt);
            assert!(pte.readable() && pte.executable() && !pte.writable());
        }

        // Same mask: shared, refcounted.
        manager
            .install_access_watch(
                &mut ept,
                GuestSpace::HOOK_VA + 8,
                space.cr3(),
                AccessType::WRITE,
            )
            .unwrap();
        match &manager.hooked_pages[0].kind {
            HookKind::AccessWatch { refcount, .. } => assert_eq!(*refcount, 2),
            other => panic!("unexpected hook kind: {other:?}"),
        }

        // Different mask: rejected.
        let conflict = manager.install_access_watch(
            &mut ept,
            GuestSpace::HOOK_VA,
            space.cr3(),
            AccessType::READ,
        );
        assert!(matches!(conflict, Err(HypervisorError::HookConflict)));
    }

    #[test]
    fn refcounted_watch_survives_partial_unhook() {
        let space = GuestSpace::new();
        let mut ept = test_ept();
        let mut manager = HookManager::new().unwrap();

        manager
            .install_access_watch(&mut ept, GuestSpace::HOOK_VA, space.cr3(), AccessType::WRITE)
            .unwrap();
        manager
            .install_access_watch(
                &mut ept,
                GuestSpace::HOOK_VA + 8,
                space.cr3(),
                AccessType::WRITE,
            )
            .unwrap();

        // Removing one of the two holders drops a reference only; the
        // other holder's watch stays armed on the leaf.
        manager
            .unhook_single_address(&mut ept, GuestSpace::HOOK_VA, 0, space.cr3())
            .unwrap();

        assert_eq!(manager.count(), (0, 1));
        let page = &manager.hooked_pages[0];
        assert_eq!(page.hooked_vas.as_slice(), &[GuestSpace::HOOK_VA + 8]);
        assert!(page.original_pte.is_some());
        match &page.kind {
            HookKind::AccessWatch { refcount, .. } => assert_eq!(*refcount, 1),
            other => panic!("unexpected hook kind: {other:?}"),
        }

        let large = space.frame_pa() & !(LARGE_PAGE_SIZE as u64 - 1);
        {
            let pt = manager.memory_manager.page_table_as_mut(large).unwrap();
            let pte = ept.pte(space.frame_pa(), pt);
            assert!(pte.readable() && pte.executable() && !pte.writable());
        }

        // The last uninstall restores the original PTE byte for byte.
        let saved = manager.hooked_pages[0].original_pte.unwrap();
        manager
            .unhook_single_address(&mut ept, GuestSpace::HOOK_VA + 8, 0, space.cr3())
            .unwrap();

        let pt = manager.memory_manager.page_table_as_mut(large).unwrap();
        assert_eq!(ept.pte(space.frame_pa(), pt).0, saved.0);
        assert!(manager.hooked_pages.is_empty());
    }

    #[test]
    fn unhook_restores_leaf_byte_for_byte() {
        let space = GuestSpace::new();
        let mut ept = test_ept();
        let mut manager = HookManager::new().unwrap();

        // Snapshot what the leaf will look like pre-hook by splitting a
        // scratch copy of the same region.
        manager
            .install_breakpoint(&mut ept, GuestSpace::HOOK_VA, space.cr3())
            .unwrap();
        let saved = manager.hooked_pages[0].original_pte.unwrap();

        manager
            .unhook_single_address(&mut ept, GuestSpace::HOOK_VA, 0, space.cr3())
            .unwrap();

        let large = space.frame_pa() & !(LARGE_PAGE_SIZE as u64 - 1);
        let pt = manager.memory_manager.page_table_as_mut(large).unwrap();
        let restored = ept.pte(space.frame_pa(), pt);
        assert_eq!(restored.0, saved.0);

        assert!(manager.hooked_pages.is_empty());
        assert!(!manager.memory_manager.is_shadow_page_mapped(space.frame_pa()));
        assert_eq!(manager.count(), (0, 0));
    }

    #[test]
    fn unhook_unknown_address_fails() {
        let space = GuestSpace::new();
        let mut ept = test_ept();
        let mut manager = HookManager::new().unwrap();

        let result =
            manager.unhook_single_address(&mut ept, GuestSpace::HOOK_VA, 0, space.cr3());
        assert!(matches!(result, Err(HypervisorError::HookNotFound)));
    }
}
