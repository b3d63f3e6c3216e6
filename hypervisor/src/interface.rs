//! The surface consumed by the upper debugger layers: hook installation,
//! per-core interception configuration, event injection and the callback
//! registry through which intercepted guest events are delivered. All calls
//! happen in VMX non-root; the per-core effects are marshaled through the
//! broadcast layer and applied in root via VMCALL.

use {
    crate::{
        error::HypervisorError,
        intel::{
            capture::GuestRegisters,
            events::InterruptionType,
            hooks::{hook_manager::SHARED_HOOK_MANAGER, inline::DetourHandler, syscall::SyscallHookType},
            vmerror::EptViolationQualification,
        },
        vmm,
        windows::{
            broadcast::{run_on_all_cores, run_on_single_core, BroadcastTask},
            nt::process_cr3,
            processor::processor_count,
        },
    },
    log::*,
    spin::RwLock,
    x86::cpuid::CpuIdResult,
};

/// A configuration request targeting every core or one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreSelection {
    AllCores,
    SingleCore(u32),
}

/// Callbacks the upper layers register to receive typed guest events. Every
/// callback runs in VMX root with interrupts disabled and must not block.
/// A `true` return means the event was consumed and the default reflection
/// is skipped.
#[derive(Default, Clone, Copy)]
pub struct EventCallbacks {
    /// CPUID interception; may rewrite the result.
    pub cpuid: Option<fn(leaf: u32, subleaf: u32, result: &mut CpuIdResult) -> bool>,

    /// Bitmap-gated RDMSR; may substitute the value.
    pub msr_read: Option<fn(core: u32, msr: u32, value: &mut u64) -> bool>,

    /// Bitmap-gated WRMSR; returning true suppresses the write.
    pub msr_write: Option<fn(core: u32, msr: u32, value: u64) -> bool>,

    /// Bitmap-gated port I/O; may emulate the whole access.
    pub io_access: Option<fn(core: u32, port: u16, is_in: bool, size: u8, value: &mut u64) -> bool>,

    /// Context-switch event: MOV to CR3 observed with reporting enabled.
    pub mov_to_cr3: Option<fn(core: u32, new_cr3: u64)>,

    /// Breakpoint (#BP) hit; returning false re-injects into the guest.
    pub breakpoint: Option<fn(core: u32, regs: &mut GuestRegisters) -> bool>,

    /// Page fault seen while #PF interception is armed; returning false
    /// re-injects with the original error code.
    pub page_fault: Option<fn(core: u32, faulting_address: u64, error_code: u32) -> bool>,

    /// An access watch fired on a hooked page.
    pub memory_access: Option<fn(core: u32, gpa: u64, qualification: EptViolationQualification)>,

    /// Acknowledged external interrupt; returning false re-injects it.
    pub external_interrupt: Option<fn(core: u32, vector: u32) -> bool>,

    /// MOV to/from a debug register while DR exiting is armed.
    pub mov_to_dr: Option<fn(core: u32, dr: u64, is_read: bool)>,

    /// VMX preemption timer expiry.
    pub preemption_timer: Option<fn(core: u32)>,

    /// An MTF single step not owned by the hook engine.
    pub monitor_trap: Option<fn(core: u32, regs: &mut GuestRegisters)>,

    /// Emulated SYSCALL/SYSRET while the EFER hook is active.
    pub syscall_event: Option<fn(core: u32, rip: u64, is_sysret: bool)>,
}

static CALLBACKS: RwLock<EventCallbacks> = RwLock::new(EventCallbacks {
    cpuid: None,
    msr_read: None,
    msr_write: None,
    io_access: None,
    mov_to_cr3: None,
    breakpoint: None,
    page_fault: None,
    memory_access: None,
    external_interrupt: None,
    mov_to_dr: None,
    preemption_timer: None,
    monitor_trap: None,
    syscall_event: None,
});

/// Replaces the registered callback set.
pub fn register_callbacks(callbacks: EventCallbacks) {
    *CALLBACKS.write() = callbacks;
}

/// Snapshot of the callback set for use inside handlers.
pub fn callbacks() -> EventCallbacks {
    *CALLBACKS.read()
}

/// Virtualizes the running system. Returns true when every logical
/// processor answered the VMCALL liveness test.
pub fn initialize() -> bool {
    match vmm::initialize() {
        Ok(()) => true,
        Err(error) => {
            error!("Hypervisor initialization failed: {:?}", error);
            false
        }
    }
}

/// Devirtualizes every core and releases all owned memory.
pub fn terminate() {
    if let Err(error) = vmm::terminate() {
        error!("Hypervisor termination failed: {:?}", error);
    }
}

/// VMCALL numbers: the wire protocol between non-root callers and the
/// root-mode handler.
#[repr(u64)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Vmcall {
    Test = 0x01,
    Vmxoff = 0x02,
    ChangePageAttrib = 0x03,
    InveptSingleContext = 0x04,
    InveptAllContexts = 0x05,
    UnhookAllPages = 0x06,
    UnhookSinglePage = 0x07,
    EnableSyscallHookEfer = 0x08,
    DisableSyscallHookEfer = 0x09,
    ChangeMsrBitmapRead = 0x0A,
    ChangeMsrBitmapWrite = 0x0B,
    SetRdtscExiting = 0x0C,
    SetRdpmcExiting = 0x0D,
    SetExceptionBitmap = 0x0E,
    SetMovToDrExiting = 0x0F,
    SetExternalInterruptExiting = 0x10,
    SetMovToCr3Exiting = 0x11,
    ChangeIoBitmap = 0x12,
    SetPreemptionTimer = 0x13,
    InjectPendingEvent = 0x14,
    SetMovToCrExiting = 0x15,
    EnableModeBasedExecHook = 0x16,
    DisableModeBasedExecHook = 0x17,
    EnableDirtyLogging = 0x18,
    DisableDirtyLogging = 0x19,
}

/// A hook request marshaled from non-root into the root-mode VMCALL
/// handler. Lives in nonpaged memory so the root side can read it under the
/// SYSTEM address space.
#[repr(C)]
pub struct HookRequest {
    pub kind: HookRequestKind,
    pub va: u64,
    pub cr3: u64,
}

#[repr(C)]
pub enum HookRequestKind {
    Breakpoint,
    Detour { handler: DetourHandler },
    AccessWatch { read: bool, write: bool, execute: bool },
}

/// Installs a hidden breakpoint (0xCC) at `va` in the context of
/// `process_id` (0 = system). Guest reads of the page keep seeing the
/// original bytes.
pub fn ept_hook(va: u64, process_id: u32) -> bool {
    install_hook(HookRequestKind::Breakpoint, va, process_id)
}

/// Installs a detour-style hook or an access watch at `va`.
///
/// With `hidden` and `execute` set, `handler` runs before the original
/// instructions every time the guest calls `va`. Otherwise the requested
/// r/w/x bits become an access watch reported through
/// `EventCallbacks::memory_access`.
pub fn ept_hook2(
    va: u64,
    handler: DetourHandler,
    process_id: u32,
    read: bool,
    write: bool,
    execute: bool,
    hidden: bool,
) -> bool {
    let kind = if hidden && execute {
        HookRequestKind::Detour { handler }
    } else {
        HookRequestKind::AccessWatch { read, write, execute }
    };
    install_hook(kind, va, process_id)
}

fn install_hook(kind: HookRequestKind, va: u64, process_id: u32) -> bool {
    if !vmm::is_initialized() {
        error!("Hook requested before virtualization");
        return false;
    }

    let Some(cr3) = process_cr3(process_id) else {
        error!("No address space for process {process_id}");
        return false;
    };

    let request = alloc::boxed::Box::new(HookRequest { kind, va, cr3 });
    let status = crate::intel::support::vmcall(
        Vmcall::ChangePageAttrib as u64,
        request.as_ref() as *const _ as u64,
        0,
        0,
    );
    drop(request);

    if status != 0 {
        error!("Hook installation failed for VA {va:#x}: status {status:#x}");
        return false;
    }

    // Other cores may hold stale translations for the flipped leaf.
    let _ = run_on_all_cores(BroadcastTask::Vmcall {
        number: Vmcall::InveptAllContexts as u64,
        param1: 0,
        param2: 0,
    });

    true
}

/// Removes the hook covering `va` (or `pa` when the caller only knows the
/// physical address) and re-arms nothing: the leaf returns to its
/// pre-install state on every core.
pub fn ept_unhook(va: u64, pa: u64, process_id: u32) -> bool {
    if !vmm::is_initialized() {
        return false;
    }

    let cr3 = process_cr3(process_id).unwrap_or(0);
    let status = crate::intel::support::vmcall(Vmcall::UnhookSinglePage as u64, va, pa, cr3);
    if status != 0 {
        error!("Unhook failed for VA {va:#x}/PA {pa:#x}: status {status:#x}");
        return false;
    }

    let _ = run_on_all_cores(BroadcastTask::Vmcall {
        number: Vmcall::InveptAllContexts as u64,
        param1: 0,
        param2: 0,
    });
    true
}

/// Removes every installed hook.
pub fn ept_unhook_all() {
    if !vmm::is_initialized() {
        return;
    }
    let _ = crate::intel::support::vmcall(Vmcall::UnhookAllPages as u64, 0, 0, 0);
    let _ = run_on_all_cores(BroadcastTask::Vmcall {
        number: Vmcall::InveptAllContexts as u64,
        param1: 0,
        param2: 0,
    });
}

fn configure(selection: CoreSelection, number: Vmcall, param1: u64, param2: u64) -> bool {
    let task = BroadcastTask::Vmcall {
        number: number as u64,
        param1,
        param2,
    };
    let result = match selection {
        CoreSelection::AllCores => run_on_all_cores(task),
        CoreSelection::SingleCore(core) => run_on_single_core(core, task),
    };
    match result {
        Ok(()) => true,
        Err(error) => {
            error!("Configuration broadcast failed: {:?}", error);
            false
        }
    }
}

/// Reports every context switch (MOV to CR3) through the callback registry.
pub fn enable_mov_to_cr3_exiting(selection: CoreSelection) -> bool {
    configure(selection, Vmcall::SetMovToCr3Exiting, 1, 0)
}

pub fn disable_mov_to_cr3_exiting(selection: CoreSelection) -> bool {
    configure(selection, Vmcall::SetMovToCr3Exiting, 0, 0)
}

pub fn enable_external_interrupt_exiting(core: u32) -> bool {
    configure(CoreSelection::SingleCore(core), Vmcall::SetExternalInterruptExiting, 1, 0)
}

pub fn disable_external_interrupt_exiting(core: u32) -> bool {
    configure(CoreSelection::SingleCore(core), Vmcall::SetExternalInterruptExiting, 0, 0)
}

pub fn enable_rdtsc_exiting(core: u32) -> bool {
    configure(CoreSelection::SingleCore(core), Vmcall::SetRdtscExiting, 1, 0)
}

pub fn disable_rdtsc_exiting(core: u32) -> bool {
    configure(CoreSelection::SingleCore(core), Vmcall::SetRdtscExiting, 0, 0)
}

pub fn enable_rdpmc_exiting(core: u32) -> bool {
    configure(CoreSelection::SingleCore(core), Vmcall::SetRdpmcExiting, 1, 0)
}

pub fn disable_rdpmc_exiting(core: u32) -> bool {
    configure(CoreSelection::SingleCore(core), Vmcall::SetRdpmcExiting, 0, 0)
}

pub fn enable_mov_to_dr_exiting(core: u32) -> bool {
    configure(CoreSelection::SingleCore(core), Vmcall::SetMovToDrExiting, 1, 0)
}

pub fn disable_mov_to_dr_exiting(core: u32) -> bool {
    configure(CoreSelection::SingleCore(core), Vmcall::SetMovToDrExiting, 0, 0)
}

/// Replaces one core's exception bitmap; bit `n` intercepts vector `n`.
pub fn set_exception_bitmap(core: u32, mask: u32) -> bool {
    configure(CoreSelection::SingleCore(core), Vmcall::SetExceptionBitmap, mask as u64, 0)
}

/// Raises CR0/CR4 ownership masks so guest writes to the masked bits exit.
pub fn enable_mov_to_cr_exiting(core: u32, cr0_mask: u64, cr4_mask: u64) -> bool {
    configure(CoreSelection::SingleCore(core), Vmcall::SetMovToCrExiting, cr0_mask, cr4_mask)
}

pub fn disable_mov_to_cr_exiting(core: u32) -> bool {
    configure(CoreSelection::SingleCore(core), Vmcall::SetMovToCrExiting, 0, 0)
}

pub fn change_msr_bitmap_read(core: u32, msr: u32, intercept: bool) -> bool {
    configure(
        CoreSelection::SingleCore(core),
        Vmcall::ChangeMsrBitmapRead,
        msr as u64,
        intercept as u64,
    )
}

pub fn change_msr_bitmap_write(core: u32, msr: u32, intercept: bool) -> bool {
    configure(
        CoreSelection::SingleCore(core),
        Vmcall::ChangeMsrBitmapWrite,
        msr as u64,
        intercept as u64,
    )
}

pub fn change_io_bitmap(core: u32, port: u16, intercept: bool) -> bool {
    configure(
        CoreSelection::SingleCore(core),
        Vmcall::ChangeIoBitmap,
        port as u64,
        intercept as u64,
    )
}

/// Arms the VMX preemption timer on one core; `None` disarms it.
pub fn set_preemption_timer(core: u32, ticks: Option<u64>) -> bool {
    match ticks {
        Some(ticks) => configure(CoreSelection::SingleCore(core), Vmcall::SetPreemptionTimer, 1, ticks),
        None => configure(CoreSelection::SingleCore(core), Vmcall::SetPreemptionTimer, 0, 0),
    }
}

/// Clears EFER.SCE so SYSCALL/SYSRET trap as #UD and are emulated.
pub fn enable_efer_syscall_hook(selection: CoreSelection, hook_type: SyscallHookType) -> bool {
    let mode = match hook_type {
        SyscallHookType::HandleAllUd => 0u64,
        SyscallHookType::SafeAccessMemory => 1u64,
    };
    configure(selection, Vmcall::EnableSyscallHookEfer, mode, 0)
}

pub fn disable_efer_syscall_hook(selection: CoreSelection) -> bool {
    configure(selection, Vmcall::DisableSyscallHookEfer, 0, 0)
}

/// Queues an interrupt or exception for delivery on one core's next VM
/// entry.
pub fn inject_interrupt_or_exception(
    core: u32,
    vector: u32,
    event_type: InterruptionType,
    error_code: Option<u32>,
) -> bool {
    if core >= processor_count() {
        return false;
    }
    // Wire format: vector and type in param1, error-code validity bit 16;
    // the code itself rides in param2.
    let param1 =
        vector as u64 | ((event_type as u64) << 8) | ((error_code.is_some() as u64) << 16);
    configure(
        CoreSelection::SingleCore(core),
        Vmcall::InjectPendingEvent,
        param1,
        error_code.unwrap_or(0) as u64,
    )
}

/// Installs mode-based execute hooks on the secondary EPT. Only succeeds on
/// hardware reporting MBEC.
pub fn configure_initialize_reversing_machine() -> bool {
    if !vmm::mbec_supported() {
        error!("Mode-based execute control not supported on this CPU");
        return false;
    }
    configure(CoreSelection::AllCores, Vmcall::EnableModeBasedExecHook, 0, 0)
}

pub fn configure_uninitialize_reversing_machine() -> bool {
    configure(CoreSelection::AllCores, Vmcall::DisableModeBasedExecHook, 0, 0)
}

/// Turns on page-modification logging for dirty tracking.
pub fn dirty_logging_initialize() -> bool {
    if !vmm::pml_supported() {
        error!("Page-modification logging not supported on this CPU");
        return false;
    }
    configure(CoreSelection::AllCores, Vmcall::EnableDirtyLogging, 0, 0)
}

pub fn dirty_logging_uninitialize() -> bool {
    configure(CoreSelection::AllCores, Vmcall::DisableDirtyLogging, 0, 0)
}

/// Number of installed hooks `(hidden, watches)`, for diagnostics.
pub fn ept_hook_count() -> (usize, usize) {
    SHARED_HOOK_MANAGER.lock().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vmcall_numbers_are_stable() {
        // The first two are fixed by the wire protocol; the rest must stay
        // unique and in the documented order.
        assert_eq!(Vmcall::Test as u64, 0x01);
        assert_eq!(Vmcall::Vmxoff as u64, 0x02);
        assert_eq!(Vmcall::ChangePageAttrib as u64, 0x03);
        assert_eq!(Vmcall::InveptSingleContext as u64, 0x04);
        assert_eq!(Vmcall::UnhookSinglePage as u64, 0x07);
        assert_eq!(Vmcall::ChangeIoBitmap as u64, 0x12);
        assert_eq!(Vmcall::DisableDirtyLogging as u64, 0x19);
    }
}
