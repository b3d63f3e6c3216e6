//! Lifecycle of the hypervisor: feature detection, the process-wide EPT and
//! MTRR state, per-core virtualization fan-out, the VMCALL liveness check,
//! and the orderly teardown that leaves the OS byte-identical to its
//! pre-virtualization state.

use {
    crate::{
        allocate::box_zeroed,
        error::HypervisorError,
        intel::{
            capture::{capture_registers, GuestRegisters},
            ept::Ept,
            hooks::hook_manager::SHARED_HOOK_MANAGER,
            mtrr::MtrrMap,
            support::{cr3, rdmsr, vmcall},
            vcpu::Vcpu,
            vmlaunch::restore_guest_context,
        },
        interface::Vmcall,
        windows::{
            broadcast::{run_on_all_cores, BroadcastTask},
            processor::{current_processor_index, processor_count},
        },
    },
    alloc::{boxed::Box, vec::Vec},
    core::{
        arch::global_asm,
        cell::UnsafeCell,
        sync::atomic::{AtomicBool, AtomicU64, Ordering},
    },
    log::*,
    spin::{Mutex, Once},
    x86::cpuid::{cpuid, CpuId},
};

/// CPUID leaf reserved for hypervisor identification.
pub const CPUID_VENDOR_AND_MAX_FUNCTIONS: u32 = 0x4000_0000;

/// "MRGE" in the vendor registers identifies this hypervisor.
pub const VENDOR_NAME: u32 = 0x4547_524D;

/// The process-wide memory-virtualization state: the identity EPT (plus the
/// secondary hierarchy for mode-based exec hooks where supported) and the
/// MTRR map it was built against.
pub struct SharedData {
    pub primary_ept: Box<Ept>,
    pub primary_eptp: u64,
    pub secondary_ept: Option<Box<Ept>>,
    pub secondary_eptp: u64,
    pub mtrr: MtrrMap,
}

static SHARED_DATA: Mutex<Option<SharedData>> = Mutex::new(None);
static PRIMARY_EPTP: AtomicU64 = AtomicU64::new(0);
static SECONDARY_EPTP: AtomicU64 = AtomicU64::new(0);
static SYSTEM_CR3: AtomicU64 = AtomicU64::new(0);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// A per-core slot. Only core `i` dereferences slot `i` outside of init and
/// teardown, which is what makes the interior mutability sound.
struct VcpuSlot(UnsafeCell<Option<Vcpu>>);

unsafe impl Sync for VcpuSlot {}

static GUEST_STATE: Once<Vec<VcpuSlot>> = Once::new();

/// The EPT/MTRR state, lockable from both root and non-root. Lock order:
/// `SHARED_HOOK_MANAGER` first, then this.
pub fn shared_data() -> &'static Mutex<Option<SharedData>> {
    &SHARED_DATA
}

pub fn primary_eptp() -> u64 {
    PRIMARY_EPTP.load(Ordering::SeqCst)
}

/// The secondary EPTP, present only on MBEC-capable hardware.
pub fn secondary_eptp() -> Option<u64> {
    match SECONDARY_EPTP.load(Ordering::SeqCst) {
        0 => None,
        eptp => Some(eptp),
    }
}

/// The SYSTEM address space captured at initialization.
pub fn system_cr3() -> u64 {
    SYSTEM_CR3.load(Ordering::SeqCst)
}

pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::SeqCst)
}

/// Deterministic root-mode probe: the dispatcher raises the per-core flag
/// on every exit and drops it before resuming the guest, so the answer
/// never depends on a faultable VMX instruction.
pub fn is_vmx_root_mode() -> bool {
    let Some(slots) = GUEST_STATE.get() else {
        return false;
    };
    let index = current_processor_index() as usize;
    match slots.get(index) {
        Some(slot) => unsafe {
            (*slot.0.get())
                .as_ref()
                .map(|vcpu| vcpu.is_on_vmx_root)
                .unwrap_or(false)
        },
        None => false,
    }
}

/// Mutable access to the calling core's virtual processor.
///
/// Sound only under the single-writer discipline: core `i` is the sole
/// writer of slot `i` while the system is virtualized.
pub fn current_vcpu() -> Option<&'static mut Vcpu> {
    let slots = GUEST_STATE.get()?;
    let index = current_processor_index() as usize;
    let slot = slots.get(index)?;
    unsafe { (*slot.0.get()).as_mut() }
}

/// MBEC (mode-based execute control) capability, from the allowed-1 half of
/// IA32_VMX_PROCBASED_CTLS2.
pub fn mbec_supported() -> bool {
    rdmsr(x86::msr::IA32_VMX_PROCBASED_CTLS2) & (1 << (32 + 22)) != 0
}

/// Page-modification logging capability.
pub fn pml_supported() -> bool {
    rdmsr(x86::msr::IA32_VMX_PROCBASED_CTLS2) & (1 << (32 + 17)) != 0
}

/// Whether this hypervisor already answers on its identification leaf.
pub fn is_hypervisor_present() -> bool {
    let regs = cpuid!(CPUID_VENDOR_AND_MAX_FUNCTIONS);
    regs.ebx == VENDOR_NAME && regs.ecx == VENDOR_NAME && regs.edx == VENDOR_NAME
}

fn has_intel_cpu() -> Result<(), HypervisorError> {
    if let Some(vendor) = CpuId::new().get_vendor_info() {
        if vendor.as_str() == "GenuineIntel" {
            return Ok(());
        }
    }
    Err(HypervisorError::CpuUnsupported)
}

fn has_vmx_support() -> Result<(), HypervisorError> {
    if let Some(features) = CpuId::new().get_feature_info() {
        if features.has_vmx() {
            return Ok(());
        }
    }
    Err(HypervisorError::VmxUnsupported)
}

/// Virtualizes the running system on every logical processor and confirms
/// each one answers a VMCALL round trip.
pub fn initialize() -> Result<(), HypervisorError> {
    if is_initialized() {
        return Ok(());
    }
    if is_hypervisor_present() {
        info!("Hypervisor already present");
        return Ok(());
    }

    has_intel_cpu()?;
    info!("CPU is Intel");

    has_vmx_support()?;
    info!("VMX is supported");

    Ept::check_features()?;
    info!("All required EPT features are present");

    let mtrr = MtrrMap::build()?;
    debug!("MTRR map: {} ranges", mtrr.ranges().len());

    let mut primary_ept = unsafe { box_zeroed::<Ept>() };
    primary_ept.build_identity(&mtrr)?;
    let primary_eptp = primary_ept.create_eptp()?;
    info!("Identity EPT built, EPTP {primary_eptp:#x}");

    let (secondary_ept, secondary_eptp) = if mbec_supported() {
        let mut ept = unsafe { box_zeroed::<Ept>() };
        ept.build_identity(&mtrr)?;
        let eptp = ept.create_eptp()?;
        info!("Secondary EPT for mode-based exec hooks built, EPTP {eptp:#x}");
        (Some(ept), eptp)
    } else {
        (None, 0)
    };

    // First touch reserves the hook pools while allocation is still cheap
    // and legal.
    {
        let hook_manager = SHARED_HOOK_MANAGER.lock();
        let _ = hook_manager.count();
    }

    // DriverEntry runs in the System process; its CR3 is the address space
    // every VM exit will run under.
    SYSTEM_CR3.store(cr3(), Ordering::SeqCst);
    PRIMARY_EPTP.store(primary_eptp, Ordering::SeqCst);
    SECONDARY_EPTP.store(secondary_eptp, Ordering::SeqCst);

    *SHARED_DATA.lock() = Some(SharedData {
        primary_ept,
        primary_eptp,
        secondary_ept,
        secondary_eptp,
        mtrr,
    });

    let count = processor_count();
    info!("Virtualizing {count} logical processors");

    let slots = GUEST_STATE.call_once(|| {
        let mut slots = Vec::with_capacity(count as usize);
        for _ in 0..count {
            slots.push(VcpuSlot(UnsafeCell::new(None)));
        }
        slots
    });

    // Populate (or repopulate after a previous terminate). No core runs
    // virtualized yet, so plain writes into the slots are sound.
    for (index, slot) in slots.iter().enumerate() {
        let slot = unsafe { &mut *slot.0.get() };
        if slot.is_none() {
            *slot = Some(Vcpu::new(index as u32));
        }
    }

    run_on_all_cores(BroadcastTask::VirtualizeCore)?;

    // One VMCALL round trip per core proves every VM is live.
    run_on_all_cores(BroadcastTask::Vmcall {
        number: Vmcall::Test as u64,
        param1: 0x22,
        param2: 0x333,
    })
    .map_err(|_| HypervisorError::VmcallTestFailed)?;

    INITIALIZED.store(true, Ordering::SeqCst);
    info!("The hypervisor has been installed successfully");

    Ok(())
}

/// Devirtualizes every core and releases all owned memory. The guest
/// observes its original CR3, descriptor tables and segment bases.
pub fn terminate() -> Result<(), HypervisorError> {
    if !is_initialized() {
        return Ok(());
    }

    info!("Terminating the hypervisor");

    // Hooks first: every leaf returns to its original frame before the EPT
    // goes away underneath the guest.
    let status = vmcall(Vmcall::UnhookAllPages as u64, 0, 0, 0);
    if status != 0 {
        warn!("Unhooking all pages reported status {status:#x}");
    }
    let _ = run_on_all_cores(BroadcastTask::Vmcall {
        number: Vmcall::InveptAllContexts as u64,
        param1: 0,
        param2: 0,
    });

    run_on_all_cores(BroadcastTask::Vmcall {
        number: Vmcall::Vmxoff as u64,
        param1: 0,
        param2: 0,
    })?;

    INITIALIZED.store(false, Ordering::SeqCst);

    // Free the per-core state. No core is in VMX operation anymore, so the
    // single-writer discipline no longer applies.
    if let Some(slots) = GUEST_STATE.get() {
        for slot in slots {
            unsafe { *slot.0.get() = None };
        }
    }

    // Hook pools and the EPT hierarchies.
    SHARED_HOOK_MANAGER.lock().release();
    *SHARED_DATA.lock() = None;
    PRIMARY_EPTP.store(0, Ordering::SeqCst);
    SECONDARY_EPTP.store(0, Ordering::SeqCst);

    info!("The hypervisor has been uninstalled");
    Ok(())
}

/// Brings the calling core under the hypervisor. Runs at dispatch IRQL from
/// the broadcast DPC.
pub fn virtualize_current_core() -> Result<(), HypervisorError> {
    let index = current_processor_index();
    debug!("Virtualizing core {index}");

    let Some(vcpu) = current_vcpu() else {
        return Err(HypervisorError::VmxNotInitialized);
    };

    // Capture the exact context the guest must resume from. After
    // VMLAUNCH, execution re-emerges from this call with RAX forced
    // non-zero.
    let mut registers = GuestRegisters::default();
    let is_virtualized = unsafe { capture_registers(&mut registers) };
    registers.rax = 1;

    if !is_virtualized {
        unsafe {
            switch_stack(
                &mut registers,
                launch_on_dedicated_stack as usize,
                vcpu.vmm_stack_top(),
            )
        };
    }

    debug!("Core {index} is virtualized");
    Ok(())
}

/// Landing point after the stack switch: activates and runs the VM. Never
/// returns by normal control flow; the CPU leaves through VM entry or
/// through `restore_guest_context`.
extern "efiapi" fn launch_on_dedicated_stack(registers: &mut GuestRegisters) -> ! {
    let vcpu = current_vcpu().expect("per-core state must exist during launch");

    let result = vcpu
        .activate(registers, primary_eptp(), system_cr3())
        .and_then(|()| vcpu.run());

    match result {
        Ok(()) => {
            // VMXOFF was requested: hand the CPU back to the interrupted
            // context with its own stack and RIP.
            vcpu.guest_registers.rip = vcpu.vmxoff_state.guest_rip;
            vcpu.guest_registers.rsp = vcpu.vmxoff_state.guest_rsp;
            unsafe { restore_guest_context(&vcpu.guest_registers) }
        }
        Err(error) => {
            error!("Virtualization broke on core {}: {:?}", vcpu.index, error);

            if vcpu.launched {
                // Steady-state failure: the capture frame is long stale, so
                // the only way out is an emergency VMXOFF that resumes the
                // guest where it stopped.
                if vcpu.devirtualize().is_ok() {
                    vcpu.guest_registers.rip = vcpu.vmxoff_state.guest_rip;
                    vcpu.guest_registers.rsp = vcpu.vmxoff_state.guest_rsp;
                    unsafe { restore_guest_context(&vcpu.guest_registers) }
                }
                error!("Core {} is unrecoverable", vcpu.index);
                loop {
                    crate::intel::support::hlt();
                }
            }

            // The launch never took; resume the captured context
            // unvirtualized.
            let _ = crate::intel::support::vmxoff();
            crate::intel::vmxon::Vmxon::disable_vmx_operation();
            unsafe { restore_guest_context(registers) }
        }
    }
}

extern "efiapi" {
    /// Moves onto `stack_top` and tail-calls `landing_code` with
    /// `registers` still in RCX.
    fn switch_stack(registers: &mut GuestRegisters, landing_code: usize, stack_top: u64) -> !;
}

global_asm!(
    r#"
// extern "efiapi" fn switch_stack(registers, landing_code, stack_top) -> !
.global switch_stack
switch_stack:
    mov     rsp, r8
    jmp     rdx
"#
);
