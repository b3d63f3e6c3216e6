//! The per-core virtual processor: its VMXON/VMCS regions, bitmaps,
//! dedicated VMM stack, pending-event queue and the root-mode run loop that
//! every VM exit funnels through. A `Vcpu` never migrates between cores;
//! entry `i` of the global state is only written by core `i`.

use {
    crate::{
        allocate::box_zeroed,
        error::HypervisorError,
        intel::{
            addresses::PhysicalAddress,
            bitmap::{IoBitmaps, MsrBitmap},
            capture::GuestRegisters,
            events::PendingEvent,
            hooks::{hook_manager::MtfRearm, syscall::SyscallHookType},
            page::Page,
            support::{rdmsr, vmclear, vmptrld, vmread, vmwrite, vmxoff},
            vmcs::Vmcs,
            vmerror::{VmInstructionError, VmxBasicExitReason},
            vmexit::{self, ExitType},
            vmlaunch::launch_vm,
            vmxon::Vmxon,
        },
    },
    alloc::boxed::Box,
    log::*,
    x86::{
        bits64::{paging::BASE_PAGE_SIZE, rflags::RFlags},
        dtables::DescriptorTablePointer,
        msr,
        vmx::vmcs,
    },
};

/// Pages of dedicated VMM stack per core. The top is 16-byte aligned for the
/// XMM spills in the exit path.
pub const STACK_PAGES_PER_PROCESSOR: usize = 0x10;

/// The dedicated VMM stack backing, page-aligned and owned by its core so
/// teardown returns the memory.
#[repr(C)]
pub struct VmmStack(pub [Page; STACK_PAGES_PER_PROCESSOR]);

/// Guest context captured just before launch so devirtualization can put the
/// descriptor-table registers back exactly as the OS (and PatchGuard) left
/// them.
#[derive(Debug, Clone, Copy)]
pub struct LaunchSnapshot {
    pub gdtr_base: u64,
    pub gdtr_limit: u16,
    pub idtr_base: u64,
    pub idtr_limit: u16,
    pub fs_base: u64,
    pub gs_base: u64,
}

/// Where the guest continues after VMXOFF.
#[derive(Debug, Clone, Copy, Default)]
pub struct VmxoffState {
    pub guest_rip: u64,
    pub guest_rsp: u64,
    pub executed: bool,
}

pub struct Vcpu {
    /// Zero-based core index; equals the slot in the global state array.
    pub index: u32,

    pub vmxon_region: Box<Vmxon>,
    pub vmcs_region: Box<Vmcs>,
    pub msr_bitmap: Box<MsrBitmap>,
    pub io_bitmaps: Box<IoBitmaps>,

    /// Page-modification log buffer, armed only while dirty logging runs.
    pub pml_buffer: Box<Page>,

    /// This core's dedicated VMM stack.
    pub vmm_stack: Box<VmmStack>,

    pub guest_registers: GuestRegisters,

    /// Set after the first successful VMLAUNCH; selects VMRESUME afterwards.
    pub launched: bool,

    /// True while the dispatcher runs between VM exit and VM entry.
    pub is_on_vmx_root: bool,

    pub launch_snapshot: Option<LaunchSnapshot>,
    pub vmxoff_state: VmxoffState,

    /// Event queue: at most one NMI and one interrupt/exception per entry.
    pub pending_nmi: bool,
    pub pending_event: Option<PendingEvent>,

    /// Configuration the MTF handler re-arms after a single step.
    pub mtf_rearm: Option<MtfRearm>,

    /// Guest RFLAGS before interrupts were masked for the single step.
    pub old_rflags: Option<u64>,

    /// Active syscall-via-#UD interception mode.
    pub syscall_hook: Option<SyscallHookType>,

    /// Whether CR3 writes are reported upward as context-switch events.
    pub report_mov_to_cr3: bool,
}

impl Vcpu {
    pub fn new(index: u32) -> Self {
        trace!("Creating VCPU {index}");

        Self {
            index,
            vmxon_region: unsafe { box_zeroed::<Vmxon>() },
            vmcs_region: unsafe { box_zeroed::<Vmcs>() },
            msr_bitmap: unsafe { box_zeroed::<MsrBitmap>() },
            io_bitmaps: unsafe { box_zeroed::<IoBitmaps>() },
            pml_buffer: unsafe { box_zeroed::<Page>() },
            vmm_stack: unsafe { box_zeroed::<VmmStack>() },
            guest_registers: GuestRegisters::default(),
            launched: false,
            is_on_vmx_root: false,
            launch_snapshot: None,
            vmxoff_state: VmxoffState::default(),
            pending_nmi: false,
            pending_event: None,
            mtf_rearm: None,
            old_rflags: None,
            syscall_hook: None,
            report_mov_to_cr3: false,
        }
    }

    /// 16-byte aligned top of this core's VMM stack.
    pub fn vmm_stack_top(&self) -> u64 {
        self.vmm_stack.0.as_ptr() as u64
            + (STACK_PAGES_PER_PROCESSOR * BASE_PAGE_SIZE) as u64
            - 0x10
    }

    /// Brings this core into VMX operation and programs the VMCS against
    /// the captured guest context. Must run on core `self.index`.
    pub fn activate(
        &mut self,
        guest_registers: &GuestRegisters,
        primary_eptp: u64,
        system_cr3: u64,
    ) -> Result<(), HypervisorError> {
        debug!("Activating VMX on core {}", self.index);

        self.guest_registers = *guest_registers;
        let gdtr = crate::intel::support::sgdt();
        let idtr = crate::intel::support::sidt();
        self.launch_snapshot = Some(LaunchSnapshot {
            gdtr_base: gdtr.base as u64,
            gdtr_limit: gdtr.limit,
            idtr_base: idtr.base as u64,
            idtr_limit: idtr.limit,
            fs_base: rdmsr(msr::IA32_FS_BASE),
            gs_base: rdmsr(msr::IA32_GS_BASE),
        });

        Vmxon::enable_vmx_operation();
        Vmxon::adjust_feature_control_msr()?;
        Vmxon::set_cr0_bits();
        Vmxon::set_cr4_bits();

        self.vmxon_region.init();
        crate::intel::support::vmxon(PhysicalAddress::pa_from_va(
            self.vmxon_region.as_ref() as *const _ as u64,
        ))?;
        trace!("VMXON successful on core {}", self.index);

        self.vmcs_region.init();
        let vmcs_pa = PhysicalAddress::pa_from_va(self.vmcs_region.as_ref() as *const _ as u64);
        vmclear(vmcs_pa)?;
        vmptrld(vmcs_pa)?;
        trace!("VMCS loaded on core {}", self.index);

        Vmcs::setup_guest_registers_state(&self.guest_registers);
        Vmcs::setup_host_registers_state(system_cr3);
        Vmcs::setup_vmcs_control_fields(
            primary_eptp,
            PhysicalAddress::pa_from_va(self.msr_bitmap.as_ref() as *const _ as u64),
            PhysicalAddress::pa_from_va(self.io_bitmaps.io_bitmap_a.as_ptr() as u64),
            PhysicalAddress::pa_from_va(self.io_bitmaps.io_bitmap_b.as_ptr() as u64),
        );

        Ok(())
    }

    /// The root-mode loop: enter the guest, field the exit, apply the RIP
    /// advancement rule, repeat. Returns only when a VMXOFF was requested
    /// (Ok) or when the virtualization of this core is broken (Err).
    pub fn run(&mut self) -> Result<(), HypervisorError> {
        loop {
            self.deliver_pending_event();

            let flags = unsafe { launch_vm(&mut self.guest_registers, u64::from(self.launched)) };
            Self::vm_succeed(RFlags::from_raw(flags))?;
            self.launched = true;
            self.is_on_vmx_root = true;

            // Keep the frame coherent with the VMCS-tracked registers.
            self.guest_registers.rip = vmread(vmcs::guest::RIP);
            self.guest_registers.rsp = vmread(vmcs::guest::RSP);
            self.guest_registers.rflags = vmread(vmcs::guest::RFLAGS);

            let exit_reason = vmread(vmcs::ro::EXIT_REASON) as u32;
            let Some(basic_exit_reason) = VmxBasicExitReason::from_u32(exit_reason) else {
                error!("Unknown exit reason: {:#x}", exit_reason);
                return Err(HypervisorError::UnknownVmExitReason);
            };

            match vmexit::dispatch(self, basic_exit_reason)? {
                ExitType::IncrementRip => self.advance_guest_rip(),
                ExitType::Continue => {}
                ExitType::ExitHypervisor => {
                    self.is_on_vmx_root = false;
                    return Ok(());
                }
            }

            self.is_on_vmx_root = false;
        }
    }

    /// Moves guest RIP past the exiting instruction. Fault-style exits never
    /// come through here.
    pub fn advance_guest_rip(&mut self) {
        let instruction_length = vmread(vmcs::ro::VMEXIT_INSTRUCTION_LEN);
        self.guest_registers.rip += instruction_length;
        vmwrite(vmcs::guest::RIP, self.guest_registers.rip);

        // An instruction boundary clears STI/MOV-SS interruptibility
        // blocking; leaving it set would fail the next entry's checks.
        let interruptibility = vmread(vmcs::guest::INTERRUPTIBILITY_STATE) & !0b11;
        vmwrite(vmcs::guest::INTERRUPTIBILITY_STATE, interruptibility);
    }

    /// Queues an event for the next VM entry. NMIs ride a dedicated slot.
    pub fn queue_event(&mut self, event: PendingEvent) {
        if event.event_type == crate::intel::events::InterruptionType::NonMaskableInterrupt {
            self.pending_nmi = true;
        } else {
            self.pending_event = Some(event);
        }
    }

    fn deliver_pending_event(&mut self) {
        // A handler may have staged an injection for this entry already;
        // the queue waits its turn. VM entry clears the valid bit once the
        // event is delivered.
        let staged = vmread(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD);
        if staged & (1 << 31) != 0 {
            return;
        }

        if self.pending_nmi {
            self.pending_nmi = false;
            crate::intel::events::PendingEvent::nmi().inject();
        } else if let Some(event) = self.pending_event.take() {
            event.inject();
        }
    }

    /// Tears VMX down on this core from inside VMX root. The guest continues
    /// at the instruction after its VMCALL, on its own stack, in its own
    /// address space.
    pub fn devirtualize(&mut self) -> Result<(), HypervisorError> {
        debug!("Devirtualizing core {}", self.index);

        // Return to the interrupted context, not the SYSTEM address space
        // the host runs with.
        let guest_cr3 = vmread(vmcs::guest::CR3);
        crate::intel::support::cr3_write(guest_cr3);

        let guest_rip = vmread(vmcs::guest::RIP) + vmread(vmcs::ro::VMEXIT_INSTRUCTION_LEN);
        let guest_rsp = vmread(vmcs::guest::RSP);

        // Put the descriptor tables and segment bases back exactly as
        // captured; kernel integrity checks compare them.
        if let Some(snapshot) = self.launch_snapshot {
            let gdtr = DescriptorTablePointer::<u64> {
                limit: snapshot.gdtr_limit,
                base: snapshot.gdtr_base as *const u64,
            };
            let idtr = DescriptorTablePointer::<u64> {
                limit: snapshot.idtr_limit,
                base: snapshot.idtr_base as *const u64,
            };
            crate::intel::support::lgdt(&gdtr);
            crate::intel::support::lidt(&idtr);
            crate::intel::support::wrmsr(msr::IA32_FS_BASE, snapshot.fs_base);
            crate::intel::support::wrmsr(msr::IA32_GS_BASE, snapshot.gs_base);
        }

        vmclear(PhysicalAddress::pa_from_va(
            self.vmcs_region.as_ref() as *const _ as u64,
        ))?;
        vmxoff()?;
        Vmxon::disable_vmx_operation();

        self.vmxoff_state = VmxoffState {
            guest_rip,
            guest_rsp,
            executed: true,
        };
        self.launched = false;

        debug!("Core {} devirtualized", self.index);
        Ok(())
    }

    /// Classifies a failed VMLAUNCH/VMRESUME via RFLAGS and the
    /// VM-instruction error field.
    fn vm_succeed(flags: RFlags) -> Result<(), HypervisorError> {
        if flags.contains(RFlags::FLAGS_ZF) {
            return match VmInstructionError::from_u32(
                vmread(vmcs::ro::VM_INSTRUCTION_ERROR) as u32
            ) {
                Some(error) => {
                    error!("VM instruction error: {:?}", error);
                    Err(HypervisorError::VmInstructionError)
                }
                None => Err(HypervisorError::UnknownVmInstructionError),
            };
        } else if flags.contains(RFlags::FLAGS_CF) {
            error!("VM instruction failed due to carry flag being set");
            return Err(HypervisorError::VmFailInvalid);
        }

        Ok(())
    }
}
