//! The VMCALL dispatcher: the root-mode end of the wire protocol. The
//! hypercall number arrives in RCX, parameters in RDX/R8/R9, and the
//! NTSTATUS-style result is returned in guest RAX.

use {
    crate::{
        error::HypervisorError,
        intel::{
            addresses::PhysicalAddress,
            bitmap::{InterceptOperation, MsrAccessType},
            ept::AccessType,
            events::{InterruptionType, PendingEvent},
            hooks::{hook_manager::SHARED_HOOK_MANAGER, syscall, syscall::SyscallHookType},
            hv,
            invept::{invept_all_contexts, invept_single_context},
            vcpu::Vcpu,
            vmexit::ExitType,
        },
        interface::{HookRequest, HookRequestKind, Vmcall},
        vmm,
    },
    log::*,
};

pub const STATUS_SUCCESS: u64 = 0;
pub const STATUS_UNSUCCESSFUL: u64 = 0xC000_0001;

impl Vmcall {
    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            0x01..=0x19 => Some(unsafe { core::mem::transmute::<u64, Self>(value) }),
            _ => None,
        }
    }
}

pub fn handle_vmcall(vcpu: &mut Vcpu) -> Result<ExitType, HypervisorError> {
    let number = vcpu.guest_registers.rcx;
    let param1 = vcpu.guest_registers.rdx;
    let param2 = vcpu.guest_registers.r8;
    let param3 = vcpu.guest_registers.r9;

    let Some(vmcall) = Vmcall::from_u64(number) else {
        warn!("Unknown VMCALL number {number:#x} on core {}", vcpu.index);
        vcpu.guest_registers.rax = STATUS_UNSUCCESSFUL;
        return Ok(ExitType::IncrementRip);
    };

    trace!(
        "VMCALL {:?} on core {} ({:#x}, {:#x}, {:#x})",
        vmcall,
        vcpu.index,
        param1,
        param2,
        param3
    );

    let status = match vmcall {
        Vmcall::Test => {
            debug!(
                "VMCALL test on core {}: {:#x} {:#x} {:#x}",
                vcpu.index, param1, param2, param3
            );
            STATUS_SUCCESS
        }

        Vmcall::Vmxoff => {
            vcpu.devirtualize()?;
            vcpu.guest_registers.rax = STATUS_SUCCESS;
            return Ok(ExitType::ExitHypervisor);
        }

        Vmcall::ChangePageAttrib => apply_hook_request(param1),

        Vmcall::InveptSingleContext => {
            invept_single_context(param1);
            STATUS_SUCCESS
        }

        Vmcall::InveptAllContexts => {
            invept_all_contexts();
            STATUS_SUCCESS
        }

        Vmcall::UnhookAllPages => {
            let mut hook_manager = SHARED_HOOK_MANAGER.lock();
            let mut shared = vmm::shared_data().lock();
            match shared.as_mut() {
                Some(shared) => match hook_manager.unhook_all(&mut shared.primary_ept) {
                    Ok(()) => STATUS_SUCCESS,
                    Err(error) => {
                        error!("Unhook-all failed: {:?}", error);
                        STATUS_UNSUCCESSFUL
                    }
                },
                None => STATUS_UNSUCCESSFUL,
            }
        }

        Vmcall::UnhookSinglePage => {
            let mut hook_manager = SHARED_HOOK_MANAGER.lock();
            let mut shared = vmm::shared_data().lock();
            match shared.as_mut() {
                Some(shared) => match hook_manager.unhook_single_address(
                    &mut shared.primary_ept,
                    param1,
                    param2,
                    param3,
                ) {
                    Ok(()) => STATUS_SUCCESS,
                    Err(error) => {
                        error!("Unhook failed: {:?}", error);
                        STATUS_UNSUCCESSFUL
                    }
                },
                None => STATUS_UNSUCCESSFUL,
            }
        }

        Vmcall::EnableSyscallHookEfer => {
            let hook_type = if param1 == 0 {
                SyscallHookType::HandleAllUd
            } else {
                SyscallHookType::SafeAccessMemory
            };
            syscall::enable_efer_hook(&mut vcpu.msr_bitmap);
            vcpu.syscall_hook = Some(hook_type);
            STATUS_SUCCESS
        }

        Vmcall::DisableSyscallHookEfer => {
            syscall::disable_efer_hook(&mut vcpu.msr_bitmap);
            vcpu.syscall_hook = None;
            STATUS_SUCCESS
        }

        Vmcall::ChangeMsrBitmapRead => {
            vcpu.msr_bitmap.modify_msr_interception(
                param1 as u32,
                MsrAccessType::Read,
                intercept_operation(param2),
            );
            STATUS_SUCCESS
        }

        Vmcall::ChangeMsrBitmapWrite => {
            vcpu.msr_bitmap.modify_msr_interception(
                param1 as u32,
                MsrAccessType::Write,
                intercept_operation(param2),
            );
            STATUS_SUCCESS
        }

        Vmcall::SetRdtscExiting => {
            hv::set_rdtsc_exiting(param1 != 0);
            STATUS_SUCCESS
        }

        Vmcall::SetRdpmcExiting => {
            hv::set_rdpmc_exiting(param1 != 0);
            STATUS_SUCCESS
        }

        Vmcall::SetExceptionBitmap => {
            hv::set_exception_bitmap(param1 as u32);
            STATUS_SUCCESS
        }

        Vmcall::SetMovToDrExiting => {
            hv::set_mov_to_dr_exiting(param1 != 0);
            STATUS_SUCCESS
        }

        Vmcall::SetExternalInterruptExiting => {
            hv::set_external_interrupt_exiting(param1 != 0);
            STATUS_SUCCESS
        }

        Vmcall::SetMovToCr3Exiting => {
            hv::set_mov_to_cr3_exiting(param1 != 0);
            vcpu.report_mov_to_cr3 = param1 != 0;
            STATUS_SUCCESS
        }

        Vmcall::ChangeIoBitmap => {
            vcpu.io_bitmaps
                .modify_io_interception(param1 as u16, intercept_operation(param2));
            STATUS_SUCCESS
        }

        Vmcall::SetPreemptionTimer => {
            hv::set_preemption_timer((param1 != 0).then_some(param2));
            STATUS_SUCCESS
        }

        Vmcall::InjectPendingEvent => {
            let vector = (param1 & 0xFF) as u32;
            let event_type = InterruptionType::from_u32(((param1 >> 8) & 0b111) as u32);
            let error_code = (param1 & (1 << 16) != 0).then_some(param2 as u32);
            vcpu.queue_event(PendingEvent {
                vector,
                event_type,
                error_code,
                instruction_length: None,
            });
            STATUS_SUCCESS
        }

        Vmcall::SetMovToCrExiting => {
            let enable = param1 != 0 || param2 != 0;
            hv::set_mov_to_cr_exiting(
                enable,
                hv::CrInterceptOptions {
                    cr0_mask: param1,
                    cr4_mask: param2,
                },
            );
            STATUS_SUCCESS
        }

        Vmcall::EnableModeBasedExecHook => match vmm::secondary_eptp() {
            Some(eptp) => {
                hv::set_mode_based_exec_control(true, eptp);
                STATUS_SUCCESS
            }
            None => STATUS_UNSUCCESSFUL,
        },

        Vmcall::DisableModeBasedExecHook => {
            hv::set_mode_based_exec_control(false, vmm::primary_eptp());
            STATUS_SUCCESS
        }

        Vmcall::EnableDirtyLogging => {
            let pml_pa = PhysicalAddress::pa_from_va(vcpu.pml_buffer.as_ptr() as u64);
            hv::enable_pml(pml_pa);
            STATUS_SUCCESS
        }

        Vmcall::DisableDirtyLogging => {
            hv::disable_pml();
            STATUS_SUCCESS
        }
    };

    vcpu.guest_registers.rax = status;
    Ok(ExitType::IncrementRip)
}

fn intercept_operation(param: u64) -> InterceptOperation {
    if param != 0 {
        InterceptOperation::Hook
    } else {
        InterceptOperation::Unhook
    }
}

/// Applies a marshaled hook request. Runs under both managers' locks; the
/// leaf flip and its INVEPT happen before VMRESUME as the concurrency rules
/// demand.
fn apply_hook_request(request_ptr: u64) -> u64 {
    if request_ptr == 0 {
        return STATUS_UNSUCCESSFUL;
    }
    let request = unsafe { &*(request_ptr as *const HookRequest) };

    let mut hook_manager = SHARED_HOOK_MANAGER.lock();
    let mut shared = vmm::shared_data().lock();
    let Some(shared) = shared.as_mut() else {
        return STATUS_UNSUCCESSFUL;
    };
    let ept = &mut shared.primary_ept;

    let result = match &request.kind {
        HookRequestKind::Breakpoint => {
            hook_manager.install_breakpoint(ept, request.va, request.cr3)
        }
        HookRequestKind::Detour { handler } => {
            hook_manager.install_detour(ept, request.va, *handler, request.cr3)
        }
        HookRequestKind::AccessWatch { read, write, execute } => {
            let mut watched = AccessType::empty();
            if *read {
                watched |= AccessType::READ;
            }
            if *write {
                watched |= AccessType::WRITE;
            }
            if *execute {
                watched |= AccessType::EXECUTE;
            }
            if watched.is_empty() {
                return STATUS_UNSUCCESSFUL;
            }
            hook_manager.install_access_watch(ept, request.va, request.cr3, watched)
        }
    };

    match result {
        Ok(()) => STATUS_SUCCESS,
        Err(error) => {
            error!("Hook installation failed: {:?}", error);
            STATUS_UNSUCCESSFUL
        }
    }
}
