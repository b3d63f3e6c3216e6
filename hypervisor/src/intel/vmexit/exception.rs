//! Exception and NMI exits. #BP feeds the debugger's breakpoint pipeline,
//! #UD drives the syscall emulation when the EFER hook is armed, #PF is
//! optionally reported before re-injection, and everything else reflects
//! into the guest unchanged.

use {
    crate::{
        error::HypervisorError,
        intel::{
            events::{self, exit_interruption_info, InterruptionType, PendingEvent},
            hooks::syscall::{self, SyscallHookType},
            paging::GuestPageWalk,
            support::{cr2_write, vmread},
            vcpu::Vcpu,
            vmexit::ExitType,
        },
    },
    log::*,
    x86::vmx::vmcs,
};

const VECTOR_NMI: u32 = 2;
const VECTOR_BP: u32 = 3;
const VECTOR_UD: u32 = 6;
const VECTOR_PF: u32 = 14;

pub fn handle_exception(vcpu: &mut Vcpu) -> Result<ExitType, HypervisorError> {
    let Some(info) = exit_interruption_info() else {
        warn!("Exception exit without valid interruption info");
        return Ok(ExitType::Continue);
    };

    match info.vector() {
        VECTOR_BP => handle_breakpoint(vcpu),
        VECTOR_UD => handle_undefined_opcode(vcpu),
        VECTOR_PF => handle_page_fault(vcpu),
        VECTOR_NMI => {
            // Queue for delivery on the next entry; NMIs must not be lost.
            vcpu.pending_nmi = true;
            Ok(ExitType::Continue)
        }
        vector => {
            // Armed by an upper-layer exception bitmap; reflect unchanged.
            let error_code = info
                .deliver_error_code()
                .then(|| vmread(vmcs::ro::VMEXIT_INTERRUPTION_ERR_CODE) as u32);
            let event_type = InterruptionType::from_u32(info.event_type());
            // Software-type injections require the instruction length.
            let instruction_length = matches!(
                event_type,
                InterruptionType::SoftwareInterrupt
                    | InterruptionType::PrivilegedSoftwareException
                    | InterruptionType::SoftwareException
            )
            .then(|| vmread(vmcs::ro::VMEXIT_INSTRUCTION_LEN));
            PendingEvent {
                vector,
                event_type,
                error_code,
                instruction_length,
            }
            .inject();
            Ok(ExitType::Continue)
        }
    }
}

fn handle_breakpoint(vcpu: &mut Vcpu) -> Result<ExitType, HypervisorError> {
    let consumed = crate::interface::callbacks()
        .breakpoint
        .map(|callback| callback(vcpu.index, &mut vcpu.guest_registers))
        .unwrap_or(false);

    if consumed {
        // The debugger may have moved the guest; the VMCS owns RIP, RSP
        // and RFLAGS.
        crate::intel::support::vmwrite(vmcs::guest::RIP, vcpu.guest_registers.rip);
        crate::intel::support::vmwrite(vmcs::guest::RSP, vcpu.guest_registers.rsp);
        crate::intel::support::vmwrite(vmcs::guest::RFLAGS, vcpu.guest_registers.rflags);
    } else {
        events::inject_breakpoint();
    }

    Ok(ExitType::Continue)
}

/// With EFER.SCE cleared, SYSCALL and SYSRET raise #UD and are emulated here
/// so the guest's system-call path keeps working while every transition is
/// observable.
fn handle_undefined_opcode(vcpu: &mut Vcpu) -> Result<ExitType, HypervisorError> {
    let Some(hook_type) = vcpu.syscall_hook else {
        events::inject_undefined_opcode();
        return Ok(ExitType::Continue);
    };

    let rip = vcpu.guest_registers.rip;
    let walker = GuestPageWalk::current_guest();

    let mut bytes = [0u8; 3];
    let readable = walker.read_bytes(rip, &mut bytes);

    if readable < 2 {
        // The faulting bytes are not mapped under the current CR3. In
        // safe-access mode that disqualifies emulation; reflect the #UD.
        if hook_type == SyscallHookType::SafeAccessMemory || readable == 0 {
            events::inject_undefined_opcode();
            return Ok(ExitType::Continue);
        }
    }

    if syscall::is_syscall_instruction(&bytes[..readable]) {
        let effect = syscall::emulate_syscall(rip, vcpu.guest_registers.rflags);
        if let Some(rcx) = effect.rcx {
            vcpu.guest_registers.rcx = rcx;
        }
        if let Some(r11) = effect.r11 {
            vcpu.guest_registers.r11 = r11;
        }
        vcpu.guest_registers.rip = effect.rip;
        vcpu.guest_registers.rflags = effect.rflags;
        effect.apply_to_vmcs();

        if let Some(callback) = crate::interface::callbacks().syscall_event {
            callback(vcpu.index, rip, false);
        }
        Ok(ExitType::Continue)
    } else if syscall::is_sysret_instruction(&bytes[..readable]) {
        let effect = syscall::emulate_sysret(vcpu.guest_registers.rcx, vcpu.guest_registers.r11);
        vcpu.guest_registers.rip = effect.rip;
        vcpu.guest_registers.rflags = effect.rflags;
        effect.apply_to_vmcs();

        if let Some(callback) = crate::interface::callbacks().syscall_event {
            callback(vcpu.index, rip, true);
        }
        Ok(ExitType::Continue)
    } else {
        // A genuine invalid opcode.
        events::inject_undefined_opcode();
        Ok(ExitType::Continue)
    }
}

fn handle_page_fault(vcpu: &mut Vcpu) -> Result<ExitType, HypervisorError> {
    let faulting_address = vmread(vmcs::ro::EXIT_QUALIFICATION);
    let error_code = vmread(vmcs::ro::VMEXIT_INTERRUPTION_ERR_CODE) as u32;

    let consumed = crate::interface::callbacks()
        .page_fault
        .map(|callback| callback(vcpu.index, faulting_address, error_code))
        .unwrap_or(false);

    if !consumed {
        // The architectural contract: CR2 holds the faulting address when
        // the guest's #PF handler runs.
        cr2_write(faulting_address);
        events::inject_page_fault(error_code);
    }

    Ok(ExitType::Continue)
}
