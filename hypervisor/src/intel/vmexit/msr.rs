//! Bitmap-gated MSR interception. Accesses the bitmap never marked still
//! exit when the MSR index is outside the two architectural ranges; those
//! receive #GP exactly like on bare metal. The EFER shadow keeps the
//! syscall-via-#UD trick invisible.

use {
    crate::{
        error::HypervisorError,
        intel::{
            events::inject_general_protection,
            hooks::syscall,
            support::{rdmsr, wrmsr},
            vcpu::Vcpu,
            vmexit::ExitType,
        },
    },
    log::*,
    x86::msr,
};

const MSR_RANGE_LOW_END: u32 = 0x0000_1FFF;
const MSR_RANGE_HIGH_START: u32 = 0xC000_0000;
const MSR_RANGE_HIGH_END: u32 = 0xC000_1FFF;

/// Synthetic MSRs some guests probe; reads yield zero instead of #GP.
const MSR_RANGE_SYNTHETIC: core::ops::RangeInclusive<u32> = 0x4000_0000..=0x4000_10FF;

fn is_valid_msr(index: u32) -> bool {
    index <= MSR_RANGE_LOW_END
        || (MSR_RANGE_HIGH_START..=MSR_RANGE_HIGH_END).contains(&index)
        || MSR_RANGE_SYNTHETIC.contains(&index)
}

pub fn handle_rdmsr(vcpu: &mut Vcpu) -> Result<ExitType, HypervisorError> {
    let index = vcpu.guest_registers.rcx as u32;

    if !is_valid_msr(index) {
        // Reserved MSR: reflect the fault the CPU would have raised.
        inject_general_protection(0);
        return Ok(ExitType::Continue);
    }

    let mut value = if MSR_RANGE_SYNTHETIC.contains(&index) {
        0
    } else {
        rdmsr(index)
    };

    // The guest must keep believing SYSCALL is enabled.
    if index == msr::IA32_EFER && vcpu.syscall_hook.is_some() {
        value = syscall::shadowed_guest_efer();
    }

    let consumed = crate::interface::callbacks()
        .msr_read
        .map(|callback| callback(vcpu.index, index, &mut value))
        .unwrap_or(false);
    if consumed {
        trace!("MSR {index:#x} read consumed by upper layer");
    }

    vcpu.guest_registers.rax = value & 0xFFFF_FFFF;
    vcpu.guest_registers.rdx = value >> 32;

    Ok(ExitType::IncrementRip)
}

pub fn handle_wrmsr(vcpu: &mut Vcpu) -> Result<ExitType, HypervisorError> {
    let index = vcpu.guest_registers.rcx as u32;
    let value = (vcpu.guest_registers.rax & 0xFFFF_FFFF) | (vcpu.guest_registers.rdx << 32);

    if !is_valid_msr(index) {
        inject_general_protection(0);
        return Ok(ExitType::Continue);
    }

    let consumed = crate::interface::callbacks()
        .msr_write
        .map(|callback| callback(vcpu.index, index, value))
        .unwrap_or(false);

    if !consumed {
        // Guest writes to EFER while the syscall hook is live must not
        // resurrect SCE behind our back.
        if index == msr::IA32_EFER && vcpu.syscall_hook.is_some() {
            wrmsr(index, value & !1);
        } else {
            wrmsr(index, value);
        }
    }

    Ok(ExitType::IncrementRip)
}
