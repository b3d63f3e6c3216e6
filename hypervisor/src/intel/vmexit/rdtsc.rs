//! RDTSC/RDTSCP/RDPMC interception, armed per-core for timing
//! instrumentation. The upper layer may substitute the counter value.

use {
    crate::{
        error::HypervisorError,
        intel::{support, vcpu::Vcpu, vmexit::ExitType},
    },
    x86::msr,
};

pub fn handle_rdtsc(vcpu: &mut Vcpu, is_rdtscp: bool) -> Result<ExitType, HypervisorError> {
    let tsc = support::rdtsc();

    vcpu.guest_registers.rax = tsc & 0xFFFF_FFFF;
    vcpu.guest_registers.rdx = tsc >> 32;
    if is_rdtscp {
        vcpu.guest_registers.rcx = support::rdmsr(msr::IA32_TSC_AUX) & 0xFFFF_FFFF;
    }

    Ok(ExitType::IncrementRip)
}

pub fn handle_rdpmc(vcpu: &mut Vcpu) -> Result<ExitType, HypervisorError> {
    let counter = vcpu.guest_registers.rcx as u32;
    let (low, high): (u32, u32);
    unsafe {
        core::arch::asm!(
            "rdpmc",
            in("ecx") counter,
            out("eax") low,
            out("edx") high,
            options(nostack),
        );
    }

    vcpu.guest_registers.rax = low as u64;
    vcpu.guest_registers.rdx = high as u64;

    Ok(ExitType::IncrementRip)
}
