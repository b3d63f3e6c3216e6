//! XSETBV always exits in VMX operation. The write is validated the way the
//! CPU would and performed in root; bad requests become #GP like on bare
//! metal.

use {
    crate::{
        error::HypervisorError,
        intel::{
            events::inject_general_protection,
            support::{read_effective_guest_cr4, xsetbv},
            vcpu::Vcpu,
            vmexit::ExitType,
        },
    },
    log::trace,
};

const CR4_OSXSAVE: u64 = 1 << 18;
const XCR0_X87: u64 = 1 << 0;
const XCR0_SSE: u64 = 1 << 1;
const XCR0_AVX: u64 = 1 << 2;

pub fn handle_xsetbv(vcpu: &mut Vcpu) -> Result<ExitType, HypervisorError> {
    let index = vcpu.guest_registers.rcx as u32;
    let value = (vcpu.guest_registers.rax & 0xFFFF_FFFF) | (vcpu.guest_registers.rdx << 32);

    // Only XCR0 exists, OSXSAVE must be on, x87 must stay set, and AVX
    // requires SSE.
    let valid = index == 0
        && read_effective_guest_cr4() & CR4_OSXSAVE != 0
        && value & XCR0_X87 != 0
        && !(value & XCR0_AVX != 0 && value & XCR0_SSE == 0);

    if !valid {
        inject_general_protection(0);
        return Ok(ExitType::Continue);
    }

    trace!("XSETBV: XCR0 = {value:#x}");
    xsetbv(value);

    Ok(ExitType::IncrementRip)
}
