//! Bitmap-gated port I/O interception: the upper layer may emulate the
//! access; otherwise it is performed natively in root and reflected into
//! the guest registers.

use {
    crate::{
        error::HypervisorError,
        intel::{
            support::{self, vmread},
            vcpu::Vcpu,
            vmerror::IoQualification,
            vmexit::ExitType,
        },
    },
    log::*,
    x86::vmx::vmcs,
};

pub fn handle_io(vcpu: &mut Vcpu) -> Result<ExitType, HypervisorError> {
    let qualification = IoQualification(vmread(vmcs::ro::EXIT_QUALIFICATION));
    let port = qualification.port() as u16;
    let is_in = qualification.is_in();
    let size = match qualification.access_size() {
        0 => 1u8,
        1 => 2,
        _ => 4,
    };

    let mut value = vcpu.guest_registers.rax;

    let consumed = crate::interface::callbacks()
        .io_access
        .map(|callback| callback(vcpu.index, port, is_in, size, &mut value))
        .unwrap_or(false);

    if qualification.is_string() {
        // INS/OUTS would need full segment/address-size decoding; the
        // bitmap is only armed for ports the upper layer claims, so an
        // unconsumed string access is reported and skipped.
        if !consumed {
            warn!("Unhandled string I/O on port {port:#x}");
        }
        return Ok(ExitType::IncrementRip);
    }

    if !consumed {
        value = match (is_in, size) {
            (true, 1) => support::inb(port) as u64,
            (true, 2) => support::inw(port) as u64,
            (true, _) => support::inl(port) as u64,
            (false, 1) => {
                support::outb(port, vcpu.guest_registers.rax as u8);
                vcpu.guest_registers.rax
            }
            (false, 2) => {
                support::outw(port, vcpu.guest_registers.rax as u16);
                vcpu.guest_registers.rax
            }
            (false, _) => {
                support::outl(port, vcpu.guest_registers.rax as u32);
                vcpu.guest_registers.rax
            }
        };
    }

    if is_in {
        // IN only replaces the low `size` bytes of RAX (zero-extended for
        // 32-bit operands).
        vcpu.guest_registers.rax = match size {
            1 => (vcpu.guest_registers.rax & !0xFF) | (value & 0xFF),
            2 => (vcpu.guest_registers.rax & !0xFFFF) | (value & 0xFFFF),
            _ => value & 0xFFFF_FFFF,
        };
    }

    Ok(ExitType::IncrementRip)
}
