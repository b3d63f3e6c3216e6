//! MOV DR interception: reported upward, then emulated against the real
//! debug registers (DR7 through the VMCS so the value survives entry).

use {
    crate::{
        error::HypervisorError,
        intel::{
            support::{vmread, vmwrite},
            vcpu::Vcpu,
            vmerror::MovDrQualification,
            vmexit::ExitType,
        },
    },
    x86::{debugregs, vmx::vmcs},
};

pub fn handle_mov_dr(vcpu: &mut Vcpu) -> Result<ExitType, HypervisorError> {
    let qualification = MovDrQualification(vmread(vmcs::ro::EXIT_QUALIFICATION));
    let dr = qualification.dr_number();
    let is_read = qualification.is_mov_from_dr();

    if let Some(callback) = crate::interface::callbacks().mov_to_dr {
        callback(vcpu.index, dr, is_read);
    }

    if is_read {
        let value = unsafe {
            match dr {
                0 => debugregs::dr0() as u64,
                1 => debugregs::dr1() as u64,
                2 => debugregs::dr2() as u64,
                3 => debugregs::dr3() as u64,
                6 => debugregs::dr6().bits() as u64,
                _ => vmread(vmcs::guest::DR7),
            }
        };
        vcpu.guest_registers.set_gpr(qualification.gpr_index(), value);
    } else {
        let value = vcpu.guest_registers.gpr(qualification.gpr_index());
        unsafe {
            match dr {
                0 => debugregs::dr0_write(value as usize),
                1 => debugregs::dr1_write(value as usize),
                2 => debugregs::dr2_write(value as usize),
                3 => debugregs::dr3_write(value as usize),
                6 => debugregs::dr6_write(debugregs::Dr6::from_bits_truncate(value as usize)),
                _ => vmwrite(vmcs::guest::DR7, value),
            }
        }
    }

    Ok(ExitType::IncrementRip)
}
