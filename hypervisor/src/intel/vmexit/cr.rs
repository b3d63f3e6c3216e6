//! Control-register access interception. CR3 writes are the interesting
//! case: with mov-to-cr3 reporting enabled each one is surfaced as a
//! context-switch event before being reflected. CR0/CR4 writes honor the
//! guest/host masks the upper layers raised.

use {
    crate::{
        error::HypervisorError,
        intel::{
            invvpid::{invvpid_single_context, VPID_TAG},
            support::{vmread, vmwrite},
            vcpu::Vcpu,
            vmerror::{CrAccessQualification, CrAccessType},
            vmexit::ExitType,
        },
    },
    log::*,
    x86::vmx::vmcs,
};

/// CR3 bit 63: do not invalidate PCID-tagged translations on load.
const CR3_NO_FLUSH_BIT: u64 = 1 << 63;

pub fn handle_cr_access(vcpu: &mut Vcpu) -> Result<ExitType, HypervisorError> {
    let qualification = CrAccessQualification(vmread(vmcs::ro::EXIT_QUALIFICATION));

    match (qualification.access_type(), qualification.cr_number()) {
        (CrAccessType::MovToCr, 3) => {
            let mut new_cr3 = vcpu.guest_registers.gpr(qualification.gpr_index());

            if vcpu.report_mov_to_cr3 {
                if let Some(callback) = crate::interface::callbacks().mov_to_cr3 {
                    callback(vcpu.index, new_cr3);
                }
            }

            // The no-flush hint is not storable in the VMCS field.
            new_cr3 &= !CR3_NO_FLUSH_BIT;
            vmwrite(vmcs::guest::CR3, new_cr3);

            // All VPs share one tag; drop this address space's stale
            // linear translations.
            invvpid_single_context(VPID_TAG);
        }
        (CrAccessType::MovFromCr, 3) => {
            let value = vmread(vmcs::guest::CR3);
            vcpu.guest_registers.set_gpr(qualification.gpr_index(), value);
        }
        (CrAccessType::MovToCr, 0) => {
            let value = vcpu.guest_registers.gpr(qualification.gpr_index());
            vmwrite(vmcs::guest::CR0, value);
            vmwrite(vmcs::control::CR0_READ_SHADOW, value);
        }
        (CrAccessType::MovToCr, 4) => {
            let value = vcpu.guest_registers.gpr(qualification.gpr_index());
            vmwrite(vmcs::guest::CR4, value);
            vmwrite(vmcs::control::CR4_READ_SHADOW, value);
        }
        (CrAccessType::MovFromCr, 0) => {
            let value = vmread(vmcs::guest::CR0);
            vcpu.guest_registers.set_gpr(qualification.gpr_index(), value);
        }
        (CrAccessType::MovFromCr, 4) => {
            let value = vmread(vmcs::guest::CR4);
            vcpu.guest_registers.set_gpr(qualification.gpr_index(), value);
        }
        (CrAccessType::Clts, _) => {
            const CR0_TS: u64 = 1 << 3;
            vmwrite(vmcs::guest::CR0, vmread(vmcs::guest::CR0) & !CR0_TS);
            vmwrite(
                vmcs::control::CR0_READ_SHADOW,
                vmread(vmcs::control::CR0_READ_SHADOW) & !CR0_TS,
            );
        }
        (CrAccessType::Lmsw, _) => {
            // Low four CR0 bits only; PE cannot be cleared by LMSW.
            let source = qualification.lmsw_source_data() & 0xF;
            let current = vmread(vmcs::guest::CR0);
            let new = (current & !0xE) | (source & 0xE) | (current & 1 | source & 1);
            vmwrite(vmcs::guest::CR0, new);
        }
        (access, cr) => {
            warn!("Unhandled CR access: {:?} on CR{}", access, cr);
        }
    }

    Ok(ExitType::IncrementRip)
}
