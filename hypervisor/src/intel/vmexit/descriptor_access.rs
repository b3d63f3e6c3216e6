//! Descriptor-table access exiting: when armed, the guest's SGDT/SIDT/
//! LGDT/LIDT and SLDT/STR/LLDT/LTR are emulated here, which is what lets
//! the debugger interpose on (or hide) the real tables.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
//! Table 28-10. Format of the VM-Exit Instruction-Information Field as Used
//! for LIDT, LGDT, SIDT, or SGDT

use {
    crate::{
        error::HypervisorError,
        intel::{
            paging::GuestPageWalk,
            support::{vmread, vmwrite},
            vcpu::Vcpu,
            vmerror::VmxBasicExitReason,
            vmexit::ExitType,
        },
    },
    bitfield::bitfield,
    log::*,
    x86::vmx::vmcs,
};

bitfield! {
    /// VM-exit instruction information for descriptor-table accesses.
    #[derive(Clone, Copy)]
    struct DescriptorInstructionInfo(u32);
    impl Debug;

    scaling, _: 1, 0;
    /// Register operand of the LDTR/TR forms when Mod is 11.
    register1, _: 6, 3;
    /// Operand is a register, not memory (LDTR/TR forms only).
    register_operand, _: 10;
    segment_register, _: 17, 15;
    index_register, _: 21, 18;
    index_register_invalid, _: 22;
    base_register, _: 26, 23;
    base_register_invalid, _: 27;
    /// GDTR/IDTR: 0 SGDT, 1 SIDT, 2 LGDT, 3 LIDT.
    /// LDTR/TR: 0 SLDT, 1 STR, 2 LLDT, 3 LTR.
    identity, _: 29, 28;
}

pub fn handle_descriptor_access(
    vcpu: &mut Vcpu,
    reason: VmxBasicExitReason,
) -> Result<ExitType, HypervisorError> {
    let info = DescriptorInstructionInfo(vmread(vmcs::ro::VMEXIT_INSTRUCTION_INFO) as u32);
    let displacement = vmread(vmcs::ro::EXIT_QUALIFICATION);

    let linear_address = memory_operand_address(vcpu, &info, displacement);
    let walker = GuestPageWalk::current_guest();

    match (reason, info.identity()) {
        (VmxBasicExitReason::AccessToGdtrOrIdtr, 0) => {
            // SGDT
            store_table_register(&walker, linear_address, vmcs::guest::GDTR_LIMIT, vmcs::guest::GDTR_BASE);
        }
        (VmxBasicExitReason::AccessToGdtrOrIdtr, 1) => {
            // SIDT
            store_table_register(&walker, linear_address, vmcs::guest::IDTR_LIMIT, vmcs::guest::IDTR_BASE);
        }
        (VmxBasicExitReason::AccessToGdtrOrIdtr, 2) => {
            // LGDT
            load_table_register(&walker, linear_address, vmcs::guest::GDTR_LIMIT, vmcs::guest::GDTR_BASE);
        }
        (VmxBasicExitReason::AccessToGdtrOrIdtr, _) => {
            // LIDT
            load_table_register(&walker, linear_address, vmcs::guest::IDTR_LIMIT, vmcs::guest::IDTR_BASE);
        }
        (_, identity) => {
            // SLDT/STR store a selector; LLDT/LTR load one. Register
            // operands bypass memory entirely.
            let selector_field = if identity == 0 || identity == 2 {
                vmcs::guest::LDTR_SELECTOR
            } else {
                vmcs::guest::TR_SELECTOR
            };

            if identity <= 1 {
                let selector = vmread(selector_field) as u16;
                if info.register_operand() {
                    vcpu.guest_registers
                        .set_gpr(info.register1() as u64, selector as u64);
                } else {
                    walker.write_bytes(linear_address, &selector.to_le_bytes());
                }
            } else {
                let selector = if info.register_operand() {
                    vcpu.guest_registers.gpr(info.register1() as u64) as u16
                } else {
                    let mut bytes = [0u8; 2];
                    walker.read_bytes(linear_address, &mut bytes);
                    u16::from_le_bytes(bytes)
                };
                trace!("Guest loads selector {selector:#x} into {selector_field:#x}");
                vmwrite(selector_field, selector);
            }
        }
    }

    Ok(ExitType::IncrementRip)
}

/// Effective linear address of the memory operand: base + scaled index +
/// displacement. Segment bases are zero in long mode except FS/GS, which
/// these instructions do not use in practice.
fn memory_operand_address(vcpu: &Vcpu, info: &DescriptorInstructionInfo, displacement: u64) -> u64 {
    let mut address = displacement;

    if !info.base_register_invalid() {
        address = address.wrapping_add(vcpu.guest_registers.gpr(info.base_register() as u64));
    }
    if !info.index_register_invalid() {
        let index = vcpu.guest_registers.gpr(info.index_register() as u64);
        address = address.wrapping_add(index << info.scaling());
    }

    address
}

/// Writes the 10-byte limit:base image the S-forms produce.
fn store_table_register(walker: &GuestPageWalk, linear_address: u64, limit_field: u32, base_field: u32) {
    let limit = vmread(limit_field) as u16;
    let base = vmread(base_field);

    let mut image = [0u8; 10];
    image[..2].copy_from_slice(&limit.to_le_bytes());
    image[2..].copy_from_slice(&base.to_le_bytes());

    if walker.write_bytes(linear_address, &image) != image.len() {
        warn!("Descriptor-table store to unmapped memory at {linear_address:#x}");
    }
}

/// Reads the 10-byte limit:base image the L-forms consume.
fn load_table_register(walker: &GuestPageWalk, linear_address: u64, limit_field: u32, base_field: u32) {
    let mut image = [0u8; 10];
    if walker.read_bytes(linear_address, &mut image) != image.len() {
        warn!("Descriptor-table load from unmapped memory at {linear_address:#x}");
        return;
    }

    let limit = u16::from_le_bytes(image[..2].try_into().unwrap());
    let base = u64::from_le_bytes(image[2..].try_into().unwrap());

    vmwrite(limit_field, limit as u64);
    vmwrite(base_field, base);
}
