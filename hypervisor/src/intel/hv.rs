//! Per-core VMCS mutation helpers. Everything here runs on the core that
//! owns the current VMCS, either inside a VMCALL handler or from a DPC at
//! dispatch IRQL, and implements the enable/disable knobs the configuration
//! surface exposes.

use {
    crate::intel::{
        support::{vmread, vmwrite},
        vmcs::{adjust_vmx_controls, VmxControl},
    },
    x86::vmx::vmcs,
};

fn update_primary_controls(set: u32, clear: u32) {
    let current = vmread(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS) as u32;
    let requested = (current | set) & !clear;
    vmwrite(
        vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS,
        adjust_vmx_controls(VmxControl::ProcessorBased, requested as u64),
    );
}

fn update_secondary_controls(set: u32, clear: u32) {
    let current = vmread(vmcs::control::SECONDARY_PROCBASED_EXEC_CONTROLS) as u32;
    let requested = (current | set) & !clear;
    vmwrite(
        vmcs::control::SECONDARY_PROCBASED_EXEC_CONTROLS,
        adjust_vmx_controls(VmxControl::ProcessorBased2, requested as u64),
    );
}

fn update_pin_controls(set: u32, clear: u32) {
    let current = vmread(vmcs::control::PINBASED_EXEC_CONTROLS) as u32;
    let requested = (current | set) & !clear;
    vmwrite(
        vmcs::control::PINBASED_EXEC_CONTROLS,
        adjust_vmx_controls(VmxControl::PinBased, requested as u64),
    );
}

fn update_exit_controls(set: u32, clear: u32) {
    let current = vmread(vmcs::control::VMEXIT_CONTROLS) as u32;
    let requested = (current | set) & !clear;
    vmwrite(
        vmcs::control::VMEXIT_CONTROLS,
        adjust_vmx_controls(VmxControl::VmExit, requested as u64),
    );
}

/// CR3-load exiting: every `mov cr3, ...` in the guest becomes a
/// control-register access exit (one per context switch).
pub fn set_mov_to_cr3_exiting(enable: bool) {
    let bit = vmcs::control::PrimaryControls::CR3_LOAD_EXITING.bits();
    if enable {
        update_primary_controls(bit, 0);
    } else {
        update_primary_controls(0, bit);
    }
}

/// RDTSC/RDTSCP exiting.
pub fn set_rdtsc_exiting(enable: bool) {
    let bit = vmcs::control::PrimaryControls::RDTSC_EXITING.bits();
    if enable {
        update_primary_controls(bit, 0);
    } else {
        update_primary_controls(0, bit);
    }
}

/// RDPMC exiting.
pub fn set_rdpmc_exiting(enable: bool) {
    let bit = vmcs::control::PrimaryControls::RDPMC_EXITING.bits();
    if enable {
        update_primary_controls(bit, 0);
    } else {
        update_primary_controls(0, bit);
    }
}

/// MOV DR exiting.
pub fn set_mov_to_dr_exiting(enable: bool) {
    let bit = vmcs::control::PrimaryControls::MOV_DR_EXITING.bits();
    if enable {
        update_primary_controls(bit, 0);
    } else {
        update_primary_controls(0, bit);
    }
}

/// INVLPG exiting; paired with individual-address INVVPID on reflection.
pub fn set_invlpg_exiting(enable: bool) {
    let bit = vmcs::control::PrimaryControls::INVLPG_EXITING.bits();
    if enable {
        update_primary_controls(bit, 0);
    } else {
        update_primary_controls(0, bit);
    }
}

/// HLT exiting.
pub fn set_hlt_exiting(enable: bool) {
    let bit = vmcs::control::PrimaryControls::HLT_EXITING.bits();
    if enable {
        update_primary_controls(bit, 0);
    } else {
        update_primary_controls(0, bit);
    }
}

/// Descriptor-table exiting: GDTR/IDTR/LDTR/TR loads and stores exit.
pub fn set_descriptor_table_exiting(enable: bool) {
    let bit = vmcs::control::SecondaryControls::DTABLE_EXITING.bits();
    if enable {
        update_secondary_controls(bit, 0);
    } else {
        update_secondary_controls(0, bit);
    }
}

/// External-interrupt exiting. Interrupts are acknowledged on exit so the
/// dispatcher can re-inject them after the upper layers have seen the
/// vector.
pub fn set_external_interrupt_exiting(enable: bool) {
    let pin = vmcs::control::PinbasedControls::EXTERNAL_INTERRUPT_EXITING.bits();
    let ack = vmcs::control::ExitControls::ACK_INTERRUPT_ON_EXIT.bits();
    if enable {
        update_pin_controls(pin, 0);
        update_exit_controls(ack, 0);
    } else {
        update_pin_controls(0, pin);
        update_exit_controls(0, ack);
    }
}

/// NMI exiting, delivering guest NMIs to the dispatcher for queued
/// re-injection.
pub fn set_nmi_exiting(enable: bool) {
    let bit = vmcs::control::PinbasedControls::NMI_EXITING.bits();
    if enable {
        update_pin_controls(bit, 0);
    } else {
        update_pin_controls(0, bit);
    }
}

/// Replaces the exception bitmap outright. Bit `n` makes vector `n` exit.
pub fn set_exception_bitmap(mask: u32) {
    vmwrite(vmcs::control::EXCEPTION_BITMAP, mask);
}

/// Adds or removes a single vector in the exception bitmap.
pub fn update_exception_bitmap(vector: u32, intercept: bool) {
    let mut bitmap = vmread(vmcs::control::EXCEPTION_BITMAP) as u32;
    if intercept {
        bitmap |= 1 << vector;
    } else {
        bitmap &= !(1 << vector);
    }
    vmwrite(vmcs::control::EXCEPTION_BITMAP, bitmap);
}

pub fn exception_bitmap() -> u32 {
    vmread(vmcs::control::EXCEPTION_BITMAP) as u32
}

/// Options for MOV-to-CR interception on CR0/CR4.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrInterceptOptions {
    pub cr0_mask: u64,
    pub cr4_mask: u64,
}

/// Raises (or clears) the CR0/CR4 guest/host masks. Bits owned by the host
/// cause exits when the guest flips them; reads come from the shadows.
pub fn set_mov_to_cr_exiting(enable: bool, options: CrInterceptOptions) {
    if enable {
        vmwrite(vmcs::control::CR0_READ_SHADOW, vmread(vmcs::guest::CR0));
        vmwrite(vmcs::control::CR4_READ_SHADOW, vmread(vmcs::guest::CR4));
        vmwrite(vmcs::control::CR0_GUEST_HOST_MASK, options.cr0_mask);
        vmwrite(vmcs::control::CR4_GUEST_HOST_MASK, options.cr4_mask);
    } else {
        vmwrite(vmcs::control::CR0_GUEST_HOST_MASK, 0u64);
        vmwrite(vmcs::control::CR4_GUEST_HOST_MASK, 0u64);
    }
}

/// Arms the VMX preemption timer with the given tick value, or disarms it.
pub fn set_preemption_timer(value: Option<u64>) {
    let bit = vmcs::control::PinbasedControls::VMX_PREEMPTION_TIMER.bits();
    match value {
        Some(ticks) => {
            update_pin_controls(bit, 0);
            vmwrite(vmcs::guest::VMX_PREEMPTION_TIMER_VALUE, ticks);
        }
        None => update_pin_controls(0, bit),
    }
}

/// Reads the preemption timer's current value.
pub fn preemption_timer_value() -> u64 {
    vmread(vmcs::guest::VMX_PREEMPTION_TIMER_VALUE)
}

/// Secondary control bit 17: page-modification logging.
const SECONDARY_ENABLE_PML: u32 = 1 << 17;

/// Secondary control bit 22: mode-based execute control for EPT.
const SECONDARY_MODE_BASED_EXECUTE: u32 = 1 << 22;

/// Starts page-modification logging into the given 4 KiB buffer. The CPU
/// decrements the index towards zero and exits with reason 62 when full.
pub fn enable_pml(pml_buffer_pa: u64) {
    vmwrite(vmcs::control::PML_ADDR_FULL, pml_buffer_pa);
    vmwrite(vmcs::guest::PML_INDEX, 511u64);
    update_secondary_controls(SECONDARY_ENABLE_PML, 0);
}

/// Stops page-modification logging.
pub fn disable_pml() {
    update_secondary_controls(0, SECONDARY_ENABLE_PML);
}

/// Resets the PML index after draining a full log.
pub fn reset_pml_index() {
    vmwrite(vmcs::guest::PML_INDEX, 511u64);
}

/// Switches this core onto `eptp` with mode-based execute control on or
/// off. Used by the reversing-machine hooks backed by the secondary EPT.
pub fn set_mode_based_exec_control(enable: bool, eptp: u64) {
    vmwrite(vmcs::control::EPTP_FULL, eptp);
    if enable {
        update_secondary_controls(SECONDARY_MODE_BASED_EXECUTE, 0);
    } else {
        update_secondary_controls(0, SECONDARY_MODE_BASED_EXECUTE);
    }
    crate::intel::invept::invept_all_contexts();
}
