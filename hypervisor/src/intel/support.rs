//! Thin wrappers over the CPU primitives the hypervisor is built on: VMX
//! instructions, MSR and control-register access, descriptor-table access
//! and the VMCALL/VMFUNC entry points into VMX root.

#![allow(dead_code)]

use {
    crate::{
        error::HypervisorError,
        intel::vmerror::VmInstructionError,
    },
    core::arch::asm,
    x86::vmx::vmcs,
};

/// Enable VMX operation. The region must hold the VMCS revision identifier.
pub fn vmxon(vmxon_region_pa: u64) -> Result<(), HypervisorError> {
    unsafe { x86::bits64::vmx::vmxon(vmxon_region_pa) }.map_err(|_| HypervisorError::VmxonFailed)
}

/// Disable VMX operation on the current logical processor.
pub fn vmxoff() -> Result<(), HypervisorError> {
    unsafe { x86::bits64::vmx::vmxoff() }.map_err(|_| HypervisorError::VmxoffFailed)
}

/// Copy VMCS data to the VMCS region and mark it clear.
pub fn vmclear(vmcs_region_pa: u64) -> Result<(), HypervisorError> {
    unsafe { x86::bits64::vmx::vmclear(vmcs_region_pa) }.map_err(|_| HypervisorError::VmclearFailed)
}

/// Make the given VMCS region current and active.
pub fn vmptrld(vmcs_region_pa: u64) -> Result<(), HypervisorError> {
    unsafe { x86::bits64::vmx::vmptrld(vmcs_region_pa) }.map_err(|_| HypervisorError::VmptrldFailed)
}

/// Read a specified field from the current VMCS.
pub fn vmread(field: u32) -> u64 {
    unsafe { x86::bits64::vmx::vmread(field) }.unwrap_or(0)
}

/// Write to a specified field in the current VMCS.
pub fn vmwrite<T: Into<u64>>(field: u32, val: T)
where
    u64: From<T>,
{
    unsafe { x86::bits64::vmx::vmwrite(field, u64::from(val)) }.unwrap();
}

/// Reads the VM-instruction error field and classifies it.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
/// 31.4 VM INSTRUCTION ERROR NUMBERS
pub fn vm_instruction_error() -> Option<VmInstructionError> {
    VmInstructionError::from_u32(vmread(vmcs::ro::VM_INSTRUCTION_ERROR) as u32)
}

/// Issues a VMCALL with the hypercall number in RCX and up to three
/// parameters, returning the NTSTATUS-style result the root handler left in
/// RAX.
pub fn vmcall(number: u64, param1: u64, param2: u64, param3: u64) -> u64 {
    let status: u64;
    unsafe {
        asm!(
            "vmcall",
            inout("rcx") number => _,
            in("rdx") param1,
            in("r8") param2,
            in("r9") param3,
            out("rax") status,
            options(nostack),
        );
    }
    status
}

/// Issues VMFUNC (function 0 = EPTP switching) with the given EPTP-list
/// index. Executed from VMX non-root without causing a VM exit.
pub fn vmfunc(eptp_index: u32, function: u32) {
    unsafe {
        asm!(
            "vmfunc",
            in("rax") function as u64,
            in("rcx") eptp_index as u64,
            options(nostack),
        );
    }
}

/// Reads an MSR.
pub fn rdmsr(msr: u32) -> u64 {
    unsafe { x86::msr::rdmsr(msr) }
}

/// Writes a value to an MSR.
pub fn wrmsr(msr: u32, value: u64) {
    unsafe { x86::msr::wrmsr(msr, value) };
}

/// Reads the CR0 register.
pub fn cr0() -> x86::controlregs::Cr0 {
    unsafe { x86::controlregs::cr0() }
}

/// Writes a value to the CR0 register.
pub fn cr0_write(val: u64) {
    unsafe { x86_64::registers::control::Cr0::write_raw(val) };
}

/// Reads the CR3 register.
pub fn cr3() -> u64 {
    unsafe { x86::controlregs::cr3() }
}

/// Writes a value to the CR3 register.
pub fn cr3_write(val: u64) {
    unsafe { x86::controlregs::cr3_write(val) };
}

/// Reads the CR4 register.
pub fn cr4() -> u64 {
    x86_64::registers::control::Cr4::read_raw()
}

/// Writes a value to the CR4 register.
pub fn cr4_write(val: u64) {
    unsafe { x86_64::registers::control::Cr4::write_raw(val) };
}

/// Writes a value to the CR2 register.
pub fn cr2_write(val: u64) {
    unsafe { x86::controlregs::cr2_write(val) };
}

/// Reads the DR7 register.
pub fn dr7_read() -> u64 {
    unsafe { x86::debugregs::dr7().0 as u64 }
}

/// Reads the effective guest CR0 combining the read shadow with the
/// guest/host mask.
pub fn read_effective_guest_cr0() -> u64 {
    let mask = vmread(vmcs::control::CR0_GUEST_HOST_MASK);
    vmread(vmcs::control::CR0_READ_SHADOW) & mask | vmread(vmcs::guest::CR0) & !mask
}

/// Reads the effective guest CR4 combining the read shadow with the
/// guest/host mask.
pub fn read_effective_guest_cr4() -> u64 {
    let mask = vmread(vmcs::control::CR4_GUEST_HOST_MASK);
    vmread(vmcs::control::CR4_READ_SHADOW) & mask | vmread(vmcs::guest::CR4) & !mask
}

/// Write back all modified cache contents to memory and invalidate the caches.
#[inline(always)]
pub fn wbinvd() {
    unsafe {
        asm!("wbinvd", options(nostack, nomem));
    }
}

/// Returns the timestamp counter value.
pub fn rdtsc() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Write to Extended Control Register XCR0. Only valid when CR4.OSXSAVE is set.
pub fn xsetbv(val: u64) {
    unsafe {
        x86_64::registers::xcontrol::XCr0::write_raw(val);
    }
}

/// Disables maskable interrupts.
pub fn cli() {
    unsafe { x86::irq::disable() };
}

/// Enables maskable interrupts.
pub fn sti() {
    unsafe { x86::irq::enable() };
}

/// Halts execution of the processor.
pub fn hlt() {
    unsafe { x86::halt() };
}

/// Reads 8-bits from an IO port.
pub fn inb(port: u16) -> u8 {
    unsafe { x86::io::inb(port) }
}

/// Writes 8-bits to an IO port.
pub fn outb(port: u16, val: u8) {
    unsafe { x86::io::outb(port, val) };
}

/// Reads 16-bits from an IO port.
pub fn inw(port: u16) -> u16 {
    unsafe { x86::io::inw(port) }
}

/// Writes 16-bits to an IO port.
pub fn outw(port: u16, val: u16) {
    unsafe { x86::io::outw(port, val) };
}

/// Reads 32-bits from an IO port.
pub fn inl(port: u16) -> u32 {
    unsafe { x86::io::inl(port) }
}

/// Writes 32-bits to an IO port.
pub fn outl(port: u16, val: u32) {
    unsafe { x86::io::outl(port, val) };
}

/// Reads the IDTR register.
pub fn sidt() -> x86::dtables::DescriptorTablePointer<u64> {
    let mut idtr = x86::dtables::DescriptorTablePointer::<u64>::default();
    unsafe { x86::dtables::sidt(&mut idtr) };
    idtr
}

/// Reads the GDTR register.
pub fn sgdt() -> x86::dtables::DescriptorTablePointer<u64> {
    let mut gdtr = x86::dtables::DescriptorTablePointer::<u64>::default();
    unsafe { x86::dtables::sgdt(&mut gdtr) };
    gdtr
}

/// Loads the IDTR register.
pub fn lidt(idtr: &x86::dtables::DescriptorTablePointer<u64>) {
    unsafe { x86::dtables::lidt(idtr) };
}

/// Loads the GDTR register.
pub fn lgdt(gdtr: &x86::dtables::DescriptorTablePointer<u64>) {
    unsafe { x86::dtables::lgdt(gdtr) };
}
