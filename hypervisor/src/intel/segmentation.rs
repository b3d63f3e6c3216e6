//! Segment state gathering for the VMCS guest and host areas: access-rights
//! conversion into the VMX encoding and base/limit extraction from a live
//! descriptor table.

use {
    core::arch::asm,
    x86::{
        bits64::rflags::RFlags,
        dtables::DescriptorTablePointer,
        segmentation::SegmentSelector,
    },
};

const VMX_SEGMENT_ACCESS_RIGHTS_UNUSABLE_FLAG: u32 = 1 << 16;

/// Converts native access rights (as read with LAR) into the VMX segment
/// access-rights encoding. A null selector yields the unusable flag.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
/// 25.4.1 Guest Register State
pub fn access_rights_from_native(access_rights: u32) -> u32 {
    if access_rights == 0 {
        return VMX_SEGMENT_ACCESS_RIGHTS_UNUSABLE_FLAG;
    }

    (access_rights >> 8) & 0b1111_0000_1111_1111
}

/// LSL - Load Segment Limit. Returns 0 for selectors the CPU rejects.
pub fn lsl(selector: SegmentSelector) -> u32 {
    if selector.bits() == 0 {
        return 0;
    }
    let flags: u64;
    let limit: u64;
    unsafe {
        asm!(
            "xor {limit}, {limit}",
            "lsl {limit}, {selector}",
            "pushfq",
            "pop {flags}",
            limit = out(reg) limit,
            selector = in(reg) u64::from(selector.bits()),
            flags = lateout(reg) flags,
        );
    };
    if RFlags::from_raw(flags).contains(RFlags::FLAGS_ZF) {
        limit as u32
    } else {
        0
    }
}

/// LAR - Load Access Rights byte. Returns 0 (unusable) for selectors the CPU
/// rejects, including the null selector.
pub fn lar(selector: SegmentSelector) -> u32 {
    if selector.bits() == 0 {
        return 0;
    }
    let flags: u64;
    let access_rights: u64;
    unsafe {
        asm!(
            "xor {ar}, {ar}",
            "lar {ar}, {selector}",
            "pushfq",
            "pop {flags}",
            ar = out(reg) access_rights,
            selector = in(reg) u64::from(selector.bits()),
            flags = lateout(reg) flags,
        );
    };
    if RFlags::from_raw(flags).contains(RFlags::FLAGS_ZF) {
        access_rights as u32
    } else {
        0
    }
}

/// Reads a segment base address out of the descriptor table. System segments
/// (TSS, LDT) occupy 16 bytes in IA-32e mode and carry base bits 63:32 in
/// the second quadword.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
/// 3.4.5 Segment Descriptors, 8.2.3 TSS Descriptor in 64-bit mode
pub fn segment_base(gdtr: &DescriptorTablePointer<u64>, selector: SegmentSelector) -> u64 {
    if selector.bits() == 0 || selector.contains(SegmentSelector::TI_LDT) {
        return 0;
    }

    let index = (selector.bits() >> 3) as usize;
    let table = unsafe {
        core::slice::from_raw_parts(
            gdtr.base.cast::<u64>(),
            usize::from(gdtr.limit + 1) / core::mem::size_of::<u64>(),
        )
    };
    let descriptor = table[index];

    let mut base = descriptor_base_low(descriptor);

    // Bit 44 distinguishes code/data from system descriptors.
    let is_system = (descriptor >> 44) & 1 == 0;
    if is_system {
        let upper = table[index + 1];
        base |= (upper & 0xFFFF_FFFF) << 32;
    }

    base
}

/// Extracts base bits 31:0 scattered across a legacy segment descriptor.
fn descriptor_base_low(descriptor: u64) -> u64 {
    ((descriptor >> 16) & 0xFF_FFFF) | ((descriptor >> 32) & 0xFF00_0000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_selector_is_unusable() {
        assert_eq!(
            access_rights_from_native(0),
            VMX_SEGMENT_ACCESS_RIGHTS_UNUSABLE_FLAG
        );
    }

    #[test]
    fn access_rights_drop_reserved_bits() {
        // LAR result for a typical 64-bit ring-0 code segment: P=1, S=1,
        // type = execute/read, L=1.
        let native = 0x00A0_9B00;
        let vmx = access_rights_from_native(native);
        assert_eq!(vmx, 0xA09B);
        // Bits 11:8 are reserved in the VMX encoding and must read zero.
        assert_eq!(vmx & 0x0F00, 0);
    }

    #[test]
    fn descriptor_base_reassembly() {
        // Descriptor with base = 0x12345678: base 23:16 = 0x34 at bits
        // 39:32, base 31:24 = 0x12 at bits 63:56, base 15:0 at bits 39:16.
        let descriptor: u64 = (0x12u64 << 56) | (0x34u64 << 32) | (0x5678u64 << 16);
        assert_eq!(descriptor_base_low(descriptor), 0x12345678);
    }
}
