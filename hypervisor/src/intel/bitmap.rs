//! The MSR bitmap and the I/O bitmap pair pointed at by the VMCS. All bits
//! start clear (no interception); upper layers mark individual MSRs or ports
//! through the broadcast layer.

use bit_field::BitField;

/// The direction of an MSR access.
pub enum MsrAccessType {
    Read,
    Write,
}

/// Whether to start or stop intercepting an MSR or port.
pub enum InterceptOperation {
    Hook,
    Unhook,
}

/// The MSR bitmap: four 1 KiB sections selecting RDMSR/WRMSR exits for the
/// low (0x0000_0000..0x0000_1FFF) and high (0xC000_0000..0xC000_1FFF)
/// MSR ranges.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
/// 25.6.9 MSR-Bitmap Address
#[repr(C, align(4096))]
pub struct MsrBitmap {
    pub read_low_msrs: [u8; 0x400],
    pub read_high_msrs: [u8; 0x400],
    pub write_low_msrs: [u8; 0x400],
    pub write_high_msrs: [u8; 0x400],
}

impl MsrBitmap {
    /// Sets or clears the interception bit for `msr`. MSRs outside both
    /// bitmap ranges always exit regardless of the bitmap and are ignored
    /// here.
    pub fn modify_msr_interception(
        &mut self,
        msr: u32,
        access: MsrAccessType,
        operation: InterceptOperation,
    ) {
        let msr_low = msr & 0x1FFF;
        let byte_index = (msr_low >> 3) as usize;
        let bit_index = (msr_low & 7) as usize;

        let section = match (msr >= 0xC000_0000, access) {
            (true, MsrAccessType::Write) => &mut self.write_high_msrs,
            (true, MsrAccessType::Read) => &mut self.read_high_msrs,
            (false, MsrAccessType::Write) => &mut self.write_low_msrs,
            (false, MsrAccessType::Read) => &mut self.read_low_msrs,
        };

        match operation {
            InterceptOperation::Hook => section[byte_index].set_bit(bit_index, true),
            InterceptOperation::Unhook => section[byte_index].set_bit(bit_index, false),
        };
    }

    /// Returns whether the given access currently exits.
    pub fn is_intercepted(&self, msr: u32, access: MsrAccessType) -> bool {
        let msr_low = msr & 0x1FFF;
        let section = match (msr >= 0xC000_0000, access) {
            (true, MsrAccessType::Write) => &self.write_high_msrs,
            (true, MsrAccessType::Read) => &self.read_high_msrs,
            (false, MsrAccessType::Write) => &self.write_low_msrs,
            (false, MsrAccessType::Read) => &self.read_low_msrs,
        };
        section[(msr_low >> 3) as usize].get_bit((msr_low & 7) as usize)
    }
}

/// The I/O bitmap pair: A covers ports 0x0000..0x7FFF, B covers
/// 0x8000..0xFFFF. One bit per port; a set bit causes IN/OUT (and their
/// string forms) on that port to exit.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
/// 25.6.4 I/O-Bitmap Addresses
#[repr(C, align(4096))]
pub struct IoBitmaps {
    pub io_bitmap_a: [u8; 0x1000],
    pub io_bitmap_b: [u8; 0x1000],
}

impl IoBitmaps {
    /// Sets or clears the interception bit for `port`.
    pub fn modify_io_interception(&mut self, port: u16, operation: InterceptOperation) {
        let (section, port) = if port < 0x8000 {
            (&mut self.io_bitmap_a, port)
        } else {
            (&mut self.io_bitmap_b, port - 0x8000)
        };

        let byte_index = (port >> 3) as usize;
        let bit_index = (port & 7) as usize;

        match operation {
            InterceptOperation::Hook => section[byte_index].set_bit(bit_index, true),
            InterceptOperation::Unhook => section[byte_index].set_bit(bit_index, false),
        };
    }

    /// Returns whether the given port currently exits.
    pub fn is_intercepted(&self, port: u16) -> bool {
        let (section, port) = if port < 0x8000 {
            (&self.io_bitmap_a, port)
        } else {
            (&self.io_bitmap_b, port - 0x8000)
        };
        section[(port >> 3) as usize].get_bit((port & 7) as usize)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::allocate::box_zeroed};

    #[test]
    fn msr_bitmap_low_and_high_ranges() {
        let mut bitmap = unsafe { box_zeroed::<MsrBitmap>() };

        bitmap.modify_msr_interception(
            x86::msr::IA32_LSTAR,
            MsrAccessType::Write,
            InterceptOperation::Hook,
        );
        assert!(bitmap.is_intercepted(x86::msr::IA32_LSTAR, MsrAccessType::Write));
        assert!(!bitmap.is_intercepted(x86::msr::IA32_LSTAR, MsrAccessType::Read));

        // IA32_LSTAR = 0xC000_0082 -> high write section, byte 16, bit 2.
        assert_eq!(bitmap.write_high_msrs[0x82 >> 3], 1 << 2);
        assert!(bitmap.read_high_msrs.iter().all(|b| *b == 0));

        bitmap.modify_msr_interception(
            x86::msr::IA32_LSTAR,
            MsrAccessType::Write,
            InterceptOperation::Unhook,
        );
        assert!(!bitmap.is_intercepted(x86::msr::IA32_LSTAR, MsrAccessType::Write));
    }

    #[test]
    fn msr_bitmap_only_marks_requested_access() {
        let mut bitmap = unsafe { box_zeroed::<MsrBitmap>() };

        bitmap.modify_msr_interception(0x1B, MsrAccessType::Read, InterceptOperation::Hook);
        assert!(bitmap.is_intercepted(0x1B, MsrAccessType::Read));
        assert!(!bitmap.is_intercepted(0x1B, MsrAccessType::Write));
        assert!(!bitmap.is_intercepted(0x1C, MsrAccessType::Read));
    }

    #[test]
    fn io_bitmap_splits_at_0x8000() {
        let mut bitmaps = unsafe { box_zeroed::<IoBitmaps>() };

        bitmaps.modify_io_interception(0x60, InterceptOperation::Hook);
        bitmaps.modify_io_interception(0x8001, InterceptOperation::Hook);

        assert!(bitmaps.is_intercepted(0x60));
        assert!(bitmaps.is_intercepted(0x8001));
        assert!(!bitmaps.is_intercepted(0x61));

        assert_eq!(bitmaps.io_bitmap_a[0x60 >> 3], 1 << (0x60 & 7));
        assert_eq!(bitmaps.io_bitmap_b[0], 1 << 1);

        bitmaps.modify_io_interception(0x60, InterceptOperation::Unhook);
        assert!(!bitmaps.is_intercepted(0x60));
        assert!(bitmaps.is_intercepted(0x8001));
    }
}
