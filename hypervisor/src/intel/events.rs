//! VM-entry event injection: the interruption-information encoding and the
//! per-VCPU pending queue (at most one NMI and one interrupt/exception per
//! entry).
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
//! 27.6 EVENT INJECTION

use {
    crate::intel::support::{vmread, vmwrite},
    bitfield::bitfield,
    x86::vmx::vmcs,
};

bitfield! {
    /// The VM-Entry Interruption-Information field.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's
    /// Manual: Table 25-17. Format of the VM-Entry Interruption-Information
    /// Field
    #[derive(Clone, Copy)]
    pub struct EventInjection(u32);
    impl Debug;

    /// Vector of the interrupt or exception.
    pub vector, set_vector: 7, 0;
    /// Interruption type.
    pub event_type, set_event_type: 10, 8;
    /// Deliver error code on the guest stack.
    pub deliver_error_code, set_deliver_error_code: 11;
    /// Valid.
    pub valid, set_valid: 31;
}

/// Exception vectors this hypervisor injects or recognizes.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExceptionVector {
    DivideError = 0,
    Debug = 1,
    Nmi = 2,
    Breakpoint = 3,
    Overflow = 4,
    BoundRangeExceeded = 5,
    InvalidOpcode = 6,
    DeviceNotAvailable = 7,
    DoubleFault = 8,
    InvalidTss = 10,
    SegmentNotPresent = 11,
    StackSegmentFault = 12,
    GeneralProtection = 13,
    PageFault = 14,
}

/// Interruption types for the injection field.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InterruptionType {
    ExternalInterrupt = 0,
    NonMaskableInterrupt = 2,
    HardwareException = 3,
    SoftwareInterrupt = 4,
    PrivilegedSoftwareException = 5,
    SoftwareException = 6,
    OtherEvent = 7,
}

impl InterruptionType {
    pub fn from_u32(value: u32) -> Self {
        match value & 0b111 {
            0 => Self::ExternalInterrupt,
            2 => Self::NonMaskableInterrupt,
            3 => Self::HardwareException,
            4 => Self::SoftwareInterrupt,
            5 => Self::PrivilegedSoftwareException,
            6 => Self::SoftwareException,
            _ => Self::OtherEvent,
        }
    }
}

/// An event queued for delivery on the next VM entry.
#[derive(Debug, Clone, Copy)]
pub struct PendingEvent {
    pub vector: u32,
    pub event_type: InterruptionType,
    pub error_code: Option<u32>,
    /// Instruction length for software interrupts/exceptions.
    pub instruction_length: Option<u64>,
}

impl PendingEvent {
    pub fn exception(vector: ExceptionVector, error_code: Option<u32>) -> Self {
        Self {
            vector: vector as u32,
            event_type: InterruptionType::HardwareException,
            error_code,
            instruction_length: None,
        }
    }

    pub fn external_interrupt(vector: u32) -> Self {
        Self {
            vector,
            event_type: InterruptionType::ExternalInterrupt,
            error_code: None,
            instruction_length: None,
        }
    }

    pub fn nmi() -> Self {
        Self {
            vector: ExceptionVector::Nmi as u32,
            event_type: InterruptionType::NonMaskableInterrupt,
            error_code: None,
            instruction_length: None,
        }
    }

    /// Encodes this event into the interruption-information format.
    pub fn encode(&self) -> u32 {
        let mut event = EventInjection(0);
        event.set_vector(self.vector);
        event.set_event_type(self.event_type as u32);
        event.set_deliver_error_code(self.error_code.is_some());
        event.set_valid(true);
        event.0
    }

    /// Writes this event into the VM-entry injection fields of the current
    /// VMCS. Delivery happens on the next VM entry.
    pub fn inject(&self) {
        if let Some(error_code) = self.error_code {
            vmwrite(vmcs::control::VMENTRY_EXCEPTION_ERR_CODE, error_code);
        }
        if let Some(length) = self.instruction_length {
            vmwrite(vmcs::control::VMENTRY_INSTRUCTION_LEN, length);
        }
        vmwrite(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD, self.encode());
    }
}

/// Injects #GP(error_code) into the guest.
pub fn inject_general_protection(error_code: u32) {
    PendingEvent::exception(ExceptionVector::GeneralProtection, Some(error_code)).inject();
}

/// Injects #UD into the guest.
pub fn inject_undefined_opcode() {
    PendingEvent::exception(ExceptionVector::InvalidOpcode, None).inject();
}

/// Injects #BP into the guest as a software exception so the guest IDT sees
/// an ordinary INT3.
pub fn inject_breakpoint() {
    let event = PendingEvent {
        vector: ExceptionVector::Breakpoint as u32,
        event_type: InterruptionType::SoftwareException,
        error_code: None,
        instruction_length: Some(1),
    };
    event.inject();
}

/// Re-injects #PF with the faulting linear address placed in CR2 by the
/// caller.
pub fn inject_page_fault(error_code: u32) {
    PendingEvent::exception(ExceptionVector::PageFault, Some(error_code)).inject();
}

/// Reads back the event (if any) the CPU reported in the VM-exit
/// interruption-information field.
pub fn exit_interruption_info() -> Option<EventInjection> {
    let info = EventInjection(vmread(vmcs::ro::VMEXIT_INTERRUPTION_INFO) as u32);
    info.valid().then_some(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gp_with_error_code_encoding() {
        let event = PendingEvent::exception(ExceptionVector::GeneralProtection, Some(0));
        let encoded = event.encode();
        assert_eq!(encoded & 0xFF, 13);
        assert_eq!((encoded >> 8) & 0b111, InterruptionType::HardwareException as u32);
        assert_ne!(encoded & (1 << 11), 0);
        assert_ne!(encoded & (1 << 31), 0);
    }

    #[test]
    fn nmi_encoding() {
        let encoded = PendingEvent::nmi().encode();
        assert_eq!(encoded & 0xFF, 2);
        assert_eq!(
            (encoded >> 8) & 0b111,
            InterruptionType::NonMaskableInterrupt as u32
        );
        assert_eq!(encoded & (1 << 11), 0);
    }

    #[test]
    fn external_interrupt_keeps_vector() {
        let encoded = PendingEvent::external_interrupt(0xEF).encode();
        assert_eq!(encoded & 0xFF, 0xEF);
        assert_eq!((encoded >> 8) & 0b111, 0);
    }

    #[test]
    fn interruption_type_round_trip() {
        assert_eq!(
            InterruptionType::from_u32(InterruptionType::SoftwareException as u32),
            InterruptionType::SoftwareException
        );
        assert_eq!(
            InterruptionType::from_u32(0),
            InterruptionType::ExternalInterrupt
        );
    }
}
