//! Decoding of the read-only VMCS reporting fields: basic exit reasons,
//! VM-instruction error numbers and the per-family exit qualifications.

use bitfield::bitfield;

/// Represents the basic VM exit reasons.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
/// Table C-1. Basic Exit Reasons
#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VmxBasicExitReason {
    ExceptionOrNmi = 0,
    ExternalInterrupt = 1,
    TripleFault = 2,
    InitSignal = 3,
    StartupIpi = 4,
    IoSystemManagementInterrupt = 5,
    OtherSmi = 6,
    InterruptWindow = 7,
    NmiWindow = 8,
    TaskSwitch = 9,
    Cpuid = 10,
    Getsec = 11,
    Hlt = 12,
    Invd = 13,
    Invlpg = 14,
    Rdpmc = 15,
    Rdtsc = 16,
    Rsm = 17,
    Vmcall = 18,
    Vmclear = 19,
    Vmlaunch = 20,
    Vmptrld = 21,
    Vmptrst = 22,
    Vmread = 23,
    Vmresume = 24,
    Vmwrite = 25,
    Vmxoff = 26,
    Vmxon = 27,
    ControlRegisterAccesses = 28,
    MovDr = 29,
    IoInstruction = 30,
    Rdmsr = 31,
    Wrmsr = 32,
    VmEntryFailureInvalidGuestState = 33,
    VmEntryFailureMsrLoading = 34,
    Mwait = 36,
    MonitorTrapFlag = 37,
    Monitor = 39,
    Pause = 40,
    VmEntryFailureMachineCheckEvent = 41,
    TprBelowThreshold = 43,
    ApicAccess = 44,
    VirtualizedEoi = 45,
    AccessToGdtrOrIdtr = 46,
    AccessToLdtrOrTr = 47,
    EptViolation = 48,
    EptMisconfiguration = 49,
    Invept = 50,
    Rdtscp = 51,
    VmxPreemptionTimerExpired = 52,
    Invvpid = 53,
    WbinvdOrWbnoinvd = 54,
    Xsetbv = 55,
    ApicWrite = 56,
    Rdrand = 57,
    Invpcid = 58,
    Vmfunc = 59,
    Encls = 60,
    Rdseed = 61,
    PageModificationLogFull = 62,
    Xsaves = 63,
    Xrstors = 64,
}

impl VmxBasicExitReason {
    /// Converts the 32-bit exit reason field to the basic exit reason in its
    /// lower 16 bits.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's
    /// Manual: 25.9.1 VM Exit Reason
    pub fn from_u32(value: u32) -> Option<Self> {
        let basic = (value & 0xFFFF) as u16;

        // 35, 38 and 42 are unused encodings; everything above XRSTORS is
        // outside what this hypervisor enables.
        match basic {
            0..=34 | 36..=37 | 39..=41 | 43..=64 => {
                Some(unsafe { core::mem::transmute::<u16, Self>(basic) })
            }
            _ => None,
        }
    }
}

/// Represents the VM instruction error numbers.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
/// Table 31-1. VM-Instruction Error Numbers
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VmInstructionError {
    VmcallInRoot = 1,
    VmclearInvalidAddress = 2,
    VmclearWithVmxonPointer = 3,
    VmlaunchNonClearVmcs = 4,
    VmresumeNonLaunchedVmcs = 5,
    VmresumeAfterVmxoff = 6,
    VmEntryInvalidControlFields = 7,
    VmEntryInvalidHostState = 8,
    VmptrldInvalidAddress = 9,
    VmptrldWithVmxonPointer = 10,
    VmptrldIncorrectVmcsRevision = 11,
    VmreadVmwriteUnsupportedVmcsComponent = 12,
    VmwriteReadonlyVmcsComponent = 13,
    VmxonInRoot = 15,
    VmEntryInvalidExecutiveVmcsPointer = 16,
    VmEntryNonLaunchedExecutiveVmcs = 17,
    VmEntryExecutiveVmcsPointerNotVmxonPointer = 18,
    VmcallNonClearVmcs = 19,
    VmcallInvalidVmExitControlFields = 20,
    VmcallIncorrectMsegRevision = 22,
    VmxoffUnderDualMonitorTreatment = 23,
    VmcallInvalidSmmMonitorFeatures = 24,
    VmEntryInvalidVmExecutionControlFieldsExecutiveVmcs = 25,
    VmEntryEventsBlockedByMovSs = 26,
    InvalidOperandToInveptInvvpid = 28,
}

impl VmInstructionError {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1..=13 | 15..=20 | 22..=26 | 28 => {
                Some(unsafe { core::mem::transmute::<u32, Self>(value) })
            }
            _ => None,
        }
    }
}

bitfield! {
    /// Exit qualification for EPT violations.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's
    /// Manual: Table 28-7. Exit Qualification for EPT Violations
    #[derive(Clone, Copy)]
    pub struct EptViolationQualification(u64);
    impl Debug;

    /// The access causing the violation was a data read.
    pub caused_by_read, _: 0;
    /// The access causing the violation was a data write.
    pub caused_by_write, _: 1;
    /// The access causing the violation was an instruction fetch.
    pub caused_by_fetch, _: 2;
    /// Bit 0 of the violated EPT entry (readable).
    pub readable, _: 3;
    /// Bit 1 of the violated EPT entry (writable).
    pub writable, _: 4;
    /// Bit 2 of the violated EPT entry (executable).
    pub executable, _: 5;
    /// The guest linear-address field is valid.
    pub linear_address_valid, _: 7;
    /// The violation occurred during the guest page walk itself.
    pub caused_by_translation, _: 8;
}

/// Access types reported in the control-register exit qualification.
#[repr(u64)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CrAccessType {
    MovToCr = 0,
    MovFromCr = 1,
    Clts = 2,
    Lmsw = 3,
}

bitfield! {
    /// Exit qualification for control-register accesses.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's
    /// Manual: Table 28-3. Exit Qualification for Control-Register Accesses
    #[derive(Clone, Copy)]
    pub struct CrAccessQualification(u64);
    impl Debug;

    /// Number of the control register (0, 3, 4 or 8).
    pub cr_number, _: 3, 0;
    /// 0 = MOV to CR, 1 = MOV from CR, 2 = CLTS, 3 = LMSW.
    pub raw_access_type, _: 5, 4;
    /// LMSW operand type (0 = register, 1 = memory).
    pub lmsw_operand_memory, _: 6;
    /// The general-purpose register used by MOV CR.
    pub gpr_index, _: 11, 8;
    /// LMSW source data.
    pub lmsw_source_data, _: 31, 16;
}

impl CrAccessQualification {
    pub fn access_type(&self) -> CrAccessType {
        match self.raw_access_type() {
            0 => CrAccessType::MovToCr,
            1 => CrAccessType::MovFromCr,
            2 => CrAccessType::Clts,
            _ => CrAccessType::Lmsw,
        }
    }
}

bitfield! {
    /// Exit qualification for I/O instructions.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's
    /// Manual: Table 28-5. Exit Qualification for I/O Instructions
    #[derive(Clone, Copy)]
    pub struct IoQualification(u64);
    impl Debug;

    /// Size of access: 0 = 1 byte, 1 = 2 bytes, 3 = 4 bytes.
    pub access_size, _: 2, 0;
    /// 0 = OUT, 1 = IN.
    pub is_in, _: 3;
    /// String instruction (INS/OUTS).
    pub is_string, _: 4;
    /// REP prefixed.
    pub has_rep, _: 5;
    /// Operand encoding: 0 = DX, 1 = immediate.
    pub immediate_operand, _: 6;
    /// Port number.
    pub port, _: 31, 16;
}

bitfield! {
    /// Exit qualification for MOV DR.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's
    /// Manual: Table 28-4. Exit Qualification for MOV DR
    #[derive(Clone, Copy)]
    pub struct MovDrQualification(u64);
    impl Debug;

    /// Number of the debug register.
    pub dr_number, _: 2, 0;
    /// 0 = MOV to DR, 1 = MOV from DR.
    pub is_mov_from_dr, _: 4;
    /// The general-purpose register operand.
    pub gpr_index, _: 11, 8;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_exit_reason_decodes_low_word_only() {
        // Bit 31 (entry-failure) must not affect the basic reason.
        let value = (1u32 << 31) | VmxBasicExitReason::EptViolation as u32;
        assert_eq!(
            VmxBasicExitReason::from_u32(value),
            Some(VmxBasicExitReason::EptViolation)
        );
    }

    #[test]
    fn basic_exit_reason_rejects_holes_and_unknowns() {
        assert_eq!(VmxBasicExitReason::from_u32(35), None);
        assert_eq!(VmxBasicExitReason::from_u32(38), None);
        assert_eq!(VmxBasicExitReason::from_u32(42), None);
        assert_eq!(VmxBasicExitReason::from_u32(0x100), None);
        assert_eq!(
            VmxBasicExitReason::from_u32(18),
            Some(VmxBasicExitReason::Vmcall)
        );
    }

    #[test]
    fn instruction_error_round_trip() {
        assert_eq!(
            VmInstructionError::from_u32(5),
            Some(VmInstructionError::VmresumeNonLaunchedVmcs)
        );
        assert_eq!(VmInstructionError::from_u32(14), None);
        assert_eq!(VmInstructionError::from_u32(0), None);
    }

    #[test]
    fn ept_violation_qualification_flags() {
        // Write to a page whose entry is execute-only.
        let qual = EptViolationQualification(0b100010);
        assert!(qual.caused_by_write());
        assert!(!qual.caused_by_fetch());
        assert!(qual.executable());
        assert!(!qual.readable());
        assert!(!qual.writable());
    }

    #[test]
    fn cr_access_qualification_mov_to_cr3() {
        // MOV CR3, R8: cr = 3, access = 0, gpr = 8.
        let qual = CrAccessQualification(3 | (8 << 8));
        assert_eq!(qual.cr_number(), 3);
        assert_eq!(qual.access_type(), CrAccessType::MovToCr);
        assert_eq!(qual.gpr_index(), 8);
    }

    #[test]
    fn io_qualification_in_dx() {
        // IN AL, DX on port 0x3f8.
        let qual = IoQualification((0x3f8 << 16) | (1 << 3));
        assert!(qual.is_in());
        assert!(!qual.is_string());
        assert_eq!(qual.access_size(), 0);
        assert_eq!(qual.port(), 0x3f8);
    }
}
