use thiserror_no_std::Error;

#[derive(Error, Debug)]
pub enum HypervisorError {
    #[error("Intel CPU not found")]
    CpuUnsupported,

    #[error("VMX is not supported")]
    VmxUnsupported,

    #[error("VMX locked off in BIOS")]
    VmxBiosLock,

    #[error("EPT is not supported")]
    EptUnsupported,

    #[error("Required EPT/VPID capability is missing")]
    EptCapabilityMissing,

    #[error("MTRRs are not supported")]
    MtrrUnsupported,

    #[error("Conflicting MTRR memory types for the same physical range")]
    ConflictingMemoryTypes,

    #[error("Failed to resolve memory type for given physical address range")]
    MemoryTypeResolutionError,

    #[error("Failed to execute VMXON")]
    VmxonFailed,

    #[error("Failed to execute VMXOFF")]
    VmxoffFailed,

    #[error("Failed to execute VMCLEAR")]
    VmclearFailed,

    #[error("Failed to execute VMPTRLD")]
    VmptrldFailed,

    #[error("VM instruction failed due to carry flag being set")]
    VmFailInvalid,

    #[error("VM instruction failed due to zero flag being set")]
    VmInstructionError,

    #[error("Unknown VM instruction error")]
    UnknownVmInstructionError,

    #[error("Unknown VM exit basic reason")]
    UnknownVmExitReason,

    #[error("Unhandled VM exit")]
    UnhandledVmExit,

    #[error("EPT misconfiguration")]
    EptMisconfiguration,

    #[error("Invalid EPT PML4 base address")]
    InvalidEptPml4BaseAddress,

    #[error("Unaligned address error")]
    UnalignedAddressError,

    #[error("Page already split")]
    PageAlreadySplit,

    #[error("Cannot remap a large page")]
    LargePageRemapError,

    #[error("Failed to translate guest virtual address")]
    GuestVirtualTranslationFailed,

    #[error("Failed to convert from virtual address to physical address")]
    VirtualToPhysicalAddressFailed,

    #[error("Virtual machine state is not initialized")]
    VmxNotInitialized,

    #[error("Invalid processor index")]
    InvalidProcessorIndex,

    #[error("Failed to switch processor")]
    ProcessorSwitchFailed,

    #[error("Broadcast task failed on at least one core")]
    BroadcastFailed,

    #[error("VMCALL round-trip test failed")]
    VmcallTestFailed,

    #[error("Unknown VMCALL number")]
    UnknownVmcallNumber,

    #[error("Hook already installed with an incompatible permission mask")]
    HookConflict,

    #[error("Hook not found")]
    HookNotFound,

    #[error("Page table not found")]
    PageTableNotFound,

    #[error("Shadow page not found")]
    ShadowPageNotFound,

    #[error("Page table already mapped")]
    PageTableAlreadyMapped,

    #[error("Shadow page already mapped")]
    ShadowPageAlreadyMapped,

    #[error("Pre-allocated page tables exhausted")]
    PageTablesUnavailable,

    #[error("Pre-allocated shadow pages exhausted")]
    ShadowPagesUnavailable,

    #[error("Failed to allocate page tables for memory manager")]
    PageTablesAllocationError,

    #[error("Failed to allocate shadow pages for memory manager")]
    ShadowPageAllocationError,

    #[error("Found rip-relative instruction which cannot be relocated")]
    RelativeInstruction,

    #[error("Failed to re-encode displaced instructions")]
    EncodingFailed,

    #[error("Displaced instructions exceed the trampoline size limit")]
    TrampolineTooLarge,

    #[error("Mode-based execute control is not supported")]
    MbecUnsupported,

    #[error("Page-modification logging is not supported")]
    PmlUnsupported,

    #[error("Old RFLAGS not set")]
    OldRflagsNotSet,

    #[error("Monitor trap flag counter not set")]
    MtfCounterNotSet,
}
