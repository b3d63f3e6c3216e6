//! NT kernel imports and the minimal type surface they need, declared
//! directly against `ntoskrnl` so no SDK is required to build the library.

#![allow(non_camel_case_types, non_snake_case)]

use core::ffi::c_void;

pub type NTSTATUS = i32;
pub type KIRQL = u8;
pub type PVOID = *mut c_void;

pub const ALL_PROCESSOR_GROUPS: u16 = 0xFFFF;

pub fn nt_success(status: NTSTATUS) -> bool {
    status >= 0
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct PROCESSOR_NUMBER {
    pub Group: u16,
    pub Number: u8,
    pub Reserved: u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct GROUP_AFFINITY {
    pub Mask: u64,
    pub Group: u16,
    pub Reserved: [u16; 3],
}

/// The deferred routine signature `KeGenericCallDpc` fans out.
pub type KDEFERRED_ROUTINE = unsafe extern "system" fn(
    Dpc: PVOID,
    DeferredContext: PVOID,
    SystemArgument1: PVOID,
    SystemArgument2: PVOID,
);

#[link(name = "ntoskrnl")]
extern "system" {
    pub fn KeQueryActiveProcessorCountEx(GroupNumber: u16) -> u32;

    pub fn KeGetCurrentProcessorNumberEx(ProcNumber: *mut PROCESSOR_NUMBER) -> u32;

    pub fn KeGetProcessorNumberFromIndex(
        ProcIndex: u32,
        ProcNumber: *mut PROCESSOR_NUMBER,
    ) -> NTSTATUS;

    pub fn KeSetSystemGroupAffinityThread(
        Affinity: *mut GROUP_AFFINITY,
        PreviousAffinity: *mut GROUP_AFFINITY,
    );

    pub fn KeRevertToUserGroupAffinityThread(PreviousAffinity: *mut GROUP_AFFINITY);

    pub fn ZwYieldExecution() -> NTSTATUS;

    /// Schedules a DPC on every logical processor and returns once all of
    /// them have signaled completion.
    pub fn KeGenericCallDpc(Routine: KDEFERRED_ROUTINE, Context: PVOID);

    /// Rendezvous: returns non-zero on exactly one of the participating
    /// processors.
    pub fn KeSignalCallDpcSynchronize(SystemArgument2: PVOID) -> u32;

    /// Marks this processor's DPC as finished.
    pub fn KeSignalCallDpcDone(SystemArgument1: PVOID);

    pub fn KeRaiseIrqlToDpcLevel() -> KIRQL;

    pub fn KeLowerIrql(NewIrql: KIRQL);

    pub fn MmGetPhysicalAddress(BaseAddress: PVOID) -> i64;

    /// Undocumented but stable since the beginning of x64 Windows.
    pub fn MmGetVirtualForPhysical(PhysicalAddress: i64) -> PVOID;

    pub fn PsLookupProcessByProcessId(ProcessId: PVOID, Process: *mut PVOID) -> NTSTATUS;

    pub fn ObfDereferenceObject(Object: PVOID);
}

/// Offset of `DirectoryTableBase` in `KPROCESS`, stable across every x64
/// build to date.
const EPROCESS_DIRECTORY_TABLE_BASE_OFFSET: usize = 0x28;

/// Resolves the page-table root of a process. Process id 0 selects the
/// address space captured at initialization (the System process).
pub fn process_cr3(process_id: u32) -> Option<u64> {
    if process_id == 0 {
        return Some(crate::vmm::system_cr3());
    }

    let mut process: PVOID = core::ptr::null_mut();
    let status =
        unsafe { PsLookupProcessByProcessId(process_id as usize as PVOID, &mut process) };
    if !nt_success(status) || process.is_null() {
        return None;
    }

    let cr3 = unsafe {
        (process.cast::<u8>().add(EPROCESS_DIRECTORY_TABLE_BASE_OFFSET) as *const u64)
            .read_volatile()
    };
    unsafe { ObfDereferenceObject(process) };

    Some(cr3)
}
