//! Logical-processor accounting and temporary migration of the current
//! thread onto a chosen core via its group affinity.

use {
    crate::windows::nt::{
        nt_success, KeGetCurrentProcessorNumberEx, KeGetProcessorNumberFromIndex,
        KeQueryActiveProcessorCountEx, KeRevertToUserGroupAffinityThread,
        KeSetSystemGroupAffinityThread, ZwYieldExecution, ALL_PROCESSOR_GROUPS, GROUP_AFFINITY,
        PROCESSOR_NUMBER,
    },
    core::mem::MaybeUninit,
    log::*,
};

/// Number of active logical processors across all groups.
pub fn processor_count() -> u32 {
    unsafe { KeQueryActiveProcessorCountEx(ALL_PROCESSOR_GROUPS) }
}

/// Systemwide index of the processor the caller is running on.
pub fn current_processor_index() -> u32 {
    unsafe { KeGetCurrentProcessorNumberEx(core::ptr::null_mut()) }
}

/// Converts a systemwide processor index into its group-relative number.
fn processor_number_from_index(index: u32) -> Option<PROCESSOR_NUMBER> {
    let mut processor_number: MaybeUninit<PROCESSOR_NUMBER> = MaybeUninit::uninit();

    let status = unsafe { KeGetProcessorNumberFromIndex(index, processor_number.as_mut_ptr()) };

    if nt_success(status) {
        Some(unsafe { processor_number.assume_init() })
    } else {
        None
    }
}

/// Pins the calling thread to one processor until dropped.
pub struct ProcessorExecutor {
    old_affinity: MaybeUninit<GROUP_AFFINITY>,
}

impl ProcessorExecutor {
    pub fn switch_to_processor(i: u32) -> Option<Self> {
        if i >= processor_count() {
            error!("Invalid processor index: {}", i);
            return None;
        }

        let processor_number = processor_number_from_index(i)?;

        let mut old_affinity: MaybeUninit<GROUP_AFFINITY> = MaybeUninit::uninit();
        let mut affinity = GROUP_AFFINITY {
            Group: processor_number.Group,
            Mask: 1 << processor_number.Number,
            Reserved: [0; 3],
        };

        trace!("Switching execution to processor {}", i);
        unsafe { KeSetSystemGroupAffinityThread(&mut affinity, old_affinity.as_mut_ptr()) };

        // Give the scheduler a chance to actually migrate us.
        if !nt_success(unsafe { ZwYieldExecution() }) {
            return None;
        }

        Some(Self { old_affinity })
    }
}

impl Drop for ProcessorExecutor {
    fn drop(&mut self) {
        trace!("Switching execution back to previous processor");
        unsafe {
            KeRevertToUserGroupAffinityThread(self.old_affinity.as_mut_ptr());
        }
    }
}
