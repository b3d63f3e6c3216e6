//! The broadcast layer: runs a per-core task on every logical processor in
//! parallel (DPC fan-out with a completion rendezvous) or on one chosen
//! core at dispatch IRQL. Every cross-core configuration change in the
//! system funnels through here; no code ever touches another core's VMCS
//! directly.

use {
    crate::{
        error::HypervisorError,
        intel::support::vmcall,
        vmm,
        windows::{
            nt::{KeGenericCallDpc, KeLowerIrql, KeRaiseIrqlToDpcLevel, KeSignalCallDpcDone, KeSignalCallDpcSynchronize, PVOID},
            processor::ProcessorExecutor,
        },
    },
    core::sync::atomic::{AtomicU32, Ordering},
    log::*,
};

/// The per-core work a broadcast performs on its target processors.
#[derive(Debug, Clone, Copy)]
pub enum BroadcastTask {
    /// Bring this core under the hypervisor (capture, VMXON, VMLAUNCH).
    VirtualizeCore,

    /// Issue a VMCALL on this core; the root-mode handler does the rest.
    Vmcall { number: u64, param1: u64, param2: u64 },
}

/// One in-flight broadcast. Failures are counted, not collected: the
/// initiator only needs to know whether every core succeeded.
struct BroadcastJob {
    task: BroadcastTask,
    failures: AtomicU32,
}

/// Runs `task` on every logical processor and blocks until all of them
/// completed. Jobs never overlap: the DPC rendezvous finishes one broadcast
/// before the initiator can start the next.
pub fn run_on_all_cores(task: BroadcastTask) -> Result<(), HypervisorError> {
    let job = BroadcastJob {
        task,
        failures: AtomicU32::new(0),
    };

    unsafe { KeGenericCallDpc(broadcast_dpc_routine, &job as *const _ as PVOID) };

    if job.failures.load(Ordering::SeqCst) != 0 {
        return Err(HypervisorError::BroadcastFailed);
    }
    Ok(())
}

/// Runs `task` on one chosen core: migrate there, raise to dispatch level
/// so nothing reschedules us mid-operation, run, restore.
pub fn run_on_single_core(core_id: u32, task: BroadcastTask) -> Result<(), HypervisorError> {
    let executor = ProcessorExecutor::switch_to_processor(core_id)
        .ok_or(HypervisorError::ProcessorSwitchFailed)?;

    let irql = unsafe { KeRaiseIrqlToDpcLevel() };
    let result = perform_task(task);
    unsafe { KeLowerIrql(irql) };

    drop(executor);
    result
}

/// The DPC body: runs the task, then participates in the completion
/// rendezvous so the initiator's `KeGenericCallDpc` returns only after all
/// cores are done.
unsafe extern "system" fn broadcast_dpc_routine(
    _dpc: PVOID,
    context: PVOID,
    system_argument1: PVOID,
    system_argument2: PVOID,
) {
    let job = unsafe { &*(context as *const BroadcastJob) };

    if perform_task(job.task).is_err() {
        job.failures.fetch_add(1, Ordering::SeqCst);
    }

    // Wait for every DPC to arrive, then report this one as done.
    unsafe { KeSignalCallDpcSynchronize(system_argument2) };
    unsafe { KeSignalCallDpcDone(system_argument1) };
}

/// Executes one task on the current core, at dispatch IRQL.
fn perform_task(task: BroadcastTask) -> Result<(), HypervisorError> {
    match task {
        BroadcastTask::VirtualizeCore => vmm::virtualize_current_core(),
        BroadcastTask::Vmcall { number, param1, param2 } => {
            let status = vmcall(number, param1, param2, 0);
            if status != 0 {
                error!("Broadcast VMCALL {number:#x} failed with status {status:#x}");
                return Err(HypervisorError::BroadcastFailed);
            }
            Ok(())
        }
    }
}
