//! External-interrupt exits, armed per core when the debugger wants to
//! observe interrupt delivery. Interrupts are acknowledged on exit, so an
//! unconsumed vector must be re-injected or it is lost.

use {
    crate::{
        error::HypervisorError,
        intel::{
            events::{exit_interruption_info, PendingEvent},
            vcpu::Vcpu,
            vmexit::ExitType,
        },
    },
    log::*,
};

pub fn handle_external_interrupt(vcpu: &mut Vcpu) -> Result<ExitType, HypervisorError> {
    let Some(info) = exit_interruption_info() else {
        warn!("External interrupt exit without valid info");
        return Ok(ExitType::Continue);
    };
    let vector = info.vector();

    let consumed = crate::interface::callbacks()
        .external_interrupt
        .map(|callback| callback(vcpu.index, vector))
        .unwrap_or(false);

    if !consumed {
        vcpu.queue_event(PendingEvent::external_interrupt(vector));
    }

    Ok(ExitType::Continue)
}
