//! VMX preemption timer expiry: the time-slicing primitive the upper
//! layers use to bound their instrumentation latency.

use crate::{
    error::HypervisorError,
    intel::{hv, vcpu::Vcpu, vmexit::ExitType},
};

pub fn handle_preemption_timer(vcpu: &mut Vcpu) -> Result<ExitType, HypervisorError> {
    if let Some(callback) = crate::interface::callbacks().preemption_timer {
        callback(vcpu.index);
    } else {
        // Nobody is time-slicing; disarm instead of spinning on expiries.
        hv::set_preemption_timer(None);
    }

    Ok(ExitType::Continue)
}
