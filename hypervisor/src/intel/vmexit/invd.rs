//! INVD would drop dirty cache lines on the floor; performing WBINVD
//! instead preserves memory contents the host depends on.

use crate::{
    error::HypervisorError,
    intel::{support::wbinvd, vcpu::Vcpu, vmexit::ExitType},
};

pub fn handle_invd(_vcpu: &mut Vcpu) -> Result<ExitType, HypervisorError> {
    wbinvd();
    Ok(ExitType::IncrementRip)
}
