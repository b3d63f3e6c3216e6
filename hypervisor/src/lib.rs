//! Kernel-resident Intel VT-x/EPT hypervisor used as the lower half of a
//! kernel debugger: it virtualizes the running system, intercepts selected
//! guest events and hides instrumentation behind EPT shadow pages.

#![no_std]

extern crate alloc;
extern crate static_assertions;

pub mod allocate;
pub mod error;
pub mod interface;
pub mod intel;
pub mod logger;
pub mod vmm;
pub mod windows;
