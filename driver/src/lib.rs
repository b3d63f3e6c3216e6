//! Kernel-driver shim: installs the allocator and logger, then hands the
//! machine to the hypervisor on load and takes it back on unload.

#![no_std]
#![allow(non_snake_case, non_camel_case_types)]

extern crate alloc;

use {
    core::{ffi::c_void, panic::PanicInfo},
    kernel_alloc::KernelAlloc,
    log::*,
};

#[global_allocator]
static GLOBAL: KernelAlloc = KernelAlloc;

type NTSTATUS = i32;
const STATUS_SUCCESS: NTSTATUS = 0;
const STATUS_UNSUCCESSFUL: NTSTATUS = 0xC000_0001u32 as i32;

#[repr(C)]
pub struct DRIVER_OBJECT {
    pub reserved: [u8; 0x68],
    pub driver_unload: *mut c_void,
}

/// Entry point: virtualize the running system. `DriverEntry` runs in the
/// System process context, which is what anchors the host CR3.
#[no_mangle]
pub extern "system" fn DriverEntry(
    driver: *mut DRIVER_OBJECT,
    _registry_path: *mut c_void,
) -> NTSTATUS {
    let _ = hypervisor::logger::init(LevelFilter::Debug);
    info!("Driver loaded");

    if !driver.is_null() {
        unsafe { (*driver).driver_unload = driver_unload as *mut c_void };
    }

    if hypervisor::interface::initialize() {
        STATUS_SUCCESS
    } else {
        error!("Failed to virtualize the system");
        STATUS_UNSUCCESSFUL
    }
}

/// Unload: devirtualize every core and release all memory.
pub extern "system" fn driver_unload(_driver: *mut DRIVER_OBJECT) {
    info!("Driver unloading");
    hypervisor::interface::terminate();
}

#[panic_handler]
fn panic(info: &PanicInfo<'_>) -> ! {
    error!("{info}");
    loop {
        unsafe { core::arch::asm!("cli; hlt") };
    }
}
