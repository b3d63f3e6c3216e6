pub mod addresses;
pub mod bitmap;
pub mod capture;
pub mod ept;
pub mod events;
pub mod hooks;
pub mod hv;
pub mod invept;
pub mod invvpid;
pub mod mtrr;
pub mod page;
pub mod paging;
pub mod segmentation;
pub mod support;
pub mod vcpu;
pub mod vmcs;
pub mod vmerror;
pub mod vmexit;
pub mod vmlaunch;
pub mod vmxon;
