pub mod broadcast;
pub mod nt;
pub mod processor;
