//! Architecture support
//!
//! Only x86_64 is implemented. The rest of the kernel reaches hardware
//! exclusively through this module and `mm`.

pub mod x86_64;

pub use x86_64::halt;
