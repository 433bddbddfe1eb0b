//! System-call interface: the 0x80 gate, the handler table, and the
//! kernel-side implementations.

pub mod dispatcher;
pub mod error;
#[cfg(feature = "selftest")]
pub mod usertest;

pub use dispatcher::{init, register};
pub use error::KernelError;
