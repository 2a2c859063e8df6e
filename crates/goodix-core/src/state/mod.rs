//! State machine engine and the sequences that run on it.

pub mod machine;

pub(crate) mod activate;
pub(crate) mod scan;
pub(crate) mod tls;

pub use machine::{Ssm, SsmHost, SsmStack, Step};
