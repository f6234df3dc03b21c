//! Argument resolution: declared signatures, injection markers, and the
//! resolver that turns upstream results into concrete call arguments.

pub mod resolver;
pub mod signature;

pub use resolver::{ArgumentResolver, KickoffSource};
pub use signature::{Inject, Param, Signature, SystemRef};
