//! Shared streaming and accounting types.

pub mod stream;
pub mod usage;

pub use stream::*;
pub use usage::*;
