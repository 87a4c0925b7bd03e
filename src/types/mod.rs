//! Core types for tiller.

pub mod generation;
pub mod message;
pub mod results;
pub mod stream;
pub mod usage;

pub use generation::*;
pub use message::*;
pub use results::*;
pub use stream::*;
pub use usage::*;
