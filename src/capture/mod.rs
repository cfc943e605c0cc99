pub mod classify;
pub mod engine;
pub mod frame;
pub mod source;

pub use classify::*;
pub use engine::*;
pub use frame::*;
pub use source::*;
