pub mod cycles;
pub mod dependency;
pub mod order;

pub use cycles::*;
pub use dependency::*;
pub use order::*;
