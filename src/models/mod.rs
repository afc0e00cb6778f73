pub mod catalog;
pub mod measurement;

pub use catalog::*;
pub use measurement::*;
