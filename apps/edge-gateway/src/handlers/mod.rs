mod control;
mod health;

pub use control::*;
pub use health::*;
