mod board;
mod error;

pub use board::*;
pub use error::*;
