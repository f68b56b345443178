pub mod net;
pub mod time;

pub use net::*;
pub use time::*;
