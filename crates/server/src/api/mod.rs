mod arrivals;
mod status;

pub use arrivals::*;
pub use status::*;
