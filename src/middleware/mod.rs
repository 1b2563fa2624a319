pub mod cors;
pub mod latency;

pub use cors::*;
pub use latency::*;
