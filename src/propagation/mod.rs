pub mod propagator;

pub use propagator::{ImuData, Propagator};
