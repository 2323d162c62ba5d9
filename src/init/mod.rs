pub mod feature_initializer;
pub mod inertial_initializer;

pub use feature_initializer::{ClonePose, ClonesCam, FeatureInitializer};
pub use inertial_initializer::{ImuSample, InertialInitializer, InitialState};
