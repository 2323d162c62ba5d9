pub mod handle;
pub mod helper;
pub mod state;
pub mod variable;

pub use handle::VarHandle;
pub use helper::{chi_square_95, StateHelper};
pub use state::State;
pub use variable::{ImuVar, LandmarkVar, PoseVar, VectorVar, IMU_ERROR_SIZE};
