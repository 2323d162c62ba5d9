pub mod helper;
pub mod msckf;
pub mod slam;

pub use helper::{
    chi_square_gate, get_feature_jacobian_full, measurement_compress_inplace, nullspace_project_inplace,
    stack_feature_jacobians, FeatureJacobian,
};
pub use msckf::UpdaterMsckf;
pub use slam::UpdaterSlam;
