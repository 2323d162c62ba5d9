//! The configuration surface: option structs mirroring the source estimator's own
//! `StateOptions`, `FeatureInitializerOptions`, `UpdaterOptions`, and
//! inertial-initializer option groups, with the same literal defaults.

use serde::{Deserialize, Serialize};

use crate::features::representation::FeatureRepresentation;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateOptions {
    pub do_fej: bool,
    pub imu_avg: bool,
    pub use_rk4_integration: bool,
    pub do_calib_camera_pose: bool,
    pub do_calib_camera_intrinsics: bool,
    pub do_calib_camera_timeoffset: bool,
    pub max_clone_size: usize,
    pub max_slam_features: usize,
    pub max_aruco_features: usize,
    pub num_cameras: usize,
    pub feat_representation: FeatureRepresentation,
    pub gravity_mag: f64,
}

impl Default for StateOptions {
    fn default() -> Self {
        Self {
            do_fej: false,
            imu_avg: false,
            use_rk4_integration: false,
            do_calib_camera_pose: false,
            do_calib_camera_intrinsics: false,
            do_calib_camera_timeoffset: false,
            max_clone_size: 8,
            max_slam_features: 0,
            max_aruco_features: 1024,
            num_cameras: 1,
            feat_representation: FeatureRepresentation::GlobalXyz,
            gravity_mag: 9.81,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeatureInitializerOptions {
    pub max_runs: usize,
    pub init_lamda: f64,
    pub max_lamda: f64,
    pub min_dx: f64,
    pub min_dcost: f64,
    pub lam_mult: f64,
    pub min_dist: f64,
    pub max_dist: f64,
    pub max_baseline: f64,
    pub max_cond_number: f64,
}

impl Default for FeatureInitializerOptions {
    fn default() -> Self {
        Self {
            max_runs: 20,
            init_lamda: 1e-3,
            max_lamda: 1e10,
            min_dx: 1e-6,
            min_dcost: 1e-6,
            lam_mult: 10.0,
            min_dist: 0.25,
            max_dist: 40.0,
            max_baseline: 40.0,
            max_cond_number: 1000.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdaterOptions {
    pub sigma_pix: f64,
    pub chi2_multipler: f64,
}

impl UpdaterOptions {
    pub fn sigma_pix_sq(&self) -> f64 {
        self.sigma_pix * self.sigma_pix
    }
}

impl Default for UpdaterOptions {
    fn default() -> Self {
        Self { sigma_pix: 1.0, chi2_multipler: 1.0 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InertialInitializerOptions {
    pub window_length: f64,
    pub imu_excite_threshold: f64,
}

impl Default for InertialInitializerOptions {
    fn default() -> Self {
        Self { window_length: 0.75, imu_excite_threshold: 0.5 }
    }
}

/// Continuous-time IMU noise model, divided by `dt` at propagation time to form Qc.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImuNoise {
    pub sigma_w: f64,
    pub sigma_a: f64,
    pub sigma_wb: f64,
    pub sigma_ab: f64,
}

impl Default for ImuNoise {
    fn default() -> Self {
        Self { sigma_w: 1.6968e-4, sigma_a: 2.0e-3, sigma_wb: 1.9393e-5, sigma_ab: 3.0e-3 }
    }
}

/// The full configuration surface for the estimator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FilterOptions {
    pub state: StateOptions,
    pub feature_init: FeatureInitializerOptions,
    pub msckf: UpdaterOptions,
    pub slam: UpdaterOptions,
    pub aruco: UpdaterOptions,
    pub inertial_init: InertialInitializerOptions,
    pub imu_noise: ImuNoise,
}

impl Default for FilterOptions {
    fn default() -> Self {
        Self {
            state: StateOptions::default(),
            feature_init: FeatureInitializerOptions::default(),
            msckf: UpdaterOptions::default(),
            slam: UpdaterOptions::default(),
            aruco: UpdaterOptions::default(),
            inertial_init: InertialInitializerOptions::default(),
            imu_noise: ImuNoise::default(),
        }
    }
}
