//! MSCKF (nullspace-projected) feature update (C7a): consumes features that just
//! dropped out of tracking, triangulates them, and folds their information into the
//! filter without ever adding the landmark to the state.
//!
//! Grounded on `ov_msckf/src/update/UpdaterMSCKF.cpp`.

use log::{debug, warn};
use nalgebra::{DMatrix, DVector};

use crate::config::{FeatureInitializerOptions, UpdaterOptions};
use crate::error::FilterResult;
use crate::features::{Feature, FeatureDatabase};
use crate::init::{ClonesCam, FeatureInitializer};
use crate::state::{State, StateHelper};

use super::helper::{
    build_pose_cache, get_feature_jacobian_full, measurement_compress_inplace, nullspace_project_inplace,
    stack_feature_jacobians, chi_square_gate,
};

pub struct UpdaterMsckf {
    options: UpdaterOptions,
    initializer: FeatureInitializer,
}

impl UpdaterMsckf {
    pub fn new(options: UpdaterOptions, feat_init_options: FeatureInitializerOptions) -> Self {
        Self { options, initializer: FeatureInitializer::new(feat_init_options) }
    }

    /// Triangulates `feat` and builds its nullspace-projected, chi-square-gated Jacobian
    /// against the current state. Returns `None` if the feature should be dropped.
    fn process_one(
        &self,
        state: &State,
        feat: &Feature,
        clones_cam: &ClonesCam,
    ) -> Option<(Vec<crate::state::VarHandle>, DMatrix<f64>, DVector<f64>)> {
        let mut feat = feat.clone();
        if !self.initializer.single_triangulation(&mut feat, clones_cam) {
            return None;
        }
        if !self.initializer.single_gaussnewton(&mut feat, clones_cam) {
            return None;
        }
        let p_fin_g = feat.p_fin_g?;

        let jac = get_feature_jacobian_full(state, &feat, p_fin_g)?;
        let mut h_x = jac.h_x;
        let mut res = jac.res;
        if !nullspace_project_inplace(&jac.h_f, &mut h_x, &mut res) {
            return None;
        }

        let r = DMatrix::<f64>::identity(res.len(), res.len()) * self.options.sigma_pix_sq();
        if !chi_square_gate(state, &jac.order, &h_x, &res, &r, self.options.chi2_multipler) {
            return None;
        }
        Some((jac.order, h_x, res))
    }

    /// Runs the MSCKF update for every feature that just dropped out of every camera's
    /// track: triangulate, nullspace-project, chi-square gate, batch, compress,
    /// and fold into the covariance with one EKF correction.
    pub fn update(&self, state: &mut State, db: &FeatureDatabase) -> FilterResult<usize> {
        if state.clones.is_empty() {
            return Ok(0);
        }
        let newest = state.clones.iter().map(|(t, _)| *t).fold(f64::MIN, f64::max);
        let clone_times: Vec<f64> = state.clones.iter().map(|(t, _)| *t).collect();
        let mut candidates = db.features_not_containing_newer(newest, true);
        for feat in &mut candidates {
            feat.clean_old_measurements(&clone_times);
        }
        candidates.retain(|f| f.num_measurements() >= 3);
        if candidates.is_empty() {
            return Ok(0);
        }

        let clones_cam = build_pose_cache(state);
        let mut entries = Vec::new();
        let mut used = Vec::new();
        for feat in candidates {
            if let Some(entry) = self.process_one(state, &feat, &clones_cam) {
                entries.push(entry);
                used.push(feat.featid);
            }
        }
        if entries.is_empty() {
            debug!("msckf update: no features survived triangulation/gating");
            return Ok(0);
        }

        let (order, mut h_big, mut res_big) = stack_feature_jacobians(state, &entries);
        measurement_compress_inplace(&mut h_big, &mut res_big);
        let r_big = DMatrix::<f64>::identity(res_big.len(), res_big.len()) * self.options.sigma_pix_sq();

        StateHelper::ekf_update(state, &order, &h_big, &res_big, &r_big)?;
        debug!("msckf update: {} features, {} residual rows", used.len(), res_big.len());
        Ok(used.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StateOptions;
    use crate::features::FeatureRepresentation;
    use nalgebra::{Matrix3 as M3, Vector3};

    fn observe(truth: Vector3<f64>, r_gtoc: M3<f64>, p_cing: Vector3<f64>) -> (f64, f64) {
        let p_in_cam = r_gtoc * (truth - p_cing);
        (p_in_cam.x / p_in_cam.z, p_in_cam.y / p_in_cam.z)
    }

    #[test]
    fn update_with_no_clones_is_a_noop() {
        let mut state = State::new(StateOptions::default());
        let db = FeatureDatabase::new(FeatureRepresentation::GlobalXyz);
        let updater = UpdaterMsckf::new(UpdaterOptions::default(), FeatureInitializerOptions::default());
        assert_eq!(updater.update(&mut state, &db).unwrap(), 0);
    }

    #[test]
    fn well_conditioned_feature_reduces_covariance_trace() {
        let mut state = State::new(StateOptions::default());
        state.imu.p = Vector3::new(0.0, 0.0, 0.0);
        StateHelper::augment_clone(&mut state, Vector3::zeros());
        state.timestamp = 1.0;
        state.imu.p = Vector3::new(1.0, 0.2, -0.1);
        StateHelper::augment_clone(&mut state, Vector3::zeros());
        state.timestamp = 2.0;
        state.imu.p = Vector3::new(2.0, -0.1, 0.2);
        StateHelper::augment_clone(&mut state, Vector3::zeros());

        let truth = Vector3::new(0.3, -0.2, 5.0);
        let db = FeatureDatabase::new(FeatureRepresentation::GlobalXyz);
        for (t, pose) in state.clones.clone() {
            let (un, vn) = observe(truth, pose.rot(), pose.p);
            db.update_feature(42, t, 0, un, vn, un, vn);
        }

        let before_trace = state.cov().trace();
        let updater = UpdaterMsckf::new(UpdaterOptions::default(), FeatureInitializerOptions::default());
        let n = updater.update(&mut state, &db).unwrap();
        assert_eq!(n, 1);
        assert!(state.cov().trace() <= before_trace);
    }
}
