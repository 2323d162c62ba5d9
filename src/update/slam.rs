//! SLAM (in-state) feature update (C7b): delayed initialization of new landmarks,
//! in-state updates of already-initialized ones, and anchor migration when the clone a
//! landmark is anchored to is about to be marginalized.
//!
//! Grounded on `ov_msckf/src/update/UpdaterSLAM.cpp`.

use log::warn;
use nalgebra::{DMatrix, DVector, Matrix3, SMatrix, Vector3};

use crate::config::{FeatureInitializerOptions, UpdaterOptions};
use crate::error::FilterResult;
use crate::features::{Feature, FeatureRepresentation};
use crate::init::FeatureInitializer;
use crate::math::skew;
use crate::state::handle::ts_key;
use crate::state::variable::LandmarkVar;
use crate::state::{State, StateHelper, VarHandle};

use super::helper::{
    build_pose_cache, chi_square_gate, get_feature_jacobian_full, inverse_depth_jacobian, stack_feature_jacobians,
    FeatureJacobian,
};

pub struct UpdaterSlam {
    slam_options: UpdaterOptions,
    aruco_options: UpdaterOptions,
    max_aruco_features: usize,
    initializer: FeatureInitializer,
}

impl UpdaterSlam {
    pub fn new(
        slam_options: UpdaterOptions,
        aruco_options: UpdaterOptions,
        max_aruco_features: usize,
        feat_init_options: FeatureInitializerOptions,
    ) -> Self {
        Self { slam_options, aruco_options, max_aruco_features, initializer: FeatureInitializer::new(feat_init_options) }
    }

    fn options_for(&self, featid: usize) -> &UpdaterOptions {
        if featid < self.max_aruco_features {
            &self.aruco_options
        } else {
            &self.slam_options
        }
    }

    /// Triangulates each candidate feature and, on success, inserts it into the state as
    /// a new SLAM landmark (`delayed_init`). Every feature passed in is
    /// consumed -- failures are simply dropped, mirroring the source's `to_delete=true`
    /// on every entry of `feature_vec` regardless of outcome.
    pub fn delayed_init(&self, state: &mut State, feats: Vec<Feature>) -> usize {
        let clone_times: Vec<f64> = state.clones.iter().map(|(t, _)| *t).collect();
        let clones_cam = build_pose_cache(state);
        let mut inserted = 0;

        for mut feat in feats {
            feat.clean_old_measurements(&clone_times);
            if feat.num_measurements() < 3 {
                continue;
            }
            if !self.initializer.single_triangulation(&mut feat, &clones_cam) {
                continue;
            }
            if !self.initializer.single_gaussnewton(&mut feat, &clones_cam) {
                continue;
            }
            let p_fin_g = match feat.p_fin_g {
                Some(p) => p,
                None => continue,
            };
            let jac = match get_feature_jacobian_full(state, &feat, p_fin_g) {
                Some(j) => j,
                None => continue,
            };
            let FeatureJacobian { order, h_x, h_f, res } = jac;

            let mut landmark = LandmarkVar::new(feat.featid, feat.feat_representation, Vector3::zeros());
            if feat.feat_representation.is_relative() {
                landmark.anchor_cam_id = feat.anchor_cam_id;
                landmark.anchor_clone_timestamp = feat.anchor_clone_timestamp;
                let p_fin_a = feat.p_fin_a.unwrap_or(p_fin_g);
                landmark.set_from_xyz(p_fin_a, false);
                landmark.set_from_xyz(p_fin_a, true);
            } else {
                landmark.set_from_xyz(p_fin_g, false);
                landmark.set_from_xyz(p_fin_g, true);
            }

            let opts = self.options_for(feat.featid);
            let r = DMatrix::<f64>::identity(res.len(), res.len()) * opts.sigma_pix_sq();
            let featid = feat.featid;
            if StateHelper::initialize_landmark(state, featid, landmark, &order, h_x, h_f, r, res, opts.chi2_multipler) {
                inserted += 1;
            }
        }
        inserted
    }

    /// Folds new observations of already-initialized SLAM landmarks into the filter
    /// (`update`): one batched EKF correction across every feature that
    /// survives its own chi-square gate, the landmark's own 3 columns appended to each
    /// feature's `H_x` rather than projected out.
    pub fn update(&self, state: &mut State, feats: Vec<Feature>) -> FilterResult<usize> {
        let clone_times: Vec<f64> = state.clones.iter().map(|(t, _)| *t).collect();
        let mut entries: Vec<(Vec<VarHandle>, DMatrix<f64>, DVector<f64>)> = Vec::new();
        let mut used: Vec<usize> = Vec::new();

        for mut feat in feats {
            feat.clean_old_measurements(&clone_times);
            if feat.num_measurements() < 1 {
                continue;
            }
            let landmark = match state.features_slam.get(&feat.featid) {
                Some(l) => l.clone(),
                None => continue,
            };

            feat.feat_representation = landmark.representation;
            feat.anchor_cam_id = landmark.anchor_cam_id;
            feat.anchor_clone_timestamp = landmark.anchor_clone_timestamp;

            let p_fin_g = if landmark.representation.is_relative() {
                let anchor_ts = match landmark.anchor_clone_timestamp {
                    Some(t) => t,
                    None => continue,
                };
                let anchor = match state.get_clone(anchor_ts) {
                    Some(a) => a.clone(),
                    None => continue,
                };
                let p_fin_a = landmark.get_xyz(false);
                feat.p_fin_a = Some(p_fin_a);
                anchor.rot().transpose() * p_fin_a + anchor.p
            } else {
                landmark.get_xyz(false)
            };

            let jac = match get_feature_jacobian_full(state, &feat, p_fin_g) {
                Some(j) => j,
                None => continue,
            };
            let FeatureJacobian { mut order, h_x, h_f, res } = jac;

            let mut h_xf = DMatrix::<f64>::zeros(h_x.nrows(), h_x.ncols() + 3);
            h_xf.view_mut((0, 0), (h_x.nrows(), h_x.ncols())).copy_from(&h_x);
            h_xf.view_mut((0, h_x.ncols()), (h_x.nrows(), 3)).copy_from(&h_f);
            order.push(VarHandle::Slam(feat.featid));

            let opts = self.options_for(feat.featid);
            let r = DMatrix::<f64>::identity(res.len(), res.len()) * opts.sigma_pix_sq();
            if !chi_square_gate(state, &order, &h_xf, &res, &r, opts.chi2_multipler) {
                continue;
            }

            used.push(feat.featid);
            entries.push((order, h_xf, res));
        }

        if entries.is_empty() {
            return Ok(0);
        }

        let (order, h_big, res_big) = stack_feature_jacobians(state, &entries);
        let mut r_big = DMatrix::<f64>::zeros(res_big.len(), res_big.len());
        let mut row_off = 0;
        for (i, &featid) in used.iter().enumerate() {
            let rows = entries[i].1.nrows();
            let sigma_sq = self.options_for(featid).sigma_pix_sq();
            for k in 0..rows {
                r_big[(row_off + k, row_off + k)] = sigma_sq;
            }
            row_off += rows;
        }

        StateHelper::ekf_update(state, &order, &h_big, &res_big, &r_big)?;
        Ok(used.len())
    }

    /// Re-anchors every relative-representation SLAM landmark whose anchor is the clone
    /// about to be marginalized, so marginalization never deletes a landmark's only
    /// geometric reference (`change_anchors`). A no-op below the clone window
    /// size, matching the source's `n_clones() <= max_clone_size` early-out.
    pub fn change_anchors(&self, state: &mut State) {
        if state.n_clones() <= state.options.max_clone_size {
            return;
        }
        let marg_ts = match state.margtimestep() {
            Some(t) => t,
            None => return,
        };
        let new_anchor_ts = state
            .clones
            .iter()
            .map(|(t, _)| *t)
            .filter(|&t| t != marg_ts)
            .fold(f64::INFINITY, f64::min);
        if !new_anchor_ts.is_finite() {
            return;
        }

        let featids: Vec<usize> = state
            .features_slam
            .iter()
            .filter(|(_, lm)| lm.representation.is_relative() && lm.anchor_clone_timestamp == Some(marg_ts))
            .map(|(&id, _)| id)
            .collect();

        for featid in featids {
            let landmark = match state.features_slam.get(&featid) {
                Some(l) => l.clone(),
                None => continue,
            };
            // The source re-anchors each landmark into the same camera it was anchored
            // to before; only the clone timestamp changes.
            let new_cam_id = landmark.anchor_cam_id.unwrap_or(0);
            perform_anchor_change(state, featid, &landmark, new_anchor_ts, new_cam_id);
        }
    }
}

/// `d(p_FinG)/d(local value)` and `d(p_FinG)/d(anchor pose)` for an arbitrary candidate
/// (representation, anchor timestamp, local value), independent of any Feature's own
/// observations. Used only by [`perform_anchor_change`]; [`get_feature_jacobian_full`]
/// covers the observation-Jacobian case.
fn anchor_point_jacobian(
    state: &State,
    representation: FeatureRepresentation,
    local_value: Vector3<f64>,
    anchor_ts: f64,
) -> Option<(Matrix3<f64>, SMatrix<f64, 3, 6>)> {
    let anchor = state.get_clone(anchor_ts)?;
    let r_gtoa = anchor.rot();

    let p_fin_a = match representation {
        FeatureRepresentation::AnchoredXyz => local_value,
        _ => {
            let (alpha, beta, rho) = (local_value.x, local_value.y, local_value.z);
            Vector3::new(alpha / rho, beta / rho, 1.0 / rho)
        }
    };

    let h_f = match representation {
        FeatureRepresentation::AnchoredXyz => r_gtoa.transpose(),
        _ => r_gtoa.transpose() * inverse_depth_jacobian(p_fin_a),
    };

    let d_pg_d_theta = -r_gtoa.transpose() * skew(&p_fin_a);
    let mut h_x = SMatrix::<f64, 3, 6>::zeros();
    h_x.fixed_view_mut::<3, 3>(0, 0).copy_from(&d_pg_d_theta);
    h_x.fixed_view_mut::<3, 3>(0, 3).copy_from(&Matrix3::identity());
    Some((h_f, h_x))
}

/// Builds the new-local-parameter encoding of anchor-frame point `p` under `representation`.
fn local_value_for(representation: FeatureRepresentation, p: Vector3<f64>) -> Vector3<f64> {
    let mut scratch = LandmarkVar::new(0, representation, Vector3::zeros());
    scratch.set_from_xyz(p, false);
    scratch.value
}

/// Re-anchors `featid` from its current anchor clone to `new_anchor_ts`, transforming
/// its local value and propagating the covariance block through the `Phi` Jacobian
/// (`perform_anchor_change`). FEJ values are carried through the same
/// (non-FEJ) transform, consistent with `do_fej` defaulting to `false`. Leaves the
/// landmark untouched if any step is ill-conditioned.
fn perform_anchor_change(
    state: &mut State,
    featid: usize,
    landmark: &LandmarkVar,
    new_anchor_ts: f64,
    new_cam_id: usize,
) {
    let old_ts = match landmark.anchor_clone_timestamp {
        Some(t) => t,
        None => return,
    };
    if old_ts == new_anchor_ts {
        return;
    }

    let (old_pose, new_pose) = match (state.get_clone(old_ts), state.get_clone(new_anchor_ts)) {
        (Some(o), Some(n)) => (o.clone(), n.clone()),
        _ => return,
    };

    let p_fin_a_old = landmark.get_xyz(false);
    let r_oldtonew = new_pose.rot() * old_pose.rot().transpose();
    let p_oldinnew = new_pose.rot() * (old_pose.p - new_pose.p);
    let p_fin_a_new = r_oldtonew * p_fin_a_old + p_oldinnew;
    let new_local = local_value_for(landmark.representation, p_fin_a_new);

    let (h_f_old, h_x_old) = match anchor_point_jacobian(state, landmark.representation, landmark.value, old_ts) {
        Some(v) => v,
        None => return,
    };
    let (h_f_new, h_x_new) = match anchor_point_jacobian(state, landmark.representation, new_local, new_anchor_ts) {
        Some(v) => v,
        None => return,
    };
    let h_f_new_inv = match h_f_new.try_inverse() {
        Some(inv) => inv,
        None => {
            warn!("anchor change for feature {featid}: new H_f not invertible, skipping");
            return;
        }
    };

    let n = state.n_vars();
    let old_id = state.var_id(VarHandle::Clone(ts_key(old_ts)));
    let new_id = state.var_id(VarHandle::Clone(ts_key(new_anchor_ts)));
    let landmark_id = state.var_id(VarHandle::Slam(featid));

    let contrib_old = h_f_new_inv * h_x_old;
    let contrib_f = h_f_new_inv * h_f_old;
    let contrib_new = h_f_new_inv * h_x_new;

    let mut phi = DMatrix::<f64>::zeros(3, n);
    for r in 0..3 {
        for c in 0..6 {
            phi[(r, old_id + c)] += contrib_old[(r, c)];
            phi[(r, new_id + c)] -= contrib_new[(r, c)];
        }
        for c in 0..3 {
            phi[(r, landmark_id + c)] += contrib_f[(r, c)];
        }
    }

    let pxf = &state.cov * phi.transpose();
    let pff = &phi * &pxf;
    // The source explicitly skips re-symmetrizing this block after the overwrite.
    state.cov.view_mut((landmark_id, 0), (3, n)).copy_from(&pxf.transpose());
    state.cov.view_mut((0, landmark_id), (n, 3)).copy_from(&pxf);
    state.cov.view_mut((landmark_id, landmark_id), (3, 3)).copy_from(&pff);

    if let Some(lm) = state.features_slam.get_mut(&featid) {
        lm.anchor_cam_id = Some(new_cam_id);
        lm.anchor_clone_timestamp = Some(new_anchor_ts);
        lm.value = new_local;
        lm.fej = new_local;
        lm.has_had_anchor_change = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StateOptions;
    use crate::features::FeatureDatabase;

    fn observe(truth: Vector3<f64>, r_gtoc: Matrix3<f64>, p_cing: Vector3<f64>) -> (f64, f64) {
        let p_in_cam = r_gtoc * (truth - p_cing);
        (p_in_cam.x / p_in_cam.z, p_in_cam.y / p_in_cam.z)
    }

    fn updater() -> UpdaterSlam {
        UpdaterSlam::new(UpdaterOptions::default(), UpdaterOptions::default(), 0, FeatureInitializerOptions::default())
    }

    fn three_clone_state() -> State {
        let mut state = State::new(StateOptions::default());
        state.imu.p = Vector3::new(0.0, 0.0, 0.0);
        StateHelper::augment_clone(&mut state, Vector3::zeros());
        state.timestamp = 1.0;
        state.imu.p = Vector3::new(1.0, 0.2, -0.1);
        StateHelper::augment_clone(&mut state, Vector3::zeros());
        state.timestamp = 2.0;
        state.imu.p = Vector3::new(2.0, -0.1, 0.2);
        StateHelper::augment_clone(&mut state, Vector3::zeros());
        state
    }

    #[test]
    fn delayed_init_inserts_well_conditioned_landmark() {
        let mut state = three_clone_state();
        let truth = Vector3::new(0.3, -0.2, 5.0);
        let db = FeatureDatabase::new(FeatureRepresentation::GlobalXyz);
        for (t, pose) in state.clones.clone() {
            let (un, vn) = observe(truth, pose.rot(), pose.p);
            db.update_feature(1, t, 0, un, vn, un, vn);
        }
        let feat = db.get_feature(1, true).unwrap();

        let inserted = updater().delayed_init(&mut state, vec![feat]);
        assert_eq!(inserted, 1);
        assert!(state.features_slam.contains_key(&1));
        assert_eq!(state.n_vars(), 15 + 3 * 6 + 3);
    }

    #[test]
    fn update_with_unknown_feature_is_a_noop() {
        let mut state = three_clone_state();
        let mut feat = Feature::new(99, FeatureRepresentation::GlobalXyz);
        feat.push(0, 2.0, 1.0, 1.0, 0.1, 0.1);
        let n = updater().update(&mut state, vec![feat]).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn update_reduces_covariance_trace_for_initialized_landmark() {
        let mut state = three_clone_state();
        let truth = Vector3::new(0.3, -0.2, 5.0);
        let db = FeatureDatabase::new(FeatureRepresentation::GlobalXyz);
        for (t, pose) in state.clones.clone() {
            let (un, vn) = observe(truth, pose.rot(), pose.p);
            db.update_feature(1, t, 0, un, vn, un, vn);
        }
        let feat = db.get_feature(1, true).unwrap();
        let u = updater();
        assert_eq!(u.delayed_init(&mut state, vec![feat]), 1);

        state.timestamp = 3.0;
        state.imu.p = Vector3::new(3.0, 0.0, 0.0);
        StateHelper::augment_clone(&mut state, Vector3::zeros());
        let (un, vn) = observe(truth, state.clones.last().unwrap().1.rot(), state.clones.last().unwrap().1.p);
        let db2 = FeatureDatabase::new(FeatureRepresentation::GlobalXyz);
        db2.update_feature(1, 3.0, 0, un, vn, un, vn);
        let feat2 = db2.get_feature(1, true).unwrap();

        let before = state.cov().trace();
        let n = u.update(&mut state, vec![feat2]).unwrap();
        assert_eq!(n, 1);
        assert!(state.cov().trace() <= before);
    }

    #[test]
    fn change_anchors_below_window_size_is_a_noop() {
        let mut state = three_clone_state();
        let mut lm = LandmarkVar::new(1, FeatureRepresentation::AnchoredXyz, Vector3::new(0.1, 0.1, 3.0));
        lm.anchor_clone_timestamp = Some(0.0);
        lm.anchor_cam_id = Some(0);
        state.features_slam.insert(1, lm);
        updater().change_anchors(&mut state);
        let lm_after = state.features_slam.get(&1).unwrap();
        assert_eq!(lm_after.anchor_clone_timestamp, Some(0.0));
    }

    #[test]
    fn change_anchors_reanchors_landmark_whose_anchor_is_marginalized() {
        let mut state = State::new(StateOptions {
            max_clone_size: 2,
            ..StateOptions::default()
        });
        state.imu.p = Vector3::new(0.0, 0.0, 0.0);
        StateHelper::augment_clone(&mut state, Vector3::zeros());
        state.timestamp = 1.0;
        state.imu.p = Vector3::new(1.0, 0.0, 0.0);
        StateHelper::augment_clone(&mut state, Vector3::zeros());
        state.timestamp = 2.0;
        state.imu.p = Vector3::new(2.0, 0.0, 0.0);
        StateHelper::augment_clone(&mut state, Vector3::zeros());

        let n = state.n_vars();
        let mut lm = LandmarkVar::new(1, FeatureRepresentation::AnchoredXyz, Vector3::new(0.2, -0.1, 4.0));
        lm.fej = lm.value;
        lm.anchor_clone_timestamp = Some(0.0);
        lm.anchor_cam_id = Some(0);
        lm.id = n;
        state.features_slam.insert(1, lm);
        state.order.push(VarHandle::Slam(1));
        state.cov = DMatrix::<f64>::identity(n + 3, n + 3) * 1e-3;

        let updater = updater();
        updater.change_anchors(&mut state);

        let lm_after = state.features_slam.get(&1).unwrap();
        assert_eq!(lm_after.anchor_clone_timestamp, Some(1.0));
        assert!(lm_after.has_had_anchor_change);
    }
}
