//! Shared per-feature Jacobian assembly for the MSCKF and SLAM updaters (C7).
//!
//! `UpdaterMSCKF.cpp`/`UpdaterSLAM.cpp` both call into a `UpdaterHelper` that has no
//! surviving source file in this tree; the three functions below are reconstructed from
//! their call sites plus the projection/representation math already used by
//! [`crate::init::feature_initializer`].

use std::collections::HashMap;

use nalgebra::{DMatrix, DVector, Matrix2x3, Matrix3, Vector2, Vector3};

use crate::features::{Feature, FeatureRepresentation};
use crate::init::{ClonePose, ClonesCam};
use crate::math::skew;
use crate::state::handle::ts_key;
use crate::state::{State, VarHandle};

/// A feature's batched Jacobian against the touched state variables, plus the 3-column
/// landmark block.
pub struct FeatureJacobian {
    pub order: Vec<VarHandle>,
    pub h_x: DMatrix<f64>,
    pub h_f: DMatrix<f64>,
    pub res: DVector<f64>,
}

fn project(p_fin_c: Vector3<f64>) -> (Vector2<f64>, Matrix2x3<f64>) {
    let z = p_fin_c.z;
    let z_hat = Vector2::new(p_fin_c.x / z, p_fin_c.y / z);
    #[rustfmt::skip]
    let h = Matrix2x3::new(
        1.0 / z, 0.0, -p_fin_c.x / (z * z),
        0.0, 1.0 / z, -p_fin_c.y / (z * z),
    );
    (z_hat, h)
}

/// `d(anchor-frame xyz)/d(alpha, beta, rho)` for the three inverse-depth representations,
/// evaluated at the current anchor-frame point `p` (`p = (alpha/rho, beta/rho, 1/rho)`).
pub(crate) fn inverse_depth_jacobian(p: Vector3<f64>) -> Matrix3<f64> {
    #[rustfmt::skip]
    let j = Matrix3::new(
        p.z, 0.0, -p.x * p.z,
        0.0, p.z, -p.y * p.z,
        0.0, 0.0, -p.z * p.z,
    );
    j
}

/// Builds the `2M x (6*|order|)` Jacobian and residual for every surviving observation
/// of `feat` against the point estimate `p_fin_g` (global frame), plus the `2M x 3`
/// landmark block expressed in the feature's own representation.
///
/// Camera-to-IMU extrinsics are not carried in the error state by default
/// (`do_calib_camera_pose` is off), so an observing clone's camera pose is its IMU pose
/// directly -- the same simplification `FeatureInitializer`'s pose cache makes.
pub fn get_feature_jacobian_full(state: &State, feat: &Feature, p_fin_g: Vector3<f64>) -> Option<FeatureJacobian> {
    let mut obs: Vec<(f64, f64, f64)> = Vec::new();
    for track in feat.tracks.values() {
        for i in 0..track.timestamps.len() {
            let (un, vn) = track.uvs_norm[i];
            obs.push((track.timestamps[i], un, vn));
        }
    }
    if obs.is_empty() {
        return None;
    }
    obs.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
    let m = obs.len();

    let is_relative = feat.feat_representation.is_relative();
    let anchor_pose = if is_relative {
        let t = feat.anchor_clone_timestamp?;
        Some(state.get_clone(t)?.clone())
    } else {
        None
    };

    let mut order: Vec<VarHandle> = Vec::new();
    let mut col_of: HashMap<VarHandle, usize> = HashMap::new();
    for &(t, _, _) in &obs {
        let h = VarHandle::Clone(ts_key(t));
        col_of.entry(h).or_insert_with(|| {
            let off = order.len() * 6;
            order.push(h);
            off
        });
    }
    if let Some(t) = feat.anchor_clone_timestamp {
        let h = VarHandle::Clone(ts_key(t));
        col_of.entry(h).or_insert_with(|| {
            let off = order.len() * 6;
            order.push(h);
            off
        });
    }

    let mut h_x = DMatrix::<f64>::zeros(2 * m, order.len() * 6);
    let mut h_pfg = DMatrix::<f64>::zeros(2 * m, 3);
    let mut res = DVector::<f64>::zeros(2 * m);

    for (row, &(t, un, vn)) in obs.iter().enumerate() {
        let clone = state.get_clone(t)?;
        let r_gtoc = clone.rot();
        let p_cing = clone.p;
        let p_fin_c = r_gtoc * (p_fin_g - p_cing);
        if p_fin_c.z.abs() < 1e-6 || p_fin_c.z < 0.0 {
            return None;
        }
        let (z_hat, h_proj) = project(p_fin_c);
        res.fixed_rows_mut::<2>(2 * row).copy_from(&(Vector2::new(un, vn) - z_hat));

        let h_theta = h_proj * skew(&p_fin_c);
        let h_p = h_proj * (-r_gtoc);
        let col = col_of[&VarHandle::Clone(ts_key(t))];
        h_x.view_mut((2 * row, col), (2, 3)).copy_from(&h_theta);
        h_x.view_mut((2 * row, col + 3), (2, 3)).copy_from(&h_p);

        h_pfg.view_mut((2 * row, 0), (2, 3)).copy_from(&(h_proj * r_gtoc));
    }

    let p_fin_a = if is_relative {
        let ap = anchor_pose.as_ref().unwrap();
        feat.p_fin_a.unwrap_or_else(|| ap.rot() * (p_fin_g - ap.p))
    } else {
        Vector3::zeros()
    };

    if is_relative {
        let ap = anchor_pose.as_ref().unwrap();
        let r_gtoa = ap.rot();
        let d_pg_d_theta_a = -r_gtoa.transpose() * skew(&p_fin_a);
        let anchor_col = col_of[&VarHandle::Clone(ts_key(feat.anchor_clone_timestamp.unwrap()))];
        for row in 0..m {
            let h_pfg_row = h_pfg.view((2 * row, 0), (2, 3)).clone_owned();
            let h_theta_a = h_pfg_row * d_pg_d_theta_a;
            let mut blk_th = h_x.view_mut((2 * row, anchor_col), (2, 3));
            blk_th += h_theta_a;
            drop(blk_th);
            let mut blk_p = h_x.view_mut((2 * row, anchor_col + 3), (2, 3));
            blk_p += h_pfg_row;
        }
    }

    let local_jac = match feat.feat_representation {
        FeatureRepresentation::GlobalXyz => Matrix3::identity(),
        FeatureRepresentation::AnchoredXyz => anchor_pose.as_ref().unwrap().rot().transpose(),
        FeatureRepresentation::GlobalFullInverseDepth => inverse_depth_jacobian(p_fin_g),
        FeatureRepresentation::AnchoredFullInverseDepth | FeatureRepresentation::AnchoredMsckfInverseDepth => {
            anchor_pose.as_ref().unwrap().rot().transpose() * inverse_depth_jacobian(p_fin_a)
        }
    };
    let h_f = h_pfg * local_jac;

    Some(FeatureJacobian { order, h_x, h_f, res })
}

/// Camera-id -> clone-timestamp -> pose cache shared by both updaters. Extrinsics are
/// not part of the error state by default (`do_calib_camera_pose` off), so a clone's
/// camera pose equals its IMU pose for every camera id.
pub(crate) fn build_pose_cache(state: &State) -> ClonesCam {
    let mut cache: ClonesCam = HashMap::new();
    for cam in 0..state.options.num_cameras {
        let mut per_ts = HashMap::new();
        for (t, pose) in &state.clones {
            per_ts.insert(ts_key(*t), ClonePose { r_gtoc: pose.rot(), p_cing: pose.p });
        }
        cache.insert(cam, per_ts);
    }
    cache
}

/// Stacks several features' `(order, h_x, res)` triples into one batched system, placing
/// each feature's columns into a shared union `order` (the "Hx_mapping" dedup: a clone
/// touched by several features gets exactly one column block in the result).
pub fn stack_feature_jacobians(
    state: &State,
    entries: &[(Vec<VarHandle>, DMatrix<f64>, DVector<f64>)],
) -> (Vec<VarHandle>, DMatrix<f64>, DVector<f64>) {
    let mut order: Vec<VarHandle> = Vec::new();
    let mut col_of: HashMap<VarHandle, usize> = HashMap::new();
    for (ord, _, _) in entries {
        for &h in ord {
            col_of.entry(h).or_insert_with(|| {
                let off: usize = order.iter().map(|&hh| state.var_size(hh)).sum();
                order.push(h);
                off
            });
        }
    }
    let total_cols: usize = order.iter().map(|&h| state.var_size(h)).sum();
    let total_rows: usize = entries.iter().map(|(_, h, _)| h.nrows()).sum();

    let mut h_big = DMatrix::<f64>::zeros(total_rows, total_cols);
    let mut res_big = DVector::<f64>::zeros(total_rows);
    let mut row_off = 0;
    for (ord, h, res) in entries {
        let rows = h.nrows();
        let mut local_col = 0;
        for &hv in ord {
            let size = state.var_size(hv);
            let dest_col = col_of[&hv];
            h_big
                .view_mut((row_off, dest_col), (rows, size))
                .copy_from(&h.view((0, local_col), (rows, size)));
            local_col += size;
        }
        res_big.rows_mut(row_off, rows).copy_from(res);
        row_off += rows;
    }
    (order, h_big, res_big)
}

/// Mahalanobis chi-square gate shared by both updaters: builds the innovation covariance
/// `S = H*P_marg*H^T + R` and compares `res^T S^-1 res` against the 95th-percentile
/// threshold for `res`'s dimension.
pub fn chi_square_gate(
    state: &State,
    order: &[VarHandle],
    h: &DMatrix<f64>,
    res: &DVector<f64>,
    r: &DMatrix<f64>,
    chi2_mult: f64,
) -> bool {
    let p_marg = crate::state::StateHelper::get_marginal_covariance(state, order);
    let s = h * &p_marg * h.transpose() + r;
    let chol = match s.cholesky() {
        Some(c) => c,
        None => return false,
    };
    let chi2 = res.dot(&chol.solve(res));
    chi2 < chi2_mult * crate::state::chi_square_95(res.len())
}

/// Projects `h_f`'s 3 columns out of `[h_x | res]` via a left null-space basis built from
/// `h_f`'s Householder QR, dropping the measurement dimension from `2M` to `2M - 3`.
/// Returns `false` (leaving `h_x`/`res` untouched) when there aren't enough observations
/// to admit a null space (`2M <= 3`).
pub fn nullspace_project_inplace(h_f: &DMatrix<f64>, h_x: &mut DMatrix<f64>, res: &mut DVector<f64>) -> bool {
    let rows = h_f.nrows();
    if rows <= 3 {
        return false;
    }
    let cols = h_x.ncols();
    let mut combined = DMatrix::<f64>::zeros(rows, cols + 1);
    combined.view_mut((0, 0), (rows, cols)).copy_from(&*h_x);
    combined.view_mut((0, cols), (rows, 1)).copy_from(&*res);

    let qr = h_f.clone().qr();
    qr.q_tr_mul(&mut combined);

    let new_rows = rows - 3;
    *h_x = combined.view((3, 0), (new_rows, cols)).clone_owned();
    *res = combined.view((3, cols), (new_rows, 1)).column(0).clone_owned();
    true
}

/// Compresses an over-determined `[h_x | res]` stack via Householder QR, truncating to
/// `h_x`'s column count once `rows(h_x) > cols(h_x)`, the standard Givens-style
/// measurement compression applied before a batched EKF update.
pub fn measurement_compress_inplace(h_x: &mut DMatrix<f64>, res: &mut DVector<f64>) {
    let rows = h_x.nrows();
    let cols = h_x.ncols();
    if rows <= cols || cols == 0 {
        return;
    }
    let mut combined = DMatrix::<f64>::zeros(rows, cols + 1);
    combined.view_mut((0, 0), (rows, cols)).copy_from(&*h_x);
    combined.view_mut((0, cols), (rows, 1)).copy_from(&*res);

    let qr = h_x.clone().qr();
    qr.q_tr_mul(&mut combined);

    *h_x = combined.view((0, 0), (cols, cols)).clone_owned();
    *res = combined.view((0, cols), (cols, 1)).column(0).clone_owned();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StateOptions;
    use crate::features::FeatureDatabase;
    use crate::state::State;
    use approx::assert_abs_diff_eq;

    fn observe(truth: Vector3<f64>, r_gtoc: Matrix3<f64>, p_cing: Vector3<f64>) -> (f64, f64) {
        let p_in_cam = r_gtoc * (truth - p_cing);
        (p_in_cam.x / p_in_cam.z, p_in_cam.y / p_in_cam.z)
    }

    #[test]
    fn feature_jacobian_matches_zero_residual_at_truth() {
        let mut state = State::new(StateOptions::default());
        state.imu.p = Vector3::new(0.0, 0.0, 0.0);
        crate::state::StateHelper::augment_clone(&mut state, Vector3::zeros());
        state.timestamp = 1.0;
        state.imu.p = Vector3::new(1.0, 0.0, 0.0);
        crate::state::StateHelper::augment_clone(&mut state, Vector3::zeros());

        let truth = Vector3::new(0.3, -0.2, 4.0);
        let db = FeatureDatabase::new(FeatureRepresentation::GlobalXyz);
        let pose0 = state.clones[0].1.clone();
        let pose1 = state.clones[1].1.clone();
        let (un0, vn0) = observe(truth, pose0.rot(), pose0.p);
        let (un1, vn1) = observe(truth, pose1.rot(), pose1.p);
        db.update_feature(1, state.clones[0].0, 0, un0, vn0, un0, vn0);
        db.update_feature(1, state.clones[1].0, 0, un1, vn1, un1, vn1);
        let feat = db.get_feature(1, false).unwrap();

        let jac = get_feature_jacobian_full(&state, &feat, truth).expect("jacobian should build");
        assert_eq!(jac.h_f.nrows(), 4);
        assert_eq!(jac.h_f.ncols(), 3);
        assert_abs_diff_eq!(jac.res.norm(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn nullspace_projection_drops_three_rows() {
        let h_f = DMatrix::<f64>::from_row_slice(4, 3, &[
            1.0, 0.0, 0.0,
            0.0, 1.0, 0.0,
            0.0, 0.0, 1.0,
            0.3, 0.1, 0.2,
        ]);
        let mut h_x = DMatrix::<f64>::from_row_slice(4, 2, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        let mut res = DVector::<f64>::from_row_slice(&[1.0, 2.0, 3.0, 4.0]);
        let ok = nullspace_project_inplace(&h_f, &mut h_x, &mut res);
        assert!(ok);
        assert_eq!(h_x.nrows(), 1);
        assert_eq!(res.len(), 1);
    }

    #[test]
    fn nullspace_projection_rejects_insufficient_rows() {
        let h_f = DMatrix::<f64>::from_row_slice(2, 3, &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
        let mut h_x = DMatrix::<f64>::zeros(2, 2);
        let mut res = DVector::<f64>::zeros(2);
        assert!(!nullspace_project_inplace(&h_f, &mut h_x, &mut res));
    }

    #[test]
    fn stack_feature_jacobians_dedups_shared_clone_columns() {
        let mut state = State::new(StateOptions::default());
        state.timestamp = 1.0;
        crate::state::StateHelper::augment_clone(&mut state, Vector3::zeros());
        let clone_handle = state.order[1];

        let order_a = vec![VarHandle::Imu, clone_handle];
        let h_a = DMatrix::<f64>::zeros(2, 15 + 6);
        let res_a = DVector::<f64>::zeros(2);
        let order_b = vec![clone_handle];
        let h_b = DMatrix::<f64>::zeros(2, 6);
        let res_b = DVector::<f64>::zeros(2);

        let (order, h_big, res_big) =
            stack_feature_jacobians(&state, &[(order_a, h_a, res_a), (order_b, h_b, res_b)]);
        assert_eq!(order.len(), 2);
        assert_eq!(h_big.nrows(), 4);
        assert_eq!(h_big.ncols(), 15 + 6);
        assert_eq!(res_big.len(), 4);
    }

    #[test]
    fn measurement_compress_truncates_to_column_count() {
        let mut h_x = DMatrix::<f64>::from_row_slice(4, 2, &[1.0, 0.0, 0.0, 1.0, 1.0, 1.0, 2.0, -1.0]);
        let mut res = DVector::<f64>::from_row_slice(&[1.0, 2.0, 3.0, 4.0]);
        measurement_compress_inplace(&mut h_x, &mut res);
        assert_eq!(h_x.nrows(), 2);
        assert_eq!(res.len(), 2);
    }
}
