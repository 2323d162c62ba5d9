//! Covariance algebra (C5): clone, marginalize, EKF update, delayed initialization.
//!
//! Grounded on `ov_msckf/src/state/StateHelper.cpp`. Associated functions rather than
//! methods on `State` because, like the source's `friend class`, this is the sole
//! module permitted to reshape `state.cov` / `state.order`.

use log::{debug, warn};
use nalgebra::{DMatrix, DVector, Vector3};

use crate::error::{FilterError, FilterResult};

use super::handle::{ts_key, VarHandle};
use super::state::State;
use super::variable::LandmarkVar;

pub struct StateHelper;

impl StateHelper {
    /// Gathers the covariance block rows/cols for `order` into one contiguous matrix.
    pub fn get_marginal_covariance(state: &State, order: &[VarHandle]) -> DMatrix<f64> {
        let total: usize = order.iter().map(|&h| state.var_size(h)).sum();
        let mut out = DMatrix::zeros(total, total);
        let mut row_off = 0;
        for &hi in order {
            let id_i = state.var_id(hi);
            let size_i = state.var_size(hi);
            let mut col_off = 0;
            for &hj in order {
                let id_j = state.var_id(hj);
                let size_j = state.var_size(hj);
                out.view_mut((row_off, col_off), (size_i, size_j))
                    .copy_from(&state.cov.view((id_i, id_j), (size_i, size_j)));
                col_off += size_j;
            }
            row_off += size_i;
        }
        out
    }

    /// `H` is measurement x order-union Jacobian, `res` the residual, `R` isotropic or
    /// block-diagonal measurement noise. Applies one batched Kalman correction and
    /// fails fast if the resulting covariance diagonal goes negative.
    pub fn ekf_update(
        state: &mut State,
        order: &[VarHandle],
        h: &DMatrix<f64>,
        res: &DVector<f64>,
        r: &DMatrix<f64>,
    ) -> FilterResult<()> {
        let n = state.n_vars();
        let total_order_size: usize = order.iter().map(|&v| state.var_size(v)).sum();
        if h.ncols() != total_order_size {
            return Err(FilterError::Precondition(format!(
                "H has {} cols but order spans {} error-dof",
                h.ncols(),
                total_order_size
            )));
        }

        // M = P * H^T, built by summing cross-covariance * H^T contributions per
        // variable in `order` against every live variable (full-width M).
        let mut m = DMatrix::zeros(n, h.nrows());
        let mut col_off = 0;
        for &hv in order {
            let id = state.var_id(hv);
            let size = state.var_size(hv);
            let h_block = h.view((0, col_off), (h.nrows(), size));
            let p_cols = state.cov.view((0, id), (n, size));
            m += p_cols * h_block.transpose();
            col_off += size;
        }

        let p_marg = Self::get_marginal_covariance(state, order);
        let mut s = h * &p_marg * h.transpose() + r;
        s = 0.5 * (&s + s.transpose());

        let chol = s.clone().cholesky().ok_or_else(|| {
            FilterError::Precondition("innovation covariance S is not positive-definite".to_string())
        })?;
        let k = chol.solve(&m.transpose()).transpose();

        state.cov -= &k * m.transpose();
        state.cov = 0.5 * (&state.cov + state.cov.transpose());

        for i in 0..n {
            if state.cov[(i, i)] < -1e-9 {
                return Err(FilterError::Inconsistent { diag_index: i, value: state.cov[(i, i)] });
            }
            if state.cov[(i, i)] < 0.0 {
                state.cov[(i, i)] = 0.0;
            }
        }

        let dx = &k * res;
        state.update(&dx);
        Ok(())
    }

    /// Clones the IMU pose sub-variable into the ordered clone map at `state.timestamp`
    /// (`augment_clone`). `last_w` is the last corrected angular rate, used to
    /// couple the new clone to the camera time-offset variable when that calibration is
    /// active (not yet wired up here; time-offset calibration is left disabled, see
    /// `DESIGN.md`).
    pub fn augment_clone(state: &mut State, _last_w: Vector3<f64>) {
        let n = state.n_vars();
        let new_id = n;
        let size = 6;
        let mut new_cov = DMatrix::zeros(n + size, n + size);
        new_cov.view_mut((0, 0), (n, n)).copy_from(&state.cov);

        // Diagonal block: copy the IMU pose's own (theta, p) covariance.
        let imu_pose_block = {
            let mut b = DMatrix::zeros(6, 6);
            b.view_mut((0, 0), (3, 3)).copy_from(&state.cov.view((0, 0), (3, 3)));
            b.view_mut((0, 3), (3, 3)).copy_from(&state.cov.view((0, 3), (3, 3)));
            b.view_mut((3, 0), (3, 3)).copy_from(&state.cov.view((3, 0), (3, 3)));
            b.view_mut((3, 3), (3, 3)).copy_from(&state.cov.view((3, 3), (3, 3)));
            b
        };
        new_cov.view_mut((new_id, new_id), (size, size)).copy_from(&imu_pose_block);

        // Cross terms: row i of the new clone vs every other live variable equals the
        // IMU-pose rows of the corresponding column.
        for col in 0..n {
            let cross_theta = state.cov[(0, col)];
            let _ = cross_theta;
        }
        let theta_rows = state.cov.view((0, 0), (3, n)).clone_owned();
        let p_rows = state.cov.view((3, 0), (3, n)).clone_owned();
        new_cov.view_mut((new_id, 0), (3, n)).copy_from(&theta_rows);
        new_cov.view_mut((new_id + 3, 0), (3, n)).copy_from(&p_rows);
        new_cov.view_mut((0, new_id), (n, 3)).copy_from(&theta_rows.transpose());
        new_cov.view_mut((0, new_id + 3), (n, 3)).copy_from(&p_rows.transpose());

        state.cov = new_cov;
        let pose = state.imu.pose();
        state.clones.push((state.timestamp, pose));
        state.set_var_id(VarHandle::Clone(ts_key(state.timestamp)), new_id);
        state.order.push(VarHandle::Clone(ts_key(state.timestamp)));
        debug!("augmented clone at t={}, state now {} error-dof", state.timestamp, state.n_vars());
    }

    /// Removes the block rows/cols for `timestamp`'s clone and shifts later ids down
    /// (`marginalize`).
    pub fn marginalize_clone(state: &mut State, timestamp: f64) {
        let key = ts_key(timestamp);
        let handle = VarHandle::Clone(key);
        let marg_id = state.var_id(handle);
        let marg_size = state.var_size(handle);
        let n = state.n_vars();

        let mut new_cov = DMatrix::zeros(n - marg_size, n - marg_size);
        // top-left
        new_cov.view_mut((0, 0), (marg_id, marg_id)).copy_from(&state.cov.view((0, 0), (marg_id, marg_id)));
        let tail = n - marg_id - marg_size;
        if tail > 0 {
            // top-right
            new_cov
                .view_mut((0, marg_id), (marg_id, tail))
                .copy_from(&state.cov.view((0, marg_id + marg_size), (marg_id, tail)));
            // bottom-left
            new_cov
                .view_mut((marg_id, 0), (tail, marg_id))
                .copy_from(&state.cov.view((marg_id + marg_size, 0), (tail, marg_id)));
            // bottom-right
            new_cov
                .view_mut((marg_id, marg_id), (tail, tail))
                .copy_from(&state.cov.view((marg_id + marg_size, marg_id + marg_size), (tail, tail)));
        }
        state.cov = new_cov;

        state.clones.retain(|(t, _)| *t != timestamp);
        state.order.retain(|&h| h != handle);
        Self::shift_ids_after(state, marg_id, marg_size);
    }

    fn shift_ids_after(state: &mut State, removal_point: usize, shrink_by: usize) {
        let order = state.order.clone();
        for h in order {
            let id = state.var_id(h);
            if id > removal_point {
                state.set_var_id(h, id - shrink_by);
            }
        }
    }

    /// Delayed initialization (`initialize`): Givens-eliminates `h_f` to an
    /// invertible top block and a nullspace-projected bottom block, chi-square gates
    /// the bottom block, and on success augments the covariance with the new landmark
    /// then applies the bottom block as a normal EKF update.
    #[allow(clippy::too_many_arguments)]
    pub fn initialize_landmark(
        state: &mut State,
        featid: usize,
        mut landmark: LandmarkVar,
        order: &[VarHandle],
        mut h_x: DMatrix<f64>,
        mut h_f: DMatrix<f64>,
        mut r: DMatrix<f64>,
        mut res: DVector<f64>,
        chi2_mult: f64,
    ) -> bool {
        let new_var_size = 3;
        let rows = h_f.nrows();

        // Givens-eliminate H_f from the bottom up so only the leading 3x3 block is
        // non-zero, rotating H_x and res identically.
        for col in (0..new_var_size).rev() {
            for row in (col + 1..rows).rev() {
                let a = h_f[(row - 1, col)];
                let b = h_f[(row, col)];
                if b.abs() < 1e-13 {
                    continue;
                }
                let radius = (a * a + b * b).sqrt();
                let (c, s) = (a / radius, b / radius);
                for mat in [&mut h_f, &mut h_x] {
                    for k in 0..mat.ncols() {
                        let top = mat[(row - 1, k)];
                        let bot = mat[(row, k)];
                        mat[(row - 1, k)] = c * top + s * bot;
                        mat[(row, k)] = -s * top + c * bot;
                    }
                }
                let top = res[row - 1];
                let bot = res[row];
                res[row - 1] = c * top + s * bot;
                res[row] = -s * top + c * bot;

                // R is isotropic by precondition; Givens rotation of an isotropic
                // covariance in (row-1,row) leaves it isotropic, so no update needed.
                let _ = &mut r;
            }
        }

        let h_f_top = h_f.view((0, 0), (new_var_size, new_var_size)).clone_owned();
        let h_x_top = h_x.view((0, 0), (new_var_size, h_x.ncols())).clone_owned();
        let res_top = res.rows(0, new_var_size).clone_owned();
        let r_top = r.view((0, 0), (new_var_size, new_var_size)).clone_owned();

        let bottom_rows = rows - new_var_size;
        let (h_x_bot, res_bot, r_bot) = if bottom_rows > 0 {
            (
                h_x.view((new_var_size, 0), (bottom_rows, h_x.ncols())).clone_owned(),
                res.rows(new_var_size, bottom_rows).clone_owned(),
                r.view((new_var_size, new_var_size), (bottom_rows, bottom_rows)).clone_owned(),
            )
        } else {
            (DMatrix::zeros(0, h_x.ncols()), DVector::zeros(0), DMatrix::zeros(0, 0))
        };

        if bottom_rows > 0 {
            let p_marg = Self::get_marginal_covariance(state, order);
            let s_bot = &h_x_bot * &p_marg * h_x_bot.transpose() + &r_bot;
            let chi2 = match s_bot.clone().cholesky() {
                Some(chol) => res_bot.dot(&chol.solve(&res_bot)),
                None => f64::INFINITY,
            };
            let threshold = chi2_mult * chi_square_95(bottom_rows);
            if chi2 > threshold {
                warn!("landmark {} rejected at delayed init: chi2 {} > {}", featid, chi2, threshold);
                return false;
            }
        }

        Self::initialize_invertible(state, &mut landmark, order, &h_x_top, &h_f_top, &r_top, &res_top);
        landmark.featid = featid;
        state.features_slam.insert(featid, landmark);
        state.order.push(VarHandle::Slam(featid));

        if bottom_rows > 0 {
            let mut full_order = order.to_vec();
            full_order.push(VarHandle::Slam(featid));
            // h_x_bot has no landmark column yet (that's what made it "bottom"); pad.
            let mut h_full = DMatrix::zeros(bottom_rows, h_x_bot.ncols() + 3);
            h_full.view_mut((0, 0), (bottom_rows, h_x_bot.ncols())).copy_from(&h_x_bot);
            if let Err(e) = Self::ekf_update(state, &full_order, &h_full, &res_bot, &r_bot) {
                warn!("post-init EKF update for landmark {} failed: {}", featid, e);
            }
        }
        true
    }

    /// Algebraically augments the covariance with `new_var` using the invertible top
    /// block of the Givens-rotated system (`initialize_invertible`).
    fn initialize_invertible(
        state: &mut State,
        new_var: &mut LandmarkVar,
        order: &[VarHandle],
        h_x: &DMatrix<f64>,
        h_f: &DMatrix<f64>,
        r: &DMatrix<f64>,
        res: &DVector<f64>,
    ) {
        let n = state.n_vars();
        let p_marg = Self::get_marginal_covariance(state, order);
        let m = h_x * &p_marg * h_x.transpose() + r;
        let h_f_inv = match h_f.clone().try_inverse() {
            Some(inv) => inv,
            None => h_f.clone().pseudo_inverse(1e-9).unwrap_or_else(|_| DMatrix::zeros(3, 3)),
        };
        let p_ll = &h_f_inv * &m * h_f_inv.transpose();

        // M_a = P * H_x^T over every live variable (full column).
        let mut m_a = DMatrix::zeros(n, h_x.nrows());
        let mut col_off = 0;
        for &hv in order {
            let id = state.var_id(hv);
            let size = state.var_size(hv);
            let h_block = h_x.view((0, col_off), (h_x.nrows(), size));
            let p_cols = state.cov.view((0, id), (n, size));
            m_a += p_cols * h_block.transpose();
            col_off += size;
        }
        let cross = -&m_a * h_f_inv.transpose();

        let mut new_cov = DMatrix::zeros(n + 3, n + 3);
        new_cov.view_mut((0, 0), (n, n)).copy_from(&state.cov);
        new_cov.view_mut((0, n), (n, 3)).copy_from(&cross);
        new_cov.view_mut((n, 0), (3, n)).copy_from(&cross.transpose());
        new_cov.view_mut((n, n), (3, 3)).copy_from(&p_ll);
        state.cov = new_cov;

        new_var.id = n;
        let dx = h_f_inv * res;
        new_var.value += Vector3::new(dx[0], dx[1], dx[2]);
        new_var.fej = new_var.value;
    }
}

/// 0.95-quantile of the chi-square distribution for small integer degrees of freedom,
/// tabulated the way the source precomputes a lookup table up to 500 dof. Values beyond
/// the table fall back to a normal approximation (Wilson-Hilferty), adequate for the
/// residual sizes this filter ever forms.
pub fn chi_square_95(dof: usize) -> f64 {
    const TABLE: [f64; 31] = [
        0.0, 3.841, 5.991, 7.815, 9.488, 11.070, 12.592, 14.067, 15.507, 16.919, 18.307, 19.675,
        21.026, 22.362, 23.685, 24.996, 26.296, 27.587, 28.869, 30.144, 31.410, 32.671, 33.924,
        35.172, 36.415, 37.652, 38.885, 40.113, 41.337, 42.557, 43.773,
    ];
    if dof < TABLE.len() {
        TABLE[dof]
    } else {
        let d = dof as f64;
        let z = 1.645_f64;
        d * (1.0 - 2.0 / (9.0 * d) + z * (2.0 / (9.0 * d)).sqrt()).powi(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StateOptions;
    use crate::features::FeatureRepresentation;

    #[test]
    fn augment_then_marginalize_restores_imu_block_size() {
        let mut state = State::new(StateOptions::default());
        state.timestamp = 1.0;
        StateHelper::augment_clone(&mut state, Vector3::zeros());
        assert_eq!(state.n_vars(), 15 + 6);
        StateHelper::marginalize_clone(&mut state, 1.0);
        assert_eq!(state.n_vars(), 15);
        assert_eq!(state.order, vec![VarHandle::Imu]);
    }

    #[test]
    fn marginalize_preserves_leading_imu_block() {
        let mut state = State::new(StateOptions::default());
        let before = state.cov.view((0, 0), (15, 15)).clone_owned();
        state.timestamp = 1.0;
        StateHelper::augment_clone(&mut state, Vector3::zeros());
        state.timestamp = 2.0;
        StateHelper::augment_clone(&mut state, Vector3::zeros());
        StateHelper::marginalize_clone(&mut state, 1.0);
        let after = state.cov.view((0, 0), (15, 15)).clone_owned();
        assert_eq!(before, after);
        assert_eq!(state.n_vars(), 15 + 6);
    }

    #[test]
    fn ekf_update_keeps_covariance_symmetric_and_nonnegative_diag() {
        let mut state = State::new(StateOptions::default());
        let order = vec![VarHandle::Imu];
        let mut h = DMatrix::zeros(3, 15);
        h[(0, 3)] = 1.0;
        h[(1, 4)] = 1.0;
        h[(2, 5)] = 1.0;
        let res = DVector::from_vec(vec![0.01, -0.02, 0.03]);
        let r = DMatrix::identity(3, 3) * 1e-4;
        StateHelper::ekf_update(&mut state, &order, &h, &res, &r).unwrap();
        for i in 0..state.n_vars() {
            assert!(state.cov[(i, i)] >= 0.0);
        }
        let asym = (&state.cov - state.cov.transpose()).abs().max();
        assert!(asym < 1e-9);
    }

    #[test]
    fn initialize_landmark_inserts_new_variable() {
        let mut state = State::new(StateOptions::default());
        let lm = LandmarkVar::new(7, FeatureRepresentation::GlobalXyz, Vector3::new(1.0, 0.0, 3.0));
        let order = vec![VarHandle::Imu];
        let h_x = DMatrix::zeros(3, 15);
        let h_f = DMatrix::identity(3, 3);
        let r = DMatrix::identity(3, 3) * 1e-2;
        let res = DVector::from_vec(vec![0.0, 0.0, 0.0]);
        let ok = StateHelper::initialize_landmark(&mut state, 7, lm, &order, h_x, h_f, r, res, 1.0);
        assert!(ok);
        assert!(state.features_slam.contains_key(&7));
        assert_eq!(state.n_vars(), 15 + 3);
    }
}
