//! IMU propagation (C6): discrete or RK4 mean prediction plus the error-state
//! transition/noise Jacobians, followed by stochastic cloning.
//!
//! Grounded on `ov_msckf/src/state/Propagator.cpp`.

use log::error;
use nalgebra::{Matrix3, Matrix4, SMatrix, Vector3, Vector4};

use crate::config::ImuNoise;
use crate::error::{FilterError, FilterResult};
use crate::math::{exp_so3, jr_so3, omega, quat_2_rot, quat_multiply, quat_norm, skew};
use crate::state::{State, StateHelper};

pub type Matrix15 = SMatrix<f64, 15, 15>;
pub type Matrix15x12 = SMatrix<f64, 15, 12>;

#[derive(Clone, Copy, Debug)]
pub struct ImuData {
    pub timestamp: f64,
    pub wm: Vector3<f64>,
    pub am: Vector3<f64>,
}

pub struct Propagator {
    noises: ImuNoise,
    gravity: Vector3<f64>,
    imu_data: Vec<ImuData>,
    last_prop_time_offset: Option<f64>,
}

impl Propagator {
    pub fn new(noises: ImuNoise, gravity_mag: f64) -> Self {
        Self { noises, gravity: Vector3::new(0.0, 0.0, gravity_mag), imu_data: Vec::new(), last_prop_time_offset: None }
    }

    pub fn feed_imu(&mut self, timestamp: f64, wm: Vector3<f64>, am: Vector3<f64>) {
        self.imu_data.push(ImuData { timestamp, wm, am });
    }

    /// Drops buffered samples no longer needed once `oldest_clone_time` has been
    /// marginalized out of the window.
    pub fn clean_older_than(&mut self, oldest_clone_time: f64) {
        self.imu_data.retain(|d| d.timestamp >= oldest_clone_time - 1.0);
    }

    /// Integrates the IMU state mean and covariance from `state.timestamp` up to
    /// `timestamp`, then calls [`StateHelper::augment_clone`] to add the new camera
    /// clone. The time-offset calibration is not wired up (see
    /// `DESIGN.md`), so camera-to-IMU time offset is always treated as zero.
    pub fn propagate_and_clone(&mut self, state: &mut State, timestamp: f64) -> FilterResult<()> {
        if state.timestamp == timestamp {
            return Err(FilterError::Precondition(
                "propagate_and_clone called again at the last update timestamp".to_string(),
            ));
        }
        if state.timestamp > timestamp {
            return Err(FilterError::Precondition(format!(
                "propagate_and_clone called going backwards in time: desired {} < current {}",
                timestamp, state.timestamp
            )));
        }

        let t_off_new = 0.0;
        if self.last_prop_time_offset.is_none() {
            self.last_prop_time_offset = Some(t_off_new);
        }
        let time0 = state.timestamp + self.last_prop_time_offset.unwrap();
        let time1 = timestamp + t_off_new;

        let prop_data = self.select_imu_readings(time0, time1)?;

        let mut phi_summed = Matrix15::identity();
        let mut qd_summed = Matrix15::zeros();

        for i in 0..prop_data.len() - 1 {
            let (f, qdi) = self.predict_and_compute(state, &prop_data[i], &prop_data[i + 1]);
            phi_summed = f * phi_summed;
            qd_summed = f * qd_summed * f.transpose() + qdi;
            qd_summed = 0.5 * (qd_summed + qd_summed.transpose());
        }

        let last_w = prop_data[prop_data.len() - 2].wm - state.imu.bg;

        // Sequential block update matching the source: row-block update first (using
        // the pre-update covariance), then column-block update reading the
        // already-updated rows, so the top-left 15x15 block ends up Phi*P*Phi^T.
        let mut new_cov = state.cov.clone();
        let top_rows = (phi_summed * state.cov.rows(0, 15)).clone_owned();
        new_cov.rows_mut(0, 15).copy_from(&top_rows);
        let left_cols = (new_cov.columns(0, 15) * phi_summed.transpose()).clone_owned();
        new_cov.columns_mut(0, 15).copy_from(&left_cols);
        let mut top_left = new_cov.view_mut((0, 0), (15, 15));
        top_left += qd_summed;
        drop(top_left);
        new_cov = 0.5 * (&new_cov + new_cov.transpose());
        state.cov = new_cov;

        state.timestamp = timestamp;
        self.last_prop_time_offset = Some(t_off_new);

        StateHelper::augment_clone(state, last_w);
        Ok(())
    }

    fn interpolate_data(imu1: &ImuData, imu2: &ImuData, timestamp: f64) -> ImuData {
        let lambda = (timestamp - imu1.timestamp) / (imu2.timestamp - imu1.timestamp);
        ImuData {
            timestamp,
            wm: (1.0 - lambda) * imu1.wm + lambda * imu2.wm,
            am: (1.0 - lambda) * imu1.am + lambda * imu2.am,
        }
    }

    fn select_imu_readings(&self, time0: f64, time1: f64) -> FilterResult<Vec<ImuData>> {
        if self.imu_data.is_empty() {
            return Err(FilterError::TransientData("no IMU measurements buffered".to_string()));
        }
        let imu_data = &self.imu_data;
        let mut prop_data = Vec::new();

        let mut i = 0;
        while i < imu_data.len() - 1 {
            if imu_data[i + 1].timestamp > time0 && imu_data[i].timestamp < time0 {
                prop_data.push(Self::interpolate_data(&imu_data[i], &imu_data[i + 1], time0));
                i += 1;
                continue;
            }
            if imu_data[i].timestamp >= time0 && imu_data[i + 1].timestamp <= time1 {
                prop_data.push(imu_data[i]);
                i += 1;
                continue;
            }
            if imu_data[i + 1].timestamp > time1 {
                if imu_data[i].timestamp > time1 {
                    prop_data.push(Self::interpolate_data(&imu_data[i - 1], &imu_data[i], time1));
                } else {
                    prop_data.push(imu_data[i]);
                }
                if prop_data.last().unwrap().timestamp != time1 {
                    prop_data.push(Self::interpolate_data(&imu_data[i], &imu_data[i + 1], time1));
                }
                break;
            }
            i += 1;
        }

        if prop_data.is_empty() {
            error!("select_imu_readings: not enough measurements to propagate with");
            return Err(FilterError::TransientData("empty propagation window".to_string()));
        }
        if imu_data.last().unwrap().timestamp <= time1 {
            error!("select_imu_readings: IMU stream hasn't reached the requested time1");
            return Err(FilterError::TransientData("IMU buffer does not cover [time0, time1]".to_string()));
        }

        let mut j = 0;
        while j + 1 < prop_data.len() {
            if (prop_data[j + 1].timestamp - prop_data[j].timestamp).abs() < 1e-12 {
                prop_data.remove(j);
            } else {
                j += 1;
            }
        }

        if prop_data.len() < 2 {
            return Err(FilterError::TransientData("fewer than 2 usable IMU samples after dedup".to_string()));
        }
        Ok(prop_data)
    }

    fn predict_and_compute(&self, state: &mut State, data_minus: &ImuData, data_plus: &ImuData) -> (Matrix15, Matrix15) {
        let dt = data_plus.timestamp - data_minus.timestamp;

        let w_hat = data_minus.wm - state.imu.bg;
        let a_hat = data_minus.am - state.imu.ba;
        let w_hat2 = data_plus.wm - state.imu.bg;
        let a_hat2 = data_plus.am - state.imu.ba;

        let (new_q, new_v, new_p) = if state.options.use_rk4_integration {
            self.predict_mean_rk4(state, dt, w_hat, a_hat, w_hat2, a_hat2)
        } else {
            self.predict_mean_discrete(state, dt, w_hat, a_hat, w_hat2, a_hat2)
        };

        // IMU error-offset contract: theta@0, p@3, v@6, bg@9, ba@12.
        let (th, p, v, bg, ba) = (0, 3, 6, 9, 12);
        let mut f = Matrix15::zeros();
        let mut g = Matrix15x12::zeros();

        if state.options.do_fej {
            let r_fej = state.imu.rot_fej();
            let d_r = quat_2_rot(&new_q) * r_fej.transpose();
            let v_fej = state.imu.v_fej;
            let p_fej = state.imu.p_fej;

            f.fixed_view_mut::<3, 3>(th, th).copy_from(&d_r);
            f.fixed_view_mut::<3, 3>(th, bg).copy_from(&(-d_r * jr_so3(&(-w_hat * dt)) * dt));
            f.fixed_view_mut::<3, 3>(bg, bg).copy_from(&Matrix3::identity());
            f.fixed_view_mut::<3, 3>(v, th)
                .copy_from(&(-skew(&(new_v - v_fej + self.gravity * dt)) * r_fej.transpose()));
            f.fixed_view_mut::<3, 3>(v, v).copy_from(&Matrix3::identity());
            f.fixed_view_mut::<3, 3>(v, ba).copy_from(&(-r_fej.transpose() * dt));
            f.fixed_view_mut::<3, 3>(ba, ba).copy_from(&Matrix3::identity());
            f.fixed_view_mut::<3, 3>(p, th)
                .copy_from(&(-skew(&(new_p - p_fej - v_fej * dt + 0.5 * self.gravity * dt * dt)) * r_fej.transpose()));
            f.fixed_view_mut::<3, 3>(p, v).copy_from(&(Matrix3::identity() * dt));
            f.fixed_view_mut::<3, 3>(p, ba).copy_from(&(-0.5 * r_fej.transpose() * dt * dt));
            f.fixed_view_mut::<3, 3>(p, p).copy_from(&Matrix3::identity());

            g.fixed_view_mut::<3, 3>(th, 0).copy_from(&(-d_r * jr_so3(&(-w_hat * dt)) * dt));
            g.fixed_view_mut::<3, 3>(v, 3).copy_from(&(-r_fej.transpose() * dt));
            g.fixed_view_mut::<3, 3>(p, 3).copy_from(&(-0.5 * r_fej.transpose() * dt * dt));
            g.fixed_view_mut::<3, 3>(bg, 6).copy_from(&(Matrix3::identity() * dt));
            g.fixed_view_mut::<3, 3>(ba, 9).copy_from(&(Matrix3::identity() * dt));
        } else {
            let r_gtoi = state.imu.rot();

            f.fixed_view_mut::<3, 3>(th, th).copy_from(&exp_so3(&(-w_hat * dt)));
            f.fixed_view_mut::<3, 3>(th, bg)
                .copy_from(&(-exp_so3(&(-w_hat * dt)) * jr_so3(&(-w_hat * dt)) * dt));
            f.fixed_view_mut::<3, 3>(bg, bg).copy_from(&Matrix3::identity());
            f.fixed_view_mut::<3, 3>(v, th).copy_from(&(-r_gtoi.transpose() * skew(&(a_hat * dt))));
            f.fixed_view_mut::<3, 3>(v, v).copy_from(&Matrix3::identity());
            f.fixed_view_mut::<3, 3>(v, ba).copy_from(&(-r_gtoi.transpose() * dt));
            f.fixed_view_mut::<3, 3>(ba, ba).copy_from(&Matrix3::identity());
            f.fixed_view_mut::<3, 3>(p, th)
                .copy_from(&(-0.5 * r_gtoi.transpose() * skew(&(a_hat * dt * dt))));
            f.fixed_view_mut::<3, 3>(p, v).copy_from(&(Matrix3::identity() * dt));
            f.fixed_view_mut::<3, 3>(p, ba).copy_from(&(-0.5 * r_gtoi.transpose() * dt * dt));
            f.fixed_view_mut::<3, 3>(p, p).copy_from(&Matrix3::identity());

            g.fixed_view_mut::<3, 3>(th, 0).copy_from(&(-exp_so3(&(-w_hat * dt)) * jr_so3(&(-w_hat * dt)) * dt));
            g.fixed_view_mut::<3, 3>(v, 3).copy_from(&(-r_gtoi.transpose() * dt));
            g.fixed_view_mut::<3, 3>(p, 3).copy_from(&(-0.5 * r_gtoi.transpose() * dt * dt));
            g.fixed_view_mut::<3, 3>(bg, 6).copy_from(&(Matrix3::identity() * dt));
            g.fixed_view_mut::<3, 3>(ba, 9).copy_from(&(Matrix3::identity() * dt));
        }

        let mut qc = SMatrix::<f64, 12, 12>::zeros();
        qc.fixed_view_mut::<3, 3>(0, 0).copy_from(&(Matrix3::identity() * (self.noises.sigma_w * self.noises.sigma_w / dt)));
        qc.fixed_view_mut::<3, 3>(3, 3).copy_from(&(Matrix3::identity() * (self.noises.sigma_a * self.noises.sigma_a / dt)));
        qc.fixed_view_mut::<3, 3>(6, 6)
            .copy_from(&(Matrix3::identity() * (self.noises.sigma_wb * self.noises.sigma_wb / dt)));
        qc.fixed_view_mut::<3, 3>(9, 9)
            .copy_from(&(Matrix3::identity() * (self.noises.sigma_ab * self.noises.sigma_ab / dt)));

        let mut qd = g * qc * g.transpose();
        qd = 0.5 * (qd + qd.transpose());

        state.imu.q = new_q;
        state.imu.p = new_p;
        state.imu.v = new_v;
        state.imu.set_fej_to_value();

        (f, qd)
    }

    fn predict_mean_discrete(
        &self,
        state: &State,
        dt: f64,
        w_hat1: Vector3<f64>,
        a_hat1: Vector3<f64>,
        w_hat2: Vector3<f64>,
        a_hat2: Vector3<f64>,
    ) -> (Vector4<f64>, Vector3<f64>, Vector3<f64>) {
        let (w_hat, a_hat) = if state.options.imu_avg {
            (0.5 * (w_hat1 + w_hat2), 0.5 * (a_hat1 + a_hat2))
        } else {
            (w_hat1, a_hat1)
        };

        let w_norm = w_hat.norm();
        let r_gtoi = state.imu.rot();

        let big_o = if w_norm > 1e-20 {
            (0.5 * w_norm * dt).cos() * Matrix4::identity() + (1.0 / w_norm) * (0.5 * w_norm * dt).sin() * omega(&w_hat)
        } else {
            Matrix4::identity() + 0.5 * dt * omega(&w_hat)
        };
        let new_q = quat_norm(&(big_o * state.imu.q));

        let new_v = state.imu.v + r_gtoi.transpose() * a_hat * dt - self.gravity * dt;
        let new_p = state.imu.p + state.imu.v * dt + 0.5 * r_gtoi.transpose() * a_hat * dt * dt - 0.5 * self.gravity * dt * dt;

        (new_q, new_v, new_p)
    }

    fn predict_mean_rk4(
        &self,
        state: &State,
        dt: f64,
        w_hat1: Vector3<f64>,
        a_hat1: Vector3<f64>,
        w_hat2: Vector3<f64>,
        a_hat2: Vector3<f64>,
    ) -> (Vector4<f64>, Vector3<f64>, Vector3<f64>) {
        let w_alpha = (w_hat2 - w_hat1) / dt;
        let a_jerk = (a_hat2 - a_hat1) / dt;

        let q0 = state.imu.q;
        let p0 = state.imu.p;
        let v0 = state.imu.v;

        let dq0 = Vector4::new(0.0, 0.0, 0.0, 1.0);
        let mut w_hat = w_hat1;
        let mut a_hat = a_hat1;

        let q0_dot = 0.5 * omega(&w_hat) * dq0;
        let p0_dot = v0;
        let r_gto0 = quat_2_rot(&quat_multiply(&dq0, &q0));
        let v0_dot = r_gto0.transpose() * a_hat - self.gravity;

        let k1_q = q0_dot * dt;
        let k1_p = p0_dot * dt;
        let k1_v = v0_dot * dt;

        w_hat += 0.5 * w_alpha * dt;
        a_hat += 0.5 * a_jerk * dt;

        let dq1 = quat_norm(&(dq0 + 0.5 * k1_q));
        let v1 = v0 + 0.5 * k1_v;

        let q1_dot = 0.5 * omega(&w_hat) * dq1;
        let p1_dot = v1;
        let r_gto1 = quat_2_rot(&quat_multiply(&dq1, &q0));
        let v1_dot = r_gto1.transpose() * a_hat - self.gravity;

        let k2_q = q1_dot * dt;
        let k2_p = p1_dot * dt;
        let k2_v = v1_dot * dt;

        let dq2 = quat_norm(&(dq0 + 0.5 * k2_q));
        let v2 = v0 + 0.5 * k2_v;

        let q2_dot = 0.5 * omega(&w_hat) * dq2;
        let p2_dot = v2;
        let r_gto2 = quat_2_rot(&quat_multiply(&dq2, &q0));
        let v2_dot = r_gto2.transpose() * a_hat - self.gravity;

        let k3_q = q2_dot * dt;
        let k3_p = p2_dot * dt;
        let k3_v = v2_dot * dt;

        w_hat += 0.5 * w_alpha * dt;
        a_hat += 0.5 * a_jerk * dt;

        let dq3 = quat_norm(&(dq0 + k3_q));
        let v3 = v0 + k3_v;

        let q3_dot = 0.5 * omega(&w_hat) * dq3;
        let p3_dot = v3;
        let r_gto3 = quat_2_rot(&quat_multiply(&dq3, &q0));
        let v3_dot = r_gto3.transpose() * a_hat - self.gravity;

        let k4_q = q3_dot * dt;
        let k4_p = p3_dot * dt;
        let k4_v = v3_dot * dt;

        let dq = quat_norm(&(dq0 + (1.0 / 6.0) * k1_q + (1.0 / 3.0) * k2_q + (1.0 / 3.0) * k3_q + (1.0 / 6.0) * k4_q));
        let new_q = quat_multiply(&dq, &q0);
        let new_p = p0 + (1.0 / 6.0) * k1_p + (1.0 / 3.0) * k2_p + (1.0 / 3.0) * k3_p + (1.0 / 6.0) * k4_p;
        let new_v = v0 + (1.0 / 6.0) * k1_v + (1.0 / 3.0) * k2_v + (1.0 / 3.0) * k3_v + (1.0 / 6.0) * k4_v;

        (new_q, new_v, new_p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StateOptions;
    use approx::assert_abs_diff_eq;

    #[test]
    fn stationary_imu_keeps_position_still() {
        let mut state = State::new(StateOptions::default());
        let mut prop = Propagator::new(ImuNoise::default(), 9.81);
        for i in 0..20 {
            let t = i as f64 * 0.01;
            prop.feed_imu(t, Vector3::zeros(), Vector3::new(0.0, 0.0, 9.81));
        }
        prop.propagate_and_clone(&mut state, 0.15).unwrap();
        assert_abs_diff_eq!(state.imu.p, Vector3::zeros(), epsilon = 1e-9);
        assert_abs_diff_eq!(state.imu.v, Vector3::zeros(), epsilon = 1e-9);
    }

    #[test]
    fn propagate_backwards_in_time_is_rejected() {
        let mut state = State::new(StateOptions::default());
        state.timestamp = 1.0;
        let mut prop = Propagator::new(ImuNoise::default(), 9.81);
        prop.feed_imu(0.0, Vector3::zeros(), Vector3::new(0.0, 0.0, 9.81));
        prop.feed_imu(1.0, Vector3::zeros(), Vector3::new(0.0, 0.0, 9.81));
        let res = prop.propagate_and_clone(&mut state, 0.5);
        assert!(res.is_err());
    }

    #[test]
    fn propagation_grows_state_with_one_clone() {
        let mut state = State::new(StateOptions::default());
        let mut prop = Propagator::new(ImuNoise::default(), 9.81);
        for i in 0..20 {
            let t = i as f64 * 0.01;
            prop.feed_imu(t, Vector3::new(0.0, 0.0, 0.01), Vector3::new(0.1, 0.0, 9.81));
        }
        prop.propagate_and_clone(&mut state, 0.15).unwrap();
        assert_eq!(state.n_clones(), 1);
        assert_eq!(state.n_vars(), 15 + 6);
    }
}
