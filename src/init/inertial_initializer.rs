//! Stationary-start initializer (C8): detects a motionless window from the raw IMU
//! buffer, estimates the gravity-aligned attitude, and seeds the biases.
//!
//! Grounded on `ov_core/src/init/InertialInitializer.cpp`.

use log::warn;
use nalgebra::{Vector3, Vector4};

use crate::config::InertialInitializerOptions;
use crate::math::{rot_2_quat, skew};

#[derive(Clone, Copy, Debug)]
pub struct ImuSample {
    pub timestamp: f64,
    pub wm: Vector3<f64>,
    pub am: Vector3<f64>,
}

/// Everything the filter needs to seed the IMU state.
#[derive(Clone, Copy, Debug)]
pub struct InitialState {
    pub time0: f64,
    pub q_gtoi0: Vector4<f64>,
    pub b_w0: Vector3<f64>,
    pub v_i0ing: Vector3<f64>,
    pub b_a0: Vector3<f64>,
    pub p_i0ing: Vector3<f64>,
}

pub struct InertialInitializer {
    options: InertialInitializerOptions,
    gravity: Vector3<f64>,
    imu_data: Vec<ImuSample>,
}

impl InertialInitializer {
    pub fn new(options: InertialInitializerOptions, gravity_mag: f64) -> Self {
        Self { options, gravity: Vector3::new(0.0, 0.0, gravity_mag), imu_data: Vec::new() }
    }

    /// Appends a raw IMU sample, trimming everything older than three window lengths
    /// behind `timestamp`.
    pub fn feed_imu(&mut self, timestamp: f64, wm: Vector3<f64>, am: Vector3<f64>) {
        self.imu_data.push(ImuSample { timestamp, wm, am });
        let cutoff = timestamp - 3.0 * self.options.window_length;
        self.imu_data.retain(|d| d.timestamp >= cutoff);
    }

    /// Attempts stationary-start initialization: rejects if there isn't a full
    /// two-window history, or if the newest window shows too little acceleration
    /// excitation (i.e. the platform hasn't even held still long enough to separate
    /// noise from gravity). On success the older (second-newest) window supplies the
    /// gravity-aligned attitude and bias estimate.
    pub fn initialize_with_imu(&self) -> Option<InitialState> {
        if self.imu_data.is_empty() {
            return None;
        }
        let newest_time = self.imu_data.last().unwrap().timestamp;
        let w = self.options.window_length;

        let window_newest: Vec<ImuSample> = self
            .imu_data
            .iter()
            .copied()
            .filter(|d| d.timestamp > newest_time - w && d.timestamp <= newest_time)
            .collect();
        let window_secondnew: Vec<ImuSample> = self
            .imu_data
            .iter()
            .copied()
            .filter(|d| d.timestamp > newest_time - 2.0 * w && d.timestamp <= newest_time - w)
            .collect();

        if window_newest.is_empty() || window_secondnew.is_empty() {
            return None;
        }

        let mut a_avg = Vector3::zeros();
        for d in &window_newest {
            a_avg += d.am;
        }
        a_avg /= window_newest.len() as f64;
        let mut a_var = 0.0;
        for d in &window_newest {
            let diff = d.am - a_avg;
            a_var += diff.dot(&diff);
        }
        a_var = (a_var / (window_newest.len() as f64 - 1.0)).sqrt();

        if a_var < self.options.imu_excite_threshold {
            warn!(
                "inertial initializer: no IMU excitation, {:.4} < {:.4}",
                a_var, self.options.imu_excite_threshold
            );
            return None;
        }

        let mut linsum = Vector3::zeros();
        let mut angsum = Vector3::zeros();
        for d in &window_secondnew {
            linsum += d.am;
            angsum += d.wm;
        }
        let n = window_secondnew.len() as f64;
        let linavg = linsum / n;
        let angavg = angsum / n;

        let z_axis = linavg / linavg.norm();
        let e1 = Vector3::new(1.0, 0.0, 0.0);
        let mut x_axis = e1 - z_axis * z_axis.dot(&e1);
        x_axis /= x_axis.norm();
        let y_axis = skew(&z_axis) * x_axis;

        let mut r_o = nalgebra::Matrix3::zeros();
        r_o.set_column(0, &x_axis);
        r_o.set_column(1, &y_axis);
        r_o.set_column(2, &z_axis);
        let q_gtoi = rot_2_quat(&r_o);

        let bg = angavg;
        let ba = linavg - crate::math::quat_2_rot(&q_gtoi) * self.gravity;

        Some(InitialState {
            time0: window_secondnew.last().unwrap().timestamp,
            q_gtoi0: q_gtoi,
            b_w0: bg,
            v_i0ing: Vector3::zeros(),
            b_a0: ba,
            p_i0ing: Vector3::zeros(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn empty_buffer_rejects() {
        let init = InertialInitializer::new(InertialInitializerOptions::default(), 9.81);
        assert!(init.initialize_with_imu().is_none());
    }

    #[test]
    fn stationary_but_noiseless_window_rejects() {
        let mut init = InertialInitializer::new(InertialInitializerOptions::default(), 9.81);
        for i in 0..300 {
            let t = i as f64 * 0.01;
            init.feed_imu(t, Vector3::zeros(), Vector3::new(0.0, 0.0, 9.81));
        }
        assert!(init.initialize_with_imu().is_none());
    }

    #[test]
    fn excited_stationary_window_recovers_gravity_alignment() {
        let mut init = InertialInitializer::new(InertialInitializerOptions::default(), 9.81);
        for i in 0..300 {
            let t = i as f64 * 0.01;
            let jitter = 0.02 * ((i as f64) * 0.37).sin();
            init.feed_imu(t, Vector3::new(0.001, -0.001, 0.0), Vector3::new(jitter, 0.0, 9.81));
        }
        let state = init.initialize_with_imu().expect("should initialize");
        let r = crate::math::quat_2_rot(&state.q_gtoi0);
        let g_in_i = r * Vector3::new(0.0, 0.0, 9.81);
        assert_abs_diff_eq!(g_in_i, Vector3::new(0.0, 0.0, 9.81), epsilon = 1e-6);
        assert_abs_diff_eq!(state.v_i0ing, Vector3::zeros(), epsilon = 1e-12);
    }
}
