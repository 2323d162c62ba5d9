//! Typed state variables (C2): a tagged sum type over every parameter kind the filter
//! carries, each exposing `update`/`clone`/`set_fej`/`size`/`id`.
//!
//! A sum type is used instead of a trait object: the set of variable kinds is closed
//! and the IMU/landmark kinds need kind-specific accessors that would otherwise
//! require downcasting.

use nalgebra::{DVector, Matrix3, Vector3, Vector4};

use crate::features::FeatureRepresentation;
use crate::math::{quat_2_rot, quat_multiply, quat_norm};

/// A plain additive vector variable (camera intrinsics, time offset).
#[derive(Clone, Debug)]
pub struct VectorVar {
    pub id: usize,
    pub value: DVector<f64>,
    pub fej: DVector<f64>,
}

impl VectorVar {
    pub fn new(dim: usize) -> Self {
        Self { id: 0, value: DVector::zeros(dim), fej: DVector::zeros(dim) }
    }

    pub fn size(&self) -> usize {
        self.value.len()
    }
}

/// A JPL quaternion + position pose, used for camera clones and camera-to-IMU extrinsics.
#[derive(Clone, Debug)]
pub struct PoseVar {
    pub id: usize,
    pub q: Vector4<f64>,
    pub p: Vector3<f64>,
    pub q_fej: Vector4<f64>,
    pub p_fej: Vector3<f64>,
}

impl PoseVar {
    pub fn identity() -> Self {
        Self {
            id: 0,
            q: Vector4::new(0.0, 0.0, 0.0, 1.0),
            p: Vector3::zeros(),
            q_fej: Vector4::new(0.0, 0.0, 0.0, 1.0),
            p_fej: Vector3::zeros(),
        }
    }

    pub fn size(&self) -> usize {
        6
    }

    pub fn rot(&self) -> Matrix3<f64> {
        quat_2_rot(&self.q)
    }

    pub fn rot_fej(&self) -> Matrix3<f64> {
        quat_2_rot(&self.q_fej)
    }

    pub fn update(&mut self, dx: &DVector<f64>) {
        let dtheta = Vector3::new(dx[0], dx[1], dx[2]);
        let dq = quat_norm(&Vector4::new(0.5 * dtheta.x, 0.5 * dtheta.y, 0.5 * dtheta.z, 1.0));
        self.q = quat_multiply(&dq, &self.q);
        self.p += Vector3::new(dx[3], dx[4], dx[5]);
    }

    pub fn set_fej_to_value(&mut self) {
        self.q_fej = self.q;
        self.p_fej = self.p;
    }
}

/// The 15-error-DoF IMU state: orientation, position, velocity, gyro bias, accel bias.
/// Always lives at covariance offset 0.
#[derive(Clone, Debug)]
pub struct ImuVar {
    pub q: Vector4<f64>,
    pub p: Vector3<f64>,
    pub v: Vector3<f64>,
    pub bg: Vector3<f64>,
    pub ba: Vector3<f64>,
    pub q_fej: Vector4<f64>,
    pub p_fej: Vector3<f64>,
    pub v_fej: Vector3<f64>,
}

pub const IMU_ERROR_SIZE: usize = 15;

impl ImuVar {
    pub fn identity() -> Self {
        let q = Vector4::new(0.0, 0.0, 0.0, 1.0);
        Self {
            q,
            p: Vector3::zeros(),
            v: Vector3::zeros(),
            bg: Vector3::zeros(),
            ba: Vector3::zeros(),
            q_fej: q,
            p_fej: Vector3::zeros(),
            v_fej: Vector3::zeros(),
        }
    }

    pub fn rot(&self) -> Matrix3<f64> {
        quat_2_rot(&self.q)
    }

    pub fn rot_fej(&self) -> Matrix3<f64> {
        quat_2_rot(&self.q_fej)
    }

    /// Error-offset contract: q at 0, p at 3, v at 6, b_g at 9, b_a at 12.
    pub fn update(&mut self, dx: &DVector<f64>) {
        let dtheta = Vector3::new(dx[0], dx[1], dx[2]);
        let dq = quat_norm(&Vector4::new(0.5 * dtheta.x, 0.5 * dtheta.y, 0.5 * dtheta.z, 1.0));
        self.q = quat_multiply(&dq, &self.q);
        self.p += Vector3::new(dx[3], dx[4], dx[5]);
        self.v += Vector3::new(dx[6], dx[7], dx[8]);
        self.bg += Vector3::new(dx[9], dx[10], dx[11]);
        self.ba += Vector3::new(dx[12], dx[13], dx[14]);
    }

    /// Cloned pose sub-variable used for stochastic cloning (`augment_clone`).
    pub fn pose(&self) -> PoseVar {
        PoseVar { id: 0, q: self.q, p: self.p, q_fej: self.q_fej, p_fej: self.p_fej }
    }

    pub fn set_fej_to_value(&mut self) {
        self.q_fej = self.q;
        self.p_fej = self.p;
        self.v_fej = self.v;
    }
}

/// A SLAM landmark: a 3-vector in one of five representations.
#[derive(Clone, Debug)]
pub struct LandmarkVar {
    pub id: usize,
    pub featid: usize,
    pub representation: FeatureRepresentation,
    pub value: Vector3<f64>,
    pub fej: Vector3<f64>,
    pub anchor_cam_id: Option<usize>,
    pub anchor_clone_timestamp: Option<f64>,
    pub has_had_anchor_change: bool,
}

impl LandmarkVar {
    pub fn new(featid: usize, representation: FeatureRepresentation, value: Vector3<f64>) -> Self {
        Self {
            id: 0,
            featid,
            representation,
            value,
            fej: value,
            anchor_cam_id: None,
            anchor_clone_timestamp: None,
            has_had_anchor_change: false,
        }
    }

    pub fn size(&self) -> usize {
        3
    }

    pub fn update(&mut self, dx: &DVector<f64>) {
        self.value += Vector3::new(dx[0], dx[1], dx[2]);
    }

    /// Converts the local (possibly inverse-depth) value into anchor-frame XYZ.
    pub fn get_xyz(&self, use_fej: bool) -> Vector3<f64> {
        let v = if use_fej { self.fej } else { self.value };
        match self.representation {
            FeatureRepresentation::AnchoredFullInverseDepth
            | FeatureRepresentation::AnchoredMsckfInverseDepth
            | FeatureRepresentation::GlobalFullInverseDepth => {
                let (alpha, beta, rho) = (v.x, v.y, v.z);
                Vector3::new(alpha / rho, beta / rho, 1.0 / rho)
            }
            FeatureRepresentation::GlobalXyz | FeatureRepresentation::AnchoredXyz => v,
        }
    }

    pub fn set_from_xyz(&mut self, p: Vector3<f64>, is_fej: bool) {
        let local = match self.representation {
            FeatureRepresentation::AnchoredFullInverseDepth
            | FeatureRepresentation::AnchoredMsckfInverseDepth
            | FeatureRepresentation::GlobalFullInverseDepth => {
                Vector3::new(p.x / p.z, p.y / p.z, 1.0 / p.z)
            }
            FeatureRepresentation::GlobalXyz | FeatureRepresentation::AnchoredXyz => p,
        };
        if is_fej {
            self.fej = local;
        } else {
            self.value = local;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn imu_update_applies_block_offsets_in_order() {
        let mut imu = ImuVar::identity();
        let dx = DVector::from_vec(vec![0.0, 0.0, 0.0, 1.0, 2.0, 3.0, 0.1, 0.2, 0.3, 0.01, 0.0, 0.0, 0.0, 0.0, 0.0]);
        imu.update(&dx);
        assert_abs_diff_eq!(imu.p, Vector3::new(1.0, 2.0, 3.0), epsilon = 1e-12);
        assert_abs_diff_eq!(imu.v, Vector3::new(0.1, 0.2, 0.3), epsilon = 1e-12);
        assert_abs_diff_eq!(imu.bg, Vector3::new(0.01, 0.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn landmark_xyz_round_trips_through_inverse_depth() {
        let mut lm = LandmarkVar::new(1, FeatureRepresentation::AnchoredFullInverseDepth, Vector3::zeros());
        let p = Vector3::new(0.5, -0.25, 3.0);
        lm.set_from_xyz(p, false);
        let back = lm.get_xyz(false);
        assert_abs_diff_eq!(back, p, epsilon = 1e-9);
    }

    #[test]
    fn pose_update_left_multiplies_quaternion() {
        let mut pose = PoseVar::identity();
        let dx = DVector::from_vec(vec![0.01, 0.0, 0.0, 0.0, 0.0, 0.0]);
        pose.update(&dx);
        assert!(pose.q.norm() > 0.0);
        assert_abs_diff_eq!(pose.q.norm(), 1.0, epsilon = 1e-12);
    }
}
