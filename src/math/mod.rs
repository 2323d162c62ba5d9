//! JPL-convention quaternion algebra and SO(3) helpers shared by every filter component.
//!
//! Quaternions are stored scalar-last, `[x, y, z, w]`, matching Trawny & Roumeliotis'
//! "Indirect Kalman Filter for 3D Attitude Estimation" tech report, which the rest of
//! this crate follows for sign conventions throughout.

use nalgebra::{Matrix3, Matrix4, Vector3, Vector4};

/// Skew-symmetric cross-product matrix `[v]_x` such that `[v]_x * w == v.cross(&w)`.
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Rotation matrix for a JPL quaternion `q = [x, y, z, w]`.
///
/// R = (2w^2 - 1) I - 2w [v]_x + 2 v v^T
pub fn quat_2_rot(q: &Vector4<f64>) -> Matrix3<f64> {
    let v = Vector3::new(q[0], q[1], q[2]);
    let w = q[3];
    Matrix3::identity() * (2.0 * w * w - 1.0) - skew(&v) * (2.0 * w) + v * v.transpose() * 2.0
}

/// Quaternion multiplication matching Trawny Eq. (8): `quat_multiply(q, p) == q ⊗ p`.
pub fn quat_multiply(q: &Vector4<f64>, p: &Vector4<f64>) -> Vector4<f64> {
    let mut qm = Matrix4::zeros();
    qm[(0, 0)] = q[3]; qm[(0, 1)] = q[2]; qm[(0, 2)] = -q[1]; qm[(0, 3)] = q[0];
    qm[(1, 0)] = -q[2]; qm[(1, 1)] = q[3]; qm[(1, 2)] = q[0]; qm[(1, 3)] = q[1];
    qm[(2, 0)] = q[1]; qm[(2, 1)] = -q[0]; qm[(2, 2)] = q[3]; qm[(2, 3)] = q[2];
    qm[(3, 0)] = -q[0]; qm[(3, 1)] = -q[1]; qm[(3, 2)] = -q[2]; qm[(3, 3)] = q[3];
    let out = qm * p;
    quat_norm(&out)
}

/// Normalizes a quaternion, forcing a non-negative scalar part for a canonical sign.
pub fn quat_norm(q: &Vector4<f64>) -> Vector4<f64> {
    let mut out = q / q.norm();
    if out[3] < 0.0 {
        out = -out;
    }
    out
}

/// 4x4 `Omega(w)` operator used to integrate quaternion kinematics `qdot = 1/2 Omega(w) q`.
pub fn omega(w: &Vector3<f64>) -> Matrix4<f64> {
    let mut m = Matrix4::zeros();
    let sk = skew(w);
    for r in 0..3 {
        for c in 0..3 {
            m[(r, c)] = -sk[(r, c)];
        }
    }
    m[(0, 3)] = w.x; m[(1, 3)] = w.y; m[(2, 3)] = w.z;
    m[(3, 0)] = -w.x; m[(3, 1)] = -w.y; m[(3, 2)] = -w.z;
    m
}

/// Converts a rotation matrix to the equivalent JPL quaternion (Shepperd's method).
pub fn rot_2_quat(rot: &Matrix3<f64>) -> Vector4<f64> {
    let trace = rot.trace();
    let candidates = [
        trace,
        rot[(0, 0)] - rot[(1, 1)] - rot[(2, 2)],
        rot[(1, 1)] - rot[(0, 0)] - rot[(2, 2)],
        rot[(2, 2)] - rot[(0, 0)] - rot[(1, 1)],
    ];
    let (best, _) = candidates
        .iter()
        .enumerate()
        .fold((0usize, candidates[0]), |acc, (i, &v)| if v > acc.1 { (i, v) } else { acc });

    let mut q = Vector4::zeros();
    match best {
        0 => {
            q[3] = 0.5 * (1.0 + trace).sqrt();
            q[0] = (rot[(1, 2)] - rot[(2, 1)]) / (4.0 * q[3]);
            q[1] = (rot[(2, 0)] - rot[(0, 2)]) / (4.0 * q[3]);
            q[2] = (rot[(0, 1)] - rot[(1, 0)]) / (4.0 * q[3]);
        }
        1 => {
            q[0] = 0.5 * (1.0 + candidates[1]).sqrt();
            q[1] = (rot[(0, 1)] + rot[(1, 0)]) / (4.0 * q[0]);
            q[2] = (rot[(0, 2)] + rot[(2, 0)]) / (4.0 * q[0]);
            q[3] = (rot[(1, 2)] - rot[(2, 1)]) / (4.0 * q[0]);
        }
        2 => {
            q[1] = 0.5 * (1.0 + candidates[2]).sqrt();
            q[0] = (rot[(0, 1)] + rot[(1, 0)]) / (4.0 * q[1]);
            q[2] = (rot[(1, 2)] + rot[(2, 1)]) / (4.0 * q[1]);
            q[3] = (rot[(2, 0)] - rot[(0, 2)]) / (4.0 * q[1]);
        }
        _ => {
            q[2] = 0.5 * (1.0 + candidates[3]).sqrt();
            q[0] = (rot[(0, 2)] + rot[(2, 0)]) / (4.0 * q[2]);
            q[1] = (rot[(1, 2)] + rot[(2, 1)]) / (4.0 * q[2]);
            q[3] = (rot[(0, 1)] - rot[(1, 0)]) / (4.0 * q[2]);
        }
    }
    quat_norm(&q)
}

/// SO(3) exponential map via Rodrigues' formula.
pub fn exp_so3(w: &Vector3<f64>) -> Matrix3<f64> {
    let theta = w.norm();
    let sk = skew(w);
    if theta < 1e-12 {
        return Matrix3::identity() + sk;
    }
    Matrix3::identity() + sk * (theta.sin() / theta) + sk * sk * ((1.0 - theta.cos()) / (theta * theta))
}

/// SO(3) logarithm map, inverse of [`exp_so3`] for rotations with angle < pi.
pub fn log_so3(r: &Matrix3<f64>) -> Vector3<f64> {
    let cos_theta = ((r.trace() - 1.0) / 2.0).clamp(-1.0, 1.0);
    let theta = cos_theta.acos();
    if theta < 1e-12 {
        return Vector3::new(r[(2, 1)] - r[(1, 2)], r[(0, 2)] - r[(2, 0)], r[(1, 0)] - r[(0, 1)]) * 0.5;
    }
    let w_hat = (r - r.transpose()) * (theta / (2.0 * theta.sin()));
    Vector3::new(w_hat[(2, 1)], w_hat[(0, 2)], w_hat[(1, 0)])
}

/// Right Jacobian of SO(3), used when linearizing discrete propagation of the
/// orientation error-state.
pub fn jr_so3(w: &Vector3<f64>) -> Matrix3<f64> {
    let theta = w.norm();
    let sk = skew(w);
    if theta < 1e-12 {
        return Matrix3::identity() - sk * 0.5;
    }
    let theta2 = theta * theta;
    Matrix3::identity() - sk * ((1.0 - theta.cos()) / theta2) + sk * sk * ((theta - theta.sin()) / (theta2 * theta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn identity_quaternion_gives_identity_rotation() {
        let q = Vector4::new(0.0, 0.0, 0.0, 1.0);
        let r = quat_2_rot(&q);
        assert_abs_diff_eq!(r, Matrix3::identity(), epsilon = 1e-12);
    }

    #[test]
    fn rot_2_quat_round_trips_through_quat_2_rot() {
        let w = Vector3::new(0.1, -0.2, 0.3);
        let r = exp_so3(&w);
        let q = rot_2_quat(&r);
        let r2 = quat_2_rot(&q);
        assert_abs_diff_eq!(r, r2, epsilon = 1e-9);
    }

    #[test]
    fn quat_multiply_identity_is_noop() {
        let id = Vector4::new(0.0, 0.0, 0.0, 1.0);
        let q = quat_norm(&Vector4::new(0.1, 0.2, 0.3, 0.9));
        let out = quat_multiply(&id, &q);
        assert_abs_diff_eq!(out, q, epsilon = 1e-12);
    }

    #[test]
    fn exp_log_so3_round_trip() {
        let w = Vector3::new(0.05, 0.3, -0.1);
        let r = exp_so3(&w);
        let w2 = log_so3(&r);
        assert_abs_diff_eq!(w, w2, epsilon = 1e-9);
    }

    #[test]
    fn skew_matches_cross_product() {
        let a = Vector3::new(1.0, 2.0, 3.0);
        let b = Vector3::new(-1.0, 0.5, 2.0);
        assert_abs_diff_eq!(skew(&a) * b, a.cross(&b), epsilon = 1e-12);
    }
}
