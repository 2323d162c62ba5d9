//! Feature triangulation (C4): linear DLT initial guess plus Gauss-Newton/LM refinement
//! in inverse-depth coordinates. Grounded on `ov_core/src/feat/FeatureInitializer.cpp`.

use std::collections::HashMap;

use nalgebra::{Matrix3, Vector2, Vector3};

use crate::config::FeatureInitializerOptions;
use crate::features::Feature;
use crate::state::handle::ts_key;

/// A camera pose at one clone timestamp, as seen by the triangulator: global-to-camera
/// rotation and the camera's position in the global frame.
#[derive(Clone, Copy, Debug)]
pub struct ClonePose {
    pub r_gtoc: Matrix3<f64>,
    pub p_cing: Vector3<f64>,
}

/// camera id -> timestamp (as bit-pattern key) -> pose.
pub type ClonesCam = HashMap<usize, HashMap<u64, ClonePose>>;

pub struct FeatureInitializer {
    pub options: FeatureInitializerOptions,
}

impl FeatureInitializer {
    pub fn new(options: FeatureInitializerOptions) -> Self {
        Self { options }
    }

    fn anchor_pose(&self, feat: &Feature, clones: &ClonesCam) -> Option<ClonePose> {
        let anchor = feat.anchor_cam_id?;
        let t = ts_key(feat.anchor_clone_timestamp?);
        clones.get(&anchor).and_then(|m| m.get(&t)).copied()
    }

    fn compute_error(&self, clones: &ClonesCam, feat: &Feature, alpha: f64, beta: f64, rho: f64) -> f64 {
        let anchor_pose = match self.anchor_pose(feat, clones) {
            Some(p) => p,
            None => return f64::INFINITY,
        };
        let r_gtoa = anchor_pose.r_gtoc;
        let p_ainv = anchor_pose.p_cing;

        let mut err = 0.0;
        for (&cam_id, track) in feat.tracks.iter() {
            for i in 0..track.timestamps.len() {
                let t_bits = ts_key(track.timestamps[i]);
                let pose = match clones.get(&cam_id).and_then(|m| m.get(&t_bits)) {
                    Some(p) => *p,
                    None => continue,
                };
                let r_atoci = pose.r_gtoc * r_gtoa.transpose();
                let p_ciina = r_gtoa * (pose.p_cing - p_ainv);
                let p_ainci = -r_atoci * p_ciina;

                let dir = Vector3::new(alpha, beta, 1.0);
                let hi1 = r_atoci.row(0).dot(&dir) + rho * p_ainci.x;
                let hi2 = r_atoci.row(1).dot(&dir) + rho * p_ainci.y;
                let hi3 = r_atoci.row(2).dot(&dir) + rho * p_ainci.z;
                let z = Vector2::new(hi1 / hi3, hi2 / hi3);
                let (un, vn) = track.uvs_norm[i];
                let res = Vector2::new(un, vn) - z;
                err += res.norm_squared();
            }
        }
        err
    }

    /// Linear DLT triangulation: builds the perpendicular-to-bearing system across every
    /// observation and solves with a least-squares SVD, gated on condition number and
    /// depth bounds. On success populates `feat.p_fin_a`/`feat.p_fin_g` and the anchor.
    pub fn single_triangulation(&self, feat: &mut Feature, clones: &ClonesCam) -> bool {
        let mut anchor_cam = 0usize;
        let mut most_meas = 0usize;
        let mut total_meas = 0usize;
        for (&cam_id, track) in feat.tracks.iter() {
            total_meas += track.timestamps.len();
            if track.timestamps.len() > most_meas {
                most_meas = track.timestamps.len();
                anchor_cam = cam_id;
            }
        }
        if total_meas == 0 {
            return false;
        }
        let anchor_track = &feat.tracks[&anchor_cam];
        let anchor_t = *anchor_track.timestamps.last().unwrap();
        feat.anchor_cam_id = Some(anchor_cam);
        feat.anchor_clone_timestamp = Some(anchor_t);

        let anchor_pose = match clones.get(&anchor_cam).and_then(|m| m.get(&ts_key(anchor_t))) {
            Some(p) => *p,
            None => return false,
        };
        let r_gtoa = anchor_pose.r_gtoc;
        let p_ainv = anchor_pose.p_cing;

        let mut a = nalgebra::DMatrix::<f64>::zeros(2 * total_meas, 3);
        let mut b = nalgebra::DVector::<f64>::zeros(2 * total_meas);
        let mut row = 0;
        for (&cam_id, track) in feat.tracks.iter() {
            for i in 0..track.timestamps.len() {
                let t_bits = ts_key(track.timestamps[i]);
                let pose = match clones.get(&cam_id).and_then(|m| m.get(&t_bits)) {
                    Some(p) => *p,
                    None => continue,
                };
                let r_atoci = pose.r_gtoc * r_gtoa.transpose();
                let p_ciina = r_gtoa * (pose.p_cing - p_ainv);

                let (un, vn) = track.uvs_norm[i];
                let mut bearing = Vector3::new(un, vn, 1.0);
                bearing = r_atoci.transpose() * bearing;
                bearing /= bearing.norm();
                let bperp_row0 = Vector3::new(-bearing.z, 0.0, bearing.x);
                let bperp_row1 = Vector3::new(0.0, bearing.z, -bearing.y);

                a.set_row(2 * row, &bperp_row0.transpose());
                a.set_row(2 * row + 1, &bperp_row1.transpose());
                b[2 * row] = bperp_row0.dot(&p_ciina);
                b[2 * row + 1] = bperp_row1.dot(&p_ciina);
                row += 1;
            }
        }

        let svd = a.clone().svd(true, true);
        let singular_values = &svd.singular_values;
        let cond_a = if singular_values.len() >= 2 {
            singular_values[0] / singular_values[singular_values.len() - 1]
        } else {
            1.0
        };
        let p_f = match svd.solve(&b, 1e-12) {
            Ok(x) => x,
            Err(_) => return false,
        };

        if cond_a.abs() > self.options.max_cond_number
            || p_f[2] < self.options.min_dist
            || p_f[2] > self.options.max_dist
            || p_f.norm().is_nan()
        {
            return false;
        }

        let p_fin_a = Vector3::new(p_f[0], p_f[1], p_f[2]);
        feat.p_fin_a = Some(p_fin_a);
        feat.p_fin_g = Some(r_gtoa.transpose() * p_fin_a + p_ainv);
        true
    }

    /// Levenberg-Marquardt refinement in (alpha, beta, rho) inverse-depth coordinates,
    /// re-gated on depth bounds and the baseline/depth ratio.
    pub fn single_gaussnewton(&self, feat: &mut Feature, clones: &ClonesCam) -> bool {
        let p_fin_a = match feat.p_fin_a {
            Some(p) => p,
            None => return false,
        };
        let mut rho = 1.0 / p_fin_a.z;
        let mut alpha = p_fin_a.x / p_fin_a.z;
        let mut beta = p_fin_a.y / p_fin_a.z;

        let mut lam = self.options.init_lamda;
        let mut eps = 10000.0;
        let mut runs = 0usize;
        let mut recompute = true;

        let mut hess = Matrix3::zeros();
        let mut grad = Vector3::zeros();
        let mut cost_old = self.compute_error(clones, feat, alpha, beta, rho);

        let anchor_pose = match self.anchor_pose(feat, clones) {
            Some(p) => p,
            None => return false,
        };
        let r_gtoa = anchor_pose.r_gtoc;
        let p_ainv = anchor_pose.p_cing;

        while runs < self.options.max_runs && lam < self.options.max_lamda && eps > self.options.min_dx {
            if recompute {
                hess = Matrix3::zeros();
                grad = Vector3::zeros();
                for (&cam_id, track) in feat.tracks.iter() {
                    for i in 0..track.timestamps.len() {
                        let t_bits = ts_key(track.timestamps[i]);
                        let pose = match clones.get(&cam_id).and_then(|m| m.get(&t_bits)) {
                            Some(p) => *p,
                            None => continue,
                        };
                        let r_atoci = pose.r_gtoc * r_gtoa.transpose();
                        let p_ciina = r_gtoa * (pose.p_cing - p_ainv);
                        let p_ainci = -r_atoci * p_ciina;

                        let dir = Vector3::new(alpha, beta, 1.0);
                        let hi1 = r_atoci.row(0).dot(&dir) + rho * p_ainci.x;
                        let hi2 = r_atoci.row(1).dot(&dir) + rho * p_ainci.y;
                        let hi3 = r_atoci.row(2).dot(&dir) + rho * p_ainci.z;
                        let hi3_sq = hi3 * hi3;

                        let d_z1_d_alpha = (r_atoci[(0, 0)] * hi3 - hi1 * r_atoci[(2, 0)]) / hi3_sq;
                        let d_z1_d_beta = (r_atoci[(0, 1)] * hi3 - hi1 * r_atoci[(2, 1)]) / hi3_sq;
                        let d_z1_d_rho = (p_ainci.x * hi3 - hi1 * p_ainci.z) / hi3_sq;
                        let d_z2_d_alpha = (r_atoci[(1, 0)] * hi3 - hi2 * r_atoci[(2, 0)]) / hi3_sq;
                        let d_z2_d_beta = (r_atoci[(1, 1)] * hi3 - hi2 * r_atoci[(2, 1)]) / hi3_sq;
                        let d_z2_d_rho = (p_ainci.y * hi3 - hi2 * p_ainci.z) / hi3_sq;

                        let h = nalgebra::Matrix2x3::new(
                            d_z1_d_alpha, d_z1_d_beta, d_z1_d_rho, d_z2_d_alpha, d_z2_d_beta, d_z2_d_rho,
                        );
                        let (un, vn) = track.uvs_norm[i];
                        let z = Vector2::new(hi1 / hi3, hi2 / hi3);
                        let res = Vector2::new(un, vn) - z;

                        grad += h.transpose() * res;
                        hess += h.transpose() * h;
                    }
                }
            }

            let mut hess_l = hess;
            for r in 0..3 {
                hess_l[(r, r)] *= 1.0 + lam;
            }
            let dx = match hess_l.lu().solve(&grad) {
                Some(x) => x,
                None => {
                    lam *= self.options.lam_mult;
                    continue;
                }
            };

            let cost = self.compute_error(clones, feat, alpha + dx.x, beta + dx.y, rho + dx.z);

            if cost <= cost_old && (cost_old - cost) / cost_old < self.options.min_dcost {
                alpha += dx.x;
                beta += dx.y;
                rho += dx.z;
                break;
            }

            if cost <= cost_old {
                recompute = true;
                cost_old = cost;
                alpha += dx.x;
                beta += dx.y;
                rho += dx.z;
                runs += 1;
                lam /= self.options.lam_mult;
                eps = dx.norm();
            } else {
                recompute = false;
                lam *= self.options.lam_mult;
            }
        }

        let p_fin_a_new = Vector3::new(alpha / rho, beta / rho, 1.0 / rho);

        let mut base_line_max = 0.0_f64;
        let qr = nalgebra::Matrix3x1::new(p_fin_a_new.x, p_fin_a_new.y, p_fin_a_new.z).qr();
        let q = qr.q();
        let nullspace = q.fixed_view::<3, 2>(0, 1).clone_owned();
        for (&cam_id, track) in feat.tracks.iter() {
            for &t in track.timestamps.iter() {
                let t_bits = ts_key(t);
                let pose = match clones.get(&cam_id).and_then(|m| m.get(&t_bits)) {
                    Some(p) => *p,
                    None => continue,
                };
                let p_ciina = r_gtoa * (pose.p_cing - p_ainv);
                let base_line = (nullspace.transpose() * p_ciina).norm();
                if base_line > base_line_max {
                    base_line_max = base_line;
                }
            }
        }

        if p_fin_a_new.z < self.options.min_dist
            || p_fin_a_new.z > self.options.max_dist
            || (p_fin_a_new.norm() / base_line_max) > self.options.max_baseline
            || p_fin_a_new.norm().is_nan()
        {
            return false;
        }

        feat.p_fin_a = Some(p_fin_a_new);
        feat.p_fin_g = Some(r_gtoa.transpose() * p_fin_a_new + p_ainv);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureDatabase;
    use crate::features::FeatureRepresentation;
    use approx::assert_abs_diff_eq;

    fn make_clones() -> ClonesCam {
        let mut clones: ClonesCam = HashMap::new();
        let mut cam0 = HashMap::new();
        cam0.insert(ts_key(0.0), ClonePose { r_gtoc: Matrix3::identity(), p_cing: Vector3::zeros() });
        cam0.insert(ts_key(1.0), ClonePose { r_gtoc: Matrix3::identity(), p_cing: Vector3::new(1.0, 0.0, 0.0) });
        clones.insert(0, cam0);
        clones
    }

    fn observe(truth: Vector3<f64>, pose: &ClonePose) -> (f64, f64) {
        let p_in_cam = pose.r_gtoc * (truth - pose.p_cing);
        (p_in_cam.x / p_in_cam.z, p_in_cam.y / p_in_cam.z)
    }

    #[test]
    fn single_clone_triangulation_is_rejected() {
        let clones = make_clones();
        let pose0 = clones[&0][&ts_key(0.0)];
        let truth = Vector3::new(0.2, 0.1, 3.0);
        let db = FeatureDatabase::new(FeatureRepresentation::GlobalXyz);
        let (un, vn) = observe(truth, &pose0);
        db.update_feature(1, 0.0, 0, un, vn, un, vn);
        let mut feat = db.get_feature(1, false).unwrap();

        let init = FeatureInitializer::new(FeatureInitializerOptions::default());
        assert!(!init.single_triangulation(&mut feat, &clones));
    }

    #[test]
    fn two_view_triangulation_recovers_depth() {
        let clones = make_clones();
        let pose0 = clones[&0][&ts_key(0.0)];
        let pose1 = clones[&0][&ts_key(1.0)];
        let truth = Vector3::new(0.3, -0.2, 4.0);

        let db = FeatureDatabase::new(FeatureRepresentation::GlobalXyz);
        let (un0, vn0) = observe(truth, &pose0);
        let (un1, vn1) = observe(truth, &pose1);
        db.update_feature(2, 0.0, 0, un0, vn0, un0, vn0);
        db.update_feature(2, 1.0, 0, un1, vn1, un1, vn1);
        let mut feat = db.get_feature(2, false).unwrap();

        let init = FeatureInitializer::new(FeatureInitializerOptions::default());
        assert!(init.single_triangulation(&mut feat, &clones));
        assert!(init.single_gaussnewton(&mut feat, &clones));
        assert_abs_diff_eq!(feat.p_fin_g.unwrap(), truth, epsilon = 1e-6);
    }
}
