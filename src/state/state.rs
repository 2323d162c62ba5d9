use std::collections::HashMap;

use nalgebra::{DMatrix, DVector};

use crate::config::StateOptions;

use super::handle::{ts_key, VarHandle};
use super::variable::{ImuVar, LandmarkVar, PoseVar, VectorVar, IMU_ERROR_SIZE};

/// The filter's mean and error-state covariance.
///
/// Field mutation outside this module is restricted to [`super::helper::StateHelper`],
/// which is the sole owner of covariance structure changes -- mirroring the source
/// estimator's `friend class StateHelper` relationship. Fields are `pub(crate)` rather
/// than private because Rust has no friend-class mechanism; the convention is that only
/// `state::helper` writes to `cov` or `order`.
pub struct State {
    pub timestamp: f64,
    pub options: StateOptions,
    pub imu: ImuVar,
    pub clones: Vec<(f64, PoseVar)>,
    pub features_slam: HashMap<usize, LandmarkVar>,
    pub calib_imu_to_cam: HashMap<usize, PoseVar>,
    pub cam_intrinsics: HashMap<usize, VectorVar>,
    pub calib_dt_cam_to_imu: Option<VectorVar>,
    pub(crate) cov: DMatrix<f64>,
    pub(crate) order: Vec<VarHandle>,
}

impl State {
    pub fn new(options: StateOptions) -> Self {
        let mut imu = ImuVar::identity();
        imu.set_fej_to_value();
        let mut s = Self {
            timestamp: 0.0,
            options,
            imu,
            clones: Vec::new(),
            features_slam: HashMap::new(),
            calib_imu_to_cam: HashMap::new(),
            cam_intrinsics: HashMap::new(),
            calib_dt_cam_to_imu: None,
            cov: DMatrix::zeros(IMU_ERROR_SIZE, IMU_ERROR_SIZE),
            order: vec![VarHandle::Imu],
        };
        for i in 0..IMU_ERROR_SIZE {
            s.cov[(i, i)] = 1e-3;
        }
        s
    }

    pub fn n_vars(&self) -> usize {
        self.cov.nrows()
    }

    pub fn cov(&self) -> &DMatrix<f64> {
        &self.cov
    }

    pub fn var_size(&self, h: VarHandle) -> usize {
        match h {
            VarHandle::Imu => IMU_ERROR_SIZE,
            VarHandle::Clone(_) => 6,
            VarHandle::CamExtrinsic(_) => 6,
            VarHandle::CamIntrinsic(_) => self.cam_intrinsics.values().next().map(|v| v.size()).unwrap_or(8),
            VarHandle::TimeOffset => 1,
            VarHandle::Slam(featid) => self.features_slam.get(&featid).map(|l| l.size()).unwrap_or(3),
        }
    }

    pub fn var_id(&self, h: VarHandle) -> usize {
        match h {
            VarHandle::Imu => 0,
            VarHandle::Clone(key) => self
                .clones
                .iter()
                .find(|(t, _)| ts_key(*t) == key)
                .map(|(_, p)| p.id)
                .expect("clone handle must reference a live clone"),
            VarHandle::CamExtrinsic(cam) => self.calib_imu_to_cam[&cam].id,
            VarHandle::CamIntrinsic(cam) => self.cam_intrinsics[&cam].id,
            VarHandle::TimeOffset => self.calib_dt_cam_to_imu.as_ref().expect("time offset not active").id,
            VarHandle::Slam(featid) => self.features_slam[&featid].id,
        }
    }

    pub(crate) fn set_var_id(&mut self, h: VarHandle, id: usize) {
        match h {
            VarHandle::Imu => {}
            VarHandle::Clone(key) => {
                if let Some((_, p)) = self.clones.iter_mut().find(|(t, _)| ts_key(*t) == key) {
                    p.id = id;
                }
            }
            VarHandle::CamExtrinsic(cam) => {
                self.calib_imu_to_cam.get_mut(&cam).unwrap().id = id;
            }
            VarHandle::CamIntrinsic(cam) => {
                self.cam_intrinsics.get_mut(&cam).unwrap().id = id;
            }
            VarHandle::TimeOffset => {
                self.calib_dt_cam_to_imu.as_mut().unwrap().id = id;
            }
            VarHandle::Slam(featid) => {
                self.features_slam.get_mut(&featid).unwrap().id = id;
            }
        }
    }

    /// Applies a full error-state correction, dispatching each variable's block to its
    /// own update rule.
    pub fn update(&mut self, dx: &DVector<f64>) {
        let order = self.order.clone();
        for h in order {
            let id = self.var_id(h);
            let size = self.var_size(h);
            let block = dx.rows(id, size).clone_owned();
            match h {
                VarHandle::Imu => self.imu.update(&block),
                VarHandle::Clone(key) => {
                    if let Some((_, p)) = self.clones.iter_mut().find(|(t, _)| ts_key(*t) == key) {
                        p.update(&block);
                    }
                }
                VarHandle::CamExtrinsic(cam) => {
                    self.calib_imu_to_cam.get_mut(&cam).unwrap().update(&block);
                }
                VarHandle::CamIntrinsic(cam) => {
                    self.cam_intrinsics.get_mut(&cam).unwrap().value += &block;
                }
                VarHandle::TimeOffset => {
                    self.calib_dt_cam_to_imu.as_mut().unwrap().value += &block;
                }
                VarHandle::Slam(featid) => {
                    self.features_slam.get_mut(&featid).unwrap().update(&block);
                }
            }
        }
    }

    /// The timestamp of the oldest clone -- the one marginalized at a window boundary.
    pub fn margtimestep(&self) -> Option<f64> {
        self.clones.iter().map(|(t, _)| *t).fold(None, |acc, t| match acc {
            None => Some(t),
            Some(m) if t < m => Some(t),
            Some(m) => Some(m),
        })
    }

    pub fn get_clone(&self, t: f64) -> Option<&PoseVar> {
        self.clones.iter().find(|(ts, _)| *ts == t).map(|(_, p)| p)
    }

    pub fn n_clones(&self) -> usize {
        self.clones.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_has_only_imu_block() {
        let state = State::new(StateOptions::default());
        assert_eq!(state.n_vars(), IMU_ERROR_SIZE);
        assert_eq!(state.order, vec![VarHandle::Imu]);
    }

    #[test]
    fn update_applies_imu_block() {
        let mut state = State::new(StateOptions::default());
        let mut dx = DVector::zeros(IMU_ERROR_SIZE);
        dx[3] = 1.0;
        state.update(&dx);
        assert_eq!(state.imu.p.x, 1.0);
    }
}
