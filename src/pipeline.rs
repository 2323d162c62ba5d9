//! Pipeline orchestrator (C9): time alignment between IMU and image streams, the
//! propagate-then-update cycle, and marginalization at the sliding-window boundary.
//!
//! Grounded on `ov_msckf/src/core/VioManager.cpp`'s `feed_measurement_camera` driver
//! loop, restructured around this crate's `Propagator`/`UpdaterMsckf`/`UpdaterSlam`.

use log::{debug, info, warn};
use nalgebra::Vector3;
use tokio::sync::mpsc;

use crate::config::FilterOptions;
use crate::error::{FilterError, FilterResult};
use crate::features::FeatureDatabase;
use crate::init::InertialInitializer;
use crate::propagation::Propagator;
use crate::state::{State, StateHelper};
use crate::update::{UpdaterMsckf, UpdaterSlam};

/// An event on the combined IMU/image timeline, the two producer streams merged onto
/// one consumer queue.
#[derive(Clone, Copy, Debug)]
pub enum PipelineEvent {
    Imu { timestamp: f64, wm: Vector3<f64>, am: Vector3<f64> },
    Image { timestamp: f64 },
}

/// Owns the filter state and every component that mutates it. The feature database is
/// shared with the (external) tracker front-end via `feature_db()`.
pub struct Pipeline {
    state: State,
    propagator: Propagator,
    inertial_init: InertialInitializer,
    msckf: UpdaterMsckf,
    slam: UpdaterSlam,
    db: FeatureDatabase,
    initialized: bool,
}

impl Pipeline {
    pub fn new(options: FilterOptions) -> Self {
        let state = State::new(options.state.clone());
        let propagator = Propagator::new(options.imu_noise.clone(), options.state.gravity_mag);
        let inertial_init = InertialInitializer::new(options.inertial_init.clone(), options.state.gravity_mag);
        let msckf = UpdaterMsckf::new(options.msckf.clone(), options.feature_init.clone());
        let slam = UpdaterSlam::new(options.slam.clone(), options.aruco.clone(), options.state.max_aruco_features, options.feature_init);
        let db = FeatureDatabase::new(options.state.feat_representation);
        Self { state, propagator, inertial_init, msckf, slam, db, initialized: false }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn feature_db(&self) -> &FeatureDatabase {
        &self.db
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Appends a raw IMU sample to both the propagator's buffer and (until the filter
    /// has a seeded pose) the stationary-start initializer's buffer.
    pub fn feed_imu(&mut self, timestamp: f64, wm: Vector3<f64>, am: Vector3<f64>) {
        self.propagator.feed_imu(timestamp, wm, am);
        if !self.initialized {
            self.inertial_init.feed_imu(timestamp, wm, am);
        }
    }

    /// Forwards a single track observation from the (external) front-end into the
    /// feature database.
    pub fn feed_feature(&mut self, id: usize, t: f64, cam: usize, u: f64, v: f64, un: f64, vn: f64) {
        self.db.update_feature(id, t, cam, u, v, un, vn);
    }

    /// Drives one image epoch through the full cycle: initialize-if-needed,
    /// propagate and clone, MSCKF update, SLAM update and
    /// delayed init, then marginalize the oldest clone and migrate its anchors.
    /// Returns `Ok(false)` if the epoch was skipped because the filter has not yet
    /// initialized.
    pub fn process_image_epoch(&mut self, t_img: f64) -> FilterResult<bool> {
        if !self.initialized {
            match self.inertial_init.initialize_with_imu() {
                Some(init) => {
                    self.state.timestamp = init.time0;
                    self.state.imu.q = init.q_gtoi0;
                    self.state.imu.p = init.p_i0ing;
                    self.state.imu.v = init.v_i0ing;
                    self.state.imu.bg = init.b_w0;
                    self.state.imu.ba = init.b_a0;
                    self.state.imu.set_fej_to_value();
                    self.initialized = true;
                    info!("inertial initializer converged at t={}", init.time0);
                }
                None => {
                    debug!("image epoch t={} skipped: filter not yet initialized", t_img);
                    return Ok(false);
                }
            }
        }

        self.propagator.propagate_and_clone(&mut self.state, t_img)?;

        let n_msckf = self.msckf.update(&mut self.state, &self.db)?;
        debug!("t={}: msckf folded {} features", t_img, n_msckf);

        let present = self.db.features_containing(t_img, false);
        let mut slam_feats = Vec::new();
        let mut delayed_candidates = Vec::new();
        let slam_capacity = self.state.options.max_slam_features;
        for feat in present {
            if self.state.features_slam.contains_key(&feat.featid) {
                slam_feats.push(feat);
            } else if self.state.features_slam.len() + delayed_candidates.len() < slam_capacity {
                delayed_candidates.push(feat);
            }
        }

        if !slam_feats.is_empty() {
            let n_slam = self.slam.update(&mut self.state, slam_feats)?;
            debug!("t={}: slam updated {} landmarks", t_img, n_slam);
        }
        if !delayed_candidates.is_empty() {
            let n_new = self.slam.delayed_init(&mut self.state, delayed_candidates);
            debug!("t={}: slam delayed-init inserted {} landmarks", t_img, n_new);
        }

        self.marginalize_if_needed();
        self.db.cleanup();
        Ok(true)
    }

    /// Marginalizes the oldest clone once the window exceeds `max_clone_size`,
    /// migrating any landmark anchored there first via `change_anchors`.
    fn marginalize_if_needed(&mut self) {
        if self.state.n_clones() <= self.state.options.max_clone_size {
            return;
        }
        self.slam.change_anchors(&mut self.state);
        if let Some(marg_ts) = self.state.margtimestep() {
            StateHelper::marginalize_clone(&mut self.state, marg_ts);
            self.propagator.clean_older_than(marg_ts);
            debug!("marginalized clone at t={}, window now {} clones", marg_ts, self.state.n_clones());
        }
    }

    /// Runs the consumer side of the concurrency model: a single filter loop draining
    /// a merged IMU/image event queue fed by independent producer tasks. Transient
    /// data failures (e.g. the IMU buffer hasn't caught up to an image timestamp yet)
    /// are logged and skipped rather than propagated; a filter inconsistency halts
    /// the loop.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<PipelineEvent>) -> FilterResult<Self> {
        while let Some(event) = events.recv().await {
            match event {
                PipelineEvent::Imu { timestamp, wm, am } => self.feed_imu(timestamp, wm, am),
                PipelineEvent::Image { timestamp } => match self.process_image_epoch(timestamp) {
                    Ok(_) => {}
                    Err(FilterError::TransientData(msg)) => {
                        warn!("image epoch t={} skipped: {}", timestamp, msg);
                    }
                    Err(e) => return Err(e),
                },
            }
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StateOptions;
    use nalgebra::Matrix3;

    fn feed_stationary_imu(pipeline: &mut Pipeline, n: usize, dt: f64) {
        for i in 0..n {
            let t = i as f64 * dt;
            let jitter = 0.02 * ((i as f64) * 0.31).sin();
            pipeline.feed_imu(t, Vector3::new(0.001, -0.001, 0.0), Vector3::new(jitter, 0.0, 9.81));
        }
    }

    #[test]
    fn image_epoch_before_initialization_is_skipped() {
        let mut pipeline = Pipeline::new(FilterOptions::default());
        pipeline.feed_imu(0.0, Vector3::zeros(), Vector3::new(0.0, 0.0, 9.81));
        let ran = pipeline.process_image_epoch(0.01).unwrap();
        assert!(!ran);
        assert!(!pipeline.is_initialized());
    }

    #[test]
    fn sustained_excitation_initializes_then_clones_on_image_epoch() {
        let mut options = FilterOptions::default();
        options.state = StateOptions { max_clone_size: 5, ..StateOptions::default() };
        let mut pipeline = Pipeline::new(options);

        feed_stationary_imu(&mut pipeline, 300, 0.01);
        // Extra IMU samples past the image epoch so the propagator's window is covered.
        for i in 300..320 {
            let t = i as f64 * 0.01;
            pipeline.feed_imu(t, Vector3::new(0.001, -0.001, 0.0), Vector3::new(0.0, 0.0, 9.81));
        }

        let ran = pipeline.process_image_epoch(2.9).unwrap();
        assert!(ran);
        assert!(pipeline.is_initialized());
        assert_eq!(pipeline.state().n_clones(), 1);
    }

    #[test]
    fn marginalizes_oldest_clone_once_window_is_full() {
        let mut options = FilterOptions::default();
        options.state = StateOptions { max_clone_size: 2, ..StateOptions::default() };
        let mut pipeline = Pipeline::new(options);
        pipeline.initialized = true;
        pipeline.state.imu.q = nalgebra::Vector4::new(0.0, 0.0, 0.0, 1.0);

        feed_stationary_imu(&mut pipeline, 50, 0.01);
        for t in [0.1, 0.2, 0.3] {
            for i in 0..20 {
                let tt = t + i as f64 * 0.01;
                pipeline.feed_imu(tt, Vector3::zeros(), Vector3::new(0.0, 0.0, 9.81));
            }
            pipeline.process_image_epoch(t).unwrap();
        }
        assert!(pipeline.state().n_clones() <= 2);
        let _ = Matrix3::<f64>::identity();
    }
}
