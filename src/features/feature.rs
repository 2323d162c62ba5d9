use std::collections::HashMap;

use nalgebra::Vector3;

use super::representation::FeatureRepresentation;

/// A single camera's lock-step observation sequences for one landmark.
///
/// Invariant: `timestamps.len() == uvs.len() == uvs_norm.len()` and
/// `timestamps` is strictly increasing, for every camera track that exists.
#[derive(Clone, Debug, Default)]
pub struct CameraTrack {
    pub timestamps: Vec<f64>,
    pub uvs: Vec<(f64, f64)>,
    pub uvs_norm: Vec<(f64, f64)>,
}

impl CameraTrack {
    fn push(&mut self, t: f64, u: f64, v: f64, un: f64, vn: f64) {
        self.timestamps.push(t);
        self.uvs.push((u, v));
        self.uvs_norm.push((un, vn));
    }
}

/// A per-landmark observation record, consumed by the updaters.
#[derive(Clone, Debug)]
pub struct Feature {
    pub featid: usize,
    pub to_delete: bool,
    pub tracks: HashMap<usize, CameraTrack>,
    pub anchor_cam_id: Option<usize>,
    pub anchor_clone_timestamp: Option<f64>,
    pub p_fin_a: Option<Vector3<f64>>,
    pub p_fin_g: Option<Vector3<f64>>,
    pub feat_representation: FeatureRepresentation,
}

impl Feature {
    pub fn new(featid: usize, feat_representation: FeatureRepresentation) -> Self {
        Self {
            featid,
            to_delete: false,
            tracks: HashMap::new(),
            anchor_cam_id: None,
            anchor_clone_timestamp: None,
            p_fin_a: None,
            p_fin_g: None,
            feat_representation,
        }
    }

    pub(super) fn push(&mut self, cam: usize, t: f64, u: f64, v: f64, un: f64, vn: f64) {
        self.tracks.entry(cam).or_default().push(t, u, v, un, vn);
    }

    /// Total number of observations across every camera.
    pub fn num_measurements(&self) -> usize {
        self.tracks.values().map(|tr| tr.timestamps.len()).sum()
    }

    /// The camera with the most observations of this feature (ties broken by lowest id).
    pub fn most_observed_camera(&self) -> Option<usize> {
        self.tracks
            .iter()
            .max_by_key(|(&cam, tr)| (tr.timestamps.len(), std::cmp::Reverse(cam)))
            .map(|(&cam, _)| cam)
    }

    /// Removes every observation whose timestamp is not in `valid_times`, keeping the
    /// three parallel sequences per camera in lock-step.
    pub fn clean_old_measurements(&mut self, valid_times: &[f64]) {
        for track in self.tracks.values_mut() {
            let mut keep_t = Vec::with_capacity(track.timestamps.len());
            let mut keep_uv = Vec::with_capacity(track.uvs.len());
            let mut keep_uvn = Vec::with_capacity(track.uvs_norm.len());
            for i in 0..track.timestamps.len() {
                if valid_times.iter().any(|&vt| vt == track.timestamps[i]) {
                    keep_t.push(track.timestamps[i]);
                    keep_uv.push(track.uvs[i]);
                    keep_uvn.push(track.uvs_norm[i]);
                }
            }
            track.timestamps = keep_t;
            track.uvs = keep_uv;
            track.uvs_norm = keep_uvn;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(featid: usize) -> Feature {
        let mut f = Feature::new(featid, FeatureRepresentation::GlobalXyz);
        f.push(0, 1.0, 10.0, 20.0, 0.1, 0.2);
        f.push(0, 2.0, 11.0, 21.0, 0.11, 0.21);
        f.push(0, 3.0, 12.0, 22.0, 0.12, 0.22);
        f
    }

    #[test]
    fn push_keeps_sequences_lockstep() {
        let f = sample(1);
        let tr = &f.tracks[&0];
        assert_eq!(tr.timestamps.len(), tr.uvs.len());
        assert_eq!(tr.timestamps.len(), tr.uvs_norm.len());
        assert!(tr.timestamps.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn clean_old_measurements_drops_unlisted_timestamps() {
        let mut f = sample(1);
        f.clean_old_measurements(&[1.0, 3.0]);
        let tr = &f.tracks[&0];
        assert_eq!(tr.timestamps, vec![1.0, 3.0]);
        assert_eq!(tr.uvs, vec![(10.0, 20.0), (12.0, 22.0)]);
        assert_eq!(tr.uvs_norm.len(), 2);
    }

    #[test]
    fn most_observed_camera_picks_richest_track() {
        let mut f = sample(1);
        f.push(1, 1.0, 0.0, 0.0, 0.0, 0.0);
        assert_eq!(f.most_observed_camera(), Some(0));
    }
}
