use std::collections::HashMap;
use std::sync::Mutex;

use log::debug;

use super::feature::Feature;
use super::representation::FeatureRepresentation;

/// Thread-safe landmark-id -> [`Feature`] map.
///
/// A single mutex covers every public method. Queries that pass `remove = true`
/// atomically drain the matching entries and hand ownership to the caller; otherwise
/// the caller receives clones and the database keeps the originals.
pub struct FeatureDatabase {
    inner: Mutex<HashMap<usize, Feature>>,
    default_representation: FeatureRepresentation,
}

impl FeatureDatabase {
    pub fn new(default_representation: FeatureRepresentation) -> Self {
        Self { inner: Mutex::new(HashMap::new()), default_representation }
    }

    /// Appends a measurement, creating the feature if this is its first observation.
    pub fn update_feature(&self, id: usize, t: f64, cam: usize, u: f64, v: f64, un: f64, vn: f64) {
        let mut map = self.inner.lock().unwrap();
        let feat = map
            .entry(id)
            .or_insert_with(|| Feature::new(id, self.default_representation));
        feat.push(cam, t, u, v, un, vn);
    }

    pub fn get_feature(&self, id: usize, remove: bool) -> Option<Feature> {
        let mut map = self.inner.lock().unwrap();
        if remove {
            map.remove(&id)
        } else {
            map.get(&id).cloned()
        }
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Features whose latest observation, in *every* camera, is strictly older than `t`
    /// -- landmarks that have just dropped out of tracking (MSCKF candidates).
    pub fn features_not_containing_newer(&self, t: f64, remove: bool) -> Vec<Feature> {
        self.select(remove, |feat| {
            feat.tracks.values().all(|tr| tr.timestamps.last().map_or(true, |&last| last < t))
        })
    }

    /// Features with at least one observation strictly older than `t` -- used when the
    /// oldest clone is about to be marginalized.
    pub fn features_containing_older(&self, t: f64, remove: bool) -> Vec<Feature> {
        self.select(remove, |feat| {
            feat.tracks.values().any(|tr| tr.timestamps.first().map_or(false, |&first| first < t))
        })
    }

    /// Features with an observation at exactly `t` in any camera.
    pub fn features_containing(&self, t: f64, remove: bool) -> Vec<Feature> {
        self.select(remove, |feat| feat.tracks.values().any(|tr| tr.timestamps.iter().any(|&ts| ts == t)))
    }

    /// Frees every feature whose `to_delete` flag is set.
    pub fn cleanup(&self) {
        let mut map = self.inner.lock().unwrap();
        let before = map.len();
        map.retain(|_, feat| !feat.to_delete);
        debug!("feature database cleanup: {} -> {} features", before, map.len());
    }

    fn select(&self, remove: bool, pred: impl Fn(&Feature) -> bool) -> Vec<Feature> {
        let mut map = self.inner.lock().unwrap();
        if remove {
            let ids: Vec<usize> = map.iter().filter(|(_, f)| pred(f)).map(|(&id, _)| id).collect();
            ids.iter().filter_map(|id| map.remove(id)).collect()
        } else {
            map.values().filter(|f| pred(f)).cloned().collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_feature_creates_then_appends() {
        let db = FeatureDatabase::new(FeatureRepresentation::GlobalXyz);
        db.update_feature(1, 1.0, 0, 1.0, 2.0, 0.1, 0.2);
        db.update_feature(1, 2.0, 0, 1.5, 2.5, 0.15, 0.25);
        let f = db.get_feature(1, false).unwrap();
        assert_eq!(f.tracks[&0].timestamps, vec![1.0, 2.0]);
    }

    #[test]
    fn features_not_containing_newer_selects_dropped_tracks() {
        let db = FeatureDatabase::new(FeatureRepresentation::GlobalXyz);
        db.update_feature(1, 1.0, 0, 0.0, 0.0, 0.0, 0.0);
        db.update_feature(2, 5.0, 0, 0.0, 0.0, 0.0, 0.0);
        let dropped = db.features_not_containing_newer(3.0, false);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].featid, 1);
    }

    #[test]
    fn remove_flag_drains_entry() {
        let db = FeatureDatabase::new(FeatureRepresentation::GlobalXyz);
        db.update_feature(1, 1.0, 0, 0.0, 0.0, 0.0, 0.0);
        let taken = db.get_feature(1, true);
        assert!(taken.is_some());
        assert!(db.get_feature(1, false).is_none());
        assert_eq!(db.size(), 0);
    }

    #[test]
    fn cleanup_drops_flagged_features() {
        let db = FeatureDatabase::new(FeatureRepresentation::GlobalXyz);
        db.update_feature(1, 1.0, 0, 0.0, 0.0, 0.0, 0.0);
        {
            let mut f = db.get_feature(1, true).unwrap();
            f.to_delete = true;
            // Re-insert to simulate a caller marking-then-returning ownership.
            let map = &db.inner;
            map.lock().unwrap().insert(1, f);
        }
        db.cleanup();
        assert_eq!(db.size(), 0);
    }
}
