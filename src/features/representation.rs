use serde::{Deserialize, Serialize};

/// Landmark parametrization, mirroring `FeatureRepresentation::Representation` in the
/// source estimator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureRepresentation {
    GlobalXyz,
    GlobalFullInverseDepth,
    AnchoredXyz,
    AnchoredFullInverseDepth,
    AnchoredMsckfInverseDepth,
}

impl FeatureRepresentation {
    /// True for the three representations that are expressed relative to an anchor clone.
    pub fn is_relative(self) -> bool {
        matches!(
            self,
            FeatureRepresentation::AnchoredXyz
                | FeatureRepresentation::AnchoredFullInverseDepth
                | FeatureRepresentation::AnchoredMsckfInverseDepth
        )
    }
}
