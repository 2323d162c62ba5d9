/// A stable reference to a live variable inside [`super::state::State`]: an integer
/// handle into typed storage rather than a raw pointer into a vector that may
/// reshuffle. Clones are addressed by timestamp since the covariance offset of a
/// clone changes across marginalizations.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum VarHandle {
    Imu,
    Clone(u64),
    CamExtrinsic(usize),
    CamIntrinsic(usize),
    TimeOffset,
    Slam(usize),
}

/// Bit-pattern key for a clone timestamp, used only as a lookup key (never arithmetic).
pub fn ts_key(t: f64) -> u64 {
    t.to_bits()
}
