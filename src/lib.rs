//! A Multi-State Constraint Kalman Filter visual-inertial odometry estimator.
//!
//! The crate is organized the way the source estimator splits its own `ov_core`/
//! `ov_init`/`ov_msckf` packages: math primitives, state representation, feature
//! tracking storage, initialization, propagation, and measurement updates each get
//! their own module, orchestrated by [`pipeline`].

pub mod config;
pub mod error;
pub mod features;
pub mod init;
pub mod math;
pub mod pipeline;
pub mod propagation;
pub mod state;
pub mod update;

pub use config::FilterOptions;
pub use error::{FilterError, FilterResult};
pub use pipeline::{Pipeline, PipelineEvent};
