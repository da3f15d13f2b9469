//! Adaptive quaternion EKF estimating attitude and gyro bias from a 6-axis IMU.

pub mod error;
pub mod filters;
pub mod replay;
pub mod types;

pub use error::{ConfigError, ConfigResult};
pub use filters::attitude_ekf::{
    AttitudeEkf, AttitudeEstimate, ChiSquareStat, FilterParams, StepStatus,
};
pub use types::ImuSample;
