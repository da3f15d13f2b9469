//! Linear algebra type system for the attitude filter
//!
//! Provides compile-time dimension checking and clean type aliases
//! for the Kalman state container and the attitude EKF.

use nalgebra::{SMatrix, SVector};

// ===== State Dimensions =====
pub const STATE_DIM: usize = 6; // q0..q3, bx, by
pub const QUAT_DIM: usize = 4;
pub const CONTROL_DIM: usize = 1; // unused by the attitude model, kept for the container shape

// ===== State Indices =====
pub const YAW_INDEX: usize = 3;
pub const BIAS_X: usize = 4;
pub const BIAS_Y: usize = 5;

// ===== Measurement Dimensions =====
pub const MEASURE_DIM_GRAVITY: usize = 3; // normalized accel (x, y, z)

// ===== Attitude Filter Types =====
pub type StateVec6 = SVector<f64, STATE_DIM>;
pub type StateMat6 = SMatrix<f64, STATE_DIM, STATE_DIM>;

// Measurement types
pub type GravityVec = SVector<f64, MEASURE_DIM_GRAVITY>;
pub type GravityNoise = SMatrix<f64, MEASURE_DIM_GRAVITY, MEASURE_DIM_GRAVITY>;

// Kalman gain types
pub type KalmanGainGravity = SMatrix<f64, STATE_DIM, MEASURE_DIM_GRAVITY>; // 6×3

// Jacobian types
pub type JacobianGravity = SMatrix<f64, MEASURE_DIM_GRAVITY, STATE_DIM>; // 3×6
