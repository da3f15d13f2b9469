//! Fixed-size Kalman filter storage.
//!
//! `KalmanState` holds every vector and matrix a linear or extended Kalman
//! filter of shape (X states, U controls, Z measurements) works with. It has
//! no predict/correct logic of its own; concrete filters own one and drive it.

use nalgebra::{SMatrix, SVector};

#[derive(Clone, Debug, PartialEq)]
pub struct KalmanState<const X: usize, const U: usize, const Z: usize> {
    /// State estimate x̂
    pub state: SVector<f64, X>,
    /// Control input u
    pub control: SVector<f64, U>,
    /// Latest measurement z
    pub measurement: SVector<f64, Z>,

    /// Covariance P [X×X]
    pub covariance: SMatrix<f64, X, X>,
    /// Kalman gain K [X×Z]
    pub gain: SMatrix<f64, X, Z>,

    /// State transition F [X×X]
    pub transition: SMatrix<f64, X, X>,
    /// Control matrix B [X×U]
    pub control_matrix: SMatrix<f64, X, U>,
    /// Process noise Q [X×X]
    pub process_noise: SMatrix<f64, X, X>,
    /// Observation matrix H [Z×X]
    pub observation: SMatrix<f64, Z, X>,
    /// Measurement noise R [Z×Z]
    pub measurement_noise: SMatrix<f64, Z, Z>,
}

impl<const X: usize, const U: usize, const Z: usize> KalmanState<X, U, Z> {
    /// Create a container with every vector and matrix zeroed
    pub fn new() -> Self {
        Self {
            state: SVector::zeros(),
            control: SVector::zeros(),
            measurement: SVector::zeros(),
            covariance: SMatrix::zeros(),
            gain: SMatrix::zeros(),
            transition: SMatrix::zeros(),
            control_matrix: SMatrix::zeros(),
            process_noise: SMatrix::zeros(),
            observation: SMatrix::zeros(),
            measurement_noise: SMatrix::zeros(),
        }
    }

    /// Zero every vector and matrix
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl<const X: usize, const U: usize, const Z: usize> Default for KalmanState<X, U, Z> {
    fn default() -> Self {
        Self::new()
    }
}
