pub mod linalg;

pub use linalg::*;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Accelerometer reading in m/s²
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccelData {
    pub timestamp: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Gyroscope reading in rad/s
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GyroData {
    pub timestamp: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl AccelData {
    pub fn vector(&self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.z)
    }
}

impl GyroData {
    pub fn vector(&self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.z)
    }
}

/// One filter input: paired accel/gyro sample and the period it covers.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ImuSample {
    /// Specific force in body frame [m/s²]
    pub accel: Vector3<f64>,
    /// Angular rate in body frame [rad/s]
    pub gyro: Vector3<f64>,
    /// Sample period [s], must be > 0
    pub dt: f64,
}

impl ImuSample {
    pub fn new(accel: Vector3<f64>, gyro: Vector3<f64>, dt: f64) -> Self {
        Self { accel, gyro, dt }
    }
}
