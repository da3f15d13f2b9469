pub mod attitude_ekf;
pub mod kalman;
