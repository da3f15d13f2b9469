//! Adaptive quaternion EKF for gravity-referenced attitude estimation
//!
//! State Vector (6D):
//! [0-3]: Quaternion (q0, q1, q2, q3), scalar first, body to world
//! [4-5]: Gyro bias (bx, by) in body frame (rad/s)
//!
//! The only absolute reference is gravity, so the z gyro bias is not
//! estimated (always published as 0) and yaw (quaternion index 3) never
//! receives a measurement correction.
//!
//! Each step re-linearizes the transition around the propagated quaternion,
//! gates the accelerometer update with a chi-square test on the innovation,
//! shrinks the gain as the residual grows, and counts suspicious
//! stable-to-unstable transitions to report divergence.

use std::f64::consts::FRAC_2_PI;

use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::filters::kalman::KalmanState;
use crate::types::{
    GravityNoise, GravityVec, ImuSample, JacobianGravity, KalmanGainGravity, StateMat6, StateVec6,
    BIAS_X, BIAS_Y, CONTROL_DIM, MEASURE_DIM_GRAVITY, QUAT_DIM, STATE_DIM, YAW_INDEX,
};

const GRAVITY: f64 = 9.8; // nominal gravity for the stillness test (m/s²)
const MOTION_ACCEL_TOLERANCE: f64 = 0.5; // m/s²
const MOTION_GYRO_LIMIT: f64 = 0.3; // rad/s

/// Upper bound on the faded bias variances
const BIAS_VARIANCE_LIMIT: f64 = 10_000.0;
/// Maximum bias change per second of sample period (rad/s per s)
const BIAS_RATE_LIMIT: f64 = 1e-2;

/// Suspicious transitions tolerated before divergence is reported
const DIVERGENCE_LIMIT: u32 = 50;
const CHI2_STABLE_FRACTION: f64 = 0.5;
const CHI2_ADAPTIVE_FLOOR: f64 = 0.1;
const CHI2_ADAPTIVE_SPAN: f64 = 0.9;

/// Maps an axis angle in [0, π/2] to a bias gain weight in [0, 1]
pub const AXIS_COSINE_SCALE: f64 = FRAC_2_PI;

const MIN_ACCEL_NORM: f64 = 1e-6;
const MIN_QUAT_NORM: f64 = 1e-9;

// Priors
const PRIOR_QUAT_VARIANCE: f64 = 1e5;
const PRIOR_BIAS_VARIANCE: f64 = 100.0;
const PRIOR_COUPLING: f64 = 0.1;

pub const DEFAULT_CHI2_THRESHOLD: f64 = 1e-8;

type AttitudeKalman = KalmanState<STATE_DIM, CONTROL_DIM, MEASURE_DIM_GRAVITY>;

/// Construction-time tuning, fixed for the lifetime of a filter
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterParams {
    /// Quaternion process-noise density (q1)
    pub quaternion_noise: f64,

    /// Gyro bias process-noise density (q2)
    pub bias_noise: f64,

    /// Accelerometer measurement-noise density (r)
    pub accel_noise: f64,

    /// Fading coefficient λ in (0, 1], inflates bias covariance by 1/λ per step
    pub fading: f64,

    /// Chi-square threshold τ on the normalized innovation
    pub chi2_threshold: f64,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            quaternion_noise: 10.0,
            bias_noise: 0.001,
            accel_noise: 1e7,
            fading: 0.9996,
            chi2_threshold: DEFAULT_CHI2_THRESHOLD,
        }
    }
}

impl FilterParams {
    pub fn validate(&self) -> ConfigResult<()> {
        let densities = [
            ("quaternion_noise", self.quaternion_noise),
            ("bias_noise", self.bias_noise),
            ("accel_noise", self.accel_noise),
        ];
        for (name, value) in densities {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::NonPositiveNoise { name, value });
            }
        }

        if !(self.fading > 0.0 && self.fading <= 1.0) {
            return Err(ConfigError::FadingOutOfRange(self.fading));
        }

        if !(self.chi2_threshold.is_finite() && self.chi2_threshold > 0.0) {
            return Err(ConfigError::NonPositiveThreshold(self.chi2_threshold));
        }

        Ok(())
    }
}

/// Outcome of a single filter step
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Success,
    /// Sustained motion-stable disagreement between prediction and gravity.
    /// The measurement update was skipped and the counters were cleared.
    DivergenceDetected,
}

impl StepStatus {
    pub fn is_divergence(self) -> bool {
        self == StepStatus::DivergenceDetected
    }
}

/// Innovation statistics of the latest measurement update
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChiSquareStat {
    /// v = z - h(x⁻)
    pub innovation: GravityVec,

    /// S⁻¹ = (H·P⁻·Hᵀ + R)⁻¹
    pub innovation_cov_inv: GravityNoise,

    /// vᵀ·S⁻¹·v
    pub chi_square: f64,

    /// arccos(|h(x⁻)ᵢ|) per body axis
    pub orientation_cosine: Vector3<f64>,

    /// Gain scale g in (0, 1]
    pub adaptive_gain: f64,

    /// False when the latest step never reached the chi-square test
    /// (near-zero accel or singular S). `chi_square`, `innovation_cov_inv`
    /// and `adaptive_gain` then still hold the last evaluated values.
    pub measured: bool,
}

impl Default for ChiSquareStat {
    fn default() -> Self {
        Self {
            innovation: GravityVec::zeros(),
            innovation_cov_inv: GravityNoise::zeros(),
            chi_square: 0.0,
            orientation_cosine: Vector3::zeros(),
            adaptive_gain: 1.0,
            measured: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttitudeEstimate {
    /// Quaternion (w, x, y, z)
    pub quaternion: (f64, f64, f64, f64),

    /// Gyro bias estimate [rad/s], z always 0
    pub gyro_bias: (f64, f64, f64),

    /// Roll, pitch, yaw [rad]
    pub euler: (f64, f64, f64),

    /// Covariance trace for uncertainty
    pub covariance_trace: f64,

    /// Last chi-square statistic and gain scale
    pub chi_square: f64,
    pub adaptive_gain: f64,

    pub motion_stable: bool,
    pub divergence_count: u32,

    /// Update counters
    pub steps: u64,
    pub corrections: u64,
    pub divergences: u64,
}

#[derive(Clone, Debug)]
pub struct AttitudeEkf {
    kf: AttitudeKalman,
    params: FilterParams,
    fading_inv: f64,

    /// Published outputs
    quaternion: [f64; 4],
    gyro_bias: [f64; 3],

    motion_stable: bool,
    chi_square_stable: bool,
    chi_square_stable_prev: bool,
    divergence_count: u32,

    stat: ChiSquareStat,
    correction: StateVec6,

    /// Update counters
    steps: u64,
    corrections: u64,
    divergences: u64,
}

impl Default for AttitudeEkf {
    fn default() -> Self {
        Self::with_params(FilterParams::default())
    }
}

impl AttitudeEkf {
    /// Create a new attitude EKF, rejecting invalid tuning
    pub fn new(params: FilterParams) -> ConfigResult<Self> {
        params.validate()?;
        Ok(Self::with_params(params))
    }

    fn with_params(params: FilterParams) -> Self {
        let mut ekf = Self {
            kf: AttitudeKalman::new(),
            params,
            fading_inv: 1.0 / params.fading,
            quaternion: [1.0, 0.0, 0.0, 0.0],
            gyro_bias: [0.0; 3],
            motion_stable: false,
            chi_square_stable: false,
            chi_square_stable_prev: false,
            divergence_count: 0,
            stat: ChiSquareStat::default(),
            correction: StateVec6::zeros(),
            steps: 0,
            corrections: 0,
            divergences: 0,
        };
        ekf.apply_priors();
        ekf
    }

    /// Covariance the filter starts from and returns to on reset
    pub fn prior_covariance() -> StateMat6 {
        let mut p = StateMat6::from_element(PRIOR_COUPLING);
        for i in 0..QUAT_DIM {
            p[(i, i)] = PRIOR_QUAT_VARIANCE;
        }
        p[(BIAS_X, BIAS_X)] = PRIOR_BIAS_VARIANCE;
        p[(BIAS_Y, BIAS_Y)] = PRIOR_BIAS_VARIANCE;
        p
    }

    fn apply_priors(&mut self) {
        self.kf.state = StateVec6::new(1.0, 0.0, 0.0, 0.0, 0.0, 0.0);
        self.kf.transition = StateMat6::identity();
        self.kf.covariance = Self::prior_covariance();

        self.quaternion = [1.0, 0.0, 0.0, 0.0];
        self.gyro_bias = [0.0; 3];
        self.motion_stable = false;
        self.chi_square_stable = false;
        self.chi_square_stable_prev = false;
        self.divergence_count = 0;
        self.stat = ChiSquareStat::default();
        self.correction = StateVec6::zeros();
        self.steps = 0;
        self.corrections = 0;
        self.divergences = 0;
    }

    /// Restore the construction-time priors. Tuning is kept.
    pub fn reset(&mut self) {
        self.kf.reset();
        self.apply_priors();
        log::debug!("attitude EKF reset to priors");
    }

    pub fn step_sample(&mut self, sample: &ImuSample) -> StepStatus {
        self.step(&sample.accel, &sample.gyro, sample.dt)
    }

    /// Advance the filter by one IMU sample.
    ///
    /// * `accel` - specific force in m/s²
    /// * `gyro` - angular rate in rad/s
    /// * `dt` - sample period in seconds, must be positive (not checked)
    pub fn step(&mut self, accel: &Vector3<f64>, gyro: &Vector3<f64>, dt: f64) -> StepStatus {
        self.steps += 1;
        self.correction = StateVec6::zeros();
        self.stat.measured = false;

        let bias = Vector3::new(self.kf.state[BIAS_X], self.kf.state[BIAS_Y], 0.0);
        let rate = gyro - bias;
        let accel_norm = accel.norm();

        self.motion_stable = rate.norm() < MOTION_GYRO_LIMIT
            && (accel_norm - GRAVITY).abs() < MOTION_ACCEL_TOLERANCE;

        self.refresh_noise(dt);

        let measurable = accel_norm > MIN_ACCEL_NORM;
        if measurable {
            self.kf.measurement = accel / accel_norm;
        }

        self.predict(&rate, dt);

        let status = if measurable {
            self.correct(dt)
        } else {
            log::debug!("accelerometer norm {accel_norm:.3e} too small, prediction only");
            StepStatus::Success
        };

        self.finish_step();
        status
    }

    /// Q and R scale with the sample period, so they are rebuilt every step
    fn refresh_noise(&mut self, dt: f64) {
        let q_quat = self.params.quaternion_noise * dt;
        let q_bias = self.params.bias_noise * dt;
        self.kf.process_noise = StateMat6::from_diagonal(&StateVec6::new(
            q_quat, q_quat, q_quat, q_quat, q_bias, q_bias,
        ));
        self.kf.measurement_noise = GravityNoise::from_diagonal_element(self.params.accel_noise);
    }

    fn predict(&mut self, rate: &Vector3<f64>, dt: f64) {
        let half_dt = 0.5 * dt;
        let kf = &mut self.kf;

        kf.transition = transition_matrix(&(rate * half_dt));
        kf.state = kf.transition * kf.state;

        // Bias coupling linearized at the propagated quaternion
        let (q0, q1, q2, q3) = (
            kf.state[0] * half_dt,
            kf.state[1] * half_dt,
            kf.state[2] * half_dt,
            kf.state[3] * half_dt,
        );
        kf.transition[(0, BIAS_X)] = q1;
        kf.transition[(0, BIAS_Y)] = q2;
        kf.transition[(1, BIAS_X)] = -q0;
        kf.transition[(1, BIAS_Y)] = q3;
        kf.transition[(2, BIAS_X)] = -q3;
        kf.transition[(2, BIAS_Y)] = -q0;
        kf.transition[(3, BIAS_X)] = q2;
        kf.transition[(3, BIAS_Y)] = -q1;

        // Fade the bias variances so the bias keeps adapting, then cap them
        for i in [BIAS_X, BIAS_Y] {
            kf.covariance[(i, i)] =
                (kf.covariance[(i, i)] * self.fading_inv).min(BIAS_VARIANCE_LIMIT);
        }

        kf.covariance =
            kf.transition * kf.covariance * kf.transition.transpose() + kf.process_noise;

        normalize_quaternion(&mut kf.state);
    }

    fn correct(&mut self, dt: f64) -> StepStatus {
        let x = self.kf.state;
        let p = self.kf.covariance;

        let h = gravity_jacobian(&x);
        self.kf.observation = h;

        let expected = expected_gravity(&x);
        let orientation_cosine = expected.map(|c| c.abs().min(1.0).acos());
        let innovation = self.kf.measurement - expected;

        let s = h * p * h.transpose() + self.kf.measurement_noise;
        let Some(s_inv) = s.try_inverse() else {
            log::warn!("innovation covariance is singular, skipping measurement update");
            self.stat.innovation = innovation;
            self.stat.orientation_cosine = orientation_cosine;
            return StepStatus::Success;
        };

        let chi_square = innovation.dot(&(s_inv * innovation));
        let gate = self.gate(chi_square);

        self.stat = ChiSquareStat {
            innovation,
            innovation_cov_inv: s_inv,
            chi_square,
            orientation_cosine,
            adaptive_gain: gate.unwrap_or(self.stat.adaptive_gain),
            measured: true,
        };

        let Some(gain_scale) = gate else {
            self.divergences += 1;
            log::warn!(
                "attitude EKF divergence: {} motion-stable chi-square violations, chi2 = {:.3e}",
                DIVERGENCE_LIMIT + 1,
                chi_square
            );
            return StepStatus::DivergenceDetected;
        };
        log::trace!("chi2 = {chi_square:.3e}, gain scale = {gain_scale:.3}");

        let mut gain: KalmanGainGravity = p * h.transpose() * s_inv * gain_scale;

        // Bias correction strength follows how observable each axis is
        let weights = [
            orientation_cosine[0] * AXIS_COSINE_SCALE,
            orientation_cosine[1] * AXIS_COSINE_SCALE,
        ];
        for (row, weight) in [BIAS_X, BIAS_Y].into_iter().zip(weights) {
            for col in 0..MEASURE_DIM_GRAVITY {
                gain[(row, col)] *= weight;
            }
        }

        let mut dx = gain * innovation;
        let bias_limit = BIAS_RATE_LIMIT * dt;
        for i in [BIAS_X, BIAS_Y] {
            dx[i] = dx[i].max(-bias_limit).min(bias_limit);
        }
        // Gravity carries no heading information
        dx[YAW_INDEX] = 0.0;

        self.kf.state += dx;
        self.kf.covariance = p - gain * h * p;
        self.kf.gain = gain;
        self.correction = dx;
        self.corrections += 1;

        StepStatus::Success
    }

    /// Chi-square gate. Returns the gain scale, or `None` when divergence
    /// must be reported and the update skipped.
    fn gate(&mut self, chi_square: f64) -> Option<f64> {
        let tau = self.params.chi2_threshold;

        self.chi_square_stable_prev = self.chi_square_stable;
        self.chi_square_stable = chi_square < CHI2_STABLE_FRACTION * tau;

        if !self.chi_square_stable && self.chi_square_stable_prev {
            // Don't penalize disagreement while maneuvering
            if self.motion_stable {
                self.divergence_count += 1;
            } else {
                self.divergence_count = 0;
            }

            if self.divergence_count > DIVERGENCE_LIMIT {
                self.divergence_count = 0;
                return None;
            }
        }

        if chi_square > CHI2_ADAPTIVE_FLOOR * tau && chi_square < tau && self.chi_square_stable {
            Some((tau - chi_square) / (CHI2_ADAPTIVE_SPAN * tau))
        } else {
            Some(1.0)
        }
    }

    fn finish_step(&mut self) {
        for i in 0..STATE_DIM {
            self.kf.covariance[(i, i)] = self.kf.covariance[(i, i)].max(0.0);
        }

        // The correction leaves q3 untouched, but rescaling to unit norm
        // still moves the published yaw component.
        normalize_quaternion(&mut self.kf.state);

        let x = &self.kf.state;
        self.quaternion = [x[0], x[1], x[2], x[3]];
        self.gyro_bias = [x[BIAS_X], x[BIAS_Y], 0.0];
    }

    // ===== Public API =====

    /// Orientation quaternion (q0, q1, q2, q3), scalar first, unit norm
    pub fn quaternion(&self) -> [f64; 4] {
        self.quaternion
    }

    /// Gyro bias estimate [rad/s]; the z component is always 0
    pub fn gyro_bias(&self) -> [f64; 3] {
        self.gyro_bias
    }

    pub fn orientation(&self) -> UnitQuaternion<f64> {
        let [w, i, j, k] = self.quaternion;
        UnitQuaternion::from_quaternion(Quaternion::new(w, i, j, k))
    }

    /// Roll, pitch, yaw in radians
    pub fn euler_angles(&self) -> (f64, f64, f64) {
        self.orientation().euler_angles()
    }

    pub fn covariance(&self) -> &StateMat6 {
        &self.kf.covariance
    }

    /// Innovation statistics of the latest gravity update. Check `measured`:
    /// steps that skip the update leave the stability flags and the
    /// chi-square value from the previous evaluation in place.
    pub fn chi_square_stat(&self) -> &ChiSquareStat {
        &self.stat
    }

    /// Measurement correction Δx applied in the latest step (zero if skipped)
    pub fn last_correction(&self) -> &StateVec6 {
        &self.correction
    }

    pub fn kalman_state(&self) -> &KalmanState<STATE_DIM, CONTROL_DIM, MEASURE_DIM_GRAVITY> {
        &self.kf
    }

    pub fn is_motion_stable(&self) -> bool {
        self.motion_stable
    }

    pub fn is_chi_square_stable(&self) -> bool {
        self.chi_square_stable
    }

    pub fn divergence_count(&self) -> u32 {
        self.divergence_count
    }

    pub fn params(&self) -> &FilterParams {
        &self.params
    }

    pub fn estimate(&self) -> AttitudeEstimate {
        let [w, x, y, z] = self.quaternion;
        let [bx, by, bz] = self.gyro_bias;
        AttitudeEstimate {
            quaternion: (w, x, y, z),
            gyro_bias: (bx, by, bz),
            euler: self.euler_angles(),
            covariance_trace: self.kf.covariance.trace(),
            chi_square: self.stat.chi_square,
            adaptive_gain: self.stat.adaptive_gain,
            motion_stable: self.motion_stable,
            divergence_count: self.divergence_count,
            steps: self.steps,
            corrections: self.corrections,
            divergences: self.divergences,
        }
    }
}

/// `I + Ω(ω·dt/2)` on the quaternion block, identity on the bias block
fn transition_matrix(half_angle: &Vector3<f64>) -> StateMat6 {
    let (hx, hy, hz) = (half_angle.x, half_angle.y, half_angle.z);
    StateMat6::from_row_slice(&[
        1.0, -hx, -hy, -hz, 0.0, 0.0, //
        hx, 1.0, hz, -hy, 0.0, 0.0, //
        hy, -hz, 1.0, hx, 0.0, 0.0, //
        hz, hy, -hx, 1.0, 0.0, 0.0, //
        0.0, 0.0, 0.0, 0.0, 1.0, 0.0, //
        0.0, 0.0, 0.0, 0.0, 0.0, 1.0,
    ])
}

/// Gravity direction in body frame: h(q) = R(q)ᵀ·[0, 0, 1]ᵀ
fn expected_gravity(x: &StateVec6) -> GravityVec {
    GravityVec::new(
        2.0 * (x[1] * x[3] - x[0] * x[2]),
        2.0 * (x[0] * x[1] + x[2] * x[3]),
        x[0] * x[0] - x[1] * x[1] - x[2] * x[2] + x[3] * x[3],
    )
}

/// ∂h/∂x; gravity does not observe the bias directly
fn gravity_jacobian(x: &StateVec6) -> JacobianGravity {
    let (a, b, c, d) = (2.0 * x[0], 2.0 * x[1], 2.0 * x[2], 2.0 * x[3]);
    JacobianGravity::from_row_slice(&[
        -c, d, -a, b, 0.0, 0.0, //
        b, a, d, c, 0.0, 0.0, //
        a, -b, -c, d, 0.0, 0.0,
    ])
}

fn normalize_quaternion(state: &mut StateVec6) {
    if state
        .fixed_rows_mut::<QUAT_DIM>(0)
        .try_normalize_mut(MIN_QUAT_NORM)
        .is_none()
    {
        log::warn!("degenerate quaternion, resetting orientation to identity");
        state.fixed_rows_mut::<QUAT_DIM>(0).copy_from_slice(&[1.0, 0.0, 0.0, 0.0]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    const DT: f64 = 0.01;

    /// Tuning that trusts the accelerometer enough to observe bias quickly
    fn responsive_params() -> FilterParams {
        FilterParams {
            quaternion_noise: 1e-3,
            bias_noise: 1e-6,
            accel_noise: 1e-2,
            fading: 0.9996,
            chi2_threshold: DEFAULT_CHI2_THRESHOLD,
        }
    }

    /// Deterministic sample source, no external RNG needed
    struct Lcg(u64);

    impl Lcg {
        fn next_f64(&mut self) -> f64 {
            self.0 = self
                .0
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (self.0 >> 11) as f64 / (1u64 << 53) as f64
        }

        fn range(&mut self, lo: f64, hi: f64) -> f64 {
            lo + (hi - lo) * self.next_f64()
        }

        fn vector(&mut self, lo: f64, hi: f64) -> Vector3<f64> {
            Vector3::new(self.range(lo, hi), self.range(lo, hi), self.range(lo, hi))
        }
    }

    fn level() -> Vector3<f64> {
        Vector3::new(0.0, 0.0, 9.8)
    }

    fn tilted_x(magnitude: f64, degrees: f64) -> Vector3<f64> {
        let angle = degrees.to_radians();
        Vector3::new(magnitude * angle.sin(), 0.0, magnitude * angle.cos())
    }

    fn settle(ekf: &mut AttitudeEkf, steps: usize) {
        for _ in 0..steps {
            assert_eq!(ekf.step(&level(), &Vector3::zeros(), DT), StepStatus::Success);
        }
    }

    fn quat_norm(ekf: &AttitudeEkf) -> f64 {
        ekf.quaternion().iter().map(|q| q * q).sum::<f64>().sqrt()
    }

    #[test]
    fn test_params_validation() {
        assert!(FilterParams::default().validate().is_ok());
        assert!(responsive_params().validate().is_ok());

        let bad_noise = FilterParams {
            bias_noise: -1.0,
            ..FilterParams::default()
        };
        assert_eq!(
            bad_noise.validate(),
            Err(ConfigError::NonPositiveNoise {
                name: "bias_noise",
                value: -1.0
            })
        );

        for fading in [0.0, -0.5, 1.5, f64::NAN] {
            let params = FilterParams {
                fading,
                ..FilterParams::default()
            };
            assert!(matches!(
                params.validate(),
                Err(ConfigError::FadingOutOfRange(_))
            ));
        }

        let unity = FilterParams {
            fading: 1.0,
            ..FilterParams::default()
        };
        assert!(unity.validate().is_ok());

        let no_threshold = FilterParams {
            chi2_threshold: 0.0,
            ..FilterParams::default()
        };
        assert!(AttitudeEkf::new(no_threshold).is_err());
    }

    #[test]
    fn test_params_from_partial_json() {
        let params: FilterParams = serde_json::from_str(r#"{ "accel_noise": 0.5 }"#).unwrap();
        assert_eq!(params.accel_noise, 0.5);
        assert_eq!(params.quaternion_noise, FilterParams::default().quaternion_noise);
    }

    #[test]
    fn test_initial_priors() {
        let ekf = AttitudeEkf::default();
        assert_eq!(ekf.quaternion(), [1.0, 0.0, 0.0, 0.0]);
        assert_eq!(ekf.gyro_bias(), [0.0, 0.0, 0.0]);

        let p = ekf.covariance();
        assert_eq!(p[(0, 0)], 1e5);
        assert_eq!(p[(3, 3)], 1e5);
        assert_eq!(p[(4, 4)], 100.0);
        assert_eq!(p[(5, 5)], 100.0);
        assert_eq!(p[(0, 5)], 0.1);
        assert_eq!(p[(4, 1)], 0.1);
        assert_eq!(ekf.kalman_state().transition, StateMat6::identity());
        assert_eq!(ekf.divergence_count(), 0);
    }

    #[test]
    fn test_stationary_converges_to_level() {
        let mut ekf = AttitudeEkf::default();
        settle(&mut ekf, 500);

        let q = ekf.quaternion();
        assert_abs_diff_eq!(q[0], 1.0, epsilon = 1e-3);
        assert_abs_diff_eq!(q[1], 0.0, epsilon = 1e-3);
        assert_abs_diff_eq!(q[2], 0.0, epsilon = 1e-3);
        assert_abs_diff_eq!(q[3], 0.0, epsilon = 1e-3);

        let bias = ekf.gyro_bias();
        assert_abs_diff_eq!(bias[0], 0.0, epsilon = 1e-3);
        assert_abs_diff_eq!(bias[1], 0.0, epsilon = 1e-3);
        assert!(ekf.is_motion_stable());
        assert!(ekf.is_chi_square_stable());
        assert!(ekf.chi_square_stat().measured);
    }

    #[test]
    fn test_norm_and_variance_invariants_hold_under_noise() {
        let tunings = [
            FilterParams::default(),
            responsive_params(),
            FilterParams {
                quaternion_noise: 0.1,
                bias_noise: 1e-4,
                accel_noise: 1.0,
                fading: 0.999,
                chi2_threshold: 1e-2,
            },
        ];

        for params in tunings {
            let mut ekf = AttitudeEkf::new(params).unwrap();
            let mut rng = Lcg(42);
            for _ in 0..2000 {
                let accel = Vector3::new(
                    rng.range(-15.0, 15.0),
                    rng.range(-15.0, 15.0),
                    rng.range(-5.0, 25.0),
                );
                let gyro = rng.vector(-2.0, 2.0);
                let _ = ekf.step(&accel, &gyro, DT);

                assert_abs_diff_eq!(quat_norm(&ekf), 1.0, epsilon = 1e-4);
                for i in 0..STATE_DIM {
                    assert!(ekf.covariance()[(i, i)] >= 0.0);
                }
            }
        }
    }

    #[test]
    fn test_injected_bias_converges_with_bounded_rate() {
        let mut ekf = AttitudeEkf::new(responsive_params()).unwrap();
        let gyro = Vector3::new(0.05, -0.02, 0.0);
        let limit = BIAS_RATE_LIMIT * DT + 1e-12;

        let mut previous = ekf.gyro_bias();
        for _ in 0..3000 {
            let _ = ekf.step(&level(), &gyro, DT);
            let bias = ekf.gyro_bias();
            assert!((bias[0] - previous[0]).abs() <= limit);
            assert!((bias[1] - previous[1]).abs() <= limit);
            assert_eq!(bias[2], 0.0);
            previous = bias;
        }

        let bias = ekf.gyro_bias();
        assert_abs_diff_eq!(bias[0], 0.05, epsilon = 1e-3);
        assert_abs_diff_eq!(bias[1], -0.02, epsilon = 1e-3);
    }

    #[test]
    fn test_tilt_is_recovered_from_gravity() {
        let mut ekf = AttitudeEkf::new(responsive_params()).unwrap();
        let angle = 20.0_f64.to_radians();
        let accel = Vector3::new(0.0, 9.8 * angle.sin(), 9.8 * angle.cos());

        for _ in 0..2000 {
            let _ = ekf.step(&accel, &Vector3::zeros(), DT);
        }

        let (roll, pitch, _) = ekf.euler_angles();
        assert_abs_diff_eq!(roll, angle, epsilon = 0.01);
        assert_abs_diff_eq!(pitch, 0.0, epsilon = 0.01);
    }

    #[test]
    fn test_single_outlier_shrinks_gain() {
        let mut ekf = AttitudeEkf::default();
        settle(&mut ekf, 500);
        let before = ekf.quaternion();

        let status = ekf.step(&tilted_x(50.0, 10.0), &Vector3::zeros(), DT);
        assert_eq!(status, StepStatus::Success);
        assert!(!ekf.is_motion_stable());

        let stat = ekf.chi_square_stat();
        assert!(stat.chi_square > 0.1 * DEFAULT_CHI2_THRESHOLD);
        assert!(stat.adaptive_gain > 0.0 && stat.adaptive_gain < 1.0);

        let after = ekf.quaternion();
        let moved: f64 = before
            .iter()
            .zip(after.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>()
            .sqrt();
        assert!(moved < 1e-3);
    }

    #[test]
    fn test_repeated_outlier_episodes_report_divergence_once() {
        let mut ekf = AttitudeEkf::default();
        settle(&mut ekf, 500);

        let outlier = tilted_x(9.8, 30.0);
        let mut reports = Vec::new();
        for episode in 0..=DIVERGENCE_LIMIT as usize {
            // Re-enter the chi-square-stable region, then violate it while still
            assert_eq!(ekf.step(&level(), &Vector3::zeros(), DT), StepStatus::Success);
            assert!(ekf.is_chi_square_stable());

            let status = ekf.step(&outlier, &Vector3::zeros(), DT);
            assert!(ekf.is_motion_stable());
            if status.is_divergence() {
                reports.push(episode);
                assert_eq!(*ekf.last_correction(), StateVec6::zeros());
            }
        }

        assert_eq!(reports, vec![DIVERGENCE_LIMIT as usize]);
        assert_eq!(ekf.divergence_count(), 0);
        assert_eq!(ekf.estimate().divergences, 1);

        // Keeps running without an external reset
        for _ in 0..20 {
            assert_eq!(ekf.step(&level(), &Vector3::zeros(), DT), StepStatus::Success);
            assert_abs_diff_eq!(quat_norm(&ekf), 1.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_consecutive_outliers_count_one_transition() {
        let mut ekf = AttitudeEkf::default();
        settle(&mut ekf, 500);

        let outlier = tilted_x(9.8, 30.0);
        for _ in 0..200 {
            assert_eq!(ekf.step(&outlier, &Vector3::zeros(), DT), StepStatus::Success);
        }
        assert_eq!(ekf.divergence_count(), 1);
        assert!(!ekf.is_chi_square_stable());
    }

    #[test]
    fn test_maneuvering_clears_divergence_count() {
        let mut ekf = AttitudeEkf::default();
        settle(&mut ekf, 500);
        let outlier = tilted_x(9.8, 30.0);

        settle(&mut ekf, 1);
        let _ = ekf.step(&outlier, &Vector3::zeros(), DT);
        assert_eq!(ekf.divergence_count(), 1);

        settle(&mut ekf, 1);
        let _ = ekf.step(&outlier, &Vector3::new(0.5, 0.0, 0.0), DT);
        assert!(!ekf.is_motion_stable());
        assert_eq!(ekf.divergence_count(), 0);
    }

    #[test]
    fn test_yaw_is_never_corrected() {
        let mut ekf = AttitudeEkf::new(responsive_params()).unwrap();
        let mut rng = Lcg(7);
        for _ in 0..500 {
            let accel = rng.vector(-12.0, 12.0);
            let gyro = rng.vector(-1.0, 1.0);
            let _ = ekf.step(&accel, &gyro, DT);
            assert_eq!(ekf.last_correction()[YAW_INDEX], 0.0);
        }
        assert!(ekf.estimate().corrections > 0);
    }

    #[test]
    fn test_zero_accel_runs_prediction_only() {
        let mut ekf = AttitudeEkf::default();
        settle(&mut ekf, 10);

        let status = ekf.step(&Vector3::zeros(), &Vector3::new(0.0, 0.0, 0.1), DT);
        assert_eq!(status, StepStatus::Success);
        assert_eq!(*ekf.last_correction(), StateVec6::zeros());
        assert_eq!(ekf.estimate().corrections, 10);
        assert!(!ekf.chi_square_stat().measured);
        assert_abs_diff_eq!(quat_norm(&ekf), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_singular_innovation_covariance_skips_update() {
        let params = FilterParams {
            quaternion_noise: 1.0,
            accel_noise: 4.0,
            ..FilterParams::default()
        };
        let mut ekf = AttitudeEkf::new(params).unwrap();
        let dt = 0.5;

        // After predict at identity: P⁻ = -I on q0..q2, so H·P⁻·Hᵀ = -4·I = -R
        ekf.kf.covariance =
            StateMat6::from_diagonal(&StateVec6::new(-1.5, -1.5, -1.5, 1.0, 0.0, 0.0));

        let status = ekf.step(&level(), &Vector3::zeros(), dt);
        assert_eq!(status, StepStatus::Success);
        assert_eq!(*ekf.last_correction(), StateVec6::zeros());
        assert_eq!(ekf.estimate().corrections, 0);
        assert!(!ekf.chi_square_stat().measured);
        assert!(!ekf.is_chi_square_stable());
        assert_eq!(ekf.chi_square_stat().innovation, GravityVec::zeros());
        assert_eq!(ekf.quaternion(), [1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_bias_gain_weighted_by_axis_observability() {
        let mut ekf = AttitudeEkf::new(responsive_params()).unwrap();
        let accel = Vector3::new(0.3, 0.4, 0.75_f64.sqrt()) * 9.8;
        for _ in 0..2000 {
            let _ = ekf.step(&accel, &Vector3::zeros(), DT);
        }

        // Reproduce the next prediction on a copy to get P⁻, H and S⁻¹
        let mut predicted = ekf.clone();
        predicted.refresh_noise(DT);
        let bias = Vector3::new(predicted.kf.state[BIAS_X], predicted.kf.state[BIAS_Y], 0.0);
        predicted.predict(&(Vector3::zeros() - bias), DT);
        let p = predicted.kf.covariance;
        let h = gravity_jacobian(&predicted.kf.state);
        let s_inv = (h * p * h.transpose() + predicted.kf.measurement_noise)
            .try_inverse()
            .unwrap();

        assert_eq!(ekf.step(&accel, &Vector3::zeros(), DT), StepStatus::Success);
        let stat = *ekf.chi_square_stat();
        assert!(stat.measured);

        let unweighted = p * h.transpose() * s_inv * stat.adaptive_gain;
        let gain = ekf.kalman_state().gain;

        // Tilted on both axes, so both bias rows are attenuated
        let weights = stat.orientation_cosine * AXIS_COSINE_SCALE;
        assert!(weights[0] > 0.5 && weights[0] < 0.9);
        assert!(weights[1] > 0.5 && weights[1] < 0.9);

        for col in 0..MEASURE_DIM_GRAVITY {
            for row in 0..QUAT_DIM {
                assert_relative_eq!(gain[(row, col)], unweighted[(row, col)], max_relative = 1e-9);
            }
            assert_relative_eq!(
                gain[(BIAS_X, col)],
                unweighted[(BIAS_X, col)] * weights[0],
                max_relative = 1e-9
            );
            assert_relative_eq!(
                gain[(BIAS_Y, col)],
                unweighted[(BIAS_Y, col)] * weights[1],
                max_relative = 1e-9
            );
        }
    }

    #[test]
    fn test_faded_bias_variance_is_capped() {
        let params = FilterParams {
            fading: 0.5,
            accel_noise: 1e12,
            ..FilterParams::default()
        };
        let mut ekf = AttitudeEkf::new(params).unwrap();
        let q_bias = params.bias_noise * DT;

        // Prior inflated by 1/λ before propagation
        settle(&mut ekf, 1);
        for i in [BIAS_X, BIAS_Y] {
            assert_abs_diff_eq!(
                ekf.covariance()[(i, i)],
                PRIOR_BIAS_VARIANCE / params.fading + q_bias,
                epsilon = 1e-6
            );
        }

        // Doubling every step, so the limit is reached within a few steps
        for step in 1..60 {
            settle(&mut ekf, 1);
            for i in [BIAS_X, BIAS_Y] {
                let variance = ekf.covariance()[(i, i)];
                assert!(variance <= BIAS_VARIANCE_LIMIT + q_bias + 1e-9);
                if step >= 10 {
                    assert!(variance > BIAS_VARIANCE_LIMIT - 1.0);
                }
            }
        }
    }

    #[test]
    fn test_reset_restores_priors() {
        let params = responsive_params();
        let mut ekf = AttitudeEkf::new(params).unwrap();
        let mut rng = Lcg(3);
        for _ in 0..300 {
            let _ = ekf.step(&rng.vector(-10.0, 10.0), &rng.vector(-0.5, 0.5), DT);
        }
        assert_ne!(*ekf.covariance(), AttitudeEkf::prior_covariance());

        ekf.reset();

        assert_eq!(*ekf.covariance(), AttitudeEkf::prior_covariance());
        assert_eq!(ekf.quaternion(), [1.0, 0.0, 0.0, 0.0]);
        assert_eq!(ekf.gyro_bias(), [0.0, 0.0, 0.0]);
        assert_eq!(
            ekf.kalman_state().state,
            StateVec6::new(1.0, 0.0, 0.0, 0.0, 0.0, 0.0)
        );
        assert_eq!(ekf.kalman_state().process_noise, StateMat6::zeros());
        assert_eq!(ekf.divergence_count(), 0);
        assert!(!ekf.is_chi_square_stable());
        assert!(!ekf.is_motion_stable());
        assert_eq!(*ekf.params(), params);
        assert_eq!(ekf.estimate().steps, 0);
    }

    #[test]
    fn test_estimate_serializes() {
        let mut ekf = AttitudeEkf::default();
        settle(&mut ekf, 5);

        let estimate = ekf.estimate();
        assert_eq!(estimate.steps, 5);
        assert_eq!(estimate.quaternion, (1.0, 0.0, 0.0, 0.0));

        let json = serde_json::to_string(&estimate).unwrap();
        assert!(json.contains("\"divergence_count\":0"));
    }
}
