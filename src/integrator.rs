use log::{debug, trace};
use nalgebra::DVector;

use crate::error::{CircuitError, Result};

/// Right-hand side of a first-order ODE system
pub trait OdeSystem {
    fn dimension(&self) -> usize;

    fn rhs(&self, t: f64, x: &DVector<f64>) -> DVector<f64>;
}

/// Integration method
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IntegrationMethod {
    /// Adaptive embedded Runge-Kutta 5(4)
    DormandPrince,
    /// Classical Runge-Kutta 4 with a fixed step
    Rk4 { step: f64 },
}

/// Integrator configuration
#[derive(Debug, Clone, PartialEq)]
pub struct IntegratorConfig {
    pub method: IntegrationMethod,
    pub rtol: f64,
    pub atol: f64,
    pub max_step: f64,
    /// First trial step; derived from the time span when `None`
    pub first_step: Option<f64>,
    /// Rejected steps below this size abort the run
    pub min_step: f64,
}

impl Default for IntegratorConfig {
    fn default() -> Self {
        IntegratorConfig {
            method: IntegrationMethod::DormandPrince,
            rtol: 1e-6,
            atol: 1e-9,
            max_step: f64::INFINITY,
            first_step: None,
            min_step: 1e-14,
        }
    }
}

impl IntegratorConfig {
    pub fn validate(&self) -> Result<()> {
        let bad = |reason: String| Err(CircuitError::invalid_parameter("integrator", reason));
        if !(self.rtol >= 0.0 && self.atol >= 0.0) || self.rtol + self.atol <= 0.0 {
            return bad(format!("tolerances must be non-negative and not both zero (rtol {}, atol {})", self.rtol, self.atol));
        }
        if !(self.max_step > 0.0) {
            return bad(format!("max step must be positive, got {}", self.max_step));
        }
        if let Some(h) = self.first_step {
            if !(h > 0.0 && h.is_finite()) {
                return bad(format!("first step must be positive, got {}", h));
            }
        }
        if let IntegrationMethod::Rk4 { step } = self.method {
            if !(step > 0.0 && step.is_finite()) {
                return bad(format!("RK4 step must be positive, got {}", step));
            }
        }
        Ok(())
    }
}

// Dormand-Prince 5(4) tableau
const C: [f64; 7] = [0.0, 1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0, 1.0];
const A: [[f64; 6]; 7] = [
    [0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [1.0 / 5.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [3.0 / 40.0, 9.0 / 40.0, 0.0, 0.0, 0.0, 0.0],
    [44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0, 0.0, 0.0, 0.0],
    [19372.0 / 6561.0, -25360.0 / 2187.0, 64448.0 / 6561.0, -212.0 / 729.0, 0.0, 0.0],
    [9017.0 / 3168.0, -355.0 / 33.0, 46732.0 / 5247.0, 49.0 / 176.0, -5103.0 / 18656.0, 0.0],
    [35.0 / 384.0, 0.0, 500.0 / 1113.0, 125.0 / 192.0, -2187.0 / 6784.0, 11.0 / 84.0],
];
const B: [f64; 7] = [35.0 / 384.0, 0.0, 500.0 / 1113.0, 125.0 / 192.0, -2187.0 / 6784.0, 11.0 / 84.0, 0.0];
/// Fifth-order minus embedded fourth-order weights
const E: [f64; 7] = [
    71.0 / 57600.0,
    0.0,
    -71.0 / 16695.0,
    71.0 / 1920.0,
    -17253.0 / 339200.0,
    22.0 / 525.0,
    -1.0 / 40.0,
];

const SAFETY: f64 = 0.9;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 5.0;

/// Step statistics of a run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntegratorStats {
    pub accepted: usize,
    pub rejected: usize,
    pub rhs_evaluations: usize,
}

/// Stateful stepper: keeps the adaptive step proposal between calls.
///
/// Steps never cross the limit handed to [`Integrator::advance`], so callers
/// can land exactly on switch events and checkpoints.
#[derive(Debug, Clone)]
pub struct Integrator {
    config: IntegratorConfig,
    step: f64,
    stats: IntegratorStats,
}

impl Integrator {
    /// Create an integrator for a run spanning `span` time units
    pub fn new(config: IntegratorConfig, span: f64) -> Result<Self> {
        config.validate()?;
        let step = match config.method {
            IntegrationMethod::Rk4 { step } => step,
            IntegrationMethod::DormandPrince => config.first_step.unwrap_or(span * 1e-3),
        }
        .min(config.max_step);

        Ok(Integrator {
            config,
            step,
            stats: IntegratorStats::default(),
        })
    }

    pub fn config(&self) -> &IntegratorConfig {
        &self.config
    }

    pub fn stats(&self) -> &IntegratorStats {
        &self.stats
    }

    /// Take one accepted step from `(t, x)` without passing `t_limit`.
    ///
    /// Returns the new time and state. A step that would reach or overshoot
    /// the limit is shortened to end exactly on it.
    pub fn advance<S: OdeSystem>(&mut self, system: &S, t: f64, x: &DVector<f64>, t_limit: f64) -> Result<(f64, DVector<f64>)> {
        if x.len() != system.dimension() {
            return Err(CircuitError::StateDimension {
                expected: system.dimension(),
                actual: x.len(),
            });
        }
        if !(t_limit > t) {
            return Err(CircuitError::integration_failed(
                t,
                format!("step limit {} is not ahead of the clock", t_limit),
            ));
        }

        match self.config.method {
            IntegrationMethod::Rk4 { step } => {
                let (h, t_new) = clip(step, t, t_limit);
                let x_new = self.rk4_step(system, t, x, h);
                self.stats.accepted += 1;
                Ok((t_new, x_new))
            }
            IntegrationMethod::DormandPrince => self.dopri_step(system, t, x, t_limit),
        }
    }

    fn rk4_step<S: OdeSystem>(&mut self, system: &S, t: f64, x: &DVector<f64>, h: f64) -> DVector<f64> {
        let k1 = system.rhs(t, x);
        let k2 = system.rhs(t + 0.5 * h, &(x + &k1 * (0.5 * h)));
        let k3 = system.rhs(t + 0.5 * h, &(x + &k2 * (0.5 * h)));
        let k4 = system.rhs(t + h, &(x + &k3 * h));
        self.stats.rhs_evaluations += 4;

        // x + h/6 * (k1 + 2 k2 + 2 k3 + k4)
        x + (k1 + k2 * 2.0 + k3 * 2.0 + k4) * (h / 6.0)
    }

    fn dopri_step<S: OdeSystem>(&mut self, system: &S, t: f64, x: &DVector<f64>, t_limit: f64) -> Result<(f64, DVector<f64>)> {
        loop {
            let (h, t_new) = clip(self.step.min(self.config.max_step), t, t_limit);

            let mut k: Vec<DVector<f64>> = Vec::with_capacity(7);
            for stage in 0..7 {
                let mut xs = x.clone();
                for (j, kj) in k.iter().enumerate() {
                    if A[stage][j] != 0.0 {
                        xs.axpy(h * A[stage][j], kj, 1.0);
                    }
                }
                k.push(system.rhs(t + C[stage] * h, &xs));
            }
            self.stats.rhs_evaluations += 7;

            let mut x_new = x.clone();
            let mut error = DVector::zeros(x.len());
            for (stage, ks) in k.iter().enumerate() {
                if B[stage] != 0.0 {
                    x_new.axpy(h * B[stage], ks, 1.0);
                }
                if E[stage] != 0.0 {
                    error.axpy(h * E[stage], ks, 1.0);
                }
            }

            let norm = self.error_norm(x, &x_new, &error);
            if norm <= 1.0 {
                let factor = if norm == 0.0 {
                    MAX_FACTOR
                } else {
                    (SAFETY * norm.powf(-0.2)).clamp(MIN_FACTOR, MAX_FACTOR)
                };
                self.step = h * factor;
                self.stats.accepted += 1;
                trace!("Accepted h = {:.3e} at t = {:.6e} (err {:.3e})", h, t, norm);
                return Ok((t_new, x_new));
            }

            let factor = if norm.is_finite() {
                (SAFETY * norm.powf(-0.2)).clamp(MIN_FACTOR, 1.0)
            } else {
                MIN_FACTOR
            };
            self.step = h * factor;
            self.stats.rejected += 1;
            debug!(
                "Rejected h = {:.3e} at t = {:.6e} (err {:.3e}), retrying with {:.3e}",
                h, t, norm, self.step
            );

            if self.step < self.config.min_step.max(4.0 * f64::EPSILON * t.abs()) {
                return Err(CircuitError::integration_failed(
                    t,
                    format!("step size {:.3e} underflow", self.step),
                ));
            }
        }
    }

    /// RMS of the error scaled by `atol + rtol * max(|x|, |x_new|)`
    fn error_norm(&self, x: &DVector<f64>, x_new: &DVector<f64>, error: &DVector<f64>) -> f64 {
        if error.is_empty() {
            return 0.0;
        }
        let sum: f64 = error
            .iter()
            .zip(x.iter().zip(x_new.iter()))
            .map(|(e, (a, b))| {
                let scale = self.config.atol + self.config.rtol * a.abs().max(b.abs());
                (e / scale).powi(2)
            })
            .sum();
        (sum / error.len() as f64).sqrt()
    }
}

/// Shorten `h` so that `t + h` does not pass `t_limit`. Steps ending within
/// a whisker of the limit are stretched onto it.
fn clip(h: f64, t: f64, t_limit: f64) -> (f64, f64) {
    let remaining = t_limit - t;
    if h * 1.000_001 >= remaining {
        (remaining, t_limit)
    } else {
        (h, t + h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;

    /// dx/dt = A x + e
    struct Linear {
        a: DMatrix<f64>,
        e: DVector<f64>,
    }

    impl OdeSystem for Linear {
        fn dimension(&self) -> usize {
            self.e.len()
        }

        fn rhs(&self, _t: f64, x: &DVector<f64>) -> DVector<f64> {
            &self.a * x + &self.e
        }
    }

    fn decay() -> Linear {
        Linear {
            a: DMatrix::from_element(1, 1, -1.0),
            e: DVector::from_element(1, 1.0),
        }
    }

    fn run(integrator: &mut Integrator, system: &Linear, x0: DVector<f64>, t_end: f64) -> DVector<f64> {
        let mut t = 0.0;
        let mut x = x0;
        while t < t_end {
            let (t_new, x_new) = integrator.advance(system, t, &x, t_end).unwrap();
            assert!(t_new > t && t_new <= t_end);
            t = t_new;
            x = x_new;
        }
        assert_eq!(t, t_end);
        x
    }

    #[test]
    fn test_dormand_prince_exponential() {
        let system = decay();
        let mut integrator = Integrator::new(IntegratorConfig::default(), 1.0).unwrap();
        let x = run(&mut integrator, &system, DVector::zeros(1), 1.0);

        assert_relative_eq!(x[0], 1.0 - (-1.0f64).exp(), epsilon = 1e-6);
        assert!(integrator.stats().accepted > 0);
    }

    #[test]
    fn test_rk4_exponential() {
        let system = decay();
        let config = IntegratorConfig {
            method: IntegrationMethod::Rk4 { step: 0.01 },
            ..IntegratorConfig::default()
        };
        let mut integrator = Integrator::new(config, 2.0).unwrap();
        let x = run(&mut integrator, &system, DVector::zeros(1), 2.0);

        assert_relative_eq!(x[0], 1.0 - (-2.0f64).exp(), epsilon = 1e-8);
        assert_eq!(integrator.stats().rhs_evaluations, 4 * integrator.stats().accepted);
    }

    #[test]
    fn test_oscillator_energy() {
        // x'' = -x as a first-order system
        let system = Linear {
            a: DMatrix::from_row_slice(2, 2, &[0.0, 1.0, -1.0, 0.0]),
            e: DVector::zeros(2),
        };
        let config = IntegratorConfig {
            rtol: 1e-9,
            atol: 1e-12,
            ..IntegratorConfig::default()
        };
        let mut integrator = Integrator::new(config, 10.0).unwrap();
        let x = run(&mut integrator, &system, DVector::from_vec(vec![1.0, 0.0]), 10.0);

        assert_relative_eq!(x[0], 10.0f64.cos(), epsilon = 1e-6);
        assert_relative_eq!(x[1], -10.0f64.sin(), epsilon = 1e-6);
    }

    #[test]
    fn test_step_lands_on_limit() {
        let system = decay();
        let config = IntegratorConfig {
            first_step: Some(0.3),
            ..IntegratorConfig::default()
        };
        let mut integrator = Integrator::new(config, 10.0).unwrap();
        let (t, _) = integrator.advance(&system, 0.0, &DVector::zeros(1), 0.1).unwrap();
        assert_eq!(t, 0.1);
    }

    #[test]
    fn test_max_step_respected() {
        let system = decay();
        let config = IntegratorConfig {
            max_step: 0.05,
            ..IntegratorConfig::default()
        };
        let mut integrator = Integrator::new(config, 1.0).unwrap();
        let mut t = 0.0;
        let mut x = DVector::zeros(1);
        while t < 1.0 {
            let (t_new, x_new) = integrator.advance(&system, t, &x, 1.0).unwrap();
            assert!(t_new - t <= 0.05 * 1.000_001 + 1e-15);
            t = t_new;
            x = x_new;
        }
    }

    #[test]
    fn test_empty_state() {
        let system = Linear {
            a: DMatrix::zeros(0, 0),
            e: DVector::zeros(0),
        };
        let mut integrator = Integrator::new(IntegratorConfig::default(), 1.0).unwrap();
        let x = run(&mut integrator, &system, DVector::zeros(0), 1.0);
        assert!(x.is_empty());
    }

    #[test]
    fn test_step_underflow_is_reported() {
        struct Blowup;
        impl OdeSystem for Blowup {
            fn dimension(&self) -> usize {
                1
            }
            fn rhs(&self, _t: f64, _x: &DVector<f64>) -> DVector<f64> {
                DVector::from_element(1, f64::NAN)
            }
        }

        let mut integrator = Integrator::new(IntegratorConfig::default(), 1.0).unwrap();
        let result = integrator.advance(&Blowup, 0.0, &DVector::zeros(1), 1.0);
        assert!(matches!(result, Err(CircuitError::IntegrationFailed { .. })));
    }

    #[test]
    fn test_invalid_config() {
        let config = IntegratorConfig {
            rtol: -1.0,
            ..IntegratorConfig::default()
        };
        assert!(Integrator::new(config, 1.0).is_err());

        let config = IntegratorConfig {
            method: IntegrationMethod::Rk4 { step: 0.0 },
            ..IntegratorConfig::default()
        };
        assert!(Integrator::new(config, 1.0).is_err());
    }

    #[test]
    fn test_wrong_dimension() {
        let system = decay();
        let mut integrator = Integrator::new(IntegratorConfig::default(), 1.0).unwrap();
        assert!(matches!(
            integrator.advance(&system, 0.0, &DVector::zeros(2), 1.0),
            Err(CircuitError::StateDimension { expected: 1, actual: 2 })
        ));
    }
}
