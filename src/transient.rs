use log::{debug, info};
use nalgebra::{DMatrix, DVector};

use crate::circuit::{Circuit, NodeId};
use crate::error::{CircuitError, Result};
use crate::integrator::{Integrator, IntegratorConfig, IntegratorStats};
use crate::scheduler::SwitchScheduler;
use crate::solver::SolverConfig;
use crate::state_space::StateSpaceBuilder;

/// Transient run options
#[derive(Debug, Clone, Default)]
pub struct TransientOptions {
    pub integrator: IntegratorConfig,
    pub solver: SolverConfig,
    /// Times the integrator must land on exactly
    pub checkpoints: Vec<f64>,
}

/// Sampled trajectory of a transient run
#[derive(Debug, Clone)]
pub struct TransientSolution {
    pub times: Vec<f64>,
    /// One column per sample: capacitor voltages, then inductor currents
    pub states: DMatrix<f64>,
    /// One column per sample: all node voltages
    pub voltages: DMatrix<f64>,
    pub stats: IntegratorStats,
    /// Topology rebuilds caused by switch toggles
    pub rebuilds: usize,
}

impl TransientSolution {
    pub fn sample_count(&self) -> usize {
        self.times.len()
    }

    /// State at `t`, linearly interpolated between samples
    pub fn state_at(&self, t: f64) -> Option<DVector<f64>> {
        let (i, j, w) = self.bracket(t)?;
        Some(self.states.column(i) * (1.0 - w) + self.states.column(j) * w)
    }

    /// Voltage of `node` at `t`, linearly interpolated between samples
    pub fn voltage_at(&self, node: NodeId, t: f64) -> Option<f64> {
        if node >= self.voltages.nrows() {
            return None;
        }
        let (i, j, w) = self.bracket(t)?;
        Some(self.voltages[(node, i)] * (1.0 - w) + self.voltages[(node, j)] * w)
    }

    /// `v(a) - v(b)` at `t`
    pub fn voltage_between(&self, a: NodeId, b: NodeId, t: f64) -> Option<f64> {
        Some(self.voltage_at(a, t)? - self.voltage_at(b, t)?)
    }

    /// Voltage trace of one node over all samples
    pub fn node_trace(&self, node: NodeId) -> Option<Vec<f64>> {
        if node >= self.voltages.nrows() {
            return None;
        }
        Some(self.voltages.row(node).iter().copied().collect())
    }

    /// Samples around `t` and the weight of the later one
    fn bracket(&self, t: f64) -> Option<(usize, usize, f64)> {
        let first = *self.times.first()?;
        let last = *self.times.last()?;
        if !(t >= first && t <= last) {
            return None;
        }
        let j = self.times.partition_point(|&s| s < t);
        if self.times[j] == t || j == 0 {
            return Some((j, j, 0.0));
        }
        let i = j - 1;
        let w = (t - self.times[i]) / (self.times[j] - self.times[i]);
        Some((i, j, w))
    }
}

impl Circuit {
    /// Integrate the circuit over `(t_start, t_end)` from `initial`
    /// (all zero when `None`)
    pub fn solve(&mut self, time_range: (f64, f64), initial: Option<&[f64]>) -> Result<TransientSolution> {
        self.solve_with(time_range, initial, &TransientOptions::default())
    }

    pub fn solve_with(
        &mut self,
        time_range: (f64, f64),
        initial: Option<&[f64]>,
        options: &TransientOptions,
    ) -> Result<TransientSolution> {
        let (t_start, t_end) = time_range;
        if !(t_start.is_finite() && t_end.is_finite() && t_start < t_end) {
            return Err(CircuitError::InvalidTimeRange {
                start: t_start,
                end: t_end,
            });
        }

        let dimension = self.state_dimension();
        let x0 = match initial {
            Some(values) if values.len() != dimension => {
                return Err(CircuitError::StateDimension {
                    expected: dimension,
                    actual: values.len(),
                })
            }
            Some(values) => DVector::from_column_slice(values),
            None => DVector::zeros(dimension),
        };

        self.begin_analysis();
        let circuit: &Circuit = self;

        let mut checkpoints: Vec<f64> = options
            .checkpoints
            .iter()
            .copied()
            .filter(|&c| c > t_start && c < t_end)
            .collect();
        checkpoints.sort_by(|a, b| a.total_cmp(b));

        let builder = StateSpaceBuilder::with_config(circuit, options.solver.clone());
        let mut scheduler = SwitchScheduler::new(circuit.switches());
        scheduler.reset();
        let mut topology = builder.build(scheduler.states())?;
        let mut integrator = Integrator::new(options.integrator.clone(), t_end - t_start)?;

        info!(
            "Transient run over ({}, {}) with {} states and {} switches",
            t_start,
            t_end,
            dimension,
            circuit.switches().len()
        );

        let mut times = vec![t_start];
        let mut states = vec![x0.clone()];
        let mut voltages = vec![topology.voltages(&x0)];
        let mut rebuilds = 0;
        let mut next_checkpoint = 0;
        let mut t = t_start;
        let mut x = x0;

        while t < t_end {
            while next_checkpoint < checkpoints.len() && checkpoints[next_checkpoint] <= t {
                next_checkpoint += 1;
            }
            let mut limit = t_end;
            if let Some(event) = scheduler.next_event_after(t) {
                limit = limit.min(event);
            }
            if let Some(&checkpoint) = checkpoints.get(next_checkpoint) {
                limit = limit.min(checkpoint);
            }

            let (t_new, x_new) = integrator.advance(&topology, t, &x, limit)?;

            scheduler.advance(t, t_new);
            if let Some(rebuilt) = scheduler.rebuild_if_dirty(|states| builder.build(states))? {
                debug!("Switches toggled at t = {}: rebuilt state-space map", t_new);
                topology = rebuilt;
                rebuilds += 1;
            }

            voltages.push(topology.voltages(&x_new));
            states.push(x_new.clone());
            times.push(t_new);
            t = t_new;
            x = x_new;
        }

        let stats = integrator.stats().clone();
        info!(
            "Transient run finished: {} samples, {} rejected steps, {} rebuilds",
            times.len(),
            stats.rejected,
            rebuilds
        );

        Ok(TransientSolution {
            states: columns(dimension, &states),
            voltages: columns(circuit.node_count(), &voltages),
            times,
            stats,
            rebuilds,
        })
    }
}

fn columns(rows: usize, samples: &[DVector<f64>]) -> DMatrix<f64> {
    DMatrix::from_fn(rows, samples.len(), |r, c| samples[c][r])
}
