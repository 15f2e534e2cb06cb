use log::{debug, info};
use nalgebra::{DMatrix, DVector};

use crate::circuit::{Circuit, NodeId};
use crate::component::ComponentType;
use crate::error::{CircuitError, Result};
use crate::integrator::OdeSystem;
use crate::mna::{sparse_mul, sparse_mul_vector, Excitation, MnaSystem, Role, Stamp};
use crate::solver::{LinearSolver, SolverConfig};
use crate::supernode::{head_side, SuperNodes};

/// Linear maps of one switch configuration
#[derive(Debug, Clone)]
pub struct Topology {
    /// `dx/dt = a x + e`
    pub a: DMatrix<f64>,
    pub e: DVector<f64>,
    /// Node voltages `v = vx x + v0`
    pub vx: DMatrix<f64>,
    pub v0: DVector<f64>,
    pub partition: SuperNodes,
    pub switch_states: Vec<bool>,
}

impl Topology {
    /// Full node-voltage vector for state `x`
    pub fn voltages(&self, x: &DVector<f64>) -> DVector<f64> {
        &self.vx * x + &self.v0
    }
}

impl OdeSystem for Topology {
    fn dimension(&self) -> usize {
        self.e.len()
    }

    fn rhs(&self, _t: f64, x: &DVector<f64>) -> DVector<f64> {
        &self.a * x + &self.e
    }
}

/// Derives [`Topology`] snapshots for a frozen circuit.
///
/// For one switch configuration the network is written as
/// `D v = Bv u_v + Bi u_i`, where the constraint values `u_v` (capacitor
/// voltages, source voltages, zero for shorts) and the injected currents
/// `u_i` (inductor currents, current sources) are affine in the state `x`.
/// Inverting `D` once gives `v = Vx x + v0`. Capacitor currents follow from a
/// KCL cut around each capacitor and inductor voltages from `v`, which
/// together give `dx/dt = A x + e`.
#[derive(Debug)]
pub struct StateSpaceBuilder<'a> {
    circuit: &'a Circuit,
    solver: LinearSolver,
    dimension: usize,
    /// Value per state slot: capacitance, then inductance
    reactance: Vec<f64>,
}

impl<'a> StateSpaceBuilder<'a> {
    pub fn new(circuit: &'a Circuit) -> Self {
        Self::with_config(circuit, SolverConfig::default())
    }

    pub fn with_config(circuit: &'a Circuit, config: SolverConfig) -> Self {
        let reactance = circuit
            .capacitors()
            .into_iter()
            .chain(circuit.inductors())
            .filter_map(|id| circuit.component(id))
            .map(|c| match c.component_type {
                ComponentType::Capacitor { capacitance } => capacitance,
                ComponentType::Inductor { inductance } => inductance,
                _ => f64::NAN,
            })
            .collect::<Vec<_>>();

        StateSpaceBuilder {
            circuit,
            solver: LinearSolver::with_config(config),
            dimension: reactance.len(),
            reactance,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Build the maps for the given switch states
    pub fn build(&self, switch_states: &[bool]) -> Result<Topology> {
        let n = self.circuit.node_count();
        let s = self.dimension;
        let system = MnaSystem::assemble_transient(self.circuit, switch_states)?;

        // u_v = sv x + sv0, u_i = si x + si0
        let (sv, sv0) = self.excitation_map(system.constraints())?;
        let (si, si0) = self.excitation_map(system.injections())?;

        let matrix = system.augmented_matrix();
        let inverse = self.solver.invert(&matrix)?;
        let bv = system.constraint_input();
        let bi = system.injection_input();

        let mut vx = &inverse * (&bv * &sv + &bi * &si);
        let mut v0 = &inverse * (&bv * &sv0 + &bi * &si0);
        canonicalize(&system.short_representatives(), self.circuit.ground(), &mut vx, &mut v0);

        // Net current leaving each node through conductances and injections
        let laplacian = system.laplacian();
        let incidence = system.incidence();
        let leaving_x = sparse_mul(&laplacian, &vx) + &incidence * &si;
        let leaving_0 = sparse_mul_vector(&laplacian, &v0) + &incidence * &si0;

        let mut a = DMatrix::zeros(s, s);
        let mut e = DVector::zeros(s);
        let links = system.constraint_links();

        for (k, stamp) in system.constraints().enumerate() {
            let slot = match stamp.role {
                Role::Constraint {
                    value: Excitation::State(slot),
                    ..
                } => slot,
                _ => continue,
            };
            // Current through the capacitor, head to tail, is minus what
            // leaves its head side through everything else
            let cut = head_side(n, &links, k);
            let capacitance = self.reactance[slot];
            for &node in &cut {
                for col in 0..s {
                    a[(slot, col)] -= leaving_x[(node, col)] / capacitance;
                }
                e[slot] -= leaving_0[node] / capacitance;
            }
        }

        for stamp in system.injections() {
            if let Role::Injection(Excitation::State(slot)) = stamp.role {
                let inductance = self.reactance[slot];
                for col in 0..s {
                    a[(slot, col)] = (vx[(stamp.head, col)] - vx[(stamp.tail, col)]) / inductance;
                }
                e[slot] = (v0[stamp.head] - v0[stamp.tail]) / inductance;
            }
        }

        debug!(
            "State-space map for switches {:?}: {} states, {} super-nodes",
            switch_states,
            s,
            system.partition().len()
        );

        Ok(Topology {
            a,
            e,
            vx,
            v0,
            partition: system.partition().clone(),
            switch_states: switch_states.to_vec(),
        })
    }

    /// Affine map from the state to the values of `stamps`
    fn excitation_map<'s, I>(&self, stamps: I) -> Result<(DMatrix<f64>, DVector<f64>)>
    where
        I: Iterator<Item = &'s Stamp<f64>>,
    {
        let stamps: Vec<&Stamp<f64>> = stamps.collect();
        let mut map = DMatrix::zeros(stamps.len(), self.dimension);
        let mut offset = DVector::zeros(stamps.len());
        for (row, stamp) in stamps.iter().enumerate() {
            let excitation = match stamp.role {
                Role::Constraint { value, .. } | Role::Injection(value) => value,
                _ => continue,
            };
            match excitation {
                Excitation::Fixed(value) => offset[row] = value,
                Excitation::State(slot) if slot < self.dimension => map[(row, slot)] = 1.0,
                Excitation::State(slot) => {
                    return Err(CircuitError::StateDimension {
                        expected: self.dimension,
                        actual: slot + 1,
                    })
                }
            }
        }
        Ok((map, offset))
    }
}

/// Copy each node's row from its short representative so shorted nodes
/// read identical voltages, and pin ground to zero
fn canonicalize(representatives: &[NodeId], ground: NodeId, vx: &mut DMatrix<f64>, v0: &mut DVector<f64>) {
    for (node, &rep) in representatives.iter().enumerate() {
        if rep == ground {
            vx.row_mut(node).fill(0.0);
            v0[node] = 0.0;
        } else if rep != node {
            let row = vx.row(rep).clone_owned();
            vx.row_mut(node).copy_from(&row);
            v0[node] = v0[rep];
        }
    }
}

impl Circuit {
    /// State-space maps for the switches at their initial positions
    pub fn state_space(&self) -> Result<Topology> {
        let states: Vec<bool> = self.switches().iter().map(|s| s.initial_state).collect();
        let topology = StateSpaceBuilder::new(self).build(&states)?;
        info!(
            "State-space system: {} states over {} nodes",
            topology.dimension(),
            self.node_count()
        );
        Ok(topology)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn rc() -> Circuit {
        let mut circuit = Circuit::new(3, 0).unwrap();
        circuit.add_voltage_source(1.0, 1, 0).unwrap();
        circuit.add_resistor(1.0, 1, 2).unwrap();
        circuit.add_capacitor(1.0, 2, 0).unwrap();
        circuit
    }

    #[test]
    fn test_rc_map() {
        let topology = rc().state_space().unwrap();
        // dv/dt = 1 - v
        assert_relative_eq!(topology.a[(0, 0)], -1.0, epsilon = 1e-12);
        assert_relative_eq!(topology.e[0], 1.0, epsilon = 1e-12);

        let v = topology.voltages(&DVector::from_element(1, 0.25));
        assert_eq!(v[0], 0.0);
        assert_relative_eq!(v[1], 1.0, epsilon = 1e-12);
        assert_relative_eq!(v[2], 0.25, epsilon = 1e-12);
    }

    #[test]
    fn test_rl_map() {
        let mut circuit = Circuit::new(3, 0).unwrap();
        circuit.add_voltage_source(1.0, 1, 0).unwrap();
        circuit.add_resistor(2.0, 1, 2).unwrap();
        circuit.add_inductor(0.5, 2, 0).unwrap();

        let topology = circuit.state_space().unwrap();
        // L di/dt = 1 - R i
        assert_relative_eq!(topology.a[(0, 0)], -4.0, epsilon = 1e-12);
        assert_relative_eq!(topology.e[0], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_lc_tank() {
        // Capacitor and inductor in parallel between node 1 and ground
        let mut circuit = Circuit::new(3, 0).unwrap();
        circuit.add_capacitor(2.0, 1, 0).unwrap();
        circuit.add_inductor(3.0, 1, 2).unwrap();
        circuit.add_wire(2, 0).unwrap();

        let topology = circuit.state_space().unwrap();
        // C dv/dt = -i, L di/dt = v
        assert_relative_eq!(topology.a[(0, 1)], -0.5, epsilon = 1e-12);
        assert_relative_eq!(topology.a[(1, 0)], 1.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(topology.a[(0, 0)], 0.0, epsilon = 1e-12);
        assert_relative_eq!(topology.a[(1, 1)], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_lone_capacitor_holds_charge() {
        let mut circuit = Circuit::new(2, 0).unwrap();
        circuit.add_capacitor(2.0, 1, 0).unwrap();
        let topology = circuit.state_space().unwrap();
        assert_relative_eq!(topology.a[(0, 0)], 0.0, epsilon = 1e-12);
        assert_relative_eq!(topology.e[0], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_series_capacitors_share_current() {
        // 1V -- R=1 -- C1=1 -- C2=1 -- ground
        let mut circuit = Circuit::new(4, 0).unwrap();
        circuit.add_voltage_source(1.0, 1, 0).unwrap();
        circuit.add_resistor(1.0, 1, 2).unwrap();
        circuit.add_capacitor(1.0, 2, 3).unwrap();
        circuit.add_capacitor(1.0, 3, 0).unwrap();

        let topology = circuit.state_space().unwrap();
        // i = 1 - x1 - x2 through both capacitors
        for row in 0..2 {
            assert_relative_eq!(topology.a[(row, 0)], -1.0, epsilon = 1e-12);
            assert_relative_eq!(topology.a[(row, 1)], -1.0, epsilon = 1e-12);
            assert_relative_eq!(topology.e[row], 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_switch_states_change_map() {
        let mut circuit = Circuit::new(4, 0).unwrap();
        circuit.add_voltage_source(1.0, 1, 0).unwrap();
        let s = circuit.add_switch(1, 2, true).unwrap();
        circuit.add_resistor(1.0, 2, 3).unwrap();
        circuit.add_capacitor(1.0, 3, 0).unwrap();
        assert_eq!(s, 0);

        let builder = StateSpaceBuilder::new(&circuit);
        let closed = builder.build(&[true]).unwrap();
        assert_relative_eq!(closed.a[(0, 0)], -1.0, epsilon = 1e-12);
        assert_relative_eq!(closed.e[0], 1.0, epsilon = 1e-12);

        let open = builder.build(&[false]).unwrap();
        assert_relative_eq!(open.a[(0, 0)], 0.0, epsilon = 1e-12);
        assert_relative_eq!(open.e[0], 0.0, epsilon = 1e-12);
        // Node 2 floats with the capacitor through the resistor
        let v = open.voltages(&DVector::from_element(1, 0.4));
        assert_relative_eq!(v[2], 0.4, epsilon = 1e-12);
    }

    #[test]
    fn test_dependent_source_folded() {
        // Voltage-controlled source doubling the capacitor voltage onto node 3
        let mut circuit = Circuit::new(4, 0).unwrap();
        circuit.add_voltage_source(1.0, 1, 0).unwrap();
        circuit.add_resistor(1.0, 1, 2).unwrap();
        circuit.add_capacitor(1.0, 2, 0).unwrap();
        circuit.add_dependent_voltage_source(2.0, 3, 0, 2, 0).unwrap();

        let topology = circuit.state_space().unwrap();
        let v = topology.voltages(&DVector::from_element(1, 0.3));
        assert_relative_eq!(v[3], 0.6, epsilon = 1e-12);
        assert_relative_eq!(topology.a[(0, 0)], -1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_capacitor_loop_is_singular() {
        let mut looped = Circuit::new(3, 0).unwrap();
        looped.add_voltage_source(1.0, 1, 0).unwrap();
        looped.add_capacitor(1.0, 1, 2).unwrap();
        looped.add_wire(2, 0).unwrap();

        assert!(matches!(
            looped.state_space(),
            Err(CircuitError::SingularSystem { .. })
        ));
    }

    #[test]
    fn test_floating_island_is_singular() {
        let mut circuit = Circuit::new(4, 0).unwrap();
        circuit.add_voltage_source(1.0, 1, 0).unwrap();
        circuit.add_resistor(1.0, 2, 3).unwrap();
        assert!(matches!(
            circuit.state_space(),
            Err(CircuitError::SingularSystem { .. })
        ));
    }
}
