use std::collections::VecDeque;

use log::{debug, info};
use num_complex::Complex64;

use crate::circuit::{BranchId, Circuit, NodeId};
use crate::component::ComponentId;
use crate::error::{CircuitError, Result};
use crate::mna::{Excitation, MnaSystem, Role};
use crate::solver::{LinearSolver, SolverConfig};

/// Cached steady-state solution
#[derive(Debug, Clone, Default)]
pub struct SteadyState {
    omega: f64,
    voltages: Option<Vec<Complex64>>,
    /// Per branch, head to tail
    currents: Option<Vec<Option<Complex64>>>,
}

impl SteadyState {
    pub fn omega(&self) -> f64 {
        self.omega
    }

    pub fn voltages(&self) -> Option<&[Complex64]> {
        self.voltages.as_deref()
    }

    pub fn is_solved(&self) -> bool {
        self.voltages.is_some()
    }
}

/// Instantaneous value `Re(p * e^{j omega t})` of a phasor
pub fn phasor_to_instant(phasor: Complex64, omega: f64, t: f64) -> f64 {
    (phasor * Complex64::from_polar(1.0, omega * t)).re
}

impl Circuit {
    /// Solve node voltages at the circuit's angular frequency (DC when none
    /// is set). Starts the analyzing phase.
    pub fn nodal_analysis(&mut self) -> Result<()> {
        self.nodal_analysis_with(&SolverConfig::default())
    }

    pub fn nodal_analysis_with(&mut self, config: &SolverConfig) -> Result<()> {
        self.begin_analysis();
        let omega = self.frequency().unwrap_or(0.0);
        self.steady = SteadyState {
            omega,
            ..SteadyState::default()
        };

        let system = MnaSystem::assemble_steady(self, omega)?;
        let matrix = system.augmented_matrix();
        let rhs = system.fixed_rhs()?;
        let (solution, stats) = LinearSolver::with_config(config.clone()).solve_dense(&matrix, &rhs)?;

        // Shorted nodes share one potential bit for bit, ground is exactly 0
        let zero = Complex64::new(0.0, 0.0);
        let voltages: Vec<Complex64> = system
            .short_representatives()
            .into_iter()
            .map(|rep| if rep == self.ground() { zero } else { solution[rep] })
            .collect();

        info!(
            "Nodal analysis at w = {} solved {} unknowns (residual {:.2e})",
            omega, stats.size, stats.residual_norm
        );
        self.steady.voltages = Some(voltages);
        Ok(())
    }

    /// Resolve every branch current from the solved voltages.
    ///
    /// Requires a prior [`Circuit::nodal_analysis`].
    pub fn calculate_currents(&mut self) -> Result<()> {
        let voltages = match &self.steady.voltages {
            Some(voltages) => voltages.clone(),
            None => return Err(CircuitError::UnresolvableCurrent { node: self.ground() }),
        };
        let system = MnaSystem::assemble_steady(self, self.steady.omega)?;

        let mut currents: Vec<Option<Complex64>> = system
            .stamps
            .iter()
            .map(|stamp| match stamp.role {
                Role::Admittance(y) => Some(y * (voltages[stamp.head] - voltages[stamp.tail])),
                Role::Injection(Excitation::Fixed(current)) => Some(current),
                Role::Open => Some(Complex64::new(0.0, 0.0)),
                Role::Constraint { .. } | Role::Injection(Excitation::State(_)) => None,
            })
            .collect();

        let order = self.unknown_current_forest(&currents);
        for &(node, parent_branch) in order.iter().rev() {
            let branch = match parent_branch {
                Some(branch) => branch,
                None => continue,
            };

            // KCL at `node`: whatever leaves through the other branches
            // arrives through the parent branch
            let mut leaving = Complex64::new(0.0, 0.0);
            for (id, other) in self.incident_branches(node) {
                if id == branch {
                    continue;
                }
                let current = currents[id].ok_or(CircuitError::UnresolvableCurrent { node })?;
                leaving += if other.head == node { current } else { -current };
            }
            let through = -leaving;
            currents[branch] = Some(if self.branches()[branch].head == node {
                through
            } else {
                -through
            });
        }

        if let Some(branch) = currents.iter().position(Option::is_none) {
            return Err(CircuitError::UnresolvableCurrent {
                node: self.branches()[branch].head,
            });
        }

        debug!("Resolved {} branch currents", currents.len());
        self.steady.currents = Some(currents);
        Ok(())
    }

    /// Breadth-first forest over branches with unknown current, starting at
    /// ground. Returns `(node, branch to parent)` in visit order.
    fn unknown_current_forest(&self, currents: &[Option<Complex64>]) -> Vec<(NodeId, Option<BranchId>)> {
        let mut visited = vec![false; self.node_count()];
        let mut order = Vec::new();
        let roots = std::iter::once(self.ground()).chain(0..self.node_count());

        for root in roots {
            if visited[root] {
                continue;
            }
            visited[root] = true;
            let mut queue = VecDeque::from([root]);
            order.push((root, None));

            while let Some(node) = queue.pop_front() {
                for (id, branch) in self.incident_branches(node) {
                    if currents[id].is_some() {
                        continue;
                    }
                    let next = branch.other(node);
                    if !visited[next] {
                        visited[next] = true;
                        order.push((next, Some(id)));
                        queue.push_back(next);
                    }
                }
            }
        }
        order
    }

    /// Voltage at `node` relative to ground
    pub fn get_voltage(&self, node: NodeId) -> Option<Complex64> {
        self.steady.voltages.as_ref()?.get(node).copied()
    }

    /// `v(a) - v(b)`
    pub fn voltage_between(&self, a: NodeId, b: NodeId) -> Option<Complex64> {
        Some(self.get_voltage(a)? - self.get_voltage(b)?)
    }

    /// Current from `i` to `j` through the element on that node pair
    pub fn get_element_current(&self, i: NodeId, j: NodeId) -> Option<Complex64> {
        let (id, branch) = self.branch_between(i, j)?;
        let current = (*self.steady.currents.as_ref()?.get(id)?)?;
        Some(if branch.head == i { current } else { -current })
    }

    /// Current through a component from `from` to `to`.
    ///
    /// Fails when the nodes are not the component's terminals.
    pub fn element_current(&self, component: ComponentId, from: NodeId, to: NodeId) -> Result<Option<Complex64>> {
        self.check_terminals(component, from, to)?;
        Ok(self.get_element_current(from, to))
    }

    /// Voltage across a component, `v(from) - v(to)`.
    ///
    /// Fails when the nodes are not the component's terminals.
    pub fn element_voltage(&self, component: ComponentId, from: NodeId, to: NodeId) -> Result<Option<Complex64>> {
        self.check_terminals(component, from, to)?;
        Ok(self.voltage_between(from, to))
    }

    fn check_terminals(&self, component: ComponentId, from: NodeId, to: NodeId) -> Result<()> {
        let element = self.component(component).ok_or_else(|| CircuitError::InvalidTerminal {
            element: format!("#{}", component),
            from,
            to,
        })?;
        element.orient(1.0, from, to).map(|_| ())
    }

    /// Instantaneous voltage at `node` and time `t` for the solved phasors
    pub fn instantaneous_voltage(&self, node: NodeId, t: f64) -> Option<f64> {
        self.get_voltage(node)
            .map(|v| phasor_to_instant(v, self.steady.omega, t))
    }

    pub fn steady_state(&self) -> &SteadyState {
        &self.steady
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::Phase;
    use approx::assert_relative_eq;

    fn assert_real(value: Option<Complex64>, expected: f64) {
        let value = value.unwrap();
        assert_relative_eq!(value.re, expected, epsilon = 1e-9);
        assert_relative_eq!(value.im, 0.0, epsilon = 1e-9);
    }

    /// Nine nodes, one dependent source, resistors R1..R5 of 1..5 ohms
    fn nine_node_circuit() -> Circuit {
        let mut circuit = Circuit::new(9, 0).unwrap();
        circuit.add_wire(0, 1).unwrap();
        circuit.add_wire(1, 2).unwrap();
        circuit.add_voltage_source(5.0, 3, 0).unwrap();
        circuit.add_resistor(1.0, 4, 1).unwrap();
        circuit.add_voltage_source(4.0, 5, 2).unwrap();
        circuit.add_resistor(5.0, 4, 3).unwrap();
        circuit.add_resistor(2.0, 4, 5).unwrap();
        circuit.add_resistor(4.0, 6, 3).unwrap();
        circuit.add_resistor(3.0, 7, 4).unwrap();
        circuit.add_dependent_voltage_source(3.0, 8, 5, 4, 1).unwrap();
        circuit.add_wire(6, 7).unwrap();
        circuit.add_voltage_source(6.0, 8, 7).unwrap();
        circuit
    }

    #[test]
    fn test_resistive_divider() {
        let mut circuit = Circuit::new(3, 0).unwrap();
        circuit.add_voltage_source(10.0, 1, 0).unwrap();
        circuit.add_resistor(1000.0, 1, 2).unwrap();
        circuit.add_resistor(3000.0, 2, 0).unwrap();

        circuit.nodal_analysis().unwrap();
        assert_real(circuit.get_voltage(1), 10.0);
        assert_real(circuit.get_voltage(2), 10.0 * 3000.0 / 4000.0);
        assert_eq!(circuit.get_voltage(0), Some(Complex64::new(0.0, 0.0)));

        circuit.calculate_currents().unwrap();
        assert_real(circuit.get_element_current(1, 2), 2.5e-3);
        // The source delivers the current from its tail to its head
        assert_real(circuit.get_element_current(0, 1), 2.5e-3);
    }

    #[test]
    fn test_milliohm_and_gigaohm_network() {
        let mut circuit = Circuit::new(4, 0).unwrap();
        circuit.add_voltage_source(1.0, 1, 0).unwrap();
        circuit.add_resistor(1e-3, 1, 2).unwrap();
        circuit.add_resistor(1e11, 2, 3).unwrap();
        circuit.add_resistor(1e11, 3, 0).unwrap();

        circuit.nodal_analysis().unwrap();
        assert_real(circuit.get_voltage(3), 0.5);

        circuit.calculate_currents().unwrap();
        let current = circuit.get_element_current(2, 3).unwrap();
        assert_relative_eq!(current.re, 0.5e-11, max_relative = 1e-6);
    }

    #[test]
    fn test_nine_node_voltages() {
        let mut circuit = nine_node_circuit();
        circuit.nodal_analysis().unwrap();

        let expected = [
            0.0,
            0.0,
            0.0,
            5.0,
            70.0 / 31.0,
            4.0,
            148.0 / 31.0,
            148.0 / 31.0,
            334.0 / 31.0,
        ];
        for (node, &v) in expected.iter().enumerate() {
            assert_real(circuit.get_voltage(node), v);
        }
        assert_eq!(circuit.voltage_between(6, 7), Some(Complex64::new(0.0, 0.0)));
    }

    #[test]
    fn test_nine_node_currents() {
        let mut circuit = nine_node_circuit();
        circuit.nodal_analysis().unwrap();
        circuit.calculate_currents().unwrap();

        assert_real(circuit.get_element_current(4, 1), 70.0 / 31.0);
        assert_real(circuit.get_element_current(4, 3), -17.0 / 31.0);
        assert_real(circuit.get_element_current(4, 5), -27.0 / 31.0);
        assert_real(circuit.get_element_current(6, 3), -7.0 / 124.0);
        assert_real(circuit.get_element_current(7, 4), 26.0 / 31.0);
        assert_real(circuit.get_element_current(6, 7), 7.0 / 124.0);
        assert_real(circuit.get_element_current(7, 6), -7.0 / 124.0);
    }

    #[test]
    fn test_kcl_holds_at_every_node() {
        let mut circuit = nine_node_circuit();
        circuit.nodal_analysis().unwrap();
        circuit.calculate_currents().unwrap();

        for node in 0..circuit.node_count() {
            let mut leaving = Complex64::new(0.0, 0.0);
            for (_, branch) in circuit.incident_branches(node) {
                leaving += circuit.get_element_current(node, branch.other(node)).unwrap();
            }
            assert_relative_eq!(leaving.norm(), 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_nodal_analysis_is_idempotent() {
        let mut circuit = nine_node_circuit();
        circuit.nodal_analysis().unwrap();
        let first = circuit.steady_state().voltages().unwrap().to_vec();
        circuit.nodal_analysis().unwrap();
        assert_eq!(circuit.steady_state().voltages().unwrap(), first.as_slice());
    }

    #[test]
    fn test_phasor_rc() {
        let mut circuit = Circuit::new(3, 0).unwrap().with_frequency(1.0);
        circuit.add_voltage_source(1.0, 1, 0).unwrap();
        circuit.add_resistor(1.0, 1, 2).unwrap();
        circuit.add_capacitor(1.0, 2, 0).unwrap();

        circuit.nodal_analysis().unwrap();
        let v = circuit.get_voltage(2).unwrap();
        assert_relative_eq!(v.re, 0.5, epsilon = 1e-12);
        assert_relative_eq!(v.im, -0.5, epsilon = 1e-12);

        circuit.calculate_currents().unwrap();
        let i = circuit.get_element_current(2, 0).unwrap();
        // i = jwC * v = 0.5 + 0.5j
        assert_relative_eq!(i.re, 0.5, epsilon = 1e-12);
        assert_relative_eq!(i.im, 0.5, epsilon = 1e-12);

        // 0.5 cos t + 0.5 sin t
        let quarter = std::f64::consts::FRAC_PI_2;
        assert_relative_eq!(circuit.instantaneous_voltage(2, quarter).unwrap(), 0.5, epsilon = 1e-12);
        assert_relative_eq!(circuit.instantaneous_voltage(2, 0.0).unwrap(), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_dc_inductor_is_short() {
        let mut circuit = Circuit::new(3, 0).unwrap();
        circuit.add_voltage_source(1.0, 1, 0).unwrap();
        circuit.add_resistor(1.0, 1, 2).unwrap();
        circuit.add_inductor(1e-3, 2, 0).unwrap();

        circuit.nodal_analysis().unwrap();
        assert_eq!(circuit.get_voltage(2), Some(Complex64::new(0.0, 0.0)));

        circuit.calculate_currents().unwrap();
        assert_real(circuit.get_element_current(2, 0), 1.0);
        assert_real(circuit.get_element_current(0, 1), 1.0);
    }

    #[test]
    fn test_dc_capacitor_is_open() {
        let mut circuit = Circuit::new(3, 0).unwrap();
        circuit.add_voltage_source(2.0, 1, 0).unwrap();
        circuit.add_resistor(1.0, 1, 2).unwrap();
        circuit.add_capacitor(1e-6, 2, 0).unwrap();

        circuit.nodal_analysis().unwrap();
        assert_real(circuit.get_voltage(2), 2.0);
        circuit.calculate_currents().unwrap();
        assert_real(circuit.get_element_current(2, 0), 0.0);
        assert_real(circuit.get_element_current(1, 2), 0.0);
    }

    #[test]
    fn test_current_source() {
        let mut circuit = Circuit::new(3, 0).unwrap();
        circuit.add_current_source(1.0, 0, 1).unwrap();
        circuit.add_resistor(2.0, 1, 2).unwrap();
        circuit.add_wire(2, 0).unwrap();

        circuit.nodal_analysis().unwrap();
        assert_real(circuit.get_voltage(1), 2.0);
        circuit.calculate_currents().unwrap();
        assert_real(circuit.get_element_current(0, 1), 1.0);
        assert_real(circuit.get_element_current(1, 2), 1.0);
        assert_real(circuit.get_element_current(2, 0), 1.0);
    }

    #[test]
    fn test_wire_forces_exact_zero() {
        let mut circuit = Circuit::new(4, 0).unwrap();
        circuit.add_voltage_source(3.3, 1, 0).unwrap();
        circuit.add_resistor(7.0, 1, 2).unwrap();
        circuit.add_wire(2, 3).unwrap();
        circuit.add_resistor(11.0, 3, 0).unwrap();

        circuit.nodal_analysis().unwrap();
        assert_eq!(circuit.voltage_between(2, 3), Some(Complex64::new(0.0, 0.0)));
        assert_eq!(circuit.voltage_between(3, 2), Some(Complex64::new(0.0, 0.0)));
    }

    #[test]
    fn test_switches_at_initial_position() {
        let mut open = Circuit::new(3, 0).unwrap();
        open.add_voltage_source(1.0, 1, 0).unwrap();
        open.add_switch(1, 2, false).unwrap();
        open.add_resistor(1.0, 2, 0).unwrap();
        open.nodal_analysis().unwrap();
        open.calculate_currents().unwrap();
        assert_real(open.get_voltage(2), 0.0);
        assert_real(open.get_element_current(1, 2), 0.0);

        let mut spdt = Circuit::new(4, 0).unwrap();
        spdt.add_voltage_source(1.0, 1, 0).unwrap();
        spdt.add_spdt_switch(2, 1, 0, false).unwrap();
        spdt.add_resistor(1.0, 2, 3).unwrap();
        spdt.add_resistor(1.0, 3, 0).unwrap();
        spdt.nodal_analysis().unwrap();
        spdt.calculate_currents().unwrap();
        assert_real(spdt.get_voltage(2), 1.0);
        assert_real(spdt.get_voltage(3), 0.5);
        assert_real(spdt.get_element_current(1, 2), 0.5);
        assert_real(spdt.get_element_current(2, 0), 0.0);
    }

    #[test]
    fn test_conflicting_sources_fail() {
        let mut circuit = Circuit::new(3, 0).unwrap();
        circuit.add_voltage_source(5.0, 1, 0).unwrap();
        circuit.add_voltage_source(3.0, 1, 2).unwrap();
        circuit.add_wire(2, 0).unwrap();

        assert!(matches!(
            circuit.nodal_analysis(),
            Err(CircuitError::SingularSystem { .. })
        ));
        assert_eq!(circuit.get_voltage(1), None);
        assert_eq!(circuit.voltage_between(1, 2), None);
    }

    #[test]
    fn test_floating_node_fails() {
        // Node 2 touches nothing, so its KCL row is empty
        let mut circuit = Circuit::new(3, 0).unwrap();
        circuit.add_voltage_source(1.0, 1, 0).unwrap();

        assert!(matches!(
            circuit.nodal_analysis(),
            Err(CircuitError::SingularSystem { .. })
        ));
    }

    #[test]
    fn test_queries_before_solve() {
        let mut circuit = Circuit::new(2, 0).unwrap();
        let r = circuit.add_resistor(1.0, 1, 0).unwrap();
        assert_eq!(circuit.get_voltage(1), None);
        assert_eq!(circuit.get_element_current(1, 0), None);
        assert_eq!(circuit.element_current(r, 1, 0).unwrap(), None);
        assert!(matches!(
            circuit.calculate_currents(),
            Err(CircuitError::UnresolvableCurrent { .. })
        ));
    }

    #[test]
    fn test_invalid_terminal_query() {
        let mut circuit = Circuit::new(3, 0).unwrap();
        circuit.add_voltage_source(1.0, 1, 0).unwrap();
        let r = circuit.add_resistor(2.0, 1, 2).unwrap();
        circuit.add_resistor(2.0, 2, 0).unwrap();
        circuit.nodal_analysis().unwrap();
        circuit.calculate_currents().unwrap();

        assert!(matches!(
            circuit.element_current(r, 1, 0),
            Err(CircuitError::InvalidTerminal { .. })
        ));
        assert!(circuit.element_voltage(r, 0, 2).is_err());
        assert_real(circuit.element_voltage(r, 2, 1).unwrap(), -0.5);
        assert_real(circuit.element_current(r, 1, 2).unwrap(), 0.25);
    }

    #[test]
    fn test_phase_frozen_after_analysis() {
        let mut circuit = Circuit::new(2, 0).unwrap();
        circuit.add_voltage_source(1.0, 1, 0).unwrap();
        circuit.nodal_analysis().unwrap();
        assert_eq!(circuit.phase(), Phase::Analyzing);
        assert!(matches!(
            circuit.add_resistor(1.0, 1, 0),
            Err(CircuitError::PhaseViolation { .. })
        ));
    }

    #[test]
    fn test_phasor_to_instant() {
        let p = Complex64::from_polar(2.0, 0.25);
        assert_relative_eq!(phasor_to_instant(p, 3.0, 0.5), 2.0 * (1.5f64 + 0.25).cos(), epsilon = 1e-12);
    }
}
