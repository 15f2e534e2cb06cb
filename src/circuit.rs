use std::collections::{BTreeMap, HashMap};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::component::{Component, ComponentId, ComponentType};
use crate::error::{CircuitError, Result};
use crate::steady_state::SteadyState;

/// Node identifier in `[0, node_count)`
pub type NodeId = usize;

/// Index of a switch (simple or SPDT) in registration order
pub type SwitchId = usize;

/// Index of a branch (one conducting path between a node pair)
pub type BranchId = usize;

/// Lifecycle phase of a circuit.
///
/// A circuit starts in `Building`; the first solve moves it to `Analyzing`
/// and there is no way back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Building,
    Analyzing,
}

/// Ties a branch to the switch that opens and closes it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchGate {
    pub switch: SwitchId,
    /// The branch conducts while the switch state equals this value
    pub conducts_when: bool,
}

/// One conducting path of a component between two nodes.
///
/// Two-terminal components own exactly one branch. An SPDT switch owns two:
/// pole to throw A and pole to throw B.
#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub component: ComponentId,
    pub head: NodeId,
    pub tail: NodeId,
    pub gate: Option<SwitchGate>,
}

impl Branch {
    /// Whether the branch conducts for the given switch states
    pub fn conducts(&self, switch_states: &[bool]) -> bool {
        match self.gate {
            None => true,
            Some(gate) => switch_states
                .get(gate.switch)
                .map_or(false, |&state| state == gate.conducts_when),
        }
    }

    /// The terminal opposite `node`
    pub fn other(&self, node: NodeId) -> NodeId {
        if node == self.head {
            self.tail
        } else {
            self.head
        }
    }
}

/// Switch bookkeeping: owning component, initial state and toggle instants
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchInfo {
    pub component: ComponentId,
    pub initial_state: bool,
    pub events: Vec<f64>,
}

/// Circuit graph: nodes `0..node_count`, at most one component per
/// unordered node pair, and a fixed ground node.
#[derive(Debug, Clone)]
pub struct Circuit {
    pub title: String,
    node_count: usize,
    ground: NodeId,
    omega: Option<f64>,
    phase: Phase,
    components: Vec<Component>,
    branches: Vec<Branch>,
    adjacency: HashMap<(NodeId, NodeId), BranchId>,
    switches: Vec<SwitchInfo>,
    name_counters: HashMap<char, usize>,
    pub(crate) steady: SteadyState,
}

fn pair_key(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

impl Circuit {
    /// Create an empty circuit with `node_count` nodes and the given ground
    pub fn new(node_count: usize, ground: NodeId) -> Result<Self> {
        if ground >= node_count {
            return Err(CircuitError::invalid_node(
                ground,
                format!("ground must be below the node count {}", node_count),
            ));
        }

        Ok(Circuit {
            title: String::new(),
            node_count,
            ground,
            omega: None,
            phase: Phase::Building,
            components: Vec::new(),
            branches: Vec::new(),
            adjacency: HashMap::new(),
            switches: Vec::new(),
            name_counters: HashMap::new(),
            steady: SteadyState::default(),
        })
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Set the angular frequency used by steady-state analysis
    pub fn with_frequency(mut self, omega: f64) -> Self {
        self.omega = Some(omega);
        self
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn ground(&self) -> NodeId {
        self.ground
    }

    /// Angular frequency for steady-state analysis, `None` meaning DC
    pub fn frequency(&self) -> Option<f64> {
        self.omega
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn component(&self, id: ComponentId) -> Option<&Component> {
        self.components.get(id)
    }

    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    pub fn switches(&self) -> &[SwitchInfo] {
        &self.switches
    }

    /// Find a component by name
    pub fn component_id(&self, name: &str) -> Option<ComponentId> {
        self.components.iter().position(|c| c.name == name)
    }

    /// Switch index of a switch component
    pub fn switch_id(&self, component: ComponentId) -> Option<SwitchId> {
        self.switches.iter().position(|s| s.component == component)
    }

    /// Components of the given kind, in registration order
    pub fn components_where<F>(&self, predicate: F) -> Vec<ComponentId>
    where
        F: Fn(&ComponentType) -> bool,
    {
        self.components
            .iter()
            .enumerate()
            .filter(|(_, c)| predicate(&c.component_type))
            .map(|(id, _)| id)
            .collect()
    }

    pub fn capacitors(&self) -> Vec<ComponentId> {
        self.components_where(|t| matches!(t, ComponentType::Capacitor { .. }))
    }

    pub fn inductors(&self) -> Vec<ComponentId> {
        self.components_where(|t| matches!(t, ComponentType::Inductor { .. }))
    }

    /// Length of the transient state vector
    pub fn state_dimension(&self) -> usize {
        self.capacitors().len() + self.inductors().len()
    }

    /// Component occupying the node pair, in either order
    pub fn lookup(&self, i: NodeId, j: NodeId) -> Option<&Component> {
        self.branch_between(i, j)
            .map(|(_, branch)| &self.components[branch.component])
    }

    /// Branch occupying the node pair, in either order
    pub fn branch_between(&self, i: NodeId, j: NodeId) -> Option<(BranchId, &Branch)> {
        self.adjacency
            .get(&pair_key(i, j))
            .map(|&id| (id, &self.branches[id]))
    }

    /// Branches incident to `node`
    pub fn incident_branches(&self, node: NodeId) -> impl Iterator<Item = (BranchId, &Branch)> {
        self.branches
            .iter()
            .enumerate()
            .filter(move |(_, b)| b.head == node || b.tail == node)
    }

    fn check_node(&self, node: NodeId) -> Result<()> {
        if node < self.node_count {
            Ok(())
        } else {
            Err(CircuitError::invalid_node(
                node,
                format!("circuit has {} nodes", self.node_count),
            ))
        }
    }

    fn next_name(&mut self, prefix: char) -> String {
        let counter = self.name_counters.entry(prefix).or_insert(0);
        *counter += 1;
        format!("{}{}", prefix, counter)
    }

    /// Add a component to the circuit.
    ///
    /// Fails outside the building phase, on out-of-range or coincident
    /// terminals, on invalid parameters, and when any node pair the component
    /// needs is already taken.
    pub fn add_component(&mut self, component: Component) -> Result<ComponentId> {
        if self.phase != Phase::Building {
            return Err(CircuitError::phase_violation(format!(
                "add '{}'",
                component.name
            )));
        }

        for node in component.nodes() {
            self.check_node(node)?;
        }
        if component.head == component.tail {
            return Err(CircuitError::invalid_node(
                component.head,
                format!("'{}' connects a node to itself", component.name),
            ));
        }
        component.validate()?;

        let id = self.components.len();
        let switch = if component.component_type.is_switch() {
            Some(self.switches.len())
        } else {
            None
        };

        let mut new_branches = Vec::new();
        match component.component_type {
            ComponentType::Switch { .. } => new_branches.push(Branch {
                component: id,
                head: component.head,
                tail: component.tail,
                gate: switch.map(|s| SwitchGate {
                    switch: s,
                    conducts_when: true,
                }),
            }),
            ComponentType::SpdtSwitch { throw_b, .. } => {
                if throw_b == component.head || throw_b == component.tail {
                    return Err(CircuitError::invalid_node(
                        throw_b,
                        format!("'{}' needs three distinct terminals", component.name),
                    ));
                }
                for (throw, conducts_when) in [(component.tail, false), (throw_b, true)] {
                    new_branches.push(Branch {
                        component: id,
                        head: component.head,
                        tail: throw,
                        gate: switch.map(|s| SwitchGate {
                            switch: s,
                            conducts_when,
                        }),
                    });
                }
            }
            _ => new_branches.push(Branch {
                component: id,
                head: component.head,
                tail: component.tail,
                gate: None,
            }),
        }

        for branch in &new_branches {
            if let Some((_, existing)) = self.branch_between(branch.head, branch.tail) {
                return Err(CircuitError::OccupiedPair {
                    a: branch.head,
                    b: branch.tail,
                    existing: self.components[existing.component].name.clone(),
                });
            }
        }

        for branch in new_branches {
            let key = pair_key(branch.head, branch.tail);
            self.adjacency.insert(key, self.branches.len());
            self.branches.push(branch);
        }

        match component.component_type {
            ComponentType::Switch { initially_closed } => self.switches.push(SwitchInfo {
                component: id,
                initial_state: initially_closed,
                events: Vec::new(),
            }),
            ComponentType::SpdtSwitch { initially_b, .. } => self.switches.push(SwitchInfo {
                component: id,
                initial_state: initially_b,
                events: Vec::new(),
            }),
            _ => {}
        }

        debug!(
            "Added {} between nodes {} and {}",
            component.name, component.head, component.tail
        );
        self.components.push(component);
        Ok(id)
    }

    fn add_generated(&mut self, component_type: ComponentType, head: NodeId, tail: NodeId) -> Result<ComponentId> {
        if self.phase != Phase::Building {
            return Err(CircuitError::phase_violation(format!(
                "add {}",
                component_type.label().to_lowercase()
            )));
        }
        let name = self.next_name(component_type.prefix());
        self.add_component(Component::new(name, component_type, head, tail))
    }

    pub fn add_resistor(&mut self, resistance: f64, i: NodeId, j: NodeId) -> Result<ComponentId> {
        self.add_generated(ComponentType::Resistor { resistance }, i, j)
    }

    pub fn add_capacitor(&mut self, capacitance: f64, i: NodeId, j: NodeId) -> Result<ComponentId> {
        self.add_generated(ComponentType::Capacitor { capacitance }, i, j)
    }

    pub fn add_inductor(&mut self, inductance: f64, i: NodeId, j: NodeId) -> Result<ComponentId> {
        self.add_generated(ComponentType::Inductor { inductance }, i, j)
    }

    /// `v(head) - v(tail) = voltage`
    pub fn add_voltage_source(&mut self, voltage: f64, head: NodeId, tail: NodeId) -> Result<ComponentId> {
        self.add_generated(ComponentType::VoltageSource { voltage }, head, tail)
    }

    /// `v(head) - v(tail) = gain * (v(sense_plus) - v(sense_minus))`
    pub fn add_dependent_voltage_source(
        &mut self,
        gain: f64,
        head: NodeId,
        tail: NodeId,
        sense_plus: NodeId,
        sense_minus: NodeId,
    ) -> Result<ComponentId> {
        self.add_generated(
            ComponentType::DependentVoltageSource {
                gain,
                sense_plus,
                sense_minus,
            },
            head,
            tail,
        )
    }

    /// `current` flows through the source from head to tail
    pub fn add_current_source(&mut self, current: f64, head: NodeId, tail: NodeId) -> Result<ComponentId> {
        self.add_generated(ComponentType::CurrentSource { current }, head, tail)
    }

    pub fn add_wire(&mut self, i: NodeId, j: NodeId) -> Result<ComponentId> {
        self.add_generated(ComponentType::Wire, i, j)
    }

    /// Add a single-pole switch and return its switch index
    pub fn add_switch(&mut self, i: NodeId, j: NodeId, closed: bool) -> Result<SwitchId> {
        self.add_generated(
            ComponentType::Switch {
                initially_closed: closed,
            },
            i,
            j,
        )?;
        Ok(self.switches.len() - 1)
    }

    /// Add an SPDT switch and return its switch index.
    ///
    /// State `false` connects `pole` to `throw_a`, `true` connects it to
    /// `throw_b`.
    pub fn add_spdt_switch(
        &mut self,
        pole: NodeId,
        throw_a: NodeId,
        throw_b: NodeId,
        initially_b: bool,
    ) -> Result<SwitchId> {
        self.add_generated(
            ComponentType::SpdtSwitch {
                throw_b,
                initially_b,
            },
            pole,
            throw_a,
        )?;
        Ok(self.switches.len() - 1)
    }

    /// Append toggle instants to a switch. Allowed in either phase.
    pub fn add_switch_events(&mut self, switch: SwitchId, events: &[f64]) -> Result<()> {
        let count = self.switches.len();
        let info = self
            .switches
            .get_mut(switch)
            .ok_or(CircuitError::UnknownSwitch {
                index: switch,
                count,
            })?;

        if let Some(bad) = events.iter().find(|t| !t.is_finite()) {
            return Err(CircuitError::invalid_parameter(
                format!("switch {}", switch),
                format!("event time must be finite, got {}", bad),
            ));
        }

        info.events.extend_from_slice(events);
        info.events.sort_by(|a, b| a.total_cmp(b));
        Ok(())
    }

    /// Move to the analyzing phase. Idempotent.
    pub(crate) fn begin_analysis(&mut self) {
        if self.phase == Phase::Building {
            info!(
                "Circuit '{}' frozen for analysis: {} nodes, {} components",
                self.title,
                self.node_count,
                self.components.len()
            );
            self.phase = Phase::Analyzing;
        }
    }

    /// Non-ground nodes that no component touches
    pub fn unconnected_nodes(&self) -> Vec<NodeId> {
        let mut touched = vec![false; self.node_count];
        for component in &self.components {
            for node in component.nodes() {
                touched[node] = true;
            }
        }
        (0..self.node_count)
            .filter(|&n| n != self.ground && !touched[n])
            .collect()
    }

    /// Print circuit summary
    pub fn print_summary(&self) {
        println!("Circuit: {}", self.title);
        println!("Nodes: {}", self.node_count);
        println!("Ground node: {}", self.ground);
        println!("Components: {}", self.components.len());

        let mut type_counts = BTreeMap::new();
        for component in &self.components {
            *type_counts.entry(component.component_type.label()).or_insert(0) += 1;
        }
        for (type_name, count) in type_counts {
            println!("  {}: {}", type_name, count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_building() {
        let mut circuit = Circuit::new(3, 0).unwrap();
        let r = circuit.add_resistor(1000.0, 1, 2).unwrap();
        let v = circuit.add_voltage_source(5.0, 1, 0).unwrap();

        assert_eq!(circuit.components().len(), 2);
        assert_eq!(circuit.component(r).unwrap().name, "R1");
        assert_eq!(circuit.component(v).unwrap().name, "V1");
        assert_eq!(circuit.phase(), Phase::Building);
    }

    #[test]
    fn test_lookup_is_symmetric() {
        let mut circuit = Circuit::new(3, 0).unwrap();
        circuit.add_resistor(10.0, 2, 1).unwrap();

        let forward = circuit.lookup(1, 2).unwrap();
        let backward = circuit.lookup(2, 1).unwrap();
        assert_eq!(forward, backward);
        assert!(circuit.lookup(0, 1).is_none());
    }

    #[test]
    fn test_occupied_pair_rejected() {
        let mut circuit = Circuit::new(3, 0).unwrap();
        circuit.add_resistor(10.0, 1, 2).unwrap();
        let err = circuit.add_capacitor(1.0, 2, 1).unwrap_err();
        assert!(matches!(err, CircuitError::OccupiedPair { .. }));
    }

    #[test]
    fn test_invalid_nodes_rejected() {
        assert!(Circuit::new(2, 2).is_err());

        let mut circuit = Circuit::new(2, 0).unwrap();
        assert!(matches!(
            circuit.add_resistor(1.0, 0, 5),
            Err(CircuitError::InvalidNode { node: 5, .. })
        ));
        assert!(matches!(
            circuit.add_wire(1, 1),
            Err(CircuitError::InvalidNode { .. })
        ));
        assert!(circuit.components().is_empty());
    }

    #[test]
    fn test_add_after_analysis_fails() {
        let mut circuit = Circuit::new(2, 0).unwrap();
        circuit.add_resistor(1.0, 0, 1).unwrap();
        circuit.begin_analysis();

        let err = circuit.add_resistor(2.0, 0, 1).unwrap_err();
        assert!(matches!(err, CircuitError::PhaseViolation { .. }));
        assert_eq!(circuit.components().len(), 1);
    }

    #[test]
    fn test_spdt_occupies_both_pairs() {
        let mut circuit = Circuit::new(4, 0).unwrap();
        let s = circuit.add_spdt_switch(1, 2, 3, false).unwrap();
        assert_eq!(s, 0);
        assert_eq!(circuit.branches().len(), 2);
        assert!(circuit.lookup(1, 2).is_some());
        assert!(circuit.lookup(3, 1).is_some());
        assert!(circuit.lookup(2, 3).is_none());
        assert!(circuit.add_resistor(1.0, 3, 1).is_err());

        let a = circuit.branch_between(1, 2).unwrap().1;
        let b = circuit.branch_between(1, 3).unwrap().1;
        assert!(a.conducts(&[false]));
        assert!(!b.conducts(&[false]));
        assert!(b.conducts(&[true]));

        // Both branches share one component; only the branch gate tells them apart
        assert_eq!(a.component, b.component);
        let kind = &circuit.component(a.component).unwrap().component_type;
        assert!(kind.impedance_at(0.0).is_zero());
    }

    #[test]
    fn test_switch_events_sorted() {
        let mut circuit = Circuit::new(3, 0).unwrap();
        let s = circuit.add_switch(1, 2, true).unwrap();
        circuit.add_switch_events(s, &[2.0, 0.5]).unwrap();
        circuit.add_switch_events(s, &[1.0]).unwrap();
        assert_eq!(circuit.switches()[s].events, vec![0.5, 1.0, 2.0]);

        assert!(matches!(
            circuit.add_switch_events(4, &[1.0]),
            Err(CircuitError::UnknownSwitch { index: 4, count: 1 })
        ));
    }

    #[test]
    fn test_non_finite_events_rejected() {
        let mut circuit = Circuit::new(3, 0).unwrap();
        let s = circuit.add_switch(1, 2, false).unwrap();
        circuit.add_switch_events(s, &[1.0]).unwrap();

        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert!(matches!(
                circuit.add_switch_events(s, &[2.0, bad]),
                Err(CircuitError::InvalidParameter { .. })
            ));
        }
        assert_eq!(circuit.switches()[s].events, vec![1.0]);
    }

    #[test]
    fn test_state_dimension_and_unconnected() {
        let mut circuit = Circuit::new(4, 0).unwrap();
        circuit.add_capacitor(1.0, 1, 0).unwrap();
        circuit.add_inductor(1.0, 1, 2).unwrap();
        circuit.add_capacitor(2.0, 2, 0).unwrap();
        assert_eq!(circuit.state_dimension(), 3);
        assert_eq!(circuit.unconnected_nodes(), vec![3]);
    }
}
