use log::{debug, trace};
use nalgebra::{ComplexField, DMatrix, DVector};
use num_complex::Complex64;
use sprs::{CsMat, TriMat};

use crate::circuit::{BranchId, Circuit, NodeId};
use crate::component::{Component, ComponentId, ComponentType, Impedance};
use crate::error::{CircuitError, Result};
use crate::supernode::SuperNodes;

/// Scalar usable in the nodal equations: `f64` for transients,
/// `Complex64` for phasors
pub trait Scalar: ComplexField<RealField = f64> + Copy {}

impl<T: ComplexField<RealField = f64> + Copy> Scalar for T {}

/// Where a constraint or injection takes its value from
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Excitation<T> {
    Fixed(T),
    /// Entry of the reactive state vector
    State(usize),
}

/// Sense nodes and gain of a dependent voltage source
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sense {
    pub plus: NodeId,
    pub minus: NodeId,
    pub gain: f64,
}

/// How a branch enters the nodal equations
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Role<T> {
    /// `v(head) - v(tail) - gain * (v(s+) - v(s-)) = value`
    Constraint {
        value: Excitation<T>,
        sense: Option<Sense>,
    },
    /// Branch current `y * (v(head) - v(tail))`
    Admittance(T),
    /// Branch current given, flowing head to tail
    Injection(Excitation<T>),
    /// No current, no equation
    Open,
}

impl<T> Role<T> {
    pub fn is_constraint(&self) -> bool {
        matches!(self, Role::Constraint { .. })
    }
}

/// Role of a branch in phasor analysis at angular frequency `omega`
pub fn steady_role(component: &Component, conducts: bool, omega: f64) -> Role<Complex64> {
    let kind = &component.component_type;
    if kind.is_ideal_voltage_constraint() {
        let (value, sense) = match *kind {
            ComponentType::VoltageSource { voltage } => (voltage, None),
            ComponentType::DependentVoltageSource {
                gain,
                sense_plus,
                sense_minus,
            } => (
                0.0,
                Some(Sense {
                    plus: sense_plus,
                    minus: sense_minus,
                    gain,
                }),
            ),
            _ => (0.0, None),
        };
        return Role::Constraint {
            value: Excitation::Fixed(Complex64::new(value, 0.0)),
            sense,
        };
    }
    if let ComponentType::CurrentSource { current } = *kind {
        return Role::Injection(Excitation::Fixed(Complex64::new(current, 0.0)));
    }
    if kind.is_switch() {
        return if conducts { short() } else { Role::Open };
    }

    match kind.impedance_at(omega) {
        Impedance::Infinite => Role::Open,
        impedance => match impedance.admittance() {
            Some(y) => Role::Admittance(y),
            None => short(),
        },
    }
}

/// Role of a branch in the transient state-space reduction.
///
/// `state` is the component's slot in the reactive state vector.
pub fn transient_role(component: &Component, conducts: bool, state: Option<usize>) -> Result<Role<f64>> {
    let missing_state = || {
        CircuitError::invalid_parameter(&component.name, "reactive element has no state slot")
    };
    let role = match component.component_type {
        ComponentType::Resistor { resistance } => Role::Admittance(1.0 / resistance),
        ComponentType::Capacitor { .. } => Role::Constraint {
            value: Excitation::State(state.ok_or_else(missing_state)?),
            sense: None,
        },
        ComponentType::Inductor { .. } => {
            Role::Injection(Excitation::State(state.ok_or_else(missing_state)?))
        }
        ComponentType::VoltageSource { voltage } => Role::Constraint {
            value: Excitation::Fixed(voltage),
            sense: None,
        },
        ComponentType::DependentVoltageSource {
            gain,
            sense_plus,
            sense_minus,
        } => Role::Constraint {
            value: Excitation::Fixed(0.0),
            sense: Some(Sense {
                plus: sense_plus,
                minus: sense_minus,
                gain,
            }),
        },
        ComponentType::CurrentSource { current } => Role::Injection(Excitation::Fixed(current)),
        ComponentType::Wire => short(),
        ComponentType::Switch { .. } | ComponentType::SpdtSwitch { .. } => {
            if conducts {
                short()
            } else {
                Role::Open
            }
        }
    };
    Ok(role)
}

fn short<T: Scalar>() -> Role<T> {
    Role::Constraint {
        value: Excitation::Fixed(T::from_real(0.0)),
        sense: None,
    }
}

/// Slot of every component in the state vector: capacitors in registration
/// order, then inductors
pub fn state_layout(circuit: &Circuit) -> Vec<Option<usize>> {
    let mut layout = vec![None; circuit.components().len()];
    let reactive = circuit.capacitors().into_iter().chain(circuit.inductors());
    for (slot, id) in reactive.enumerate() {
        layout[id] = Some(slot);
    }
    layout
}

/// One branch with its role
#[derive(Debug, Clone, PartialEq)]
pub struct Stamp<T> {
    pub branch: BranchId,
    pub element: String,
    pub head: NodeId,
    pub tail: NodeId,
    pub role: Role<T>,
}

/// Nodal equations of one topology, kept as classified branches.
///
/// The augmented system is laid out as
/// `[constraint rows; aggregated KCL rows; ground row]` against the full
/// node-voltage vector, which makes it square exactly when the constraint
/// links form a forest.
#[derive(Debug, Clone)]
pub struct MnaSystem<T> {
    pub node_count: usize,
    pub ground: NodeId,
    pub stamps: Vec<Stamp<T>>,
    constraints: Vec<usize>,
    injections: Vec<usize>,
    partition: SuperNodes,
    kcl_row: Vec<Option<usize>>,
}

impl<T: Scalar> MnaSystem<T> {
    /// Classify every branch with `role` and partition the nodes into
    /// super-nodes. Fails on a loop of ideal voltage constraints.
    pub fn assemble<F>(circuit: &Circuit, switch_states: &[bool], mut role: F) -> Result<Self>
    where
        F: FnMut(ComponentId, &Component, bool) -> Result<Role<T>>,
    {
        let mut stamps = Vec::with_capacity(circuit.branches().len());
        for (id, branch) in circuit.branches().iter().enumerate() {
            let component = circuit
                .component(branch.component)
                .ok_or_else(|| CircuitError::singular(format!("branch {} has no component", id)))?;
            stamps.push(Stamp {
                branch: id,
                element: component.name.clone(),
                head: branch.head,
                tail: branch.tail,
                role: role(branch.component, component, branch.conducts(switch_states))?,
            });
        }

        let constraints: Vec<usize> = (0..stamps.len())
            .filter(|&i| stamps[i].role.is_constraint())
            .collect();
        let injections: Vec<usize> = (0..stamps.len())
            .filter(|&i| matches!(stamps[i].role, Role::Injection(_)))
            .collect();

        let links: Vec<(NodeId, NodeId)> = constraints
            .iter()
            .map(|&i| (stamps[i].head, stamps[i].tail))
            .collect();
        let (partition, redundant) = SuperNodes::from_links(circuit.node_count(), &links);
        if let Some(&first) = redundant.first() {
            let stamp = &stamps[constraints[first]];
            return Err(CircuitError::singular(format!(
                "voltage loop closed by '{}' between nodes {} and {}",
                stamp.element, stamp.head, stamp.tail
            )));
        }

        let ground_group = partition.group_of(circuit.ground());
        let mut kcl_row = vec![None; partition.len()];
        let mut next = 0;
        for (group, slot) in kcl_row.iter_mut().enumerate() {
            if group != ground_group {
                *slot = Some(next);
                next += 1;
            }
        }

        debug!(
            "Assembled {} branches: {} constraints, {} injections, {} super-nodes",
            stamps.len(),
            constraints.len(),
            injections.len(),
            partition.len()
        );

        Ok(MnaSystem {
            node_count: circuit.node_count(),
            ground: circuit.ground(),
            stamps,
            constraints,
            injections,
            partition,
            kcl_row,
        })
    }

    pub fn partition(&self) -> &SuperNodes {
        &self.partition
    }

    pub fn constraints(&self) -> impl Iterator<Item = &Stamp<T>> {
        self.constraints.iter().map(move |&i| &self.stamps[i])
    }

    pub fn injections(&self) -> impl Iterator<Item = &Stamp<T>> {
        self.injections.iter().map(move |&i| &self.stamps[i])
    }

    pub fn constraint_count(&self) -> usize {
        self.constraints.len()
    }

    pub fn injection_count(&self) -> usize {
        self.injections.len()
    }

    /// Node pairs of the constraint links, in constraint order
    pub fn constraint_links(&self) -> Vec<(NodeId, NodeId)> {
        self.constraints().map(|s| (s.head, s.tail)).collect()
    }

    /// Constraint links that force equal potentials
    pub fn short_links(&self) -> Vec<(NodeId, NodeId)> {
        let zero = T::from_real(0.0);
        self.constraints()
            .filter(|s| {
                matches!(
                    s.role,
                    Role::Constraint {
                        value: Excitation::Fixed(v),
                        sense: None,
                    } if v == zero
                )
            })
            .map(|s| (s.head, s.tail))
            .collect()
    }

    fn kcl_row_of(&self, node: NodeId) -> Option<usize> {
        self.kcl_row[self.partition.group_of(node)]
    }

    /// Square matrix of the augmented nodal system
    pub fn augmented_matrix(&self) -> DMatrix<T> {
        let n = self.node_count;
        let k = self.constraints.len();
        let one = T::from_real(1.0);
        let mut matrix = DMatrix::from_element(n, n, T::from_real(0.0));

        for (row, stamp) in self.constraints().enumerate() {
            matrix[(row, stamp.head)] += one;
            matrix[(row, stamp.tail)] -= one;
            if let Role::Constraint {
                sense: Some(sense), ..
            } = stamp.role
            {
                let gain = T::from_real(sense.gain);
                matrix[(row, sense.plus)] -= gain;
                matrix[(row, sense.minus)] += gain;
            }
        }

        for (value, (row, col)) in self.kcl_rows().iter() {
            matrix[(k + row, col)] += *value;
        }

        matrix[(n - 1, self.ground)] = one;
        trace!("Augmented nodal matrix:\n{}", matrix);
        matrix
    }

    /// Aggregated KCL rows, one per super-node without ground: admittance
    /// currents leaving the super-node. Branches internal to a super-node
    /// are skipped.
    pub fn kcl_rows(&self) -> CsMat<T> {
        let rows = self.partition.len().saturating_sub(1);
        let mut triplets = TriMat::new((rows, self.node_count));
        for stamp in &self.stamps {
            let y = match stamp.role {
                Role::Admittance(y) => y,
                _ => continue,
            };
            if self.partition.same(stamp.head, stamp.tail) {
                continue;
            }
            if let Some(row) = self.kcl_row_of(stamp.head) {
                triplets.add_triplet(row, stamp.head, y);
                triplets.add_triplet(row, stamp.tail, -y);
            }
            if let Some(row) = self.kcl_row_of(stamp.tail) {
                triplets.add_triplet(row, stamp.tail, y);
                triplets.add_triplet(row, stamp.head, -y);
            }
        }
        triplets.to_csr()
    }

    /// Input map of the constraint values (`n x constraints`)
    pub fn constraint_input(&self) -> DMatrix<T> {
        let mut input = DMatrix::from_element(self.node_count, self.constraints.len(), T::from_real(0.0));
        for row in 0..self.constraints.len() {
            input[(row, row)] = T::from_real(1.0);
        }
        input
    }

    /// Input map of the injected currents (`n x injections`)
    pub fn injection_input(&self) -> DMatrix<T> {
        let k = self.constraints.len();
        let one = T::from_real(1.0);
        let mut input = DMatrix::from_element(self.node_count, self.injections.len(), T::from_real(0.0));
        for (col, stamp) in self.injections().enumerate() {
            // Current leaves the head's super-node and enters the tail's
            if let Some(row) = self.kcl_row_of(stamp.head) {
                input[(k + row, col)] -= one;
            }
            if let Some(row) = self.kcl_row_of(stamp.tail) {
                input[(k + row, col)] += one;
            }
        }
        input
    }

    /// Full admittance Laplacian, internal branches included
    pub fn laplacian(&self) -> CsMat<T> {
        let mut triplets = TriMat::new((self.node_count, self.node_count));
        for stamp in &self.stamps {
            if let Role::Admittance(y) = stamp.role {
                triplets.add_triplet(stamp.head, stamp.head, y);
                triplets.add_triplet(stamp.tail, stamp.tail, y);
                triplets.add_triplet(stamp.head, stamp.tail, -y);
                triplets.add_triplet(stamp.tail, stamp.head, -y);
            }
        }
        triplets.to_csr()
    }

    /// Incidence of the injections: +1 at the head, -1 at the tail
    pub fn incidence(&self) -> DMatrix<T> {
        let one = T::from_real(1.0);
        let mut incidence = DMatrix::from_element(self.node_count, self.injections.len(), T::from_real(0.0));
        for (col, stamp) in self.injections().enumerate() {
            incidence[(stamp.head, col)] += one;
            incidence[(stamp.tail, col)] -= one;
        }
        incidence
    }

    /// For every node, the node whose potential it must share exactly:
    /// ground for anything shorted to ground, otherwise the lowest node of
    /// its shorted group
    pub fn short_representatives(&self) -> Vec<NodeId> {
        let (shorts, _) = SuperNodes::from_links(self.node_count, &self.short_links());
        shorts.representatives(self.ground)
    }
}

impl MnaSystem<Complex64> {
    /// Phasor analysis system at the circuit's frequency, switches at their
    /// initial positions
    pub fn assemble_steady(circuit: &Circuit, omega: f64) -> Result<Self> {
        let states: Vec<bool> = circuit.switches().iter().map(|s| s.initial_state).collect();
        Self::assemble(circuit, &states, |_, component, conducts| {
            Ok(steady_role(component, conducts, omega))
        })
    }

    /// Right-hand side for fixed excitations
    pub fn fixed_rhs(&self) -> Result<DVector<Complex64>> {
        let fixed = |stamp: &Stamp<Complex64>| match stamp.role {
            Role::Constraint {
                value: Excitation::Fixed(v),
                ..
            }
            | Role::Injection(Excitation::Fixed(v)) => Ok(v),
            _ => Err(CircuitError::invalid_parameter(
                &stamp.element,
                "excitation is not a fixed value",
            )),
        };
        let values = self.constraints().map(fixed).collect::<Result<Vec<_>>>()?;
        let currents = self.injections().map(fixed).collect::<Result<Vec<_>>>()?;
        Ok(self.constraint_input() * DVector::from_vec(values)
            + self.injection_input() * DVector::from_vec(currents))
    }
}

impl MnaSystem<f64> {
    /// State-space system for the given switch positions
    pub fn assemble_transient(circuit: &Circuit, switch_states: &[bool]) -> Result<Self> {
        let layout = state_layout(circuit);
        Self::assemble(circuit, switch_states, |id, component, conducts| {
            transient_role(component, conducts, layout[id])
        })
    }
}

/// Convert a sparse matrix to dense
pub fn sparse_to_dense<T: Scalar>(sparse: &CsMat<T>) -> DMatrix<T> {
    let mut dense = DMatrix::from_element(sparse.rows(), sparse.cols(), T::from_real(0.0));
    for (value, (row, col)) in sparse.iter() {
        dense[(row, col)] += *value;
    }
    dense
}

/// Sparse times dense product
pub fn sparse_mul<T: Scalar>(sparse: &CsMat<T>, dense: &DMatrix<T>) -> DMatrix<T> {
    let mut result = DMatrix::from_element(sparse.rows(), dense.ncols(), T::from_real(0.0));
    for (value, (row, col)) in sparse.iter() {
        for j in 0..dense.ncols() {
            result[(row, j)] += *value * dense[(col, j)];
        }
    }
    result
}

/// Sparse matrix-vector multiplication
pub fn sparse_mul_vector<T: Scalar>(sparse: &CsMat<T>, vector: &DVector<T>) -> DVector<T> {
    let mut result = DVector::from_element(sparse.rows(), T::from_real(0.0));
    for (value, (row, col)) in sparse.iter() {
        result[row] += *value * vector[col];
    }
    result
}
