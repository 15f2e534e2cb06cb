use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::circuit::NodeId;
use crate::error::{CircuitError, Result};

/// Index of a component inside its circuit
pub type ComponentId = usize;

/// Types of circuit components, with their scalar parameters.
///
/// The set is closed: every analysis matches on it exhaustively instead of
/// dispatching through per-kind overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ComponentType {
    Resistor {
        resistance: f64,
    },
    Capacitor {
        capacitance: f64,
    },
    Inductor {
        inductance: f64,
    },
    VoltageSource {
        voltage: f64,
    },
    /// `v(head) - v(tail) = gain * (v(sense_plus) - v(sense_minus))`
    DependentVoltageSource {
        gain: f64,
        sense_plus: NodeId,
        sense_minus: NodeId,
    },
    /// Current flows through the source from head to tail
    CurrentSource {
        current: f64,
    },
    Wire,
    Switch {
        initially_closed: bool,
    },
    /// Pole is the component head, throw A its tail
    SpdtSwitch {
        throw_b: NodeId,
        initially_b: bool,
    },
}

/// Impedance of an element at a fixed angular frequency
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Impedance {
    Finite(Complex64),
    Infinite,
}

impl Impedance {
    pub fn is_zero(&self) -> bool {
        matches!(self, Impedance::Finite(z) if z.norm() == 0.0)
    }

    /// Admittance, or `None` for a zero impedance
    pub fn admittance(&self) -> Option<Complex64> {
        match self {
            Impedance::Infinite => Some(Complex64::new(0.0, 0.0)),
            Impedance::Finite(z) if z.norm() == 0.0 => None,
            Impedance::Finite(z) => Some(z.inv()),
        }
    }
}

impl ComponentType {
    /// Impedance at angular frequency `omega`.
    ///
    /// A capacitor at `omega == 0` is an open circuit and an inductor at
    /// `omega == 0` is a short. Ideal voltage elements are zero impedance,
    /// current sources infinite. A switch reports its initial position.
    ///
    /// An SPDT switch has two branches, so it reports the zero impedance of
    /// the pole-to-selected-throw branch. Which branch conducts is a
    /// per-branch question answered by `Branch::conducts`, and analyses use
    /// that instead of this value for every switch.
    pub fn impedance_at(&self, omega: f64) -> Impedance {
        let zero = Impedance::Finite(Complex64::new(0.0, 0.0));
        match *self {
            ComponentType::Resistor { resistance } => {
                Impedance::Finite(Complex64::new(resistance, 0.0))
            }
            ComponentType::Capacitor { capacitance } => {
                if omega == 0.0 {
                    Impedance::Infinite
                } else {
                    Impedance::Finite(Complex64::new(0.0, omega * capacitance).inv())
                }
            }
            ComponentType::Inductor { inductance } => {
                Impedance::Finite(Complex64::new(0.0, omega * inductance))
            }
            ComponentType::VoltageSource { .. }
            | ComponentType::DependentVoltageSource { .. }
            | ComponentType::Wire => zero,
            ComponentType::CurrentSource { .. } => Impedance::Infinite,
            ComponentType::Switch { initially_closed } => {
                if initially_closed {
                    zero
                } else {
                    Impedance::Infinite
                }
            }
            ComponentType::SpdtSwitch { .. } => zero,
        }
    }

    /// True for elements that pin the voltage across their terminals
    /// regardless of frequency or state
    pub fn is_ideal_voltage_constraint(&self) -> bool {
        matches!(
            self,
            ComponentType::VoltageSource { .. }
                | ComponentType::DependentVoltageSource { .. }
                | ComponentType::Wire
        )
    }

    pub fn is_ideal_current_source(&self) -> bool {
        matches!(self, ComponentType::CurrentSource { .. })
    }

    pub fn is_switch(&self) -> bool {
        matches!(
            self,
            ComponentType::Switch { .. } | ComponentType::SpdtSwitch { .. }
        )
    }

    /// Letter used for generated component names
    pub fn prefix(&self) -> char {
        match self {
            ComponentType::Resistor { .. } => 'R',
            ComponentType::Capacitor { .. } => 'C',
            ComponentType::Inductor { .. } => 'L',
            ComponentType::VoltageSource { .. } => 'V',
            ComponentType::DependentVoltageSource { .. } => 'E',
            ComponentType::CurrentSource { .. } => 'I',
            ComponentType::Wire => 'W',
            ComponentType::Switch { .. } => 'S',
            ComponentType::SpdtSwitch { .. } => 'P',
        }
    }

    /// Human readable kind, used in summaries
    pub fn label(&self) -> &'static str {
        match self {
            ComponentType::Resistor { .. } => "Resistors",
            ComponentType::Capacitor { .. } => "Capacitors",
            ComponentType::Inductor { .. } => "Inductors",
            ComponentType::VoltageSource { .. } => "Voltage Sources",
            ComponentType::DependentVoltageSource { .. } => "Dependent Voltage Sources",
            ComponentType::CurrentSource { .. } => "Current Sources",
            ComponentType::Wire => "Wires",
            ComponentType::Switch { .. } => "Switches",
            ComponentType::SpdtSwitch { .. } => "SPDT Switches",
        }
    }
}

/// Circuit component/element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    pub component_type: ComponentType,
    pub head: NodeId,
    pub tail: NodeId,
}

impl Component {
    pub fn new(
        name: impl Into<String>,
        component_type: ComponentType,
        head: NodeId,
        tail: NodeId,
    ) -> Self {
        Component {
            name: name.into(),
            component_type,
            head,
            tail,
        }
    }

    /// All nodes this component touches, sense nodes included
    pub fn nodes(&self) -> Vec<NodeId> {
        match self.component_type {
            ComponentType::DependentVoltageSource {
                sense_plus,
                sense_minus,
                ..
            } => vec![self.head, self.tail, sense_plus, sense_minus],
            ComponentType::SpdtSwitch { throw_b, .. } => vec![self.head, self.tail, throw_b],
            _ => vec![self.head, self.tail],
        }
    }

    /// Orient a head-to-tail quantity so that it reads from `from` to `to`.
    ///
    /// Fails when the pair is not this component's head and tail (in either
    /// order). For an SPDT switch `to` may be either throw.
    pub fn orient<T>(&self, value: T, from: NodeId, to: NodeId) -> Result<T>
    where
        T: std::ops::Neg<Output = T>,
    {
        let throw_b = match self.component_type {
            ComponentType::SpdtSwitch { throw_b, .. } => Some(throw_b),
            _ => None,
        };
        let is_throw = |node: NodeId| node == self.tail || Some(node) == throw_b;
        if from == self.head && is_throw(to) {
            Ok(value)
        } else if to == self.head && is_throw(from) {
            Ok(-value)
        } else {
            Err(CircuitError::InvalidTerminal {
                element: self.name.clone(),
                from,
                to,
            })
        }
    }

    /// Validate parameter ranges
    pub fn validate(&self) -> Result<()> {
        let positive = |value: f64, what: &str| -> Result<()> {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(CircuitError::invalid_parameter(
                    &self.name,
                    format!("{} must be positive and finite, got {}", what, value),
                ))
            }
        };
        let finite = |value: f64, what: &str| -> Result<()> {
            if value.is_finite() {
                Ok(())
            } else {
                Err(CircuitError::invalid_parameter(
                    &self.name,
                    format!("{} must be finite, got {}", what, value),
                ))
            }
        };

        match self.component_type {
            ComponentType::Resistor { resistance } => positive(resistance, "resistance"),
            ComponentType::Capacitor { capacitance } => positive(capacitance, "capacitance"),
            ComponentType::Inductor { inductance } => positive(inductance, "inductance"),
            ComponentType::VoltageSource { voltage } => finite(voltage, "voltage"),
            ComponentType::DependentVoltageSource { gain, .. } => finite(gain, "gain"),
            ComponentType::CurrentSource { current } => finite(current, "current"),
            ComponentType::Wire | ComponentType::Switch { .. } | ComponentType::SpdtSwitch { .. } => Ok(()),
        }
    }
}
