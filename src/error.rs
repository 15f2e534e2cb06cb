use thiserror::Error;

use crate::circuit::NodeId;

/// Result type alias using [`CircuitError`].
pub type Result<T> = std::result::Result<T, CircuitError>;

/// Errors raised while building, solving or integrating a circuit.
///
/// Each one is terminal for the operation that raised it; nothing retries
/// or substitutes a guessed value.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CircuitError {
    // ============ Building Errors ============
    /// Structural mutation attempted after analysis began
    #[error("Cannot {operation}: circuit is already being analyzed")]
    PhaseViolation { operation: String },

    /// The node pair already holds an element
    #[error("Node pair ({a}, {b}) already holds element '{existing}'")]
    OccupiedPair {
        a: NodeId,
        b: NodeId,
        existing: String,
    },

    /// Node index outside the circuit or otherwise unusable
    #[error("Invalid node reference {node}: {message}")]
    InvalidNode { node: NodeId, message: String },

    /// Element parameter out of range
    #[error("Invalid parameter for '{element}': {message}")]
    InvalidParameter { element: String, message: String },

    /// Switch index that was never registered
    #[error("Unknown switch index {index} (circuit has {count} switches)")]
    UnknownSwitch { index: usize, count: usize },

    // ============ Query Errors ============
    /// A directional query named nodes that are not the element's terminals
    #[error("Nodes ({from}, {to}) are not the terminals of '{element}'")]
    InvalidTerminal {
        element: String,
        from: NodeId,
        to: NodeId,
    },

    // ============ Analysis Errors ============
    /// Nodal or state matrix is not invertible
    #[error("Singular system: {reason}")]
    SingularSystem { reason: String },

    /// KCL back-propagation could not close a node
    #[error(
        "Cannot resolve current at node {node}: voltage loop or insufficient information. \
         Run nodal analysis before calculating currents."
    )]
    UnresolvableCurrent { node: NodeId },

    // ============ Transient Errors ============
    /// Time range is empty, reversed or not finite
    #[error("Invalid time range ({start}, {end})")]
    InvalidTimeRange { start: f64, end: f64 },

    /// Initial state has the wrong length
    #[error("Initial state has {actual} entries, expected {expected}")]
    StateDimension { expected: usize, actual: usize },

    /// The integrator could not make progress
    #[error("Integration failed at t = {time:.6e}: {reason}")]
    IntegrationFailed { time: f64, reason: String },
}

impl CircuitError {
    /// Create a phase violation error
    pub fn phase_violation(operation: impl Into<String>) -> Self {
        Self::PhaseViolation {
            operation: operation.into(),
        }
    }

    /// Create an invalid node error
    pub fn invalid_node(node: NodeId, message: impl Into<String>) -> Self {
        Self::InvalidNode {
            node,
            message: message.into(),
        }
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter(element: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            element: element.into(),
            message: message.into(),
        }
    }

    /// Create a singular system error
    pub fn singular(reason: impl Into<String>) -> Self {
        Self::SingularSystem {
            reason: reason.into(),
        }
    }

    /// Create an integration failure error
    pub fn integration_failed(time: f64, reason: impl Into<String>) -> Self {
        Self::IntegrationFailed {
            time,
            reason: reason.into(),
        }
    }
}
