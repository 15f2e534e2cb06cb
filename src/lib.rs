pub mod circuit;
pub mod cli;
pub mod component;
pub mod error;
pub mod integrator;
pub mod mna;
pub mod output;
pub mod parser;
pub mod scheduler;
pub mod simulator;
pub mod solver;
pub mod state_space;
pub mod steady_state;
pub mod supernode;
pub mod transient;

// Re-export commonly used types
pub use circuit::{Circuit, NodeId, Phase, SwitchId};
pub use component::{Component, ComponentId, ComponentType};
pub use error::{CircuitError, Result};
pub use integrator::{IntegrationMethod, IntegratorConfig};
pub use parser::{Netlist, NetlistParser};
pub use simulator::{SimulationResult, Simulator, SimulatorConfig};
pub use solver::SolverConfig;
pub use state_space::{StateSpaceBuilder, Topology};
pub use steady_state::phasor_to_instant;
pub use transient::{TransientOptions, TransientSolution};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
