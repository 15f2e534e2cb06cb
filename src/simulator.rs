use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use colored::*;
use log::{info, warn};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::circuit::Circuit;
use crate::integrator::IntegratorConfig;
use crate::output::{self, OutputFormat};
use crate::parser::{Analysis, Netlist, NetlistParser};
use crate::solver::SolverConfig;
use crate::transient::TransientOptions;

/// Which analysis produced a result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AnalysisKind {
    OperatingPoint { omega: f64 },
    Transient { tstart: f64, tstop: f64 },
}

impl AnalysisKind {
    /// Name of the sample axis
    pub fn axis(&self) -> &'static str {
        match self {
            AnalysisKind::OperatingPoint { .. } => "omega",
            AnalysisKind::Transient { .. } => "time",
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            AnalysisKind::OperatingPoint { .. } => "op",
            AnalysisKind::Transient { .. } => "tran",
        }
    }
}

/// Named trace, one value per sample point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub name: String,
    pub values: Vec<f64>,
}

/// Simulation results container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationResult {
    pub analysis: AnalysisKind,
    pub points: Vec<f64>,
    pub signals: Vec<Signal>,
}

impl SimulationResult {
    pub fn signal(&self, name: &str) -> Option<&Signal> {
        self.signals.iter().find(|s| s.name == name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimulatorConfig {
    pub solver: SolverConfig,
    pub integrator: IntegratorConfig,
    /// Transient runs land on these times exactly
    pub checkpoints: Vec<f64>,
}

/// Netlist-driven simulator: loads a circuit and runs its analyses
#[derive(Debug, Default)]
pub struct Simulator {
    netlist: Option<Netlist>,
    circuit: Option<Circuit>,
    results: Vec<SimulationResult>,
    config: SimulatorConfig,
}

impl Simulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: SimulatorConfig) -> Self {
        Simulator {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Load a netlist from file
    pub fn load_netlist(&mut self, filename: &str) -> Result<()> {
        info!("Loading netlist from: {}", filename);
        let netlist = NetlistParser::new().parse_file(filename)?;
        self.load_netlist_from_parsed(netlist)
    }

    pub fn load_netlist_str(&mut self, content: &str) -> Result<()> {
        let netlist = NetlistParser::new().parse_netlist(content)?;
        self.load_netlist_from_parsed(netlist)
    }

    pub fn load_netlist_from_parsed(&mut self, netlist: Netlist) -> Result<()> {
        let circuit = netlist.build_circuit()?;

        let unconnected = circuit.unconnected_nodes();
        if !unconnected.is_empty() {
            warn!("Nodes {:?} are not connected to any element", unconnected);
        }
        info!(
            "Loaded circuit '{}': {} nodes, {} components, {} switches",
            circuit.title,
            circuit.node_count(),
            circuit.components().len(),
            circuit.switches().len()
        );

        self.netlist = Some(netlist);
        self.circuit = Some(circuit);
        self.results.clear();
        Ok(())
    }

    pub fn circuit(&self) -> Option<&Circuit> {
        self.circuit.as_ref()
    }

    fn circuit_mut(&mut self) -> Result<&mut Circuit> {
        self.circuit.as_mut().ok_or_else(|| anyhow!("No circuit loaded"))
    }

    /// Run the analyses the netlist asks for, or an operating point if it
    /// asks for none
    pub fn run_analyses(&mut self) -> Result<()> {
        let analyses = self
            .netlist
            .as_ref()
            .ok_or_else(|| anyhow!("No circuit loaded"))?
            .analyses
            .clone();

        if analyses.is_empty() {
            return self.run_operating_point();
        }
        for analysis in analyses {
            match analysis {
                Analysis::Operating => self.run_operating_point()?,
                Analysis::Transient { tstart, tstop } => self.run_transient(tstart, tstop)?,
            }
        }
        Ok(())
    }

    /// Steady-state node voltages and element currents at the circuit's
    /// angular frequency
    pub fn run_operating_point(&mut self) -> Result<()> {
        let solver = self.config.solver.clone();
        let circuit = self.circuit_mut()?;
        let omega = circuit.frequency().unwrap_or(0.0);
        info!("Starting operating point analysis at omega = {}", omega);

        let start_time = Instant::now();
        circuit
            .nodal_analysis_with(&solver)
            .context("Nodal analysis failed")?;
        circuit
            .calculate_currents()
            .context("Current calculation failed")?;

        let mut signals = Vec::new();
        for node in 0..circuit.node_count() {
            let voltage = circuit
                .get_voltage(node)
                .ok_or_else(|| anyhow!("Node {} has no solved voltage", node))?;
            push_phasor(&mut signals, format!("V({})", node), voltage, omega);
        }
        for (id, component) in circuit.components().iter().enumerate() {
            if let Some(current) = circuit.element_current(id, component.head, component.tail)? {
                push_phasor(&mut signals, format!("I({})", component.name), current, omega);
            }
        }

        info!(
            "Operating point analysis completed in {:.3}ms",
            start_time.elapsed().as_secs_f64() * 1e3
        );
        self.results.push(SimulationResult {
            analysis: AnalysisKind::OperatingPoint { omega },
            points: vec![omega],
            signals,
        });
        Ok(())
    }

    /// Transient run from an all-zero state
    pub fn run_transient(&mut self, tstart: f64, tstop: f64) -> Result<()> {
        info!("Starting transient analysis over ({}, {})", tstart, tstop);
        let options = TransientOptions {
            integrator: self.config.integrator.clone(),
            solver: self.config.solver.clone(),
            checkpoints: self.config.checkpoints.clone(),
        };
        let circuit = self.circuit_mut()?;

        let start_time = Instant::now();
        let solution = circuit
            .solve_with((tstart, tstop), None, &options)
            .context("Transient analysis failed")?;

        let mut signals = Vec::new();
        for node in 0..circuit.node_count() {
            signals.push(Signal {
                name: format!("V({})", node),
                values: solution.voltages.row(node).iter().copied().collect(),
            });
        }

        let state_names = circuit
            .capacitors()
            .into_iter()
            .map(|id| ("V", id))
            .chain(circuit.inductors().into_iter().map(|id| ("I", id)));
        for (row, (quantity, id)) in state_names.enumerate() {
            let name = circuit
                .component(id)
                .map_or_else(|| id.to_string(), |c| c.name.clone());
            signals.push(Signal {
                name: format!("{}({})", quantity, name),
                values: solution.states.row(row).iter().copied().collect(),
            });
        }

        info!(
            "Transient analysis completed in {:.3}ms: {} samples, {} accepted / {} rejected steps, {} rebuilds",
            start_time.elapsed().as_secs_f64() * 1e3,
            solution.sample_count(),
            solution.stats.accepted,
            solution.stats.rejected,
            solution.rebuilds
        );
        self.results.push(SimulationResult {
            analysis: AnalysisKind::Transient { tstart, tstop },
            points: solution.times,
            signals,
        });
        Ok(())
    }

    pub fn results(&self) -> &[SimulationResult] {
        &self.results
    }

    /// Export simulation results to file
    pub fn export_results(&self, filename: &str, format: OutputFormat) -> Result<Vec<PathBuf>> {
        output::export(&self.results, Path::new(filename), format)
    }

    /// Print simulation summary
    pub fn print_summary(&self) {
        if let Some(circuit) = &self.circuit {
            circuit.print_summary();
        }
        if self.results.is_empty() {
            println!("No simulation results available");
            return;
        }

        for result in &self.results {
            match result.analysis {
                AnalysisKind::OperatingPoint { omega } => {
                    println!("\n{}", format!("=== Operating point (omega = {}) ===", omega).bold());
                }
                AnalysisKind::Transient { tstart, tstop } => {
                    println!("\n{}", format!("=== Transient ({}, {}) ===", tstart, tstop).bold());
                    println!("Samples: {}", result.points.len());
                    println!("Final values:");
                }
            }
            for signal in &result.signals {
                if let Some(value) = signal.values.last() {
                    println!("  {:<16} {:>14.6e}", signal.name.cyan(), value);
                }
            }
        }
    }
}

/// A DC value as one signal; a phasor as its real and imaginary parts
fn push_phasor(signals: &mut Vec<Signal>, name: String, value: Complex64, omega: f64) {
    if omega == 0.0 {
        signals.push(Signal {
            name,
            values: vec![value.re],
        });
    } else {
        signals.push(Signal {
            name: format!("Re({})", name),
            values: vec![value.re],
        });
        signals.push(Signal {
            name: format!("Im({})", name),
            values: vec![value.im],
        });
    }
}
