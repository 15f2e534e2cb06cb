use anyhow::{anyhow, bail, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::LevelFilter;

use crate::integrator::{IntegrationMethod, IntegratorConfig};
use crate::output::OutputFormat;
use crate::parser::{parse_value, Analysis};
use crate::simulator::SimulatorConfig;

#[derive(Debug, Clone)]
pub struct CliArgs {
    pub input_file: String,
    pub output_file: Option<String>,
    /// Analyses requested on the command line; the netlist's own when empty
    pub analyses: Vec<Analysis>,
    pub output_format: OutputFormat,
    pub verbose_level: u8,
    pub config: SimulatorConfig,
}

pub fn build_cli() -> Command {
    Command::new("linsim")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Linear circuit solver: phasor steady state and switched transients")
        .arg(
            Arg::new("input")
                .help("Input netlist file")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("FILE")
                .help("Output file for simulation results"),
        )
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .value_name("FORMAT")
                .default_value("csv")
                .value_parser(["csv", "json"])
                .help("Output format"),
        )
        .arg(
            Arg::new("op")
                .long("op")
                .action(ArgAction::SetTrue)
                .help("Run a steady-state operating point"),
        )
        .arg(
            Arg::new("tran")
                .long("tran")
                .value_names(["TSTART", "TSTOP"])
                .num_args(2)
                .help("Transient analysis over (TSTART, TSTOP)"),
        )
        .arg(
            Arg::new("method")
                .long("method")
                .value_name("METHOD")
                .value_parser(["dopri", "rk4"])
                .help("Integration method (default dopri)"),
        )
        .arg(
            Arg::new("step")
                .long("step")
                .value_name("H")
                .help("Fixed step for rk4"),
        )
        .arg(
            Arg::new("rtol")
                .long("rtol")
                .value_name("TOL")
                .help("Relative tolerance for dopri"),
        )
        .arg(
            Arg::new("atol")
                .long("atol")
                .value_name("TOL")
                .help("Absolute tolerance for dopri"),
        )
        .arg(
            Arg::new("max-step")
                .long("max-step")
                .value_name("H")
                .help("Largest step dopri may take"),
        )
        .arg(
            Arg::new("checkpoint")
                .long("checkpoint")
                .value_name("T")
                .num_args(1..)
                .action(ArgAction::Append)
                .help("Times the transient run must sample"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .help("Increase verbosity level"),
        )
}

impl CliArgs {
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let input_file = matches
            .get_one::<String>("input")
            .ok_or_else(|| anyhow!("Input file is required"))?
            .clone();

        let output_file = matches.get_one::<String>("output").cloned();
        let verbose_level = matches.get_count("verbose");

        let output_format = matches
            .get_one::<String>("format")
            .map_or(Ok(OutputFormat::Csv), |f| f.parse())?;

        let mut analyses = Vec::new();
        if matches.get_flag("op") {
            analyses.push(Analysis::Operating);
        }
        if let Some(values) = matches.get_many::<String>("tran") {
            let values: Vec<&String> = values.collect();
            if values.len() != 2 {
                bail!("Transient analysis requires exactly 2 parameters: tstart and tstop");
            }
            let tstart = parse_value(values[0])?;
            let tstop = parse_value(values[1])?;
            if !(tstart < tstop) {
                bail!("Invalid time range: tstart must be less than tstop");
            }
            analyses.push(Analysis::Transient { tstart, tstop });
        }

        Ok(CliArgs {
            input_file,
            output_file,
            analyses,
            output_format,
            verbose_level,
            config: simulator_config(matches)?,
        })
    }

    pub fn log_level(&self) -> LevelFilter {
        match self.verbose_level {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

fn optional_value(matches: &ArgMatches, name: &str) -> Result<Option<f64>> {
    matches
        .get_one::<String>(name)
        .map(|v| parse_value(v))
        .transpose()
        .map_err(|e| anyhow!("--{}: {}", name, e))
}

fn simulator_config(matches: &ArgMatches) -> Result<SimulatorConfig> {
    let mut integrator = IntegratorConfig::default();

    let step = optional_value(matches, "step")?;
    match matches.get_one::<String>("method").map(String::as_str) {
        Some("rk4") => {
            let step = step.ok_or_else(|| anyhow!("--method rk4 needs --step"))?;
            integrator.method = IntegrationMethod::Rk4 { step };
        }
        _ if step.is_some() => bail!("--step only applies to --method rk4"),
        _ => {}
    }
    if let Some(rtol) = optional_value(matches, "rtol")? {
        integrator.rtol = rtol;
    }
    if let Some(atol) = optional_value(matches, "atol")? {
        integrator.atol = atol;
    }
    if let Some(max_step) = optional_value(matches, "max-step")? {
        integrator.max_step = max_step;
    }
    integrator.validate()?;

    let checkpoints = match matches.get_many::<String>("checkpoint") {
        Some(values) => values.map(|v| parse_value(v)).collect::<Result<Vec<_>>>()?,
        None => Vec::new(),
    };

    Ok(SimulatorConfig {
        integrator,
        checkpoints,
        ..SimulatorConfig::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(argv: &[&str]) -> Result<CliArgs> {
        let matches = build_cli().try_get_matches_from(argv)?;
        CliArgs::from_matches(&matches)
    }

    #[test]
    fn test_defaults() {
        let parsed = args(&["linsim", "circuit.net"]).unwrap();
        assert_eq!(parsed.input_file, "circuit.net");
        assert_eq!(parsed.output_format, OutputFormat::Csv);
        assert!(parsed.analyses.is_empty());
        assert_eq!(parsed.config.integrator, IntegratorConfig::default());
        assert_eq!(parsed.log_level(), LevelFilter::Warn);
    }

    #[test]
    fn test_analyses_and_overrides() {
        let parsed = args(&[
            "linsim", "rc.net", "--op", "--tran", "0", "5ms", "--rtol", "1e-8", "--max-step", "10u",
            "--checkpoint", "1m", "2m", "-vv", "-f", "json", "-o", "out.json",
        ])
        .unwrap();
        assert_eq!(
            parsed.analyses,
            vec![
                Analysis::Operating,
                Analysis::Transient {
                    tstart: 0.0,
                    tstop: 5e-3
                }
            ]
        );
        assert_eq!(parsed.config.integrator.rtol, 1e-8);
        assert!((parsed.config.integrator.max_step - 1e-5).abs() < 1e-18);
        assert_eq!(parsed.config.checkpoints.len(), 2);
        assert_eq!(parsed.output_format, OutputFormat::Json);
        assert_eq!(parsed.output_file.as_deref(), Some("out.json"));
        assert_eq!(parsed.log_level(), LevelFilter::Debug);
    }

    #[test]
    fn test_rk4_needs_step() {
        assert!(args(&["linsim", "x.net", "--method", "rk4"]).is_err());
        assert!(args(&["linsim", "x.net", "--step", "1m"]).is_err());

        let parsed = args(&["linsim", "x.net", "--method", "rk4", "--step", "1m"]).unwrap();
        assert_eq!(parsed.config.integrator.method, IntegrationMethod::Rk4 { step: 1e-3 });
    }

    #[test]
    fn test_invalid_values() {
        assert!(args(&["linsim", "x.net", "--tran", "5", "1"]).is_err());
        assert!(args(&["linsim", "x.net", "--rtol", "fast"]).is_err());
        assert!(args(&["linsim", "x.net", "--rtol", "-1"]).is_err());
    }
}
