use std::path::Path;

use colored::*;
use log::{error, info};

use linsim::cli::{build_cli, CliArgs};
use linsim::parser::NetlistParser;
use linsim::simulator::Simulator;

fn main() {
    let matches = build_cli().get_matches();

    let args = match CliArgs::from_matches(&matches) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}", format!("Error: {:#}", e).red());
            std::process::exit(2);
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(args.log_level().to_string()),
    )
    .init();

    if let Err(e) = run_application(args) {
        error!("{}", format!("Error: {:#}", e).red());
        std::process::exit(1);
    }
}

fn run_application(args: CliArgs) -> anyhow::Result<()> {
    info!("{}", format!("Starting linsim {}", linsim::VERSION).green().bold());
    info!("Input file: {}", args.input_file.bright_blue());

    if !Path::new(&args.input_file).exists() {
        return Err(anyhow::anyhow!("Input file '{}' not found", args.input_file));
    }

    let mut netlist = NetlistParser::new().parse_file(&args.input_file)?;
    if !args.analyses.is_empty() {
        netlist.analyses = args.analyses.clone();
    }

    let mut simulator = Simulator::with_config(args.config.clone());
    simulator.load_netlist_from_parsed(netlist)?;
    simulator.run_analyses()?;

    match &args.output_file {
        Some(output_file) => {
            for path in simulator.export_results(output_file, args.output_format)? {
                println!("{} {}", "Wrote".green(), path.display());
            }
        }
        None => simulator.print_summary(),
    }

    info!("{}", "Simulation completed successfully!".green().bold());
    Ok(())
}
