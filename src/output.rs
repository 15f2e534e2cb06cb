use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use csv::Writer;
use log::info;
use serde::{Deserialize, Serialize};

use crate::simulator::SimulationResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputFormat {
    Csv,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "csv" => Ok(OutputFormat::Csv),
            "json" => Ok(OutputFormat::Json),
            other => bail!("Invalid output format '{}'", other),
        }
    }
}

/// One row per sample point, one column per signal
pub fn write_csv<W: Write>(result: &SimulationResult, writer: W) -> Result<()> {
    let mut writer = Writer::from_writer(writer);

    let mut header = vec![result.analysis.axis().to_string()];
    header.extend(result.signals.iter().map(|s| s.name.clone()));
    writer.write_record(&header)?;

    for (i, point) in result.points.iter().enumerate() {
        let mut record = vec![point.to_string()];
        for signal in &result.signals {
            record.push(signal.values.get(i).map_or_else(String::new, |v| v.to_string()));
        }
        writer.write_record(&record)?;
    }

    writer.flush()?;
    Ok(())
}

pub fn write_json<W: Write>(results: &[SimulationResult], writer: W) -> Result<()> {
    serde_json::to_writer_pretty(writer, results)?;
    Ok(())
}

/// Export results to `path`.
///
/// JSON holds every result in one array. CSV needs one table per analysis,
/// so with several results each goes to `<stem>_<analysis>.csv`.
pub fn export(results: &[SimulationResult], path: &Path, format: OutputFormat) -> Result<Vec<PathBuf>> {
    if results.is_empty() {
        bail!("No simulation results available");
    }

    let mut written = Vec::new();
    match format {
        OutputFormat::Json => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create '{}'", path.display()))?;
            write_json(results, file)?;
            written.push(path.to_path_buf());
        }
        OutputFormat::Csv => {
            for result in results {
                let target = if results.len() == 1 {
                    path.to_path_buf()
                } else {
                    suffixed(path, result.analysis.tag())
                };
                let file = File::create(&target)
                    .with_context(|| format!("Failed to create '{}'", target.display()))?;
                write_csv(result, file)?;
                written.push(target);
            }
        }
    }

    for target in &written {
        info!("Results exported to {:?}: {}", format, target.display());
    }
    Ok(written)
}

fn suffixed(path: &Path, tag: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "results".to_string());
    let file_name = match path.extension() {
        Some(ext) => format!("{}_{}.{}", stem, tag, ext.to_string_lossy()),
        None => format!("{}_{}", stem, tag),
    };
    path.with_file_name(file_name)
}
