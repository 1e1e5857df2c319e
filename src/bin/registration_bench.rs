//! Registration test bench
//!
//! Loads a sub-map collection from a container file, perturbs the
//! reading sub-map over the configured disturbance grid, solves each
//! registration and reports the remaining pose errors.
//!
//! Exit codes: 0 when every disturbance solved, 2 when some solves were
//! reported non-usable, 64 when a required parameter is missing.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::ExitCode;
use submap3d::harness::{
    register_submap_pair, DisturbanceRanges, RegistrationHarnessOptions, SweepReport,
};
use submap3d::registration::RegistrationCostOptions;
use submap3d::{container, SolverOptions, SubmapConfig};

/// Exit code for missing or invalid required parameters (EX_USAGE)
const EXIT_USAGE: u8 = 64;
/// Exit code when some solves were reported non-usable
const EXIT_NOT_USABLE: u8 = 2;

#[derive(Parser)]
#[command(name = "registration_bench")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Perturb-and-solve probe for sub-map registration", long_about = None)]
struct Cli {
    /// Input sub-map container file
    #[arg(long)]
    submap_collection_file_path: Option<PathBuf>,

    /// Id of the fixed reference sub-map
    #[arg(long)]
    reference_submap_id: Option<u32>,

    /// Id of the perturbed reading sub-map; equal to the reference id
    /// duplicates the reference
    #[arg(long)]
    reading_submap_id: Option<u32>,

    /// Disturbance sweep values per axis, comma separated
    #[arg(long, value_delimiter = ',', default_value = "0")]
    test_range_x: Vec<f64>,
    #[arg(long, value_delimiter = ',', default_value = "0")]
    test_range_y: Vec<f64>,
    #[arg(long, value_delimiter = ',', default_value = "0")]
    test_range_z: Vec<f64>,
    #[arg(long, value_delimiter = ',', default_value = "0")]
    test_range_yaw: Vec<f64>,
    #[arg(long, value_delimiter = ',', default_value = "0")]
    test_range_pitch: Vec<f64>,
    #[arg(long, value_delimiter = ',', default_value = "0")]
    test_range_roll: Vec<f64>,

    /// JSON file overriding the submap_registration defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Solver report style: brief, full or none
    #[arg(long, default_value = "brief")]
    report: String,

    /// Append per-disturbance results to a CSV file
    #[arg(long)]
    log_csv: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    submap_registration: RegistrationSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RegistrationSection {
    param: ParamSection,
    solver: SolverOptions,
    cost: RegistrationCostOptions,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ParamSection {
    optimize_yaw: bool,
}

impl Default for ParamSection {
    fn default() -> Self {
        Self { optimize_yaw: true }
    }
}

fn missing(name: &str) -> ExitCode {
    eprintln!("Parameter {name} must be set");
    ExitCode::from(EXIT_USAGE)
}

fn write_csv(path: &PathBuf, report: &SweepReport) -> std::io::Result<()> {
    use std::io::Write;
    let mut file = std::fs::File::create(path)?;
    writeln!(file, "reference_submap_id, reading_submap_id")?;
    writeln!(
        file,
        "{}, {}",
        report.reference_submap_id, report.reading_submap_id
    )?;
    writeln!(
        file,
        "x_disturbance, y_disturbance, z_disturbance, yaw_disturbance, \
         x_error, y_error, z_error, yaw_error, solve_time"
    )?;
    for record in &report.records {
        if record.usable {
            writeln!(
                file,
                "{}, {}, {}, {}, {}, {}, {}, {}, {}",
                record.disturbance.x,
                record.disturbance.y,
                record.disturbance.z,
                record.disturbance.yaw,
                record.position_error.x,
                record.position_error.y,
                record.position_error.z,
                record.yaw_error,
                record.solve_time.as_secs_f64()
            )?;
        } else {
            writeln!(
                file,
                "{}, {}, {}, {}, X, X, X, X, X",
                record.disturbance.x,
                record.disturbance.y,
                record.disturbance.z,
                record.disturbance.yaw
            )?;
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    // Exit code 2 is reserved for non-usable solves, so argument errors
    // map to the usage code instead of clap's default
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e)
            if matches!(
                e.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            ) =>
        {
            print!("{e}");
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            eprint!("{e}");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let Some(collection_path) = cli.submap_collection_file_path.as_ref() else {
        return missing("submap_collection_file_path");
    };
    let Some(reference_submap_id) = cli.reference_submap_id else {
        return missing("reference_submap_id");
    };
    let Some(reading_submap_id) = cli.reading_submap_id else {
        return missing("reading_submap_id");
    };

    let mut options = RegistrationHarnessOptions::default();
    if let Some(config_path) = cli.config.as_ref() {
        let text = match std::fs::read_to_string(config_path) {
            Ok(text) => text,
            Err(e) => {
                eprintln!("Cannot read config file {}: {e}", config_path.display());
                return ExitCode::from(EXIT_USAGE);
            }
        };
        let parsed: ConfigFile = match serde_json::from_str(&text) {
            Ok(parsed) => parsed,
            Err(e) => {
                eprintln!("Cannot parse config file {}: {e}", config_path.display());
                return ExitCode::from(EXIT_USAGE);
            }
        };
        options.solver = parsed.submap_registration.solver;
        options.solver.optimize_yaw = parsed.submap_registration.param.optimize_yaw;
        options.cost = parsed.submap_registration.cost;
    }

    if !matches!(cli.report.as_str(), "brief" | "full" | "none") {
        eprintln!("Parameter report must be \"brief\" (default), \"full\" or \"none\"");
        return ExitCode::from(EXIT_USAGE);
    }

    let (mut collection, _constraints) =
        match container::load_from_file(collection_path, &SubmapConfig::default()) {
            Ok(loaded) => loaded,
            Err(e) => {
                eprintln!("Cannot load {}: {e}", collection_path.display());
                return ExitCode::FAILURE;
            }
        };
    println!(
        "Loaded {} sub-maps from {}",
        collection.len(),
        collection_path.display()
    );

    let ranges = DisturbanceRanges {
        x: cli.test_range_x,
        y: cli.test_range_y,
        z: cli.test_range_z,
        yaw: cli.test_range_yaw,
        pitch: cli.test_range_pitch,
        roll: cli.test_range_roll,
    };

    let report = match register_submap_pair(
        &mut collection,
        reference_submap_id,
        reading_submap_id,
        &ranges,
        &options,
    ) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Registration sweep failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    if cli.report != "none" {
        for (i, record) in report.records.iter().enumerate() {
            println!(
                "-- {i:3} disturbance: x {:8.4}  y {:8.4}  z {:8.4}  yaw {:8.4}",
                record.disturbance.x,
                record.disturbance.y,
                record.disturbance.z,
                record.disturbance.yaw
            );
            if record.usable {
                println!(
                    "-- {i:3} remaining error: x {:9.6}  y {:9.6}  z {:9.6}  yaw {:9.6}  \
                     time {:.4}s",
                    record.position_error.x,
                    record.position_error.y,
                    record.position_error.z,
                    record.yaw_error,
                    record.solve_time.as_secs_f64()
                );
            } else {
                println!("-- {i:3} solver could not find a usable solution");
            }
            if cli.report == "full" {
                println!(
                    "-- {i:3} solver steps: {} in {:.4}s",
                    record.iterations,
                    record.solve_time.as_secs_f64()
                );
            }
        }
    }

    if let Some(csv_path) = cli.log_csv.as_ref() {
        if let Err(e) = write_csv(csv_path, &report) {
            eprintln!("Cannot write CSV log {}: {e}", csv_path.display());
            return ExitCode::FAILURE;
        }
        println!("Results logged to {}", csv_path.display());
    }

    if report.all_usable() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_NOT_USABLE)
    }
}
