//! Pose graph test bench
//!
//! Loads a sub-map collection, perturbs every non-constant sub-map
//! pose, builds the full overlap graph and optimizes it, then reports
//! the per-sub-map corrections.

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::process::ExitCode;
use submap3d::registration::RegistrationCostOptions;
use submap3d::{container, InformationMatrix, PoseGraph, SolverOptions, SubmapConfig};

/// Exit code for missing required parameters (EX_USAGE)
const EXIT_USAGE: u8 = 64;

#[derive(Parser)]
#[command(name = "pose_graph_bench")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Perturb a whole collection and optimize its pose graph", long_about = None)]
struct Cli {
    /// Input sub-map container file
    #[arg(long)]
    submap_collection_file_path: Option<PathBuf>,

    /// Uniform bound of the translation noise added per axis, meters
    #[arg(long, default_value = "1.0")]
    noise_amplitude: f64,

    /// RNG seed for reproducible perturbations
    #[arg(long, default_value = "42")]
    seed: u64,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let Some(collection_path) = cli.submap_collection_file_path.as_ref() else {
        eprintln!("Parameter submap_collection_file_path must be set");
        return ExitCode::from(EXIT_USAGE);
    };

    let (mut collection, _constraints) =
        match container::load_from_file(collection_path, &SubmapConfig::default()) {
            Ok(loaded) => loaded,
            Err(e) => {
                eprintln!("Cannot load {}: {e}", collection_path.display());
                return ExitCode::FAILURE;
            }
        };
    let submap_ids = collection.ids();
    println!("Loaded {} sub-maps", submap_ids.len());

    // Perturb every sub-map except the anchor
    let mut rng = StdRng::seed_from_u64(cli.seed);
    let mut truth = std::collections::BTreeMap::new();
    for &submap_id in &submap_ids {
        let pose = collection.get_submap_pose(submap_id).unwrap();
        truth.insert(submap_id, pose);
        if submap_id == 0 {
            continue;
        }
        let mut perturbed = pose;
        for axis in 0..3 {
            perturbed.translation.vector[axis] +=
                rng.gen_range(-cli.noise_amplitude..=cli.noise_amplitude);
        }
        collection.set_submap_pose(submap_id, perturbed).unwrap();
    }

    // The registration costs sample ESDF distances
    for &submap_id in &submap_ids {
        if let Err(e) = collection.generate_esdf_by_id(submap_id) {
            eprintln!("ESDF generation failed for sub-map {submap_id}: {e}");
            return ExitCode::FAILURE;
        }
    }

    let mut graph = PoseGraph::new(RegistrationCostOptions::default());
    println!("Adding all sub-maps as nodes");
    for &submap_id in &submap_ids {
        let pose = collection.get_submap_pose(submap_id).unwrap();
        graph.add_node(submap_id, pose, submap_id == 0);
    }

    println!("Adding a registration constraint per overlapping pair");
    for (first, second) in collection.overlapping_pairs() {
        graph
            .add_constraint(first, second, InformationMatrix::identity())
            .expect("pairs are unique and the identity is positive definite");
    }
    println!("{} constraints", graph.num_constraints());

    if let Err(e) = graph.initialize() {
        eprintln!("Pose graph initialization failed: {e}");
        return ExitCode::FAILURE;
    }

    println!("Optimizing the graph");
    let summary = match graph.optimize(&collection, &SolverOptions::default()) {
        Ok(summary) => summary,
        Err(e) => {
            eprintln!("Optimization failed: {e}");
            return ExitCode::FAILURE;
        }
    };
    println!(
        "cost {:.6e} -> {:.6e} in {} steps ({:.3}s)",
        summary.initial_cost,
        summary.final_cost,
        summary.num_iterations(),
        summary.total_time.as_secs_f64()
    );

    for (submap_id, pose) in graph.submap_poses() {
        collection.set_submap_pose(submap_id, pose).unwrap();
        let error = (pose.translation.vector - truth[&submap_id].translation.vector).norm();
        println!("sub-map {submap_id}: residual translation error {error:.4} m");
    }

    if summary.is_solution_usable() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    }
}
