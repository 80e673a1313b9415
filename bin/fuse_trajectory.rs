use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use pose_fusion::io::{FusedRecord, G2oWriter, load_corrections, load_measurements};
use pose_fusion::metrics::{ErrorKind, TrajectoryErrors};
use pose_fusion::{
    Anchor, FusionConfig, FusionError, FusionPipeline, OptimizerType, SE3, VoBaseline,
    init_logger,
};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{error, info, warn};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OptimizerArg {
    /// Levenberg-Marquardt
    Lm,
    /// Gauss-Newton
    Gn,
}

impl From<OptimizerArg> for OptimizerType {
    fn from(arg: OptimizerArg) -> Self {
        match arg {
            OptimizerArg::Lm => OptimizerType::LevenbergMarquardt,
            OptimizerArg::Gn => OptimizerType::GaussNewton,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum AnchorArg {
    /// Keep the first VO pose
    Vo,
    /// Pin frame 0 to the first ground-truth pose
    Gt,
}

#[derive(Parser)]
#[command(name = "fuse_trajectory")]
#[command(about = "Fuse a VO trajectory with learned relative-pose corrections")]
struct Args {
    /// VO baseline record (.json) or pose graph (.g2o)
    #[arg(short, long)]
    baseline: PathBuf,

    /// Correction record (.json)
    #[arg(short, long)]
    corrections: Option<PathBuf>,

    /// Fused record to write (.json)
    #[arg(short, long)]
    output: PathBuf,

    /// Also write the fused graph in g2o format
    #[arg(long)]
    g2o_output: Option<PathBuf>,

    /// FusionConfig as JSON; command-line flags override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Add the inverse of every correction as an extra edge
    #[arg(long)]
    reverse_factor: bool,

    #[arg(long, value_enum)]
    optimizer: Option<OptimizerArg>,

    #[arg(short, long)]
    max_iterations: Option<usize>,

    /// Relative cost change for convergence
    #[arg(long)]
    convergence_threshold: Option<f64>,

    #[arg(long, value_enum)]
    anchor: Option<AnchorArg>,

    /// Name of the per-step covariance list in the baseline record
    #[arg(long)]
    covariance_field: Option<String>,

    /// Export per-frame marginal covariances
    #[arg(long)]
    covariances: bool,

    /// Perturb the initial guess with this seed before solving
    #[arg(long)]
    perturb_seed: Option<u64>,

    /// Rotation perturbation bound (rad)
    #[arg(long, default_value = "0.05")]
    perturb_rotation: f64,

    /// Translation perturbation bound (m)
    #[arg(long, default_value = "0.1")]
    perturb_translation: f64,
}

fn load_config(args: &Args) -> Result<FusionConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => serde_json::from_reader(BufReader::new(File::open(path)?))?,
        None => FusionConfig::new(),
    };

    if args.reverse_factor {
        config = config.with_reverse_factor(true);
    }
    if let Some(optimizer) = args.optimizer {
        config = config.with_optimizer(optimizer.into());
    }
    if let Some(max_iterations) = args.max_iterations {
        config = config.with_max_iterations(max_iterations);
    }
    if let Some(threshold) = args.convergence_threshold {
        config = config.with_convergence_threshold(threshold);
    }
    if let Some(anchor) = args.anchor {
        config = config.with_anchor(match anchor {
            AnchorArg::Vo => Anchor::VoOrigin,
            AnchorArg::Gt => Anchor::GroundTruth,
        });
    }
    if let Some(field) = &args.covariance_field {
        config = config.with_covariance_field(field.as_str());
    }
    if args.covariances {
        config = config.with_compute_covariances(true);
    }
    Ok(config)
}

fn report_armse(label: &str, gt: &[SE3], est: &[SE3]) {
    let errors = match TrajectoryErrors::compute(gt, est) {
        Ok(errors) => errors,
        Err(e) => {
            warn!("Skipping {} error statistics: {}", label, e);
            return;
        }
    };
    info!(
        "{} ARMSE (Rel Trans / Rot): {}",
        label,
        errors.mean_error(ErrorKind::Relative)
    );
    info!(
        "{} ARMSE (Traj Trans / Rot): {}",
        label,
        errors.mean_error(ErrorKind::Trajectory)
    );
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args)?;
    let (baseline, mut corrections) = load_measurements(&args.baseline, &config.covariance_field)?;
    if let Some(path) = &args.corrections {
        corrections.extend(load_corrections(
            path,
            baseline.len(),
            config.correction_adjacency,
        )?);
    }
    info!(
        "Loaded {} frames and {} corrections",
        baseline.len(),
        corrections.len()
    );

    let pipeline = FusionPipeline::new(config);
    let mut graph = pipeline.build_graph(&baseline, &corrections)?;
    if let Some(seed) = args.perturb_seed {
        info!(
            "Perturbing initial guess (seed {}, ±{} rad, ±{} m)",
            seed, args.perturb_rotation, args.perturb_translation
        );
        let mut rng = StdRng::seed_from_u64(seed);
        graph.perturb_initial_guess(&mut rng, args.perturb_rotation, args.perturb_translation);
    }

    let outcome = pipeline.solve(graph)?;

    FusedRecord::from_outcome(&baseline, &outcome).write(&args.output)?;
    if let Some(path) = &args.g2o_output {
        G2oWriter::write(path, &outcome.graph)?;
    }

    report_errors(&baseline, outcome.trajectory());
    Ok(())
}

fn report_errors(baseline: &VoBaseline, fused: &[SE3]) {
    let n = fused.len();
    match (baseline.poses_gt.get(..n), baseline.poses_est.get(..n)) {
        (Some(gt), Some(vo)) if !gt.is_empty() => {
            report_armse("Fusion", gt, fused);
            report_armse("VO Only", gt, vo);
        }
        _ => info!("No ground truth in the baseline, skipping error statistics"),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logger();

    run(&args).inspect_err(|e| match e.downcast_ref::<FusionError>() {
        Some(fusion_error) => {
            error!("Fusion failed ({})", fusion_error.kind());
            error!("Full error chain:\n{}", fusion_error.chain());
        }
        None => error!("Fusion failed: {}", e),
    })
}
