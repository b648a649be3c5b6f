use clap::{Parser, Subcommand, ValueEnum};
use log::{LevelFilter, info};

mod cell;
mod cells;
mod composite;
mod config;
mod db;
mod graph;
mod observation;
mod pipelines;
mod render;
mod transport;

use crate::cell::{Cell, Params, Value};
use crate::composite::{BuildContext, CellRegistry, Composite, Tick};
use crate::config::PipelineConfig;
use crate::observation::ObservationSource;
use crate::pipelines::{IncrementalModelBuilder, PostProcessor, TodDetector, TodTrainer, TrainingComposite};

pub type Result<T> = anyhow::Result<T>;

#[derive(Parser)]
#[command(name = "tod-pipelines")]
#[command(about = "Textured object detection and training pipelines", long_about = None)]
struct Cli {
    /// Pipeline configuration (JSON).
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Log more; repeat for debug output.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the detector over synthetic frames and print the poses found.
    Detect {
        #[arg(long, default_value = "1")]
        frames: usize,
    },

    /// Train a model from synthetic observations and store it in the db.
    Train {
        #[arg(long, default_value = "5")]
        frames: usize,
    },

    /// Render the resolved graph of a pipeline.
    Graph {
        #[arg(value_enum)]
        pipeline: PipelineArg,

        #[arg(long, value_enum, default_value_t = FormatArg::Dot)]
        format: FormatArg,

        #[arg(short = 'o', long)]
        out: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PipelineArg {
    Detector,
    Builder,
    PostProcessor,
    Trainer,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Dot,
    Json,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    env_logger::builder()
        .filter_level(level)
        .parse_default_env()
        .try_init()?;

    let config = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };

    // the only availability check for the lifetime of the process
    let registry = CellRegistry::standard();
    let ctx = BuildContext::new(&registry)
        .with_transport(transport::probe(config.transport.as_ref()));

    match cli.cmd {
        Commands::Detect { frames } => detect(&config, &ctx, frames)?,
        Commands::Train { frames } => train(&config, &ctx, frames)?,
        Commands::Graph {
            pipeline,
            format,
            out,
        } => {
            let composite = build_pipeline(pipeline, &config, &ctx)?;
            let view = render::GraphView::of(&composite);
            let text = match format {
                FormatArg::Dot => render::render_dot(&view),
                FormatArg::Json => render::render_json(&view)?,
            };
            match out {
                Some(path) => {
                    std::fs::write(&path, text)?;
                    println!("Wrote {}", path);
                }
                None => print!("{}", text),
            }
        }
    }

    Ok(())
}

fn observations(config: &PipelineConfig, frames: usize) -> ObservationSource {
    match config.intrinsics() {
        Some(k) => Box::new((0..frames as i64).map(move |i| observation::observe(i, k))),
        None => observation::synthetic_sequence(frames),
    }
}

fn detect(config: &PipelineConfig, ctx: &BuildContext<'_>, frames: usize) -> Result<()> {
    let mut detector = Composite::build(&TodDetector, &config.detector_args()?, ctx)?;
    for obs in observations(config, frames) {
        let frame = obs.frame_number;
        let mut values = obs.values();
        values.retain(|name, _| detector.schema().has_input(name));

        let Tick::Done(out) = detector.tick(&values)? else {
            break;
        };
        let keypoints = match out.get("keypoints") {
            Some(Value::Keypoints(k)) => k.len(),
            _ => 0,
        };
        let poses = match out.get("pose_results") {
            Some(Value::Poses(p)) => serde_json::to_value(p)?,
            _ => serde_json::Value::Null,
        };
        println!(
            "{}",
            serde_json::json!({"frame": frame, "keypoints": keypoints, "poses": poses})
        );
    }
    Ok(())
}

fn train(config: &PipelineConfig, ctx: &BuildContext<'_>, frames: usize) -> Result<()> {
    let mut trainer =
        TrainingComposite::build(observations(config, frames), &config.trainer_args(), ctx)?;
    let doc = trainer.run()?;
    info!("model {} written", doc.object_id);
    println!(
        "{}",
        serde_json::json!({
            "object_id": doc.object_id,
            "frames": trainer.records().len(),
            "points": doc.points.len(),
        })
    );
    Ok(())
}

/// Keep only the named arguments.
fn pick(args: Params, keys: &[&str]) -> Params {
    args.into_iter()
        .filter(|(name, _)| keys.contains(&name.as_str()))
        .collect()
}

fn build_pipeline(
    pipeline: PipelineArg,
    config: &PipelineConfig,
    ctx: &BuildContext<'_>,
) -> Result<Composite> {
    let trainer_args = config.trainer_args();
    match pipeline {
        PipelineArg::Detector => Composite::build(&TodDetector, &config.detector_args()?, ctx),
        PipelineArg::Builder => Composite::build(
            &IncrementalModelBuilder,
            &pick(
                trainer_args,
                &["visualize", "json_feature_params", "json_descriptor_params"],
            ),
            ctx,
        ),
        PipelineArg::PostProcessor => Composite::build(
            &PostProcessor,
            &pick(trainer_args, &["object_id", "voxel_size"]),
            ctx,
        ),
        PipelineArg::Trainer => Composite::build(
            &TodTrainer::new(observations(config, 0)),
            &trainer_args,
            ctx,
        ),
    }
}
