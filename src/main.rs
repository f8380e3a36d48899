use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use gif::{Encoder, Frame, Repeat};
use log::{debug, info, warn};
use rand::{thread_rng, Rng};
use tch::{kind, nn, Device, Kind, Tensor};
use tqdm::tqdm;

use vidgan::config::{parse_device, Config, DatasetConfig, ModelConfig, FRAME_SIZE};
use vidgan::dataset::{LabeledVideoDataset, LabeledVideoSource};
use vidgan::discriminator::{ClipDiscriminator, FrameDiscriminator};
use vidgan::generator::ClipGenerator;
use vidgan::parallel::{ForwardStrategy, ShardedForward, SingleForward};
use vidgan::sequencer::FrameSequencer;
use vidgan::video::ClipTransform;

#[derive(Parser, Debug)]
#[command(version, about = "Conditional video GAN via Rust.", long_about = None)]
struct Args {
    /// JSON5 config file; built-in defaults when absent.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Overrides the configured device, e.g. "cpu" or "cuda(0)".
    #[arg(long)]
    device: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sample clips from the generator and write them as GIFs.
    Generate {
        #[arg(long, default_value = "g_weights.ot")]
        weights: PathBuf,
        #[arg(short, long, default_value_t = 4)]
        num: i64,
        /// Class to generate; random real classes when absent.
        #[arg(short, long)]
        label: Option<i64>,
        /// Roll per-frame latents through the frame sequencer.
        #[arg(short, long, default_value_t = false)]
        motion: bool,
        #[arg(short, long, default_value = "results")]
        output: PathBuf,
    },
    /// Score dataset clips with both discriminators.
    Score {
        #[arg(long, default_value = "d_weights.ot")]
        weights: PathBuf,
        /// Dataset root; overrides the configured one.
        #[arg(short, long)]
        dataset: Option<PathBuf>,
        /// Score at most this many clips.
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Print the class map and per-class video counts of a dataset.
    Inspect {
        #[arg(short, long)]
        dataset: Option<PathBuf>,
        /// Also read every video once to report frame counts.
        #[arg(long, default_value_t = false)]
        frames: bool,
    },
}

fn main() -> Result<()> {
    pretty_env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::open(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(name) = &args.device {
        config.device = match parse_device(name) {
            Ok(device) => device,
            Err(err) => bail!(err),
        };
    }
    info!("Use Device: {:?}", config.device);

    match args.command {
        Command::Generate { weights, num, label, motion, output } => {
            generate(&config, &weights, num, label, motion, &output)
        }
        Command::Score { weights, dataset, limit } => {
            let dataset = dataset_config(&config, dataset)?;
            score(&config, &weights, &dataset, limit)
        }
        Command::Inspect { dataset, frames } => {
            let dataset = dataset_config(&config, dataset)?;
            inspect(&config.model, &dataset, frames)
        }
    }
}

fn dataset_config(config: &Config, root_dir: Option<PathBuf>) -> Result<DatasetConfig> {
    match (root_dir, &config.dataset) {
        (Some(root_dir), Some(dataset)) => Ok(DatasetConfig { root_dir, ..dataset.clone() }),
        (Some(root_dir), None) => Ok(DatasetConfig {
            root_dir,
            class_index: None,
            extensions: vec!["gif".into()],
        }),
        (None, Some(dataset)) => Ok(dataset.clone()),
        (None, None) => bail!("Please specify the dataset. See the --help option for details."),
    }
}

fn load_weights(vs: &mut nn::VarStore, path: &Path) -> Result<()> {
    if path.is_file() {
        vs.load(path)?;
        info!("Loaded: {}", path.display());
    } else {
        warn!("{} not found, using freshly initialized weights", path.display());
    }
    Ok(())
}

fn run_forward<F>(shards: usize, inputs: &Tensor, labels: &Tensor, forward: F) -> Result<Tensor>
where
    F: FnMut(&Tensor, Option<&Tensor>) -> vidgan::Result<Tensor>,
{
    let output = if shards > 1 {
        let strategy = ShardedForward::new(shards)?;
        debug!("forward pass split into at most {} shards", strategy.shards());
        strategy.run(inputs, Some(labels), forward)?
    } else {
        SingleForward.run(inputs, Some(labels), forward)?
    };
    Ok(output)
}

fn sample_labels(model: &ModelConfig, num: i64, label: Option<i64>) -> Result<Tensor> {
    if let Some(label) = label {
        if !(0..model.num_classes).contains(&label) || label == model.fake_label {
            bail!("label {} is not a real class in [0, {})", label, model.num_classes);
        }
        return Ok(Tensor::full([num], label, kind::INT64_CPU));
    }
    let mut rng = thread_rng();
    let labels = (0..num)
        .map(|_| loop {
            let label = rng.gen_range(0..model.num_classes);
            if label != model.fake_label {
                break label;
            }
        })
        .collect::<Vec<_>>();
    Ok(Tensor::from_slice(&labels))
}

fn generate(
    config: &Config,
    weights: &Path,
    num: i64,
    label: Option<i64>,
    motion: bool,
    output: &Path,
) -> Result<()> {
    if num <= 0 {
        bail!("--num must be positive");
    }
    let model = &config.model;
    let device = config.device;

    let mut g_vs = nn::VarStore::new(device);
    let generator = ClipGenerator::new(g_vs.root(), model)?;
    let mut sequencer = FrameSequencer::new(
        &g_vs.root() / "sequencer",
        generator.latent_dim(),
        model.sequencer_hidden,
        model.dropout,
        model.forget_bias,
    )?;
    load_weights(&mut g_vs, weights)?;

    let labels = sample_labels(model, num, label)?.to_device(device);
    let clips = tch::no_grad(|| -> Result<Tensor> {
        let seed = Tensor::randn([num, generator.latent_dim()], (Kind::Float, device));
        let latents = if motion {
            sequencer.initialize(num)?;
            sequencer
                .forward_t(&seed, generator.time_steps(), false)?
                .permute([1, 0, 2])
                .contiguous()
        } else {
            seed
        };
        run_forward(config.shards, &latents, &labels, |xs, labels| {
            let labels = labels.ok_or_else(|| vidgan::Error::ContractViolation("missing labels".into()))?;
            generator.forward_t(xs, labels, false)
        })
    })?;

    fs::create_dir_all(output)?;
    for i in tqdm(0..num) {
        let mut path_buf = output.to_path_buf();
        path_buf.push(format!("generate-{}-class{}.gif", i + 1, labels.int64_value(&[i])));
        write_gif(&clips.get(i), &path_buf)?;
    }
    info!("Generated {} clips in {}", num, output.display());
    Ok(())
}

/// Writes a clip `[nc, T, H, W]` with values in `[-1, 1]` as an animated GIF.
fn write_gif(clip: &Tensor, path: &Path) -> Result<()> {
    let (nc, time_steps, height, width) = clip.size4()?;
    let clip = ((clip.to_device(Device::Cpu) + 1.0) * 127.5).clamp(0.0, 255.0);
    let clip = if nc >= 3 { clip.narrow(0, 0, 3) } else { clip.narrow(0, 0, 1).repeat([3, 1, 1, 1]) };

    let mut image = File::create(path)?;
    let mut encoder = Encoder::new(&mut image, width as u16, height as u16, &[])?;
    encoder.set_repeat(Repeat::Infinite)?;

    let len = 3 * width as usize * height as usize;
    for t in 0..time_steps {
        let frame = clip.select(1, t).permute([1, 2, 0]).contiguous();
        let mut data = vec![0u8; len];
        frame.to_kind(Kind::Uint8).copy_data(&mut data, len);
        encoder.write_frame(&Frame::from_rgb(width as u16, height as u16, &data))?;
    }
    Ok(())
}

fn score(config: &Config, weights: &Path, dataset: &DatasetConfig, limit: Option<usize>) -> Result<()> {
    let model = &config.model;
    let device = config.device;

    let mut d_vs = nn::VarStore::new(device);
    let frame_discriminator = FrameDiscriminator::new(&d_vs.root() / "frame", model)?;
    let clip_discriminator = ClipDiscriminator::new(&d_vs.root() / "clip", model)?;
    load_weights(&mut d_vs, weights)?;

    let transform = ClipTransform { frames: model.time_steps as usize, size: FRAME_SIZE as u32 };
    let dataset = LabeledVideoDataset::open(dataset, Some(transform))?;
    if dataset.is_empty() {
        bail!("no videos found under {}", dataset.root_dir().display());
    }
    let count = limit.map_or(dataset.len(), |limit| limit.min(dataset.len()));

    let mut frame_total = 0.0;
    let mut clip_total = 0.0;
    tch::no_grad(|| -> Result<()> {
        for index in tqdm(0..count) {
            let (clip, label) = dataset.get(index)?;
            let clip = clip.to_device(device);
            let frames = clip.transpose(0, 1).contiguous();

            let frame_scores = frame_discriminator.forward_t(&frames, false)?;
            let clip_score = clip_discriminator.forward_t(&clip, &Tensor::from(label).to_device(device), false)?;
            frame_total += frame_scores.mean(Kind::Float).double_value(&[]);
            clip_total += clip_score.double_value(&[]);
        }
        Ok(())
    })?;

    info!("Scored clips: {}", count);
    info!("Mean frame score: {:.4}", frame_total / count as f64);
    info!("Mean clip score: {:.4}", clip_total / count as f64);
    Ok(())
}

fn inspect(model: &ModelConfig, dataset: &DatasetConfig, frames: bool) -> Result<()> {
    let dataset = LabeledVideoDataset::open(dataset, None)?;

    let mut classes = dataset.class_to_idx().iter().map(|(name, &index)| (index, name)).collect::<Vec<_>>();
    classes.sort();
    let mut per_class = BTreeMap::new();
    for (_, label) in dataset.samples() {
        *per_class.entry(*label).or_insert(0usize) += 1;
    }
    for (index, name) in &classes {
        let videos = per_class.get(index).copied().unwrap_or(0);
        println!("{:>4} {:<32} {:>6} videos", index, name, videos);
        if *index >= model.num_classes {
            warn!("class {} ({}) is outside the model's {} classes", index, name, model.num_classes);
        }
    }
    println!("--------");
    println!("Videos: {}", dataset.len());

    if frames {
        for index in tqdm(0..dataset.len()) {
            dataset.frame_count(index)?;
        }
        let counts = dataset.cached_frame_counts();
        let short = counts.values().filter(|&&n| (n as i64) < model.time_steps).count();
        let total = counts.values().sum::<usize>();
        println!("Frames: {} ({:.1} per video)", total, total as f64 / counts.len().max(1) as f64);
        println!("Videos shorter than {} frames: {}", model.time_steps, short);
    }
    Ok(())
}
