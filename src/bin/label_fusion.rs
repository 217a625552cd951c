//! label_fusion: command-line multi-atlas label fusion
//!
//! Usage: `label_fusion <dim> [options] <target> <output>`

use std::path::{Path, PathBuf};

use clap::Parser;

use labelfusion_wasm::nifti_io::{read_nifti, to_labels, to_mask, write_nifti};
use labelfusion_wasm::utils::{crop, format_index, mirror_pad, validate_pattern};
use labelfusion_wasm::{parse_radius, FusionConfig, FusionError, Grid, LabelFusion, WeightMethod};

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "label_fusion")]
#[command(about = "Multi-atlas patch-based label fusion (Gaussian or joint label fusion)")]
#[command(version)]
struct Cli {
    /// Image dimensionality (2 or 3).
    dim: usize,

    /// Target image to segment.
    target: PathBuf,

    /// Output segmentation.
    output: PathBuf,

    /// Atlas intensity image, registered to the target (repeat per atlas).
    #[arg(short = 'g', long = "atlas", required = true)]
    atlases: Vec<PathBuf>,

    /// Atlas segmentation, in the same order as the atlases (repeat per atlas).
    #[arg(short = 'l', long = "label")]
    labels: Vec<PathBuf>,

    /// Weighting method: Joint[alpha,beta] or Gauss[sigma].
    #[arg(short = 'm', long, default_value = "Joint[0.1,2]")]
    method: String,

    /// Patch radius, e.g. 2 or 2x2x1.
    #[arg(long, default_value = "3")]
    patch_radius: String,

    /// Local search radius, e.g. 3 or 3x3x0.
    #[arg(long, default_value = "3")]
    search_radius: String,

    /// Mirror-pad all inputs by this radius before fusion (outputs are cropped back).
    #[arg(long)]
    padding: Option<String>,

    /// Forbid LABEL wherever IMAGE is non-zero (repeatable).
    #[arg(short = 'x', long = "exclusion", num_args = 2, value_names = ["LABEL", "IMAGE"])]
    exclusions: Vec<String>,

    /// Write posterior maps, named by substituting the label into this pattern.
    #[arg(long)]
    posterior: Option<String>,

    /// Write weight maps, named by substituting the atlas index into this pattern.
    #[arg(long)]
    weights: Option<String>,

    /// Only fuse voxels where this mask is non-zero.
    #[arg(short = 'M', long)]
    mask: Option<PathBuf>,

    /// Worker threads (0 = all cores).
    #[arg(long, default_value_t = 0)]
    threads: usize,
}

fn main() -> CliResult<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    run(&cli)
}

/// Load an image, pad it, and check it matches the requested dimensionality
fn load(path: &Path, dim: usize, pad: [usize; 3]) -> CliResult<Grid<f64>> {
    log::debug!("Loading {}", path.display());
    let mut grid = read_nifti(path)?;
    if dim == 2 {
        if grid.dims()[2] != 1 {
            return Err(format!("{} is not a 2D image: {:?}", path.display(), grid.dims()).into());
        }
        grid = grid.with_ndim(2);
    }
    if pad.iter().any(|&p| p > 0) {
        grid = mirror_pad(&grid, pad)?;
    }
    Ok(grid)
}

fn unpad<T: Copy>(grid: &Grid<T>, pad: [usize; 3]) -> CliResult<Grid<T>> {
    if pad.iter().any(|&p| p > 0) {
        Ok(crop(grid, pad)?)
    } else {
        Ok(grid.clone())
    }
}

fn run(cli: &Cli) -> CliResult<()> {
    if !(2..=3).contains(&cli.dim) {
        return Err(format!("Unsupported dimensionality {}, use 2 or 3", cli.dim).into());
    }
    let dim = cli.dim;

    let method: WeightMethod = cli.method.parse()?;
    let patch_radius = parse_radius(&cli.patch_radius, dim)?;
    let search_radius = parse_radius(&cli.search_radius, dim)?;
    let pad = match &cli.padding {
        Some(text) => parse_radius(text, dim)?,
        None => [0; 3],
    };

    // Fail on bad output patterns before doing any work
    if let Some(pattern) = &cli.posterior {
        validate_pattern(pattern)?;
    }
    if let Some(pattern) = &cli.weights {
        validate_pattern(pattern)?;
    }

    let config = FusionConfig::default()
        .with_patch_radius(patch_radius)
        .with_search_radius(search_radius)
        .with_method(method)
        .with_posteriors(cli.posterior.is_some())
        .with_weight_maps(cli.weights.is_some())
        .with_threads(cli.threads);

    let mut engine = LabelFusion::new(load(&cli.target, dim, pad)?, config);

    if !cli.labels.is_empty() && cli.labels.len() != cli.atlases.len() {
        return Err(FusionError::AtlasLabelCountMismatch {
            atlases: cli.atlases.len(),
            labels: cli.labels.len(),
        }
        .into());
    }
    for (i, atlas) in cli.atlases.iter().enumerate() {
        let label = match cli.labels.get(i) {
            Some(path) => Some(to_labels(&load(path, dim, pad)?)),
            None => None,
        };
        engine.add_atlas(load(atlas, dim, pad)?, label);
    }

    if let Some(path) = &cli.mask {
        engine.set_mask(to_mask(&load(path, dim, pad)?));
    }

    for pair in cli.exclusions.chunks_exact(2) {
        let label: i32 = pair[0]
            .parse()
            .map_err(|_| format!("Bad exclusion label '{}'", pair[0]))?;
        engine.add_exclusion_map(label, to_mask(&load(Path::new(&pair[1]), dim, pad)?));
    }

    let output = engine.run()?;

    let labels = unpad(&output.labels, pad)?;
    write_nifti(&labels.map(f64::from), &cli.output)?;
    log::info!("Segmentation written to {}", cli.output.display());

    if let (Some(pattern), Some(posteriors)) = (&cli.posterior, &output.posteriors) {
        for (label, map) in posteriors {
            let path = format_index(pattern, i64::from(*label));
            write_nifti(&unpad(map, pad)?, &path)?;
        }
        log::info!("{} posterior maps written", posteriors.len());
    }

    if let (Some(pattern), Some(weight_maps)) = (&cli.weights, &output.weight_maps) {
        for (i, map) in weight_maps.iter().enumerate() {
            let path = format_index(pattern, i as i64);
            write_nifti(&unpad(map, pad)?, &path)?;
        }
        log::info!("{} weight maps written", weight_maps.len());
    }

    Ok(())
}
