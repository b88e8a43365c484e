use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::PathBuf;

use clap::Parser;
use serde::Serialize;

use crate::extract::{
    ColorMode, DEFAULT_CONTRAST_THRESH, DEFAULT_MAGNIF, DEFAULT_SIZES, DEFAULT_STEP,
    DEFAULT_WINDOW_SIZE, DescriptorParams,
};
use crate::imread::{DEFAULT_MODES, ImreadMode, SizeSpec};
use crate::parallel::Parallelism;
use crate::source::{DEFAULT_EXTENSIONS, Sampler};

/// Extract dense local descriptors from labeled image collections.
#[derive(Parser, Serialize, Debug, Clone)]
#[command(name = "imfeat", version)]
pub struct Opts {
    /// Output archive; each image's arrays land under label/filename
    pub output: PathBuf,

    #[command(flatten)]
    pub files: FileOptions,

    #[command(flatten)]
    pub sift: SiftOptions,

    /// Worker count; 1 forces strictly sequential extraction.
    /// Defaults to one worker per core.
    #[arg(short = 'j', long, value_name = "N")]
    pub jobs: Option<usize>,
}

#[derive(Parser, Serialize, Debug, Clone)]
pub struct FileOptions {
    /// Adds every subdirectory of this path as one class directory
    #[arg(long, value_name = "DIR")]
    pub root_dir: Option<PathBuf>,

    /// Adds directories whose path doubles as the class label
    #[arg(long, value_name = "DIR", num_args = 1..)]
    pub dirs: Vec<PathBuf>,

    /// Adds a directory under an explicit class label; repeatable
    #[arg(long, value_names = ["DIR", "LABEL"], num_args = 2, action = clap::ArgAction::Append)]
    pub labeled_dir: Vec<String>,

    /// Limit on images loaded per class; unlimited when absent
    #[arg(long, value_name = "NUM")]
    pub num_per_class: Option<usize>,

    /// How to choose images when a class holds more than the limit
    #[arg(long, value_enum, default_value_t = Sampler::First)]
    pub sampler: Sampler,

    /// Comma-separated case-insensitive filename extensions to load
    #[arg(long, value_delimiter = ',', default_values_t = DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()))]
    pub extensions: Vec<String>,

    /// Decode backend preference, most preferred first;
    /// all known backends are probed when unset
    #[arg(long, value_enum)]
    pub imread_mode: Vec<ImreadMode>,

    /// Resize images to WxH before extraction; use * for one axis to
    /// scale it to match the other (e.g. 500x* keeps the aspect ratio)
    #[arg(long, value_name = "WxH", value_parser = parse_size)]
    pub resize: Option<SizeSpec>,
}

#[derive(Parser, Serialize, Debug, Clone)]
pub struct SiftOptions {
    /// Descriptor color mode
    #[arg(long, value_enum, default_value_t = ColorMode::Gray)]
    pub color: ColorMode,

    /// Step between frame centers, in pixels
    #[arg(long, value_name = "N", default_value_t = DEFAULT_STEP, value_parser = clap::value_parser!(u32).range(1..))]
    pub step: u32,

    /// Comma-separated bin sizes to extract at
    #[arg(long, value_delimiter = ',', default_values_t = DEFAULT_SIZES.iter().copied(), value_parser = clap::value_parser!(u32).range(1..))]
    pub sizes: Vec<u32>,

    /// The image is smoothed by a Gaussian with std dev size/magnif
    #[arg(long, value_name = "F", default_value_t = DEFAULT_MAGNIF, value_parser = parse_positive)]
    pub magnif: f64,

    /// Size of the Gaussian window, in spatial bin units
    #[arg(long, value_name = "F", default_value_t = DEFAULT_WINDOW_SIZE, value_parser = parse_positive)]
    pub window_size: f64,

    /// Contrast threshold under which descriptors are zeroed
    #[arg(long, value_name = "F", default_value_t = DEFAULT_CONTRAST_THRESH)]
    pub contrast_thresh: f64,

    /// Disable the fast flat-window computation
    #[arg(long)]
    pub slow: bool,
}

impl Opts {
    /// Union of --root-dir, --dirs and --labeled-dir as directory → label.
    pub fn dirs_map(&self) -> anyhow::Result<BTreeMap<PathBuf, String>> {
        let mut map = BTreeMap::new();
        if let Some(root) = &self.files.root_dir {
            for entry in fs::read_dir(root)? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    map.insert(entry.path(), entry.file_name().to_string_lossy().into_owned());
                }
            }
        }
        for dir in &self.files.dirs {
            map.insert(dir.clone(), dir.to_string_lossy().into_owned());
        }
        for pair in self.files.labeled_dir.chunks(2) {
            map.insert(PathBuf::from(&pair[0]), pair[1].clone());
        }
        Ok(map)
    }

    pub fn extensions_set(&self) -> HashSet<String> {
        self.files.extensions.iter().map(|e| e.to_ascii_lowercase()).collect()
    }

    pub fn imread_modes(&self) -> Vec<ImreadMode> {
        if self.files.imread_mode.is_empty() {
            DEFAULT_MODES.to_vec()
        } else {
            self.files.imread_mode.clone()
        }
    }

    pub fn parallelism(&self) -> Parallelism {
        match self.jobs {
            Some(1) => Parallelism::Sequential,
            Some(n) => Parallelism::Threads(n),
            None => Parallelism::Auto,
        }
    }

    pub fn descriptor_params(&self) -> DescriptorParams {
        DescriptorParams {
            color: self.sift.color,
            step: self.sift.step,
            sizes: self.sift.sizes.clone(),
            magnif: self.sift.magnif,
            window_size: self.sift.window_size,
            contrast_thresh: self.sift.contrast_thresh,
            fast: !self.sift.slow,
            size: self.files.resize,
        }
    }
}

fn parse_positive(s: &str) -> anyhow::Result<f64> {
    let v: f64 = s.parse()?;
    if !(v > 0.0 && v.is_finite()) {
        anyhow::bail!("{s:?} is not a positive number");
    }
    Ok(v)
}

fn parse_size(s: &str) -> anyhow::Result<SizeSpec> {
    let Some((w, h)) = s.split_once('x') else {
        anyhow::bail!("invalid size {s:?}, expected WxH");
    };
    let axis = |t: &str| -> anyhow::Result<Option<u32>> {
        if t == "*" { Ok(None) } else { Ok(Some(t.parse()?)) }
    };
    let spec = SizeSpec { width: axis(w)?, height: axis(h)? };
    if spec.width.is_none() && spec.height.is_none() {
        anyhow::bail!("invalid size {s:?}, at most one axis may be *");
    }
    Ok(spec)
}
