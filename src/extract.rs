use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use log::info;
use ndarray::{Array2, Array3, Axis};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::features::Features;
use crate::imread::{DEFAULT_MODES, Decoder, ImreadMode, SizeSpec};
use crate::parallel::{Parallelism, par_map};
use crate::source::{DEFAULT_EXTENSIONS, Sampler, resolve_dirs, sample_images};

pub const DEFAULT_STEP: u32 = 20;
pub const DEFAULT_SIZES: &[u32] = &[6, 9, 12];
pub const DEFAULT_MAGNIF: f64 = 6.0;
pub const DEFAULT_WINDOW_SIZE: f64 = 1.5;
pub const DEFAULT_CONTRAST_THRESH: f64 = 0.005;

/// Color handling of the descriptor routine. Color modes triple the
/// descriptor width by computing one descriptor block per channel.
#[derive(ValueEnum, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ColorMode {
    Gray,
    Rgb,
    Hsv,
    Opponent,
}

/// Immutable extraction configuration, passed by reference to every
/// extraction call and never mutated mid-run.
#[derive(Serialize, Debug, Clone)]
pub struct DescriptorParams {
    pub color: ColorMode,
    /// Step between frame centers, in pixels
    pub step: u32,
    /// Bin sizes to extract at
    pub sizes: Vec<u32>,
    /// The image is smoothed with a Gaussian of std dev size/magnif
    pub magnif: f64,
    /// Gaussian window size, in spatial bin units
    pub window_size: f64,
    /// Contrast below which a descriptor is zeroed
    pub contrast_thresh: f64,
    /// Use the fast flat-window approximation
    pub fast: bool,
    /// Optional resize applied before extraction
    pub size: Option<SizeSpec>,
}

impl Default for DescriptorParams {
    fn default() -> Self {
        Self {
            color: ColorMode::Gray,
            step: DEFAULT_STEP,
            sizes: DEFAULT_SIZES.to_vec(),
            magnif: DEFAULT_MAGNIF,
            window_size: DEFAULT_WINDOW_SIZE,
            contrast_thresh: DEFAULT_CONTRAST_THRESH,
            fast: true,
            size: None,
        }
    }
}

/// The external dense descriptor routine.
///
/// `extract` returns keypoint locations as an N×4 array with columns
/// (x, y, norm, scale), scale being the raw bin size, and the row-aligned
/// N×D descriptor array, D depending on the color mode.
pub trait DenseDescriptor: Sync {
    fn extract(
        &self,
        img: &Array3<f32>,
        params: &DescriptorParams,
    ) -> Result<(Array2<f64>, Array2<f32>)>;
}

/// Per-image extraction output: N×3 frames (x, y, scale) and the row-aligned
/// N×D descriptors.
#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorBatch {
    pub frames: Array2<f64>,
    pub descriptors: Array2<f32>,
}

/// Run the descriptor routine on decoded pixels and normalize its output:
/// drop the norm column and undo the routine's magnification convention on
/// the scale column.
pub fn get_features<D>(
    img: &Array3<f32>,
    routine: &D,
    params: &DescriptorParams,
) -> Result<DescriptorBatch>
where
    D: DenseDescriptor + ?Sized,
{
    let (locations, descriptors) = routine.extract(img, params)?;
    if locations.ncols() != 4 {
        return Err(Error::Descriptor(format!(
            "expected 4 location columns, got {}",
            locations.ncols()
        )));
    }
    if locations.nrows() != descriptors.nrows() {
        return Err(Error::Descriptor(format!(
            "{} locations for {} descriptors",
            locations.nrows(),
            descriptors.nrows()
        )));
    }
    let mut frames = locations.select(Axis(1), &[0, 1, 3]);
    frames.column_mut(2).mapv_inplace(|s| s / params.magnif);
    Ok(DescriptorBatch { frames, descriptors })
}

/// Decode one image (resizing per `params.size`) and extract its
/// descriptors. Failures carry the offending path and abort the batch.
pub fn load_features<D>(
    path: &Path,
    decoder: &Decoder,
    routine: &D,
    params: &DescriptorParams,
) -> Result<DescriptorBatch>
where
    D: DenseDescriptor + ?Sized,
{
    let inner = || -> Result<DescriptorBatch> {
        let img = decoder.load(path, params.size)?;
        get_features(&img, routine, params)
    };
    inner().map_err(|e| Error::Extraction { path: path.to_path_buf(), source: Box::new(e) })
}

/// Everything the pipeline needs besides the directories and the routine.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Per-class image cap; `None` loads everything
    pub img_per_cla: Option<usize>,
    pub sampler: Sampler,
    /// Case-insensitive filename extensions to treat as images
    pub extensions: HashSet<String>,
    /// Decode backend preference order
    pub imread_modes: Vec<ImreadMode>,
    pub parallelism: Parallelism,
    pub params: DescriptorParams,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            img_per_cla: None,
            sampler: Sampler::First,
            extensions: DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            imread_modes: DEFAULT_MODES.to_vec(),
            parallelism: Parallelism::default(),
            params: DescriptorParams::default(),
        }
    }
}

/// The whole pipeline: resolve directories to labeled images, sample, freeze
/// a decode backend, extract in parallel and assemble the archive.
///
/// The archive is only assembled after every unit succeeded; a single
/// failing image aborts the run with nothing written.
pub fn extract_features<D>(
    dirs: &BTreeMap<PathBuf, String>,
    routine: &D,
    opts: &ExtractOptions,
) -> Result<Features>
where
    D: DenseDescriptor + ?Sized,
{
    let resolved = resolve_dirs(dirs, &opts.extensions)?;
    let entries = sample_images(resolved, opts.img_per_cla, opts.sampler)?;
    let decoder = Decoder::probe(&opts.imread_modes)?;
    info!(
        "extracting descriptors from {} images ({:?} backend, {:?})",
        entries.len(),
        decoder.mode(),
        opts.parallelism
    );

    let batches = par_map(
        &entries,
        |entry| load_features(&entry.path(), &decoder, routine, &opts.params),
        &opts.parallelism,
    )?;

    let mut features = Features::with_capacity(entries.len());
    for (entry, batch) in entries.into_iter().zip(batches) {
        features.push(entry.label, entry.name, batch);
    }
    Ok(features)
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    /// Routine returning canned output regardless of the image.
    struct Canned {
        locations: Array2<f64>,
        descriptors: Array2<f32>,
    }

    impl DenseDescriptor for Canned {
        fn extract(
            &self,
            _img: &Array3<f32>,
            _params: &DescriptorParams,
        ) -> Result<(Array2<f64>, Array2<f32>)> {
            Ok((self.locations.clone(), self.descriptors.clone()))
        }
    }

    #[test]
    fn strips_norm_column_and_unscales() {
        let routine = Canned {
            locations: array![[10.0, 20.0, 0.9, 6.0], [30.0, 40.0, 0.1, 12.0]],
            descriptors: array![[1.0, 2.0], [3.0, 4.0]],
        };
        let img = Array3::zeros((4, 4, 1));
        let params = DescriptorParams { magnif: 6.0, ..Default::default() };

        let batch = get_features(&img, &routine, &params).unwrap();
        assert_eq!(batch.frames, array![[10.0, 20.0, 1.0], [30.0, 40.0, 2.0]]);
        assert_eq!(batch.descriptors, routine.descriptors);
    }

    #[test]
    fn rejects_wrong_location_width() {
        let routine = Canned {
            locations: array![[1.0, 2.0, 3.0]],
            descriptors: array![[0.0f32]],
        };
        let img = Array3::zeros((4, 4, 1));
        let err = get_features(&img, &routine, &DescriptorParams::default()).unwrap_err();
        assert!(matches!(err, Error::Descriptor(_)));
    }

    #[test]
    fn rejects_misaligned_rows() {
        let routine = Canned {
            locations: array![[1.0, 2.0, 3.0, 4.0], [5.0, 6.0, 7.0, 8.0]],
            descriptors: array![[0.0f32]],
        };
        let img = Array3::zeros((4, 4, 1));
        let err = get_features(&img, &routine, &DescriptorParams::default()).unwrap_err();
        assert!(matches!(err, Error::Descriptor(_)));
    }
}
