use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use clap::ValueEnum;
use log::{debug, info};
use rand::Rng;
use serde::Serialize;
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// Extensions treated as images when no filter is given.
pub const DEFAULT_EXTENSIONS: &[&str] = &["jpg", "png", "bmp"];

/// One selected image together with its class label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageEntry {
    pub label: String,
    pub dir: PathBuf,
    pub name: String,
}

impl ImageEntry {
    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.name)
    }
}

/// Turn a directory → label mapping into label → [(directory, filename)].
///
/// Only regular files directly inside each directory qualify, and only when
/// their extension matches `extensions` case-insensitively, on both sides.
/// Two files with the same name under one label (possibly from different
/// directories) are a fatal [`Error::DuplicateImage`].
pub fn resolve_dirs(
    dirs: &BTreeMap<PathBuf, String>,
    extensions: &HashSet<String>,
) -> Result<BTreeMap<String, Vec<(PathBuf, String)>>> {
    let extensions: HashSet<String> =
        extensions.iter().map(|e| e.to_ascii_lowercase()).collect();
    let mut by_label: BTreeMap<String, Vec<(PathBuf, String)>> = BTreeMap::new();
    let mut seen: BTreeMap<&str, HashSet<String>> = BTreeMap::new();

    for (dir, label) in dirs {
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let ext = match name.rsplit_once('.') {
                Some((_, ext)) => ext.to_ascii_lowercase(),
                None => continue,
            };
            if !extensions.contains(&ext) {
                continue;
            }
            if !seen.entry(label.as_str()).or_default().insert(name.clone()) {
                return Err(Error::DuplicateImage { name, label: label.clone() });
            }
            by_label.entry(label.clone()).or_default().push((dir.clone(), name));
        }
        debug!("listed {}", dir.display());
    }

    Ok(by_label)
}

/// How to pick images when a class holds more than the per-class cap.
#[derive(ValueEnum, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Sampler {
    /// The first N filenames lexicographically
    First,
    /// A random sample without replacement
    Random,
    /// N evenly spaced images over the sorted filenames
    Uniform,
}

impl Sampler {
    /// Reduce `images` to at most `n` entries. `Random` draws from the
    /// process RNG; fix the seed through [`Sampler::sample_with`] instead
    /// when reproducibility matters.
    pub fn sample(
        &self,
        images: Vec<(PathBuf, String)>,
        n: usize,
    ) -> Result<Vec<(PathBuf, String)>> {
        self.sample_with(images, n, &mut rand::rng())
    }

    pub fn sample_with<R: Rng + ?Sized>(
        &self,
        mut images: Vec<(PathBuf, String)>,
        n: usize,
        rng: &mut R,
    ) -> Result<Vec<(PathBuf, String)>> {
        if images.len() <= n {
            // every strategy keeps the full list, in its base ordering
            if !matches!(self, Sampler::Random) {
                images.sort_by(|a, b| a.1.cmp(&b.1));
            }
            return Ok(images);
        }
        match self {
            Sampler::First => {
                images.sort_by(|a, b| a.1.cmp(&b.1));
                images.truncate(n);
                Ok(images)
            }
            Sampler::Random => {
                let picked = rand::seq::index::sample(rng, images.len(), n);
                Ok(take_indices(images, picked.iter()))
            }
            Sampler::Uniform => {
                images.sort_by(|a, b| a.1.cmp(&b.1));
                let indices = uniform_indices(images.len(), n)?;
                Ok(take_indices(images, indices.into_iter()))
            }
        }
    }
}

fn take_indices<T>(items: Vec<T>, indices: impl Iterator<Item = usize>) -> Vec<T> {
    let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
    indices.map(|i| slots[i].take().expect("index picked twice")).collect()
}

/// Evenly spaced indices over `[0, len - 1]` via rounded linear interpolation.
///
/// Collapsed spacing (two picks landing on one index) is reported as an
/// explicit configuration error rather than being silently absorbed.
fn uniform_indices(len: usize, n: usize) -> Result<Vec<usize>> {
    if n == 0 {
        return Ok(vec![]);
    }
    if n == 1 {
        return Ok(vec![0]);
    }
    let indices: Vec<usize> = (0..n)
        .map(|k| (k as f64 * (len - 1) as f64 / (n - 1) as f64).round() as usize)
        .collect();
    if indices.windows(2).any(|w| w[1] <= w[0]) {
        return Err(Error::Config(format!(
            "cannot sample {} distinct indices uniformly from {} images",
            n, len
        )));
    }
    Ok(indices)
}

/// Apply the per-class cap and flatten the resolved mapping into one entry
/// list, concatenated in label order. No cap keeps every image, in the
/// sampler's base ordering, so uncapped runs match large-cap runs exactly.
pub fn sample_images(
    resolved: BTreeMap<String, Vec<(PathBuf, String)>>,
    img_per_cla: Option<usize>,
    sampler: Sampler,
) -> Result<Vec<ImageEntry>> {
    let n_labels = resolved.len();
    let mut entries = Vec::new();
    for (label, images) in resolved {
        let picked = sampler.sample(images, img_per_cla.unwrap_or(usize::MAX))?;
        for (dir, name) in picked {
            entries.push(ImageEntry { label: label.clone(), dir, name });
        }
    }
    if entries.is_empty() {
        return Err(Error::Config("no images selected".to_owned()));
    }
    info!("selected {} images across {} labels", entries.len(), n_labels);
    Ok(entries)
}
