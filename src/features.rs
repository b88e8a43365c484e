use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use log::info;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::extract::DescriptorBatch;

/// Descriptor element precision chosen at read time. Archives store
/// descriptors in single precision; reading as `f64` widens them.
pub trait FeatureElement: Copy + 'static {
    fn from_f32(v: f32) -> Self;
}

impl FeatureElement for f32 {
    fn from_f32(v: f32) -> f32 {
        v
    }
}

impl FeatureElement for f64 {
    fn from_f32(v: f32) -> f64 {
        v as f64
    }
}

/// Four parallel sequences; index `i` across all of them describes one
/// image. `(labels[i], names[i])` is unique within one archive.
#[derive(Debug, Clone, PartialEq)]
pub struct Features<F = f32> {
    pub labels: Vec<String>,
    pub names: Vec<String>,
    pub frames: Vec<Array2<f64>>,
    pub features: Vec<Array2<F>>,
}

impl<F> Features<F> {
    pub fn new() -> Self {
        Self { labels: vec![], names: vec![], frames: vec![], features: vec![] }
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            labels: Vec::with_capacity(n),
            names: Vec::with_capacity(n),
            frames: Vec::with_capacity(n),
            features: Vec::with_capacity(n),
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

impl<F> Default for Features<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl Features<f32> {
    /// Append one completed extraction.
    pub fn push(&mut self, label: String, name: String, batch: DescriptorBatch) {
        self.labels.push(label);
        self.names.push(name);
        self.frames.push(batch.frames);
        self.features.push(batch.descriptors);
    }
}

#[derive(Serialize, Deserialize)]
struct Leaf {
    frames: Array2<f64>,
    features: Array2<f32>,
}

/// On-disk layout: scalar metadata at the root, then label → image-name →
/// (frames, features).
#[derive(Serialize, Deserialize, Default)]
struct Container {
    attrs: BTreeMap<String, String>,
    groups: BTreeMap<String, BTreeMap<String, Leaf>>,
}

/// Persist an archive, attaching `attrs` as root metadata.
///
/// The container is assembled fully in memory first; nothing reaches disk
/// when any leaf is rejected. A repeated (label, name) leaf is a fatal
/// [`Error::DuplicateLeaf`], never a silent overwrite.
pub fn write_features(
    path: &Path,
    features: Features<f32>,
    attrs: BTreeMap<String, String>,
) -> Result<()> {
    let n = features.len();
    if features.names.len() != n || features.frames.len() != n || features.features.len() != n
    {
        return Err(Error::Config("feature archive sequences are misaligned".to_owned()));
    }

    let mut container = Container { attrs, groups: BTreeMap::new() };
    let Features { labels, names, frames, features } = features;
    for (((label, name), frames), descrs) in
        labels.into_iter().zip(names).zip(frames).zip(features)
    {
        let group = container.groups.entry(label.clone()).or_default();
        if group.insert(name.clone(), Leaf { frames, features: descrs }).is_some() {
            return Err(Error::DuplicateLeaf { label, name });
        }
    }

    let file = File::create(path)?;
    bincode::serialize_into(BufWriter::new(file), &container)?;
    info!("wrote {} feature bags to {}", n, path.display());
    Ok(())
}

/// Read an archive back into four parallel sequences, one entry per leaf in
/// container traversal order. That order is the container's own (sorted by
/// label, then name) and need not match the original write order.
pub fn read_features<F: FeatureElement>(path: &Path) -> Result<Features<F>> {
    Ok(read_features_with_attrs(path)?.0)
}

/// Like [`read_features`], additionally returning the root metadata.
pub fn read_features_with_attrs<F: FeatureElement>(
    path: &Path,
) -> Result<(Features<F>, BTreeMap<String, String>)> {
    let file = File::open(path)?;
    let container: Container = bincode::deserialize_from(BufReader::new(file))?;

    let mut out = Features::new();
    for (label, group) in container.groups {
        for (name, leaf) in group {
            out.labels.push(label.clone());
            out.names.push(name);
            out.frames.push(leaf.frames);
            out.features.push(leaf.features.mapv(F::from_f32));
        }
    }
    Ok((out, container.attrs))
}
