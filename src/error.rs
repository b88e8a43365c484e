use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the extraction pipeline. None of these are ever
/// downgraded to warnings, and nothing in the pipeline retries.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad configuration: no images selected, malformed resize spec,
    /// degenerate sampling request, and the like.
    #[error("{0}")]
    Config(String),

    /// The same (label, filename) identity was seen twice during resolution.
    #[error("more than one {name:?} with label {label:?}")]
    DuplicateImage { name: String, label: String },

    /// None of the requested decode backends are compiled in.
    #[error("no usable image decoding backend among: {0}")]
    UnavailableBackend(String),

    /// Decode, resize or descriptor computation failed for one image.
    /// Aborts the whole batch.
    #[error("failed to extract features from {}", path.display())]
    Extraction {
        path: PathBuf,
        #[source]
        source: Box<Error>,
    },

    /// The descriptor routine violated its output contract.
    #[error("descriptor routine error: {0}")]
    Descriptor(String),

    /// An archive write would create the same (label, name) leaf twice.
    #[error("duplicate archive leaf {label:?}/{name:?}")]
    DuplicateLeaf { label: String, name: String },

    #[error("archive serialization error")]
    Serialization(#[from] bincode::Error),

    #[error("io error")]
    Io(#[from] std::io::Error),

    #[error("directory listing error")]
    Walk(#[from] walkdir::Error),

    #[cfg(feature = "image")]
    #[error("image decode error")]
    Image(#[from] image::ImageError),

    #[cfg(feature = "opencv")]
    #[error("opencv error")]
    OpenCv(#[from] opencv::Error),
}
