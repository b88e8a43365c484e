pub mod config;
#[cfg(feature = "opencv")]
pub mod dsift;
pub mod error;
pub mod extract;
pub mod features;
pub mod imread;
pub mod parallel;
pub mod source;

pub use error::{Error, Result};
pub use extract::{
    DenseDescriptor, DescriptorBatch, DescriptorParams, ExtractOptions, extract_features,
    get_features, load_features,
};
pub use features::{Features, read_features, read_features_with_attrs, write_features};
pub use imread::{Decoder, ImreadMode, SizeSpec};
pub use parallel::{Parallelism, par_map};
pub use source::{ImageEntry, Sampler, resolve_dirs, sample_images};
