use std::path::Path;

use clap::ValueEnum;
use log::debug;
use ndarray::Array3;
use serde::Serialize;

use crate::error::{Error, Result};

/// Target size for the optional pre-extraction resize.
///
/// An axis left as `None` is scaled to match the other axis, preserving the
/// aspect ratio. At most one axis may be `None`.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeSpec {
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl SizeSpec {
    /// Resolve to a concrete (width, height) for an image of the given size.
    pub fn target_for(&self, cur_w: u32, cur_h: u32) -> (u32, u32) {
        match (self.width, self.height) {
            (Some(w), Some(h)) => (w, h),
            (Some(w), None) => {
                let scale = w as f64 / cur_w as f64;
                (w, (cur_h as f64 * scale).round().max(1.0) as u32)
            }
            (None, Some(h)) => {
                let scale = h as f64 / cur_h as f64;
                ((cur_w as f64 * scale).round().max(1.0) as u32, h)
            }
            (None, None) => (cur_w, cur_h),
        }
    }
}

/// An interchangeable image-decoding implementation.
#[derive(ValueEnum, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImreadMode {
    /// Pure-Rust decoding through the `image` crate
    Image,
    /// OpenCV imgcodecs
    #[value(name = "opencv")]
    OpenCv,
}

/// Probe order used when the caller expresses no preference.
pub const DEFAULT_MODES: &[ImreadMode] = &[ImreadMode::Image, ImreadMode::OpenCv];

impl ImreadMode {
    fn compiled_in(self) -> bool {
        match self {
            ImreadMode::Image => cfg!(feature = "image"),
            ImreadMode::OpenCv => cfg!(feature = "opencv"),
        }
    }

    fn name(self) -> &'static str {
        match self {
            ImreadMode::Image => "image",
            ImreadMode::OpenCv => "opencv",
        }
    }
}

/// A frozen decode backend selection, probed once per run and then shared
/// read-only with every worker.
#[derive(Debug, Clone, Copy)]
pub struct Decoder {
    mode: ImreadMode,
}

impl Decoder {
    /// Pick the first usable backend in `modes`. Fails listing every
    /// attempted mode when none is compiled in.
    pub fn probe(modes: &[ImreadMode]) -> Result<Self> {
        for &mode in modes {
            if mode.compiled_in() {
                debug!("using {} decode backend", mode.name());
                return Ok(Self { mode });
            }
        }
        let attempted: Vec<&str> = modes.iter().map(|m| m.name()).collect();
        Err(Error::UnavailableBackend(attempted.join(", ")))
    }

    pub fn mode(&self) -> ImreadMode {
        self.mode
    }

    /// Decode `path` into an H×W×C array, C ∈ {1, 3}, RGB channel order,
    /// values in [0, 1]. When `size` is set, the image is resized in the
    /// backend's native representation before conversion.
    pub fn load(&self, path: &Path, size: Option<SizeSpec>) -> Result<Array3<f32>> {
        match self.mode {
            #[cfg(feature = "image")]
            ImreadMode::Image => imp_image::load(path, size),
            #[cfg(feature = "opencv")]
            ImreadMode::OpenCv => imp_opencv::load(path, size),
            #[allow(unreachable_patterns)]
            _ => unreachable!("probe() only selects compiled-in backends"),
        }
    }
}

#[cfg(feature = "image")]
mod imp_image {
    use image::imageops::FilterType;

    use super::*;

    pub fn load(path: &Path, size: Option<SizeSpec>) -> Result<Array3<f32>> {
        let mut img = image::open(path)?;
        if let Some(spec) = size {
            let (w, h) = spec.target_for(img.width(), img.height());
            img = img.resize_exact(w, h, FilterType::Triangle);
        }
        let (w, h) = (img.width() as usize, img.height() as usize);
        let arr = if img.color().has_color() {
            let rgb = img.to_rgb32f();
            Array3::from_shape_vec((h, w, 3), rgb.into_raw())
        } else {
            let gray = img.to_luma32f();
            Array3::from_shape_vec((h, w, 1), gray.into_raw())
        };
        Ok(arr.expect("pixel buffer length matches image dimensions"))
    }
}

#[cfg(feature = "opencv")]
mod imp_opencv {
    use ndarray::s;
    use opencv::core::{self, Mat, Size};
    use opencv::prelude::*;
    use opencv::{imgcodecs, imgproc};

    use super::*;

    pub fn load(path: &Path, size: Option<SizeSpec>) -> Result<Array3<f32>> {
        let mut img =
            imgcodecs::imread(&path.to_string_lossy(), imgcodecs::IMREAD_UNCHANGED)?;
        if img.empty() {
            return Err(opencv::Error::new(
                core::StsError,
                format!("failed to read {}", path.display()),
            )
            .into());
        }
        if let Some(spec) = size {
            let (w, h) = spec.target_for(img.cols() as u32, img.rows() as u32);
            let mut resized = Mat::default();
            imgproc::resize(
                &img,
                &mut resized,
                Size::new(w as i32, h as i32),
                0.0,
                0.0,
                imgproc::InterpolationFlags::INTER_AREA as i32,
            )?;
            img = resized;
        }

        let mut float = Mat::default();
        img.convert_to(&mut float, core::CV_32F, 1.0 / 255.0, 0.0)?;
        let (rows, cols) = (float.rows() as usize, float.cols() as usize);
        let channels = float.channels() as usize;
        let data = float.reshape(1, 1)?.data_typed::<f32>()?.to_vec();
        let arr = Array3::from_shape_vec((rows, cols, channels), data)
            .expect("pixel buffer length matches image dimensions");

        // imgcodecs yields BGR(A); flip to RGB and drop any alpha plane
        match channels {
            1 => Ok(arr),
            3 => Ok(arr.slice(s![.., .., ..;-1]).to_owned()),
            4 => Ok(arr.slice(s![.., .., ..3;-1]).to_owned()),
            c => Err(opencv::Error::new(
                core::StsError,
                format!("unsupported channel count {c} in {}", path.display()),
            )
            .into()),
        }
    }
}
