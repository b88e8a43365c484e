use ndarray::{Array2, Array3, ArrayView2, Axis, concatenate, s};
use opencv::core::{KeyPoint, Mat, Vector};
use opencv::features2d::SIFT;
use opencv::prelude::*;

use crate::error::{Error, Result};
use crate::extract::{ColorMode, DenseDescriptor, DescriptorParams};

const DESC_WIDTH: usize = 128;

/// Dense multi-scale SIFT over a fixed grid, computed with OpenCV.
///
/// Descriptors are computed per color plane and concatenated, so the width
/// is 128 for gray and 384 for the color modes. `fast` and `window_size`
/// are accepted for interface parity; OpenCV's SIFT exposes no flat-window
/// variant, so they only affect the recorded metadata.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenseSift;

impl DenseDescriptor for DenseSift {
    fn extract(
        &self,
        img: &Array3<f32>,
        params: &DescriptorParams,
    ) -> Result<(Array2<f64>, Array2<f32>)> {
        let planes = color_planes(img, params.color)?;
        let (h, w) = (img.shape()[0] as u32, img.shape()[1] as u32);

        let grid = grid_keypoints(w, h, params.step, &params.sizes);
        if grid.is_empty() {
            return Ok((
                Array2::zeros((0, 4)),
                Array2::zeros((0, DESC_WIDTH * planes.len())),
            ));
        }

        // detection thresholds are irrelevant, compute() works on the fixed grid
        let mut sift = SIFT::create_def()?;

        let mut canonical = grid.clone();
        let mut blocks: Vec<Array2<f32>> = Vec::with_capacity(planes.len());
        for (i, plane) in planes.iter().enumerate() {
            let mat = plane_to_mat(plane)?;
            let mut kps = canonical.clone();
            let mut desc = Mat::default();
            sift.compute(&mat, &mut kps, &mut desc)?;
            if i == 0 {
                // compute() may discard border keypoints; the survivors
                // become the canonical grid for the remaining planes
                canonical = kps;
            } else if kps.len() != canonical.len() {
                return Err(Error::Descriptor(format!(
                    "plane {} kept {} of {} grid keypoints",
                    i,
                    kps.len(),
                    canonical.len()
                )));
            }
            blocks.push(mat_to_array(&desc)?);
        }

        let views: Vec<ArrayView2<f32>> = blocks.iter().map(|b| b.view()).collect();
        let mut descriptors = concatenate(Axis(1), &views)
            .map_err(|e| Error::Descriptor(format!("failed to stack descriptor planes: {e}")))?;

        let luma = luminance(img);
        let mut locations = Array2::zeros((canonical.len(), 4));
        for (row, kp) in canonical.iter().enumerate() {
            let (x, y) = (kp.pt().x, kp.pt().y);
            let size = kp.size() / 4.0;
            let contrast = patch_contrast(&luma, x, y, size);
            if contrast < params.contrast_thresh {
                descriptors.row_mut(row).fill(0.0);
            }
            locations[[row, 0]] = x as f64;
            locations[[row, 1]] = y as f64;
            locations[[row, 2]] = contrast;
            locations[[row, 3]] = size as f64;
        }
        Ok((locations, descriptors))
    }
}

/// Keypoints covering the image on a regular grid, one layer per bin size.
/// Diameter is four spatial bins, the SIFT descriptor support.
fn grid_keypoints(w: u32, h: u32, step: u32, sizes: &[u32]) -> Vector<KeyPoint> {
    let mut kps = Vector::new();
    for &size in sizes {
        let radius = size * 2;
        let mut y = radius;
        while y + radius < h {
            let mut x = radius;
            while x + radius < w {
                // infallible for finite coordinates
                if let Ok(kp) = KeyPoint::new_coords(
                    x as f32,
                    y as f32,
                    (size * 4) as f32,
                    -1.0,
                    0.0,
                    0,
                    -1,
                ) {
                    kps.push(kp);
                }
                x += step;
            }
            y += step;
        }
    }
    kps
}

/// The per-channel planes a color mode extracts descriptors from.
/// Grayscale input is replicated when a color mode asks for three planes.
fn color_planes(img: &Array3<f32>, color: ColorMode) -> Result<Vec<Array2<f32>>> {
    let channels = img.shape()[2];
    if channels != 1 && channels != 3 {
        return Err(Error::Descriptor(format!("expected 1 or 3 channels, got {channels}")));
    }
    let rgb = |i: usize| img.slice(s![.., .., i.min(channels - 1)]).to_owned();

    Ok(match color {
        ColorMode::Gray => vec![luminance(img)],
        ColorMode::Rgb => vec![rgb(0), rgb(1), rgb(2)],
        ColorMode::Hsv => {
            let (mut h, mut s, mut v) = (rgb(0), rgb(1), rgb(2));
            ndarray::Zip::from(&mut h).and(&mut s).and(&mut v).for_each(|h, s, v| {
                let (hh, ss, vv) = rgb_to_hsv(*h, *s, *v);
                (*h, *s, *v) = (hh, ss, vv);
            });
            vec![h, s, v]
        }
        ColorMode::Opponent => {
            let (r, g, b) = (rgb(0), rgb(1), rgb(2));
            let o1 = (&r - &g) / 2f32.sqrt() * 0.5 + 0.5;
            let o2 = (&r + &g - &b * 2.0) / 6f32.sqrt() * 0.5 + 0.5;
            let o3 = (&r + &g + &b) / 3.0;
            vec![o1, o2, o3]
        }
    })
}

fn luminance(img: &Array3<f32>) -> Array2<f32> {
    if img.shape()[2] == 1 {
        img.index_axis(Axis(2), 0).to_owned()
    } else {
        let (r, g, b) = (
            img.index_axis(Axis(2), 0),
            img.index_axis(Axis(2), 1),
            img.index_axis(Axis(2), 2),
        );
        &r * 0.299 + &g * 0.587 + &b * 0.114
    }
}

fn rgb_to_hsv(r: f32, g: f32, b: f32) -> (f32, f32, f32) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;
    let h = if delta == 0.0 {
        0.0
    } else if max == r {
        (((g - b) / delta).rem_euclid(6.0)) / 6.0
    } else if max == g {
        ((b - r) / delta + 2.0) / 6.0
    } else {
        ((r - g) / delta + 4.0) / 6.0
    };
    let s = if max == 0.0 { 0.0 } else { delta / max };
    (h, s, max)
}

/// Standard deviation of the luminance patch under a keypoint, the blank
/// threshold the contrast test runs against.
fn patch_contrast(luma: &Array2<f32>, x: f32, y: f32, size: f32) -> f64 {
    let (rows, cols) = luma.dim();
    let half = (size * 2.0).ceil() as isize;
    let (cx, cy) = (x.round() as isize, y.round() as isize);
    let x0 = (cx - half).max(0) as usize;
    let y0 = (cy - half).max(0) as usize;
    let x1 = ((cx + half) as usize + 1).min(cols);
    let y1 = ((cy + half) as usize + 1).min(rows);
    if x0 >= x1 || y0 >= y1 {
        return 0.0;
    }
    let patch = luma.slice(s![y0..y1, x0..x1]);
    let n = patch.len() as f64;
    let mean = patch.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var = patch.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
    var.sqrt()
}

fn plane_to_mat(plane: &Array2<f32>) -> Result<Mat> {
    let (rows, _cols) = plane.dim();
    let bytes: Vec<u8> =
        plane.iter().map(|&v| (v * 255.0).round().clamp(0.0, 255.0) as u8).collect();
    let mat = Mat::from_slice(&bytes)?.reshape(1, rows as i32)?.try_clone()?;
    Ok(mat)
}

fn mat_to_array(desc: &Mat) -> Result<Array2<f32>> {
    let (rows, cols) = (desc.rows() as usize, desc.cols() as usize);
    if rows == 0 {
        return Ok(Array2::zeros((0, DESC_WIDTH)));
    }
    let data = desc.reshape(1, 1)?.data_typed::<f32>()?.to_vec();
    Array2::from_shape_vec((rows, cols), data)
        .map_err(|e| Error::Descriptor(format!("bad descriptor matrix shape: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_covers_every_size_layer() {
        let grid = grid_keypoints(100, 80, 20, &[6, 9]);
        assert!(!grid.is_empty());
        let sizes: Vec<f32> = grid.iter().map(|kp| kp.size()).collect();
        assert!(sizes.contains(&24.0));
        assert!(sizes.contains(&36.0));
    }

    #[test]
    fn flat_patch_has_zero_contrast() {
        let luma = Array2::from_elem((50, 50), 0.5);
        assert_eq!(patch_contrast(&luma, 25.0, 25.0, 6.0), 0.0);
    }

    #[test]
    fn hsv_of_pure_red() {
        let (h, s, v) = rgb_to_hsv(1.0, 0.0, 0.0);
        assert_eq!((h, s, v), (0.0, 1.0, 1.0));
    }
}
