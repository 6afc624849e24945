// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::Path;

use canonical_error::{CanonicalError, data_loss_error};
use image::{DynamicImage, RgbImage};
use image::imageops::{self, FilterType};

/// Model input: a single NHWC image with channel values in -1..1.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageTensor {
    pub shape: [usize; 4],  // [1, height, width, 3]
    pub data: Vec<f32>,
}

// Crops the largest centered square out of `image`.
fn center_square(image: &RgbImage) -> RgbImage {
    let (width, height) = image.dimensions();
    let side = std::cmp::min(width, height);
    imageops::crop_imm(image, (width - side) / 2, (height - side) / 2, side, side)
        .to_image()
}

// Maps 0..255 to -1..1, the scaling the classifier was trained with.
fn normalize(value: u8) -> f32 {
    (value as f32 / 127.5) - 1.0
}

/// Converts `image` into the classifier's input. The steps are fixed so that
/// a given frame always yields the same tensor: RGB conversion, center crop
/// to square, Lanczos3 resize to `size` x `size`, normalization, and a
/// leading batch dimension.
pub fn preprocess_image(image: &DynamicImage, size: u32) -> ImageTensor {
    let square = center_square(&image.to_rgb8());
    let resized = imageops::resize(&square, size, size, FilterType::Lanczos3);
    ImageTensor{
        shape: [1, size as usize, size as usize, 3],
        data: resized.as_raw().iter().map(|v| normalize(*v)).collect(),
    }
}

/// Decodes the image file at `path` and preprocesses it. Returns DataLoss if
/// the file cannot be read or decoded.
pub fn load_image_tensor(path: &Path, size: u32) -> Result<ImageTensor, CanonicalError> {
    let image = image::open(path).map_err(|e| data_loss_error(
        format!("Cannot decode image {:?}: {}", path, e).as_str()))?;
    Ok(preprocess_image(&image, size))
}

// mod tests.
