//! Input normalization, environment capability checks, and output encoding.

use std::io::Cursor;
use std::path::Path;

use anyhow::{bail, Context, Result};
use base64::Engine;
use image::{DynamicImage, ImageBuffer, ImageFormat, Luma, Rgb, Rgba};
use ndarray::{Array4, ArrayD, Axis, Ix4};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Capability, UpscaleError, UpscaleResult};

const DATA_URL_PNG_PREFIX: &str = "data:image/png;base64,";

/// Everything `Upscaler::execute` accepts as an image.
#[derive(Debug, Clone)]
pub enum Input {
    /// `[C, H, W]` or `[N, C, H, W]`, values in 0..=255.
    Tensor(ArrayD<f32>),
    /// `data:` URL, http(s) URL, or filesystem path.
    Source(String),
    Pixels(DynamicImage),
}

impl From<Array4<f32>> for Input {
    fn from(value: Array4<f32>) -> Self {
        Self::Tensor(value.into_dyn())
    }
}

impl From<DynamicImage> for Input {
    fn from(value: DynamicImage) -> Self {
        Self::Pixels(value)
    }
}

impl From<&str> for Input {
    fn from(value: &str) -> Self {
        Self::Source(value.to_string())
    }
}

impl From<String> for Input {
    fn from(value: String) -> Self {
        Self::Source(value)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Tensor,
    #[default]
    DataUrl,
}

/// What the hosting runtime can do with string inputs and encoded outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Environment {
    pub string_input: bool,
    pub data_url_output: bool,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            string_input: true,
            data_url_output: true,
        }
    }
}

impl Environment {
    /// Tensor-only runtime: no string loading, no image encoding.
    pub fn tensor_only() -> Self {
        Self {
            string_input: false,
            data_url_output: false,
        }
    }

    /// Fails before any tensor work when `input`, `output`, or the per-tile
    /// `progress_output` needs something this runtime lacks.
    pub fn check(
        &self,
        input: &Input,
        output: OutputFormat,
        progress_output: Option<OutputFormat>,
    ) -> UpscaleResult<()> {
        if matches!(input, Input::Source(_)) && !self.string_input {
            return Err(UpscaleError::environment(Capability::StringInput));
        }
        let wants_data_url =
            output == OutputFormat::DataUrl || progress_output == Some(OutputFormat::DataUrl);
        if wants_data_url && !self.data_url_output {
            return Err(UpscaleError::environment(Capability::DataUrlOutput));
        }
        Ok(())
    }
}

/// Resolve any [`Input`] into an NCHW tensor.
pub async fn normalize_input(input: Input) -> UpscaleResult<Array4<f32>> {
    match input {
        Input::Tensor(tensor) => tensor_to_nchw(tensor),
        Input::Pixels(image) => Ok(image_to_tensor(&image)),
        Input::Source(source) => {
            let bytes = read_source(&source)
                .await
                .map_err(|e| UpscaleError::InvalidInput(format!("{e:#}")))?;
            let image = image::load_from_memory(&bytes).map_err(|e| {
                UpscaleError::InvalidInput(format!("failed to decode image from {}: {e}", describe(&source)))
            })?;
            Ok(image_to_tensor(&image))
        }
    }
}

fn tensor_to_nchw(tensor: ArrayD<f32>) -> UpscaleResult<Array4<f32>> {
    let rank = tensor.ndim();
    let tensor = match rank {
        3 => tensor.insert_axis(Axis(0)),
        4 => tensor,
        _ => {
            return Err(UpscaleError::InvalidInput(format!(
                "Unsupported dimensions for incoming pixels: {rank}. Only 3 or 4 rank tensors are supported."
            )))
        }
    };
    tensor
        .into_dimensionality::<Ix4>()
        .map_err(|e| UpscaleError::InvalidInput(e.to_string()))
}

fn describe(source: &str) -> &str {
    if source.starts_with("data:") {
        "data URL"
    } else {
        source
    }
}

async fn read_source(source: &str) -> Result<Vec<u8>> {
    if let Some(rest) = source.strip_prefix("data:") {
        let (meta, payload) = rest
            .split_once(',')
            .context("malformed data URL: missing ',' separator")?;
        if !meta.ends_with(";base64") {
            bail!("unsupported data URL encoding: only base64 payloads are accepted");
        }
        return base64::engine::general_purpose::STANDARD
            .decode(payload.trim())
            .context("invalid base64 payload in data URL");
    }

    if source.starts_with("http://") || source.starts_with("https://") {
        debug!(url = %source, "Fetching input image");
        let response = reqwest::get(source)
            .await
            .with_context(|| format!("Failed to fetch image from {source}"))?
            .error_for_status()
            .with_context(|| format!("Image request to {source} failed"))?;
        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("Failed while downloading image from {source}"))?;
        return Ok(bytes.to_vec());
    }

    tokio::fs::read(source)
        .await
        .with_context(|| format!("Failed to read image file: {source}"))
}

/// RGB8 pixels to a `[1, 3, H, W]` tensor.
pub fn image_to_tensor(image: &DynamicImage) -> Array4<f32> {
    let rgb = image.to_rgb8();
    let (w, h) = rgb.dimensions();
    Array4::from_shape_fn((1, 3, h as usize, w as usize), |(_, c, y, x)| {
        rgb.get_pixel(x as u32, y as u32)[c] as f32
    })
}

/// Single-image tensor with 1, 3, or 4 channels to pixels, clamped to 0..=255.
pub fn tensor_to_image(tensor: &Array4<f32>) -> Result<DynamicImage> {
    let (n, c, h, w) = tensor.dim();
    if n != 1 {
        bail!("cannot encode a batch of {n} images as one image");
    }

    let mut raw = Vec::with_capacity(c * h * w);
    for y in 0..h {
        for x in 0..w {
            for ch in 0..c {
                raw.push(tensor[[0, ch, y, x]].round().clamp(0.0, 255.0) as u8);
            }
        }
    }

    let (w, h) = (w as u32, h as u32);
    let image = match c {
        1 => ImageBuffer::<Luma<u8>, _>::from_raw(w, h, raw).map(DynamicImage::ImageLuma8),
        3 => ImageBuffer::<Rgb<u8>, _>::from_raw(w, h, raw).map(DynamicImage::ImageRgb8),
        4 => ImageBuffer::<Rgba<u8>, _>::from_raw(w, h, raw).map(DynamicImage::ImageRgba8),
        _ => bail!("cannot encode a tensor with {c} channels as an image"),
    };
    image.context("pixel buffer does not match image dimensions")
}

pub fn to_data_url(tensor: &Array4<f32>) -> Result<String> {
    let image = tensor_to_image(tensor)?;
    let mut png = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .context("Failed to encode PNG")?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(&png);
    Ok(format!("{DATA_URL_PNG_PREFIX}{encoded}"))
}

pub fn save_png(tensor: &Array4<f32>, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output directory: {}", parent.display()))?;
    }
    tensor_to_image(tensor)?
        .save_with_format(path, ImageFormat::Png)
        .with_context(|| format!("Failed to write image: {}", path.display()))
}

/// Decode a PNG data URL produced by [`to_data_url`].
pub fn decode_data_url(url: &str) -> Result<DynamicImage> {
    let payload = url
        .strip_prefix(DATA_URL_PNG_PREFIX)
        .context("not a PNG data URL")?;
    let bytes = base64::engine::general_purpose::STANDARD.decode(payload)?;
    Ok(image::load_from_memory_with_format(&bytes, ImageFormat::Png)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    fn gradient(c: usize, h: usize, w: usize) -> Array4<f32> {
        Array4::from_shape_fn((1, c, h, w), |(_, ch, y, x)| (ch * 50 + y * 10 + x) as f32)
    }

    #[tokio::test]
    async fn test_rank_three_tensor_is_expanded() {
        let chw = ArrayD::<f32>::zeros(IxDyn(&[3, 5, 7]));
        let nchw = normalize_input(Input::Tensor(chw)).await.unwrap();
        assert_eq!(nchw.dim(), (1, 3, 5, 7));
    }

    #[tokio::test]
    async fn test_unsupported_rank_is_rejected() {
        let hw = ArrayD::<f32>::zeros(IxDyn(&[5, 7]));
        let err = normalize_input(Input::Tensor(hw)).await.unwrap_err();
        assert!(matches!(err, UpscaleError::InvalidInput(_)));
        assert!(err
            .to_string()
            .contains("Unsupported dimensions for incoming pixels: 2. Only 3 or 4 rank tensors are supported."));
    }

    #[test]
    fn test_environment_rejects_string_input_before_work() {
        let env = Environment {
            string_input: false,
            data_url_output: true,
        };
        let err = env
            .check(&Input::from("cat.png"), OutputFormat::Tensor, None)
            .unwrap_err();
        match &err {
            UpscaleError::EnvironmentCapability { capability, .. } => {
                assert_eq!(*capability, Capability::StringInput)
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("string URL"));
    }

    #[test]
    fn test_environment_rejects_data_url_output() {
        let env = Environment::tensor_only();
        let input = Input::from(gradient(3, 2, 2));
        assert!(env.check(&input, OutputFormat::Tensor, None).is_ok());
        let err = env.check(&input, OutputFormat::DataUrl, None).unwrap_err();
        assert!(err.to_string().contains("base64"));
    }

    #[test]
    fn test_environment_rejects_data_url_progress_output() {
        let env = Environment::tensor_only();
        let input = Input::from(gradient(3, 2, 2));
        assert!(env
            .check(&input, OutputFormat::Tensor, Some(OutputFormat::Tensor))
            .is_ok());
        let err = env
            .check(&input, OutputFormat::Tensor, Some(OutputFormat::DataUrl))
            .unwrap_err();
        assert!(matches!(
            err,
            UpscaleError::EnvironmentCapability {
                capability: Capability::DataUrlOutput,
                ..
            }
        ));
    }

    #[test]
    fn test_data_url_preserves_pixels() {
        let tensor = gradient(3, 4, 6);
        let url = to_data_url(&tensor).unwrap();
        assert!(url.starts_with(DATA_URL_PNG_PREFIX));

        let decoded = image_to_tensor(&decode_data_url(&url).unwrap());
        assert_eq!(decoded, tensor);
    }

    #[test]
    fn test_encoding_clamps_out_of_range_values() {
        let mut tensor = Array4::<f32>::zeros((1, 1, 1, 2));
        tensor[[0, 0, 0, 0]] = -20.0;
        tensor[[0, 0, 0, 1]] = 300.0;
        let image = tensor_to_image(&tensor).unwrap().to_luma8();
        assert_eq!(image.get_pixel(0, 0)[0], 0);
        assert_eq!(image.get_pixel(1, 0)[0], 255);
    }

    #[test]
    fn test_batched_or_odd_channel_tensors_cannot_be_encoded() {
        assert!(tensor_to_image(&Array4::zeros((2, 3, 2, 2))).is_err());
        assert!(tensor_to_image(&Array4::zeros((1, 2, 2, 2))).is_err());
    }

    #[tokio::test]
    async fn test_data_url_and_file_sources_decode() {
        let tensor = gradient(3, 3, 3);
        let url = to_data_url(&tensor).unwrap();
        let from_url = normalize_input(Input::from(url)).await.unwrap();
        assert_eq!(from_url, tensor);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/in.png");
        save_png(&tensor, &path).unwrap();
        let from_file = normalize_input(Input::from(path.to_string_lossy().to_string()))
            .await
            .unwrap();
        assert_eq!(from_file, tensor);
    }

    #[tokio::test]
    async fn test_missing_file_is_invalid_input() {
        let err = normalize_input(Input::from("/no/such/image.png")).await.unwrap_err();
        assert!(matches!(err, UpscaleError::InvalidInput(_)));
    }
}
