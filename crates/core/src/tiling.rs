//! Tile planning and stitching for patch-wise super-resolution.
//!
//! The planner walks the image in `patch_size` strides. Each tile owns a *core*
//! region (clipped at the right/bottom edges) and borrows up to `padding` pixels
//! of context on every side where the image actually has pixels. Core regions
//! partition the image exactly once, so the stitcher can write cropped tile
//! outputs in any order without overlap.

use std::sync::Arc;

use anyhow::{bail, Result};
use ndarray::{s, Array4};

use crate::tensor::{TensorHandle, TensorLedger};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    pub row: usize,
    pub col: usize,
    pub origin_x: usize,
    pub origin_y: usize,
    pub width: usize,
    pub height: usize,
    pub pad_left: usize,
    pub pad_top: usize,
    pub pad_right: usize,
    pub pad_bottom: usize,
}

impl Tile {
    /// Left edge of the padded input region.
    pub fn input_x(&self) -> usize {
        self.origin_x - self.pad_left
    }

    /// Top edge of the padded input region.
    pub fn input_y(&self) -> usize {
        self.origin_y - self.pad_top
    }

    pub fn padded_width(&self) -> usize {
        self.pad_left + self.width + self.pad_right
    }

    pub fn padded_height(&self) -> usize {
        self.pad_top + self.height + self.pad_bottom
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePlan {
    pub image_width: usize,
    pub image_height: usize,
    pub rows: usize,
    pub cols: usize,
    tiles: Vec<Tile>,
}

impl TilePlan {
    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn is_single(&self) -> bool {
        self.tiles.len() == 1
    }
}

/// Compute the covering tile set for an `image_width × image_height` image.
///
/// `patch_size` of `None` or `0`, or a patch that covers the whole image,
/// yields a single whole-image tile with zero padding.
pub fn plan(
    image_width: usize,
    image_height: usize,
    patch_size: Option<usize>,
    padding: usize,
) -> TilePlan {
    if image_width == 0 || image_height == 0 {
        return TilePlan {
            image_width,
            image_height,
            rows: 0,
            cols: 0,
            tiles: Vec::new(),
        };
    }

    let patch = match patch_size {
        Some(p) if p > 0 && (p < image_width || p < image_height) => p,
        _ => {
            return TilePlan {
                image_width,
                image_height,
                rows: 1,
                cols: 1,
                tiles: vec![Tile {
                    row: 0,
                    col: 0,
                    origin_x: 0,
                    origin_y: 0,
                    width: image_width,
                    height: image_height,
                    pad_left: 0,
                    pad_top: 0,
                    pad_right: 0,
                    pad_bottom: 0,
                }],
            };
        }
    };

    let rows = image_height.div_ceil(patch);
    let cols = image_width.div_ceil(patch);
    let mut tiles = Vec::with_capacity(rows * cols);

    for row in 0..rows {
        let origin_y = row * patch;
        let height = patch.min(image_height - origin_y);
        let pad_top = padding.min(origin_y);
        let pad_bottom = padding.min(image_height - (origin_y + height));

        for col in 0..cols {
            let origin_x = col * patch;
            let width = patch.min(image_width - origin_x);
            let pad_left = padding.min(origin_x);
            let pad_right = padding.min(image_width - (origin_x + width));

            tiles.push(Tile {
                row,
                col,
                origin_x,
                origin_y,
                width,
                height,
                pad_left,
                pad_top,
                pad_right,
                pad_bottom,
            });
        }
    }

    TilePlan {
        image_width,
        image_height,
        rows,
        cols,
        tiles,
    }
}

/// Copy a tile's padded input region out of an NCHW image.
pub fn extract_tile(input: &Array4<f32>, tile: &Tile) -> Array4<f32> {
    let y0 = tile.input_y();
    let x0 = tile.input_x();
    input
        .slice(s![
            ..,
            ..,
            y0..y0 + tile.padded_height(),
            x0..x0 + tile.padded_width()
        ])
        .to_owned()
}

/// Incrementally assembles scaled tile outputs into one pre-sized buffer.
///
/// The output buffer is allocated on the first write, once the model's output
/// batch and channel count are known.
pub struct Stitcher {
    ledger: Arc<TensorLedger>,
    scale: usize,
    out_height: usize,
    out_width: usize,
    expected_tiles: usize,
    written: usize,
    output: Option<TensorHandle>,
}

impl Stitcher {
    pub fn new(ledger: &Arc<TensorLedger>, plan: &TilePlan, scale: usize) -> Self {
        Self {
            ledger: Arc::clone(ledger),
            scale,
            out_height: plan.image_height * scale,
            out_width: plan.image_width * scale,
            expected_tiles: plan.len(),
            written: 0,
            output: None,
        }
    }

    /// Crop the scaled padding off `tile_output`, copy its core into place, and
    /// dispose `tile_output`.
    pub fn write(&mut self, tile: &Tile, mut tile_output: TensorHandle) -> Result<()> {
        let result = self.write_inner(tile, &tile_output, false);
        tile_output.dispose();
        result.map(|_| ())
    }

    /// Like [`Stitcher::write`], also returning a copy of the scaled core region.
    pub fn write_and_copy_core(
        &mut self,
        tile: &Tile,
        mut tile_output: TensorHandle,
    ) -> Result<Array4<f32>> {
        let result = self.write_inner(tile, &tile_output, true);
        tile_output.dispose();
        match result? {
            Some(core) => Ok(core),
            None => bail!("tile ({}, {}) core was not copied", tile.row, tile.col),
        }
    }

    fn write_inner(
        &mut self,
        tile: &Tile,
        tile_output: &TensorHandle,
        copy_core: bool,
    ) -> Result<Option<Array4<f32>>> {
        let scale = self.scale;
        let source = tile_output.array()?;
        let (batch, channels, tile_h, tile_w) = source.dim();

        let expected_h = tile.padded_height() * scale;
        let expected_w = tile.padded_width() * scale;
        if tile_h != expected_h || tile_w != expected_w {
            bail!(
                "tile ({}, {}) output is {}x{}, expected {}x{} (padded input {}x{} at scale {})",
                tile.row,
                tile.col,
                tile_w,
                tile_h,
                expected_w,
                expected_h,
                tile.padded_width(),
                tile.padded_height(),
                scale
            );
        }

        if self.output.is_none() {
            self.output = Some(TensorHandle::zeros(
                &self.ledger,
                (batch, channels, self.out_height, self.out_width),
            ));
        }
        let Some(output) = self.output.as_mut() else {
            bail!("stitch buffer missing");
        };
        let target = output.array_mut()?;
        let (out_batch, out_channels, _, _) = target.dim();
        if batch != out_batch || channels != out_channels {
            bail!(
                "tile ({}, {}) output has shape [{batch}, {channels}, ..], expected [{out_batch}, {out_channels}, ..]",
                tile.row,
                tile.col
            );
        }

        let crop_y0 = tile.pad_top * scale;
        let crop_x0 = tile.pad_left * scale;
        let core_h = tile.height * scale;
        let core_w = tile.width * scale;
        let out_y0 = tile.origin_y * scale;
        let out_x0 = tile.origin_x * scale;

        let core = source.slice(s![
            ..,
            ..,
            crop_y0..crop_y0 + core_h,
            crop_x0..crop_x0 + core_w
        ]);
        target
            .slice_mut(s![.., .., out_y0..out_y0 + core_h, out_x0..out_x0 + core_w])
            .assign(&core);

        self.written += 1;
        Ok(copy_core.then(|| core.to_owned()))
    }

    pub fn finish(mut self) -> Result<TensorHandle> {
        if self.written != self.expected_tiles {
            bail!(
                "stitching incomplete: {} of {} tiles written",
                self.written,
                self.expected_tiles
            );
        }
        match self.output.take() {
            Some(output) => Ok(output),
            None => bail!("no tiles were stitched"),
        }
    }
}

/// Stitch a complete set of tile outputs, given in plan order.
pub fn stitch(
    ledger: &Arc<TensorLedger>,
    tile_outputs: Vec<TensorHandle>,
    plan: &TilePlan,
    scale: usize,
) -> Result<TensorHandle> {
    if tile_outputs.len() != plan.len() {
        bail!(
            "got {} tile outputs for a plan of {} tiles",
            tile_outputs.len(),
            plan.len()
        );
    }
    let mut stitcher = Stitcher::new(ledger, plan, scale);
    for (tile, output) in plan.tiles().iter().zip(tile_outputs) {
        stitcher.write(tile, output)?;
    }
    stitcher.finish()
}
