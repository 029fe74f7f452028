//! Frame buffer, cropping, and resize into model input tensors.

use crate::engine::{Tensor, TensorSpec};
use image::{GrayImage, RgbImage};
use ndarray::IxDyn;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid frame buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("unsupported channel count: {0} (expected 1 or 3)")]
    UnsupportedChannels(u32),
    #[error("frame of {width}x{height}x{channels} does not fit in memory")]
    TooLarge { width: u32, height: u32, channels: u32 },
}

/// A dense interleaved pixel buffer (`height x width x channels`).
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, channels: u32) -> Result<Self, FrameError> {
        if channels != 1 && channels != 3 {
            return Err(FrameError::UnsupportedChannels(channels));
        }
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|n| n.checked_mul(channels as usize))
            .ok_or(FrameError::TooLarge {
                width,
                height,
                channels,
            })?;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            channels,
        })
    }

    pub fn from_rgb(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw(),
            width,
            height,
            channels: 3,
        }
    }

    pub fn from_luma(image: GrayImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw(),
            width,
            height,
            channels: 1,
        }
    }

    fn pixel(&self, x: usize, y: usize, c: usize) -> f32 {
        self.data[(y * self.width as usize + x) * self.channels as usize + c] as f32
    }

    /// Copy out the sub-rectangle at `position` with `size`, clamped to the frame.
    pub fn crop(&self, position: (f64, f64), size: (f64, f64)) -> Frame {
        let (w, h) = (self.width as f64, self.height as f64);
        let x0 = position.0.clamp(0.0, w) as usize;
        let y0 = position.1.clamp(0.0, h) as usize;
        let x1 = (position.0 + size.0).clamp(0.0, w) as usize;
        let y1 = (position.1 + size.1).clamp(0.0, h) as usize;
        let (cw, ch) = (x1.saturating_sub(x0), y1.saturating_sub(y0));

        let stride = self.width as usize * self.channels as usize;
        let row_len = cw * self.channels as usize;
        let mut data = Vec::with_capacity(row_len * ch);
        for y in y0..y0 + ch {
            let start = y * stride + x0 * self.channels as usize;
            data.extend_from_slice(&self.data[start..start + row_len]);
        }

        Frame {
            data,
            width: cw as u32,
            height: ch as u32,
            channels: self.channels,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Resize into a tensor shaped for `layout` using bilinear interpolation.
    ///
    /// Grayscale frames are replicated into every model channel; color frames
    /// feeding a single-channel model are averaged. `swap_rb` reverses the
    /// first and third channel. Empty frames produce a zero tensor.
    pub fn to_tensor(&self, layout: &InputLayout, swap_rb: bool) -> Tensor {
        let mut tensor = Tensor::zeros(IxDyn(&layout.shape()));
        if self.is_empty() {
            tracing::debug!(?layout, "empty crop; feeding zero tensor");
            return tensor;
        }

        let (src_w, src_h) = (self.width as usize, self.height as usize);
        let src_c = self.channels as usize;
        let inv_x = src_w as f32 / layout.width as f32;
        let inv_y = src_h as f32 / layout.height as f32;

        for y in 0..layout.height {
            let src_y = (y as f32 + 0.5) * inv_y - 0.5;
            let y0 = (src_y.floor() as i32).clamp(0, src_h as i32 - 1) as usize;
            let y1 = (y0 + 1).min(src_h - 1);
            let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

            for x in 0..layout.width {
                let src_x = (x as f32 + 0.5) * inv_x - 0.5;
                let x0 = (src_x.floor() as i32).clamp(0, src_w as i32 - 1) as usize;
                let x1 = (x0 + 1).min(src_w - 1);
                let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

                let sample = |c: usize| {
                    let tl = self.pixel(x0, y0, c);
                    let tr = self.pixel(x1, y0, c);
                    let bl = self.pixel(x0, y1, c);
                    let br = self.pixel(x1, y1, c);
                    tl * (1.0 - fx) * (1.0 - fy)
                        + tr * fx * (1.0 - fy)
                        + bl * (1.0 - fx) * fy
                        + br * fx * fy
                };

                for c in 0..layout.channels {
                    let value = match (src_c, layout.channels) {
                        (1, _) => sample(0),
                        (_, 1) => (0..src_c).map(&sample).sum::<f32>() / src_c as f32,
                        _ => {
                            let src = if swap_rb && c < 3 { 2 - c } else { c.min(src_c - 1) };
                            sample(src)
                        }
                    };
                    tensor[layout.index(c, y, x).as_slice()] = value;
                }
            }
        }

        tensor
    }
}

/// Spatial layout of an image input tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputLayout {
    pub nchw: bool,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl InputLayout {
    /// Infer the layout of a rank-4 image input. A dimension of 1 or 3 in
    /// position 1 means NCHW, otherwise NHWC. `size` (width, height) overrides
    /// the declared spatial dimensions; without it they must be static.
    pub fn from_spec(spec: &TensorSpec, size: Option<(usize, usize)>) -> Option<Self> {
        if spec.shape.len() != 4 {
            return None;
        }
        let nchw = matches!(spec.dim(1), Some(1) | Some(3));
        let (c_axis, h_axis, w_axis) = if nchw { (1, 2, 3) } else { (3, 1, 2) };
        let channels = spec.dim(c_axis)?;
        let (width, height) = match size {
            Some(size) => size,
            None => (spec.dim(w_axis)?, spec.dim(h_axis)?),
        };
        Some(Self {
            nchw,
            channels,
            height,
            width,
        })
    }

    pub fn shape(&self) -> Vec<usize> {
        if self.nchw {
            vec![1, self.channels, self.height, self.width]
        } else {
            vec![1, self.height, self.width, self.channels]
        }
    }

    fn index(&self, c: usize, y: usize, x: usize) -> [usize; 4] {
        if self.nchw {
            [0, c, y, x]
        } else {
            [0, y, x, c]
        }
    }
}
