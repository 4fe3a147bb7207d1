// 该文件是 Qianli （千里眼） 项目的一部分。
// src/frame.rs - BGR 帧与输入张量定义
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use image::{ImageBuffer, Rgb, RgbImage};
use thiserror::Error;

pub const BGR_CHANNELS: usize = 3;

/// 通道顺序与 `Rgb<u8>` 无关的三通道图像缓冲区
pub type BgrImage = ImageBuffer<Rgb<u8>, Vec<u8>>;

#[derive(Error, Debug)]
pub enum FrameError {
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  LengthMismatch { expected: usize, actual: usize },
}

/// 任意分辨率的 HWC 三通道帧，通道顺序为 B、G、R
#[derive(Debug, Clone, PartialEq)]
pub struct BgrFrame {
  width: u32,
  height: u32,
  data: Box<[u8]>,
}

impl BgrFrame {
  pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, FrameError> {
    let expected = BGR_CHANNELS * width as usize * height as usize;
    if data.len() != expected {
      return Err(FrameError::LengthMismatch {
        expected,
        actual: data.len(),
      });
    }

    Ok(Self {
      width,
      height,
      data: data.into_boxed_slice(),
    })
  }

  /// 纯色帧，`bgr` 为 [蓝, 绿, 红]
  pub fn filled(width: u32, height: u32, bgr: [u8; 3]) -> Self {
    let data = bgr
      .iter()
      .copied()
      .cycle()
      .take(BGR_CHANNELS * width as usize * height as usize)
      .collect::<Vec<u8>>();
    Self {
      width,
      height,
      data: data.into_boxed_slice(),
    }
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn channels(&self) -> usize {
    BGR_CHANNELS
  }

  pub fn is_empty(&self) -> bool {
    self.width == 0 || self.height == 0
  }

  pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
    let idx = (y as usize * self.width as usize + x as usize) * BGR_CHANNELS;
    [self.data[idx], self.data[idx + 1], self.data[idx + 2]]
  }

  pub fn as_bgr(&self) -> &[u8] {
    &self.data
  }

  /// 以图像缓冲区的形式借出数据，通道仍为 BGR
  pub fn to_bgr_image(&self) -> BgrImage {
    ImageBuffer::from_raw(self.width, self.height, self.data.to_vec())
      .unwrap_or_else(|| ImageBuffer::new(self.width, self.height))
  }

  pub fn from_bgr_image(image: BgrImage) -> Self {
    let (width, height) = image.dimensions();
    Self {
      width,
      height,
      data: image.into_raw().into_boxed_slice(),
    }
  }

  pub fn to_rgb_image(&self) -> RgbImage {
    ImageBuffer::from_fn(self.width, self.height, |x, y| {
      let [b, g, r] = self.pixel(x, y);
      Rgb([r, g, b])
    })
  }

  pub fn from_rgb_image(image: &RgbImage) -> Self {
    let (width, height) = image.dimensions();
    let mut data = vec![0u8; width as usize * height as usize * BGR_CHANNELS];

    for (x, y, pixel) in image.enumerate_pixels() {
      let idx = (y as usize * width as usize + x as usize) * BGR_CHANNELS;
      data[idx] = pixel[2];
      data[idx + 1] = pixel[1];
      data[idx + 2] = pixel[0];
    }

    Self {
      width,
      height,
      data: data.into_boxed_slice(),
    }
  }
}

impl AsMut<[u8]> for BgrFrame {
  fn as_mut(&mut self) -> &mut [u8] {
    &mut self.data
  }
}

/// 送入加速器的 f32 张量，像素主序、通道次序
#[derive(Debug, Clone, PartialEq)]
pub struct TensorBuffer {
  width: u32,
  height: u32,
  data: Box<[f32]>,
}

impl TensorBuffer {
  pub(crate) fn from_parts(width: u32, height: u32, data: Vec<f32>) -> Self {
    debug_assert_eq!(data.len(), width as usize * height as usize * BGR_CHANNELS);
    Self {
      width,
      height,
      data: data.into_boxed_slice(),
    }
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn len(&self) -> usize {
    self.data.len()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }

  pub fn byte_len(&self) -> usize {
    self.data.len() * std::mem::size_of::<f32>()
  }

  pub fn as_slice(&self) -> &[f32] {
    &self.data
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rejects_short_buffer() {
    let err = BgrFrame::new(2, 2, vec![0; 11]).unwrap_err();
    assert!(matches!(
      err,
      FrameError::LengthMismatch {
        expected: 12,
        actual: 11
      }
    ));
  }

  #[test]
  fn rgb_conversion_swaps_channels() {
    let frame = BgrFrame::filled(3, 2, [10, 20, 30]);
    let rgb = frame.to_rgb_image();
    assert_eq!(rgb.get_pixel(2, 1).0, [30, 20, 10]);
    assert_eq!(BgrFrame::from_rgb_image(&rgb), frame);
  }

  #[test]
  fn bgr_image_keeps_channel_order() {
    let frame = BgrFrame::filled(4, 4, [1, 2, 3]);
    let image = frame.to_bgr_image();
    assert_eq!(image.get_pixel(0, 0).0, [1, 2, 3]);
    assert_eq!(BgrFrame::from_bgr_image(image), frame);
  }
}
