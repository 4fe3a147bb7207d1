// 该文件是 Qianli （千里眼） 项目的一部分。
// src/preprocess.rs - 图像预处理
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

use image::imageops;
use thiserror::Error;
use tracing::debug;

use crate::config::{ChannelOrder, PreprocessConfig};
use crate::frame::{BGR_CHANNELS, BgrFrame, TensorBuffer};

#[derive(Error, Debug)]
pub enum PreprocessError {
  #[error("缩放失败: {from_width}x{from_height} -> {width}x{height}")]
  Resize {
    from_width: u32,
    from_height: u32,
    width: u32,
    height: u32,
  },
}

/// 将帧缩放到网络输入尺寸并归一化
///
/// 缩放使用区域平均。输出按像素主序、通道次序排列，通道顺序与帧一致
/// （B、G、R），每个值为 `(v - mean[c]) * scale[c]`。
pub fn preprocess(
  frame: &BgrFrame,
  width: u32,
  height: u32,
  mean: &[f32; 3],
  scale: &[f32; 3],
) -> Result<TensorBuffer, PreprocessError> {
  let resize_error = || PreprocessError::Resize {
    from_width: frame.width(),
    from_height: frame.height(),
    width,
    height,
  };
  if frame.is_empty() || width == 0 || height == 0 {
    return Err(resize_error());
  }

  let resized = if (frame.width(), frame.height()) == (width, height) {
    frame.to_bgr_image()
  } else {
    imageops::thumbnail(&frame.to_bgr_image(), width, height)
  };
  if resized.dimensions() != (width, height) {
    return Err(resize_error());
  }

  let data = resized
    .as_raw()
    .chunks_exact(BGR_CHANNELS)
    .flat_map(|px| (0..BGR_CHANNELS).map(move |c| (px[c] as f32 - mean[c]) * scale[c]))
    .collect::<Vec<f32>>();

  debug!(
    "预处理: {}x{} -> {}x{}, {} 个浮点数",
    frame.width(),
    frame.height(),
    width,
    height,
    data.len()
  );
  Ok(TensorBuffer::from_parts(width, height, data))
}

/// 持有网络输入约定的预处理器
#[derive(Debug, Clone)]
pub struct Preprocessor {
  config: PreprocessConfig,
}

impl Preprocessor {
  pub fn new(config: PreprocessConfig) -> Self {
    Self { config }
  }

  pub fn config(&self) -> &PreprocessConfig {
    &self.config
  }

  pub fn process(&self, frame: &BgrFrame) -> Result<TensorBuffer, PreprocessError> {
    let config = &self.config;
    match config.channel_order {
      ChannelOrder::Bgr => preprocess(frame, config.width, config.height, &config.mean, &config.scale),
      ChannelOrder::Rgb => {
        let swapped = BgrFrame::from_bgr_image(frame.to_rgb_image());
        preprocess(&swapped, config.width, config.height, &config.mean, &config.scale)
      }
    }
  }
}

impl Default for Preprocessor {
  fn default() -> Self {
    Self::new(PreprocessConfig::default())
  }
}
