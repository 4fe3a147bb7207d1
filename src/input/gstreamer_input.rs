// 该文件是 Qianli （千里眼） 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 输入
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

//! # GStreamer 视频输入
//!
//! 输出帧统一为 BGR，保持源分辨率，缩放交给预处理。
//!
//! - `gst://camera/video0?width=640&height=480&fps=30` 打开 `/dev/video0`
//! - `gst://file/path/to/video.mp4` 解码视频文件
//!
//! 使用前需要安装 GStreamer 开发库：
//!
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev
//! ```

use std::collections::HashMap;

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{BGR_CHANNELS, BgrFrame},
};

#[derive(Error, Debug)]
pub enum GStreamerInputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("不支持的输入来源: {0}")]
  UnsupportedSource(String),
  #[error("GStreamer 错误: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer 布尔操作错误: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("找不到 appsink 元素")]
  AppSinkNotFound,
  #[error("无法转换为 appsink 元素")]
  AppSinkConversionFailed,
  #[error("无法从 caps 获取视频信息")]
  VideoInfoError,
  #[error("不支持的视频格式: {0:?}")]
  UnsupportedFormat(gst_video::VideoFormat),
  #[error("管道错误: {0}")]
  PipelineError(String),
  #[error("缓冲区大小不匹配: 期望 {expected} 字节, 实际 {actual} 字节")]
  BufferSizeMismatch { expected: usize, actual: usize },
  #[error("状态改变错误: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
}

enum Source {
  File(String),
  Camera {
    device: String,
    width: u32,
    height: u32,
    fps: u32,
  },
}

impl Source {
  fn to_pipeline(&self) -> String {
    match self {
      Source::File(path) => format!("filesrc location={} ! decodebin", path),
      Source::Camera {
        device,
        width,
        height,
        fps,
      } => format!(
        "v4l2src device={} ! videoconvert ! videoscale ! video/x-raw,width={},height={},framerate={}/1",
        device, width, height, fps
      ),
    }
  }
}

/// 由 URL 解析出的输入管道描述
pub struct GStreamerInputPipelineBuilder {
  source: Source,
}

impl FromUrlWithScheme for GStreamerInputPipelineBuilder {
  const SCHEME: &'static str = "gst";
}

impl FromUrl for GStreamerInputPipelineBuilder {
  type Error = GStreamerInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(GStreamerInputError::SchemeMismatch);
    }

    let query: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (String::from(k), String::from(v)))
      .collect();
    let number = |key: &str, default: u32| {
      query
        .get(key)
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
    };

    let source = match url.host_str() {
      Some("camera") => Source::Camera {
        device: format!("/dev{}", url.path()),
        width: number("width", 640),
        height: number("height", 480),
        fps: number("fps", 30),
      },
      Some("file") => Source::File(url.path().to_string()),
      other => {
        return Err(GStreamerInputError::UnsupportedSource(
          other.unwrap_or_default().to_string(),
        ));
      }
    };

    Ok(GStreamerInputPipelineBuilder { source })
  }
}

impl GStreamerInputPipelineBuilder {
  pub fn pipeline_description(&self) -> String {
    format!(
      "{} ! videoconvert ! video/x-raw,format=BGR ! appsink max-buffers=2 drop=true name=sink",
      self.source.to_pipeline()
    )
  }

  pub fn build(self) -> Result<GStreamerInput, GStreamerInputError> {
    gst::init()?;

    let description = self.pipeline_description();
    info!("GStreamer 输入管道: {}", description);

    let pipeline = gst::parse::launch(&description)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerInputError::PipelineError("无法创建管道".to_string()))?;

    let appsink = pipeline
      .by_name("sink")
      .ok_or(GStreamerInputError::AppSinkNotFound)?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerInputError::AppSinkConversionFailed)?;

    pipeline.set_state(gst::State::Playing)?;

    Ok(GStreamerInput { pipeline, appsink })
  }
}

pub struct GStreamerInput {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
}

impl Drop for GStreamerInput {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      tracing::warn!("无法停止 GStreamer 管道: {}", e);
    }
  }
}

impl Iterator for GStreamerInput {
  type Item = BgrFrame;

  fn next(&mut self) -> Option<Self::Item> {
    let sample = self
      .appsink
      .pull_sample()
      .map_err(|e| info!("视频流结束: {}", e))
      .ok()?;
    convert_sample(sample)
      .map_err(|e| error!("无法转换视频帧: {}", e))
      .ok()
  }
}

fn convert_sample(sample: gst::Sample) -> Result<BgrFrame, GStreamerInputError> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| GStreamerInputError::PipelineError("样本中没有缓冲区".to_string()))?;
  let caps = sample
    .caps()
    .ok_or_else(|| GStreamerInputError::PipelineError("样本中没有 caps".to_string()))?;

  let info =
    gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerInputError::VideoInfoError)?;
  if info.format() != gst_video::VideoFormat::Bgr {
    return Err(GStreamerInputError::UnsupportedFormat(info.format()));
  }

  let width = info.width() as usize;
  let height = info.height() as usize;
  let row = width * BGR_CHANNELS;
  let stride = info.stride()[0].max(0) as usize;

  let map = buffer
    .map_readable()
    .map_err(|e| GStreamerInputError::PipelineError(format!("无法映射缓冲区: {}", e)))?;
  let data = map.as_slice();

  let expected = stride * height.saturating_sub(1) + row;
  if stride < row || data.len() < expected {
    return Err(GStreamerInputError::BufferSizeMismatch {
      expected,
      actual: data.len(),
    });
  }

  // 去掉每行末尾的对齐填充
  let mut pixels = Vec::with_capacity(row * height);
  for y in 0..height {
    pixels.extend_from_slice(&data[y * stride..y * stride + row]);
  }

  BgrFrame::new(info.width(), info.height(), pixels)
    .map_err(|e| GStreamerInputError::PipelineError(e.to_string()))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn camera_url_builds_v4l2_pipeline() {
    let url = Url::parse("gst://camera/video0?width=320&height=240&fps=15").unwrap();
    let builder = GStreamerInputPipelineBuilder::from_url(&url).unwrap();
    let description = builder.pipeline_description();
    assert!(description.starts_with("v4l2src device=/dev/video0"));
    assert!(description.contains("width=320,height=240,framerate=15/1"));
    assert!(description.contains("format=BGR"));
  }

  #[test]
  fn file_url_builds_decode_pipeline() {
    let url = Url::parse("gst://file/data/street.mp4").unwrap();
    let builder = GStreamerInputPipelineBuilder::from_url(&url).unwrap();
    assert!(
      builder
        .pipeline_description()
        .starts_with("filesrc location=/data/street.mp4 ! decodebin")
    );
  }

  #[test]
  fn unknown_source_is_rejected() {
    let url = Url::parse("gst://rtsp/stream").unwrap();
    assert!(matches!(
      GStreamerInputPipelineBuilder::from_url(&url),
      Err(GStreamerInputError::UnsupportedSource(_))
    ));
  }
}
