// 该文件是 Qianli （千里眼） 项目的一部分。
// src/output/gstreamer_video_output.rs - GStreamer 显示与视频文件输出
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

//! # GStreamer 视频输出
//!
//! - `gst://display` 在窗口中显示标注后的帧
//! - `gst://file/<path>` 编码保存为视频文件，按扩展名选择封装 (mp4/mkv/avi/webm)
//!
//! 帧尺寸在收到第一帧时确定。可选参数 `fps`，默认 30。
//!
//! ```no_run
//! use qianli::{FromUrl, output::GStreamerVideoOutput};
//! use url::Url;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let display = GStreamerVideoOutput::from_url(&Url::parse("gst://display")?)?;
//! let file = GStreamerVideoOutput::from_url(&Url::parse("gst://file/tmp/out.mp4?fps=15")?)?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Mutex;

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::BgrFrame,
  model::DetectResult,
  output::{Render, draw::Draw},
};

#[derive(Error, Debug)]
pub enum GStreamerVideoOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("不支持的输出目标: {0}")]
  UnsupportedTarget(String),
  #[error("GStreamer 错误: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer 布尔操作错误: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("找不到 appsrc 元素")]
  AppSrcNotFound,
  #[error("无法转换为 appsrc 元素")]
  AppSrcConversionFailed,
  #[error("管道错误: {0}")]
  PipelineError(String),
  #[error("状态改变错误: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
  #[error("帧尺寸变化: {expected:?} -> {actual:?}")]
  FrameSizeChanged {
    expected: (u32, u32),
    actual: (u32, u32),
  },
}

#[derive(Default)]
struct StreamState {
  size: Option<(u32, u32)>,
  frame_count: u64,
}

pub struct GStreamerVideoOutput {
  pipeline: gst::Pipeline,
  appsrc: gst_app::AppSrc,
  fps: i32,
  draw: Draw,
  state: Mutex<StreamState>,
}

impl FromUrlWithScheme for GStreamerVideoOutput {
  const SCHEME: &'static str = "gst";
}

fn file_pipeline(path: &str) -> String {
  let encoder = if path.ends_with(".mkv") {
    "video/x-raw,format=I420 ! x264enc speed-preset=fast ! h264parse ! matroskamux"
  } else if path.ends_with(".avi") {
    "video/x-raw,format=I420 ! x264enc ! avimux"
  } else if path.ends_with(".webm") {
    "vp8enc ! webmmux"
  } else {
    "video/x-raw,format=I420 ! x264enc speed-preset=fast tune=zerolatency ! h264parse ! mp4mux"
  };
  format!(
    "appsrc name=src ! videoconvert ! {} ! filesink location={}",
    encoder, path
  )
}

impl FromUrl for GStreamerVideoOutput {
  type Error = GStreamerVideoOutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(GStreamerVideoOutputError::SchemeMismatch);
    }

    let query: HashMap<_, _> = url.query_pairs().collect();
    let fps: i32 = query
      .get("fps")
      .and_then(|v| v.parse().ok())
      .filter(|fps| *fps > 0)
      .unwrap_or(30);

    let pipeline_desc = match url.host_str() {
      Some("display") => "appsrc name=src ! videoconvert ! autovideosink sync=false".to_string(),
      Some("file") => file_pipeline(url.path()),
      other => {
        return Err(GStreamerVideoOutputError::UnsupportedTarget(
          other.unwrap_or_default().to_string(),
        ));
      }
    };

    gst::init()?;
    info!("创建视频输出管道: {}", pipeline_desc);

    let pipeline = gst::parse::launch(&pipeline_desc)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerVideoOutputError::PipelineError("无法创建管道".to_string()))?;

    let appsrc = pipeline
      .by_name("src")
      .ok_or(GStreamerVideoOutputError::AppSrcNotFound)?
      .downcast::<gst_app::AppSrc>()
      .map_err(|_| GStreamerVideoOutputError::AppSrcConversionFailed)?;
    appsrc.set_format(gst::Format::Time);

    Ok(GStreamerVideoOutput {
      pipeline,
      appsrc,
      fps,
      draw: Draw::default(),
      state: Mutex::new(StreamState::default()),
    })
  }
}

impl Drop for GStreamerVideoOutput {
  fn drop(&mut self) {
    let _ = self.appsrc.end_of_stream();

    // 等待 EOS 写入文件尾
    std::thread::sleep(std::time::Duration::from_millis(100));

    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("无法停止视频输出管道: {}", e);
    }

    if let Ok(state) = self.state.lock() {
      info!("视频输出关闭，共写入 {} 帧", state.frame_count);
    }
  }
}

impl GStreamerVideoOutput {
  pub fn with_draw(mut self, draw: Draw) -> Self {
    self.draw = draw;
    self
  }

  fn push_frame(&self, frame: &BgrFrame) -> Result<(), GStreamerVideoOutputError> {
    let mut state = self
      .state
      .lock()
      .map_err(|_| GStreamerVideoOutputError::PipelineError("输出状态锁已损坏".to_string()))?;

    let size = (frame.width(), frame.height());
    match state.size {
      None => {
        let caps = gst::Caps::builder("video/x-raw")
          .field("format", "BGR")
          .field("width", size.0 as i32)
          .field("height", size.1 as i32)
          .field("framerate", gst::Fraction::new(self.fps, 1))
          .build();
        self.appsrc.set_caps(Some(&caps));
        self.pipeline.set_state(gst::State::Playing)?;
        info!("视频输出启动: {}x{} @ {} fps", size.0, size.1, self.fps);
        state.size = Some(size);
      }
      Some(expected) if expected != size => {
        return Err(GStreamerVideoOutputError::FrameSizeChanged {
          expected,
          actual: size,
        });
      }
      Some(_) => {}
    }

    let mut buffer = gst::Buffer::from_slice(frame.as_bgr().to_vec());
    let frame_duration = 1_000_000_000 / self.fps as u64;
    if let Some(buffer) = buffer.get_mut() {
      buffer.set_pts(gst::ClockTime::from_nseconds(
        state.frame_count * frame_duration,
      ));
      buffer.set_duration(gst::ClockTime::from_nseconds(frame_duration));
    }
    state.frame_count += 1;

    self.appsrc.push_buffer(buffer).map_err(|e| {
      GStreamerVideoOutputError::PipelineError(format!("无法推送缓冲区: {:?}", e))
    })?;

    Ok(())
  }
}

impl Render<BgrFrame, DetectResult> for GStreamerVideoOutput {
  type Error = GStreamerVideoOutputError;

  fn render_result(&self, frame: &BgrFrame, result: &DetectResult) -> Result<(), Self::Error> {
    let annotated = self.draw.annotate(frame, result);
    self.push_frame(&annotated)
  }
}
