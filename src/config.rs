// 该文件是 Qianli （千里眼） 项目的一部分。
// src/config.rs - 流水线配置
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

//! 流水线配置
//!
//! 网络输入尺寸、通道顺序、均值与缩放系数属于计算图的接口约定，
//! 必须与导出计算图时使用的值完全一致；不一致不会报错，只会得到错误的检测结果。

use std::{
  path::{Path, PathBuf},
  time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub const DEFAULT_GRAPH_PATH: &str = "./ssd.graph";
pub const DEFAULT_GRAPH_NAME: &str = "ssdGraph";
pub const NETWORK_IMAGE_WIDTH: u32 = 300;
pub const NETWORK_IMAGE_HEIGHT: u32 = 300;
pub const NETWORK_MEAN: [f32; 3] = [127.5, 127.5, 127.5];
pub const NETWORK_SCALE: [f32; 3] = [0.007843, 0.007843, 0.007843];
pub const MAX_NCS_CONNECTED: u32 = 1;
pub const FIFO_DEPTH: u32 = 2;
pub const MIN_SCORE_PERCENT: f32 = 20.0;
pub const DISPLAY_CLASSES: [i32; 6] = [2, 4, 6, 7, 14, 15];
/// 单个结果元素的字节数上限，防止设备报告异常大小
pub const MAX_RESULT_BYTES: usize = 1 << 20;
pub const RETRIEVE_TIMEOUT_MS: u64 = 2000;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("读取配置文件错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("解析配置文件错误: {0}")]
  ParseError(#[from] serde_json::Error),
  #[error("配置无效: {0}")]
  Invalid(String),
}

/// 像素通道顺序，由计算图训练时的约定决定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
  Bgr,
  Rgb,
}

/// 预处理约定：输入尺寸 + 通道顺序 + 每通道仿射变换
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
  pub width: u32,
  pub height: u32,
  pub mean: [f32; 3],
  pub scale: [f32; 3],
  pub channel_order: ChannelOrder,
}

impl Default for PreprocessConfig {
  fn default() -> Self {
    Self {
      width: NETWORK_IMAGE_WIDTH,
      height: NETWORK_IMAGE_HEIGHT,
      mean: NETWORK_MEAN,
      scale: NETWORK_SCALE,
      channel_order: ChannelOrder::Bgr,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
  pub graph_name: String,
  pub fifo_depth: u32,
  pub max_result_bytes: usize,
  /// 等待结果的超时（毫秒），`None` 表示一直阻塞
  pub retrieve_timeout_ms: Option<u64>,
}

impl Default for SessionConfig {
  fn default() -> Self {
    Self {
      graph_name: DEFAULT_GRAPH_NAME.to_string(),
      fifo_depth: FIFO_DEPTH,
      max_result_bytes: MAX_RESULT_BYTES,
      retrieve_timeout_ms: Some(RETRIEVE_TIMEOUT_MS),
    }
  }
}

impl SessionConfig {
  pub fn retrieve_timeout(&self) -> Option<Duration> {
    self.retrieve_timeout_ms.map(Duration::from_millis)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
  pub min_score_percent: f32,
  pub allowed_classes: Vec<i32>,
  /// 标签字体 (TTF/OTF)，为空时不绘制标签文字
  pub font: Option<PathBuf>,
}

impl Default for DisplayConfig {
  fn default() -> Self {
    Self {
      min_score_percent: MIN_SCORE_PERCENT,
      allowed_classes: DISPLAY_CLASSES.to_vec(),
      font: None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
  pub max_devices: u32,
  pub preprocess: PreprocessConfig,
  pub session: SessionConfig,
  pub display: DisplayConfig,
  /// 计算图约定与预处理配置不一致时是否直接失败
  pub strict_contract: bool,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      max_devices: MAX_NCS_CONNECTED,
      preprocess: PreprocessConfig::default(),
      session: SessionConfig::default(),
      display: DisplayConfig::default(),
      strict_contract: false,
    }
  }
}

impl PipelineConfig {
  pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    info!("加载配置文件: {}", path.display());
    let text = std::fs::read_to_string(path)?;
    let config: Self = serde_json::from_str(&text)?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.max_devices == 0 {
      return Err(ConfigError::Invalid("max_devices 不能为 0".to_string()));
    }
    if self.preprocess.width == 0 || self.preprocess.height == 0 {
      return Err(ConfigError::Invalid(format!(
        "网络输入尺寸无效: {}x{}",
        self.preprocess.width, self.preprocess.height
      )));
    }
    if self.session.fifo_depth == 0 {
      return Err(ConfigError::Invalid("fifo_depth 不能为 0".to_string()));
    }
    if self.session.max_result_bytes < 4 {
      return Err(ConfigError::Invalid(
        "max_result_bytes 至少为 4 字节".to_string(),
      ));
    }
    Ok(())
  }
}
