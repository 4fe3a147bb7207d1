// 该文件是 Qianli （千里眼） 项目的一部分。
// src/model.rs - 模型
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

use crate::session::Ticket;

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&mut self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
  fn postprocess(output: &[f32]) -> Result<Self::Output, Self::Error>;
}

/// 提交与取回分离的模型，最多 `depth()` 个输入同时在途
///
/// `collect` 按提交顺序返回结果及其对应的标记。
pub trait PipelinedModel: Model {
  fn submit(&mut self, input: &Self::Input) -> Result<Ticket, Self::Error>;
  fn collect(&mut self) -> Result<(Ticket, Self::Output), Self::Error>;
  fn in_flight(&self) -> usize;
  fn depth(&self) -> usize;
}

/// 区分只影响当前帧的错误与必须终止处理的错误
pub trait Recoverable {
  fn is_recoverable(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
  pub image_id: i32,
  pub class_id: i32,
  pub score: f32,
  pub bbox: [f32; 4], // [left, top, right, bottom]，归一化坐标
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectResult {
  pub items: Box<[Detection]>,
}

impl DetectResult {
  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn iter(&self) -> std::slice::Iter<'_, Detection> {
    self.items.iter()
  }
}

mod decode;
pub use self::decode::{DecodeError, RECORD_LEN, decode};

mod ssd;
pub use self::ssd::{DetectorError, SsdDetector, SsdDetectorBuilder};
