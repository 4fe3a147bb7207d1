// 该文件是 Qianli （千里眼） 项目的一部分。
// src/ncs.rs - 神经计算棒驱动接口
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

//! # 加速器驱动接口
//!
//! [`Driver`] 对应 NCSDK v2 的设备、计算图、FIFO 三类句柄操作。
//! 句柄类型不透明，由具体后端决定：
//!
//! - `mvnc`：通过 FFI 调用 `libmvnc`（需要 `ncsdk` 特性）
//! - [`SimDriver`]：纯软件模拟的加速器，用于离线运行与测试
//!
//! 驱动本身不负责资源的释放顺序，顺序由 [`crate::session::Session`] 保证。

use thiserror::Error;

mod sim;
pub use self::sim::{SimDriver, SimDriverBuilder, SimEvent};

#[cfg(feature = "ncsdk")]
mod mvnc;
#[cfg(feature = "ncsdk")]
pub use self::mvnc::Mvnc;

/// 驱动返回的状态码
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NcStatus {
  #[error("设备忙")]
  Busy,
  #[error("未知错误")]
  Error,
  #[error("内存不足")]
  OutOfMemory,
  #[error("未找到设备")]
  DeviceNotFound,
  #[error("参数无效")]
  InvalidParameters,
  #[error("超时")]
  Timeout,
  #[error("未找到 MV 命令")]
  MvCmdNotFound,
  #[error("未分配")]
  NotAllocated,
  #[error("未授权")]
  Unauthorized,
  #[error("不支持的计算图文件")]
  UnsupportedGraphFile,
  #[error("不支持的配置文件")]
  UnsupportedConfigurationFile,
  #[error("不支持的特性")]
  UnsupportedFeature,
  #[error("Myriad 错误")]
  MyriadError,
  #[error("数据长度无效")]
  InvalidDataLength,
  #[error("句柄无效")]
  InvalidHandle,
  #[error("未知状态码 {0}")]
  Unknown(i32),
}

impl NcStatus {
  /// 将原生状态码转换为结果，`0` 为成功
  pub fn check(code: i32) -> Result<(), NcStatus> {
    match code {
      0 => Ok(()),
      -1 => Err(NcStatus::Busy),
      -2 => Err(NcStatus::Error),
      -3 => Err(NcStatus::OutOfMemory),
      -4 => Err(NcStatus::DeviceNotFound),
      -5 => Err(NcStatus::InvalidParameters),
      -6 => Err(NcStatus::Timeout),
      -7 => Err(NcStatus::MvCmdNotFound),
      -8 => Err(NcStatus::NotAllocated),
      -9 => Err(NcStatus::Unauthorized),
      -10 => Err(NcStatus::UnsupportedGraphFile),
      -11 => Err(NcStatus::UnsupportedConfigurationFile),
      -12 => Err(NcStatus::UnsupportedFeature),
      -13 => Err(NcStatus::MyriadError),
      -14 => Err(NcStatus::InvalidDataLength),
      -15 => Err(NcStatus::InvalidHandle),
      other => Err(NcStatus::Unknown(other)),
    }
  }

  pub fn code(&self) -> i32 {
    match self {
      NcStatus::Busy => -1,
      NcStatus::Error => -2,
      NcStatus::OutOfMemory => -3,
      NcStatus::DeviceNotFound => -4,
      NcStatus::InvalidParameters => -5,
      NcStatus::Timeout => -6,
      NcStatus::MvCmdNotFound => -7,
      NcStatus::NotAllocated => -8,
      NcStatus::Unauthorized => -9,
      NcStatus::UnsupportedGraphFile => -10,
      NcStatus::UnsupportedConfigurationFile => -11,
      NcStatus::UnsupportedFeature => -12,
      NcStatus::MyriadError => -13,
      NcStatus::InvalidDataLength => -14,
      NcStatus::InvalidHandle => -15,
      NcStatus::Unknown(code) => *code,
    }
  }
}

/// FIFO 方向（以主机视角）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FifoKind {
  /// 主机只读，设备写入
  HostReadOnly,
  /// 主机只写，设备读取
  HostWriteOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FifoDataType {
  Fp16,
  Fp32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FifoSpec {
  pub kind: FifoKind,
  pub depth: u32,
  pub data_type: FifoDataType,
}

impl FifoSpec {
  pub fn input(depth: u32) -> Self {
    Self {
      kind: FifoKind::HostWriteOnly,
      depth,
      data_type: FifoDataType::Fp32,
    }
  }

  pub fn output(depth: u32) -> Self {
    Self {
      kind: FifoKind::HostReadOnly,
      depth,
      data_type: FifoDataType::Fp32,
    }
  }
}

/// 加速器驱动
///
/// 所有方法都只做一次底层调用，不做重试。
pub trait Driver {
  type Device;
  type Graph;
  type Fifo;

  fn device_create(&self, index: u32) -> Result<Self::Device, NcStatus>;
  fn device_open(&self, device: &mut Self::Device) -> Result<(), NcStatus>;
  fn device_close(&self, device: &mut Self::Device) -> Result<(), NcStatus>;
  fn device_destroy(&self, device: Self::Device) -> Result<(), NcStatus>;

  fn graph_create(&self, name: &str) -> Result<Self::Graph, NcStatus>;
  fn graph_allocate_with_fifos(
    &self,
    device: &Self::Device,
    graph: &mut Self::Graph,
    blob: &[u8],
    input: &FifoSpec,
    output: &FifoSpec,
  ) -> Result<(Self::Fifo, Self::Fifo), NcStatus>;
  fn graph_destroy(&self, graph: Self::Graph) -> Result<(), NcStatus>;

  /// 将张量写入输入 FIFO 并排队推理，`tag` 会随结果一同返回
  fn queue_inference(
    &self,
    graph: &Self::Graph,
    input: &Self::Fifo,
    output: &Self::Fifo,
    tensor: &[f32],
    tag: usize,
  ) -> Result<(), NcStatus>;
  /// 可读元素个数，不阻塞
  fn fifo_fill_level(&self, fifo: &Self::Fifo) -> Result<u32, NcStatus>;
  /// 下一个元素的字节数
  fn fifo_element_size(&self, fifo: &Self::Fifo) -> Result<usize, NcStatus>;
  /// 读取下一个元素，返回 (字节数, tag)
  fn fifo_read(&self, fifo: &Self::Fifo, buffer: &mut [u8]) -> Result<(usize, usize), NcStatus>;
  fn fifo_destroy(&self, fifo: Self::Fifo) -> Result<(), NcStatus>;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn status_codes_round_trip() {
    assert_eq!(NcStatus::check(0), Ok(()));
    assert_eq!(NcStatus::check(-4), Err(NcStatus::DeviceNotFound));
    assert_eq!(NcStatus::check(-10), Err(NcStatus::UnsupportedGraphFile));
    assert_eq!(NcStatus::check(-42), Err(NcStatus::Unknown(-42)));
    assert_eq!(NcStatus::Unknown(-42).code(), -42);
    assert_eq!(NcStatus::Busy.code(), -1);
  }
}
