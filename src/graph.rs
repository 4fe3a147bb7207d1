// 该文件是 Qianli （千里眼） 项目的一部分。
// src/graph.rs - 计算图文件读取
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

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{ChannelOrder, PreprocessConfig};

#[derive(Error, Debug)]
pub enum GraphError {
  #[error("无法打开计算图文件 {path}: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("计算图文件读取不完整: 期望 {expected} 字节, 实际 {actual} 字节")]
  Read { expected: u64, actual: u64 },
  #[error("计算图约定文件解析错误 {path}: {source}")]
  Contract {
    path: PathBuf,
    source: serde_json::Error,
  },
}

/// 从磁盘读出的计算图原始数据，上传到设备后即释放
#[derive(Debug, Clone)]
pub struct GraphBlob {
  bytes: Box<[u8]>,
}

impl GraphBlob {
  pub fn len(&self) -> usize {
    self.bytes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.bytes.is_empty()
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.bytes
  }
}

impl From<Vec<u8>> for GraphBlob {
  fn from(bytes: Vec<u8>) -> Self {
    Self {
      bytes: bytes.into_boxed_slice(),
    }
  }
}

pub struct GraphStore;

impl GraphStore {
  /// 读取整个计算图文件
  pub fn load<P: AsRef<Path>>(path: P) -> Result<GraphBlob, GraphError> {
    let path = path.as_ref();
    let io_error = |source| GraphError::Io {
      path: path.to_path_buf(),
      source,
    };

    info!("加载计算图文件: {}", path.display());
    let file = File::open(path).map_err(io_error)?;
    let expected = file.metadata().map_err(io_error)?.len();
    Self::read_blob(path, file, expected)
  }

  /// 从 `reader` 读出全部数据，少于 `expected` 字节时报错
  fn read_blob<R: Read>(path: &Path, mut reader: R, expected: u64) -> Result<GraphBlob, GraphError> {
    let mut bytes = Vec::with_capacity(expected as usize);
    let actual = reader
      .read_to_end(&mut bytes)
      .map_err(|source| GraphError::Io {
        path: path.to_path_buf(),
        source,
      })? as u64;
    if actual < expected {
      return Err(GraphError::Read { expected, actual });
    }

    debug!(
      "计算图文件大小: {:.2} MB",
      bytes.len() as f64 / (1024.0 * 1024.0)
    );
    Ok(GraphBlob::from(bytes))
  }

  /// 计算图旁的约定文件路径，即 `<graph>.json`
  pub fn contract_path<P: AsRef<Path>>(path: P) -> PathBuf {
    let mut name = path.as_ref().as_os_str().to_os_string();
    name.push(".json");
    PathBuf::from(name)
  }

  /// 读取计算图约定文件，不存在时返回 `None`
  pub fn load_contract<P: AsRef<Path>>(path: P) -> Result<Option<GraphContract>, GraphError> {
    let contract_path = Self::contract_path(path);
    if !contract_path.exists() {
      return Ok(None);
    }

    let text = std::fs::read_to_string(&contract_path).map_err(|source| GraphError::Io {
      path: contract_path.clone(),
      source,
    })?;
    let contract = serde_json::from_str(&text).map_err(|source| GraphError::Contract {
      path: contract_path,
      source,
    })?;
    Ok(Some(contract))
  }
}

/// 计算图导出时使用的预处理参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphContract {
  pub width: u32,
  pub height: u32,
  pub mean: [f32; 3],
  pub scale: [f32; 3],
  pub channel_order: ChannelOrder,
}

impl GraphContract {
  /// 与当前预处理配置对比，返回所有不一致项
  pub fn mismatches(&self, config: &PreprocessConfig) -> Vec<String> {
    const EPSILON: f32 = 1e-6;
    let close = |a: &[f32; 3], b: &[f32; 3]| a.iter().zip(b).all(|(x, y)| (x - y).abs() <= EPSILON);

    let mut mismatches = Vec::new();
    if (self.width, self.height) != (config.width, config.height) {
      mismatches.push(format!(
        "输入尺寸: 计算图 {}x{}, 配置 {}x{}",
        self.width, self.height, config.width, config.height
      ));
    }
    if !close(&self.mean, &config.mean) {
      mismatches.push(format!(
        "均值: 计算图 {:?}, 配置 {:?}",
        self.mean, config.mean
      ));
    }
    if !close(&self.scale, &config.scale) {
      mismatches.push(format!(
        "缩放: 计算图 {:?}, 配置 {:?}",
        self.scale, config.scale
      ));
    }
    if self.channel_order != config.channel_order {
      mismatches.push(format!(
        "通道顺序: 计算图 {:?}, 配置 {:?}",
        self.channel_order, config.channel_order
      ));
    }
    mismatches
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn scratch_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("qianli-{}-{}", std::process::id(), name))
  }

  #[test]
  fn loads_whole_file() {
    let path = scratch_path("whole.graph");
    std::fs::write(&path, [7u8; 1024]).unwrap();

    let blob = GraphStore::load(&path).unwrap();
    assert_eq!(blob.len(), 1024);
    assert!(blob.as_bytes().iter().all(|&b| b == 7));

    std::fs::remove_file(&path).unwrap();
  }

  #[test]
  fn missing_file_is_io_error() {
    let err = GraphStore::load(scratch_path("missing.graph")).unwrap_err();
    assert!(matches!(err, GraphError::Io { .. }));
  }

  #[test]
  fn truncated_read_is_reported() {
    let err = GraphStore::read_blob(Path::new("short.graph"), &[7u8; 10][..], 20).unwrap_err();
    assert!(matches!(
      err,
      GraphError::Read {
        expected: 20,
        actual: 10
      }
    ));
  }

  #[test]
  fn contract_path_appends_json() {
    assert_eq!(
      GraphStore::contract_path("./ssd.graph"),
      PathBuf::from("./ssd.graph.json")
    );
  }

  #[test]
  fn absent_contract_is_none() {
    let path = scratch_path("nocontract.graph");
    assert!(GraphStore::load_contract(&path).unwrap().is_none());
  }

  #[test]
  fn contract_reports_every_mismatch() {
    let path = scratch_path("contract.graph");
    std::fs::write(
      GraphStore::contract_path(&path),
      r#"{ "width": 300, "height": 300, "mean": [127.5, 127.5, 127.5],
           "scale": [0.0078125, 0.0078125, 0.0078125], "channel_order": "rgb" }"#,
    )
    .unwrap();

    let contract = GraphStore::load_contract(&path).unwrap().unwrap();
    let mismatches = contract.mismatches(&PreprocessConfig::default());
    assert_eq!(mismatches.len(), 2);

    let matching = GraphContract {
      width: 300,
      height: 300,
      mean: [127.5; 3],
      scale: [0.007843; 3],
      channel_order: ChannelOrder::Bgr,
    };
    assert!(matching.mismatches(&PreprocessConfig::default()).is_empty());

    std::fs::remove_file(GraphStore::contract_path(&path)).unwrap();
  }
}
