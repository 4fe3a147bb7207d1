// 该文件是 Qianli （千里眼） 项目的一部分。
// src/model/decode.rs - SSD 输出解码
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

use thiserror::Error;
use tracing::debug;

use crate::model::{DetectResult, Detection};

/// 每条记录 7 个浮点数: image_id, class_id, score, left, top, right, bottom
pub const RECORD_LEN: usize = 7;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
  #[error("推理结果格式错误: {0}")]
  Malformed(String),
}

/// 解析 SSD 的扁平输出
///
/// `raw[0]` 为检测数 N，第一个 7 元组为保留头部，第 i 条记录从
/// `7 + 7 * i` 开始。保持原始顺序，不做过滤。
pub fn decode(raw: &[f32]) -> Result<DetectResult, DecodeError> {
  let count = *raw
    .first()
    .ok_or_else(|| DecodeError::Malformed("结果为空".to_string()))?;
  if !count.is_finite() || count < 0.0 || count.fract() != 0.0 {
    return Err(DecodeError::Malformed(format!("检测数无效: {}", count)));
  }

  let count = count as usize;
  let needed = count
    .checked_mul(RECORD_LEN)
    .and_then(|n| n.checked_add(RECORD_LEN))
    .ok_or_else(|| DecodeError::Malformed(format!("检测数过大: {}", count)))?;
  if raw.len() < needed {
    return Err(DecodeError::Malformed(format!(
      "检测数 {} 需要 {} 个浮点数, 实际 {} 个",
      count,
      needed,
      raw.len()
    )));
  }

  let items = raw[RECORD_LEN..needed]
    .chunks_exact(RECORD_LEN)
    .map(|r| Detection {
      image_id: r[0] as i32,
      class_id: r[1] as i32,
      score: r[2],
      bbox: [r[3], r[4], r[5], r[6]],
    })
    .collect::<Box<[Detection]>>();

  debug!("解码得到 {} 个检测结果", items.len());
  Ok(DetectResult { items })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn with_records(records: &[[f32; 7]]) -> Vec<f32> {
    let mut raw = vec![0.0; RECORD_LEN];
    raw[0] = records.len() as f32;
    raw.extend(records.iter().flatten());
    raw
  }

  #[test]
  fn zero_detections() {
    let result = decode(&[0.0; 7]).unwrap();
    assert!(result.is_empty());
  }

  #[test]
  fn records_start_after_header() {
    let raw = with_records(&[
      [0.0, 15.0, 0.9, 0.1, 0.1, 0.5, 0.5],
      [0.0, 7.0, 0.4, 0.2, 0.3, 0.6, 0.7],
    ]);
    let result = decode(&raw).unwrap();

    assert_eq!(result.len(), 2);
    assert_eq!(result.items[0].class_id, 15);
    assert_eq!(result.items[0].score, 0.9);
    assert_eq!(result.items[0].bbox, [0.1, 0.1, 0.5, 0.5]);
    assert_eq!(result.items[1].class_id, 7);
    assert_eq!(result.items[1].bbox, [0.2, 0.3, 0.6, 0.7]);
  }

  #[test]
  fn header_values_other_than_count_are_ignored() {
    let mut raw = with_records(&[[0.0, 2.0, 0.5, 0.0, 0.0, 1.0, 1.0]]);
    raw[1..7].copy_from_slice(&[9.0; 6]);
    assert_eq!(decode(&raw).unwrap().items[0].class_id, 2);
  }

  #[test]
  fn extra_trailing_data_is_ignored() {
    let mut raw = with_records(&[[0.0, 2.0, 0.5, 0.0, 0.0, 1.0, 1.0]]);
    raw.extend([1.0; 14]);
    assert_eq!(decode(&raw).unwrap().len(), 1);
  }

  #[test]
  fn count_beyond_buffer_is_malformed() {
    let mut raw = with_records(&[[0.0, 2.0, 0.5, 0.0, 0.0, 1.0, 1.0]]);
    raw[0] = 3.0;
    assert!(matches!(decode(&raw), Err(DecodeError::Malformed(_))));
  }

  #[test]
  fn invalid_counts_are_malformed() {
    for count in [-1.0, f32::NAN, f32::INFINITY, 1.5, 1e30] {
      let mut raw = vec![0.0; 14];
      raw[0] = count;
      assert!(decode(&raw).is_err(), "count {} accepted", count);
    }
    assert!(decode(&[]).is_err());
  }

  #[test]
  fn decoding_is_idempotent() {
    let raw = with_records(&[[0.0, 15.0, 0.9, 0.1, 0.1, 0.5, 0.5]]);
    assert_eq!(decode(&raw).unwrap(), decode(&raw).unwrap());
  }
}
