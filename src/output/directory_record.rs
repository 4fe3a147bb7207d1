// 该文件是 Qianli （千里眼） 项目的一部分。
// src/output/directory_record.rs - 目录记录输出
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

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};

use chrono::{Datelike, Utc};
use thiserror::Error;
use tracing::debug;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::BgrFrame,
  model::DetectResult,
  output::{
    Render,
    draw::{Draw, Record},
  },
};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 按日期分目录保存帧
///
/// `folder:///path?record=name` 保存原始帧并附带检测记录文本，
/// 否则保存标注后的帧。默认只保存有可显示检测结果的帧，`always` 时保存每一帧。
pub struct DirectoryRecordOutput {
  directory: PathBuf,
  draw: Draw,
  record: Option<Record>,
  frame_counter: AtomicU16,
  always: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    let record = uri
      .query_pairs()
      .find(|(k, _)| k == "record")
      .map(|(_, v)| Record {
        label_with_name: v != "id",
      });
    let always = uri.query_pairs().any(|(k, _)| k == "always");

    Ok(DirectoryRecordOutput {
      directory: PathBuf::from(uri.path()),
      draw: Draw::default(),
      record,
      frame_counter: AtomicU16::new(0),
      always,
    })
  }
}

impl DirectoryRecordOutput {
  pub fn with_draw(mut self, draw: Draw) -> Self {
    self.draw = draw;
    self
  }

  pub fn directory(&self) -> &Path {
    &self.directory
  }

  fn frame_id(&self) -> u16 {
    self.frame_counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
  }

  fn frame_path(&self) -> Result<PathBuf, DirectoryRecordOutputError> {
    let now = Utc::now();
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    std::fs::create_dir_all(&directory)?;

    Ok(directory.join(format!(
      "{}-{:04X}.png",
      now.format("%H-%M-%S"),
      self.frame_id()
    )))
  }
}

impl Render<BgrFrame, DetectResult> for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn render_result(&self, frame: &BgrFrame, result: &DetectResult) -> Result<(), Self::Error> {
    let shown = DetectResult {
      items: self.draw.filter().apply(result).copied().collect(),
    };
    if !self.always && shown.is_empty() {
      return Ok(());
    }

    let path = self.frame_path()?;
    match &self.record {
      Some(record) => {
        frame.to_rgb_image().save(&path)?;
        record.record(&shown, &path)?;
      }
      None => {
        self.draw.annotate(frame, result).to_rgb_image().save(&path)?;
      }
    }
    debug!("记录帧: {}", path.display());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::Detection;
  use url::Url;

  fn files_with_extension(dir: &Path, extension: &str) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
      return 0;
    };
    entries
      .flatten()
      .map(|entry| {
        let path = entry.path();
        if path.is_dir() {
          files_with_extension(&path, extension)
        } else {
          usize::from(path.extension().is_some_and(|e| e == extension))
        }
      })
      .sum()
  }

  fn person() -> DetectResult {
    DetectResult {
      items: vec![Detection {
        image_id: 0,
        class_id: 15,
        score: 0.9,
        bbox: [0.1, 0.1, 0.5, 0.5],
      }]
      .into_boxed_slice(),
    }
  }

  fn scratch_dir(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("qianli-folder-{}-{}", std::process::id(), name))
  }

  #[test]
  fn skips_frames_without_detections() {
    let dir = scratch_dir("skip");
    let url = Url::parse(&format!("folder://{}", dir.display())).unwrap();
    let output = DirectoryRecordOutput::from_url(&url).unwrap();

    let frame = BgrFrame::filled(16, 16, [0, 0, 0]);
    output.render_result(&frame, &DetectResult::default()).unwrap();
    assert_eq!(files_with_extension(&dir, "png"), 0);

    output.render_result(&frame, &person()).unwrap();
    assert_eq!(files_with_extension(&dir, "png"), 1);

    std::fs::remove_dir_all(&dir).unwrap();
  }

  #[test]
  fn record_mode_writes_text_next_to_frame() {
    let dir = scratch_dir("record");
    let url = Url::parse(&format!("folder://{}?record=id&always", dir.display())).unwrap();
    let output = DirectoryRecordOutput::from_url(&url).unwrap();

    let frame = BgrFrame::filled(16, 16, [0, 0, 0]);
    output.render_result(&frame, &DetectResult::default()).unwrap();
    output.render_result(&frame, &person()).unwrap();

    assert_eq!(files_with_extension(&dir, "png"), 2);
    assert_eq!(files_with_extension(&dir, "txt"), 2);

    std::fs::remove_dir_all(&dir).unwrap();
  }
}
