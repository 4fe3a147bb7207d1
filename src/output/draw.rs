// 该文件是 Qianli （千里眼） 项目的一部分。
// src/output/draw.rs - 检测结果筛选与叠加绘制
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

use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use image::Rgb;
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::DisplayConfig;
use crate::frame::{BgrFrame, BgrImage};
use crate::label::label_name;
use crate::model::{DetectResult, Detection};

// 颜色均为 BGR 顺序
const BOX_COLOR: [u8; 3] = [0, 0, 255];
const LABEL_BACKGROUND: [u8; 3] = [125, 175, 75];
const LABEL_TEXT_COLOR: [u8; 3] = [255, 255, 255];
const BOX_THICKNESS: i32 = 2;
const LABEL_FONT_SIZE: f32 = 16.0;
const LABEL_TEXT_HEIGHT: u32 = 12;
const LABEL_CHAR_WIDTH: u32 = 9; // 无字体时的估计宽度

#[derive(Error, Debug)]
pub enum DrawError {
  #[error("无法读取字体文件: {0}")]
  FontIo(#[from] std::io::Error),
  #[error("字体文件无效")]
  InvalidFont,
}

/// 显示筛选：分数百分比严格大于阈值，且类别在白名单内
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayFilter {
  min_score_percent: f32,
  allowed_classes: Vec<i32>,
}

impl DisplayFilter {
  pub fn new(config: &DisplayConfig) -> Self {
    Self {
      min_score_percent: config.min_score_percent,
      allowed_classes: config.allowed_classes.clone(),
    }
  }

  pub fn accepts(&self, detection: &Detection) -> bool {
    detection.score * 100.0 > self.min_score_percent
      && self.allowed_classes.contains(&detection.class_id)
  }

  pub fn apply<'a>(&'a self, result: &'a DetectResult) -> impl Iterator<Item = &'a Detection> {
    result.iter().filter(move |d| self.accepts(d))
  }
}

impl Default for DisplayFilter {
  fn default() -> Self {
    Self::new(&DisplayConfig::default())
  }
}

/// 像素坐标下的检测框
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelBox {
  pub left: i32,
  pub top: i32,
  pub right: i32,
  pub bottom: i32,
}

impl PixelBox {
  pub fn width(&self) -> i32 {
    self.right - self.left
  }

  pub fn height(&self) -> i32 {
    self.bottom - self.top
  }
}

/// 将归一化坐标乘以帧尺寸后截断为整数，不做裁剪
pub fn denormalize(detection: &Detection, width: u32, height: u32) -> PixelBox {
  let (w, h) = (width as f32, height as f32);
  PixelBox {
    left: (detection.bbox[0] * w) as i32,
    top: (detection.bbox[1] * h) as i32,
    right: (detection.bbox[2] * w) as i32,
    bottom: (detection.bbox[3] * h) as i32,
  }
}

/// 标签文本，如 `person90%`
pub fn label_text(detection: &Detection) -> String {
  format!(
    "{}{}%",
    label_name(detection.class_id),
    (detection.score * 100.0) as i32
  )
}

pub struct Draw {
  filter: DisplayFilter,
  font: Option<FontVec>,
  font_scale: PxScale,
}

impl Draw {
  pub fn new(filter: DisplayFilter) -> Self {
    Self {
      filter,
      font: None,
      font_scale: PxScale::from(LABEL_FONT_SIZE),
    }
  }

  /// 按显示配置构建，配置了字体时一并加载
  pub fn from_config(config: &DisplayConfig) -> Result<Self, DrawError> {
    let draw = Self::new(DisplayFilter::new(config));
    match &config.font {
      Some(path) => draw.with_font_file(path),
      None => Ok(draw),
    }
  }

  /// 加载标签字体，未加载字体时只绘制边框和标签底色
  pub fn with_font_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self, DrawError> {
    let data = std::fs::read(path.as_ref())?;
    let font = FontVec::try_from_vec(data).map_err(|_| DrawError::InvalidFont)?;
    info!("加载标签字体: {}", path.as_ref().display());
    self.font = Some(font);
    Ok(self)
  }

  pub fn filter(&self) -> &DisplayFilter {
    &self.filter
  }

  fn label_size(&self, text: &str) -> (u32, u32) {
    match &self.font {
      Some(font) => text_size(self.font_scale, font, text),
      None => (text.len() as u32 * LABEL_CHAR_WIDTH, LABEL_TEXT_HEIGHT),
    }
  }

  fn draw_box(&self, image: &mut BgrImage, pixel_box: &PixelBox) {
    for inset in 0..BOX_THICKNESS {
      let width = pixel_box.width() - 2 * inset + 1;
      let height = pixel_box.height() - 2 * inset + 1;
      if width <= 0 || height <= 0 {
        break;
      }
      let rect = Rect::at(pixel_box.left + inset, pixel_box.top + inset)
        .of_size(width as u32, height as u32);
      draw_hollow_rect_mut(image, rect, Rgb(BOX_COLOR));
    }
  }

  fn draw_label(&self, image: &mut BgrImage, pixel_box: &PixelBox, text: &str) {
    let (text_width, text_height) = self.label_size(text);
    let left = pixel_box.left;
    let top = (pixel_box.top - text_height as i32).max(1);

    let background = Rect::at(left - 1, top - 1).of_size(text_width + 2, text_height + 2);
    draw_filled_rect_mut(image, background, Rgb(LABEL_BACKGROUND));

    if let Some(font) = &self.font {
      draw_text_mut(
        image,
        Rgb(LABEL_TEXT_COLOR),
        left,
        top,
        self.font_scale,
        font,
        text,
      );
    }
  }

  /// 在图像上绘制通过筛选的检测结果，返回绘制数量
  pub fn draw_detections(&self, image: &mut BgrImage, result: &DetectResult) -> usize {
    let (width, height) = image.dimensions();
    let mut drawn = 0;
    for detection in self.filter.apply(result) {
      let pixel_box = denormalize(detection, width, height);
      let text = label_text(detection);
      debug!(
        "绘制 {}: ({}, {}) - ({}, {})",
        text, pixel_box.left, pixel_box.top, pixel_box.right, pixel_box.bottom
      );
      self.draw_box(image, &pixel_box);
      self.draw_label(image, &pixel_box, &text);
      drawn += 1;
    }
    drawn
  }

  pub fn annotate(&self, frame: &BgrFrame, result: &DetectResult) -> BgrFrame {
    let mut image = frame.to_bgr_image();
    self.draw_detections(&mut image, result);
    BgrFrame::from_bgr_image(image)
  }
}

impl Default for Draw {
  fn default() -> Self {
    Self::new(DisplayFilter::default())
  }
}

/// 将检测结果写成与图像同名的文本文件
pub struct Record {
  pub label_with_name: bool,
}

impl Record {
  pub fn format(&self, result: &DetectResult) -> String {
    result
      .iter()
      .map(|item| {
        let name = if self.label_with_name {
          label_name(item.class_id).to_string()
        } else {
          item.class_id.to_string()
        };
        format!(
          "{}, {:.4}, {:.4}, {:.4}, {:.4}, {:.4}",
          name, item.score, item.bbox[0], item.bbox[1], item.bbox[2], item.bbox[3]
        )
      })
      .collect::<Vec<String>>()
      .join("\n")
  }

  pub fn record(&self, result: &DetectResult, path: &Path) -> Result<(), std::io::Error> {
    std::fs::write(path.with_extension("txt"), self.format(result))
  }
}
