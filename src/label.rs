// 该文件是 Qianli （千里眼） 项目的一部分。
// src/label.rs - VOC 类别标签
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

/// 以类别编号为下标的显示名称，自行车、汽车、公交车、摩托车统一显示为 vehicle
pub const VOC_LABELS: [&str; 21] = [
  "background",
  "aeroplane",
  "vehicle",
  "bird",
  "boat",
  "bottle",
  "vehicle",
  "vehicle",
  "cat",
  "chair",
  "cow",
  "diningtable",
  "dog",
  "horse",
  "vehicle",
  "person",
  "pottedplant",
  "sheep",
  "sofa",
  "train",
  "tvmonitor",
];

pub const UNKNOWN_LABEL: &str = "unknown";

pub fn label_name(class_id: i32) -> &'static str {
  usize::try_from(class_id)
    .ok()
    .and_then(|idx| VOC_LABELS.get(idx))
    .copied()
    .unwrap_or(UNKNOWN_LABEL)
}
