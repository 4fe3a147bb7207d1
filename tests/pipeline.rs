// 该文件是 Qianli （千里眼） 项目的一部分。
// tests/pipeline.rs - 端到端流水线测试
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

use std::cell::RefCell;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use qianli::{
  config::PipelineConfig,
  frame::BgrFrame,
  model::{DetectResult, Model, SsdDetectorBuilder},
  ncs::{FifoKind, SimDriver, SimEvent},
  output::{DisplayFilter, Draw, PixelBox, Render, denormalize},
  task::{PipelinedTask, Task},
};

fn scratch_graph(name: &str) -> PathBuf {
  let path = std::env::temp_dir().join(format!("qianli-it-{}-{}", std::process::id(), name));
  std::fs::write(&path, vec![7u8; 1024]).unwrap();
  path
}

/// 一个检测结果：15 类，置信度 0.9，框 (0.1, 0.1)-(0.5, 0.5)
fn person(_: &[f32]) -> Vec<f32> {
  vec![
    1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, //
    0.0, 15.0, 0.9, 0.1, 0.1, 0.5, 0.5,
  ]
}

#[test]
fn blue_frame_yields_one_person() {
  let graph = scratch_graph("person.graph");
  let driver = Arc::new(SimDriver::builder().responder(person).build());
  let mut detector = SsdDetectorBuilder::new(PipelineConfig::default())
    .graph(&graph)
    .build(driver.clone())
    .unwrap();

  let frame = BgrFrame::filled(640, 480, [255, 0, 0]);
  let result = detector.infer(&frame).unwrap();

  assert_eq!(result.len(), 1);
  let detection = result.items[0];
  assert_eq!(detection.class_id, 15);
  assert!((detection.score - 0.9).abs() < 1e-6);
  assert_eq!(
    denormalize(&detection, frame.width(), frame.height()),
    PixelBox {
      left: 64,
      top: 48,
      right: 320,
      bottom: 240,
    }
  );
  assert!(DisplayFilter::default().accepts(&detection));

  // 标注只改动检测框附近的像素
  let annotated = Draw::default().annotate(&frame, &result);
  assert_eq!(annotated.pixel(64, 100), [0, 0, 255]);
  assert_eq!(annotated.pixel(600, 400), [255, 0, 0]);

  detector.shutdown().unwrap();
  std::fs::remove_file(&graph).unwrap();
}

#[test]
fn shutdown_releases_in_reverse_order() {
  let graph = scratch_graph("order.graph");
  let driver = Arc::new(SimDriver::default());
  let detector = SsdDetectorBuilder::new(PipelineConfig::default())
    .graph(&graph)
    .build(driver.clone())
    .unwrap();
  detector.shutdown().unwrap();

  let events = driver.events();
  let position = |event: SimEvent| {
    events
      .iter()
      .position(|e| *e == event)
      .unwrap_or_else(|| panic!("缺少事件 {:?}", event))
  };
  let fifo_out = position(SimEvent::FifoDestroyed(FifoKind::HostReadOnly));
  let fifo_in = position(SimEvent::FifoDestroyed(FifoKind::HostWriteOnly));
  let graph_destroyed = position(SimEvent::GraphDestroyed("ssdGraph".to_string()));
  let device_closed = position(SimEvent::DeviceClosed(0));

  assert!(fifo_out < fifo_in);
  assert!(fifo_in < graph_destroyed);
  assert!(graph_destroyed < device_closed);
  std::fs::remove_file(&graph).unwrap();
}

#[derive(Default)]
struct Recorder {
  frames: RefCell<Vec<([u8; 3], Vec<i32>)>>,
}

impl Render<BgrFrame, DetectResult> for Recorder {
  type Error = Infallible;

  fn render_result(&self, frame: &BgrFrame, result: &DetectResult) -> Result<(), Infallible> {
    let classes = result.iter().map(|d| d.class_id).collect();
    self.frames.borrow_mut().push((frame.pixel(0, 0), classes));
    Ok(())
  }
}

#[test]
fn pipelined_results_match_their_frames() {
  let graph = scratch_graph("pipelined.graph");
  // 亮帧识别为 15 类，暗帧识别为 7 类
  let driver = Arc::new(
    SimDriver::builder()
      .responder(|tensor| {
        let class = if tensor[0] > 0.0 { 15.0 } else { 7.0 };
        vec![
          1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, //
          0.0, class, 0.8, 0.2, 0.2, 0.6, 0.6,
        ]
      })
      .build(),
  );
  let mut detector = SsdDetectorBuilder::new(PipelineConfig::default())
    .graph(&graph)
    .build(driver)
    .unwrap();

  let bright = [255, 255, 255];
  let dark = [0, 0, 0];
  let frames = (0..5).map(|i| BgrFrame::filled(64, 48, if i % 2 == 0 { bright } else { dark }));

  let output = Recorder::default();
  PipelinedTask::default()
    .run_task(frames, &mut detector, &output)
    .unwrap();

  let frames = output.frames.into_inner();
  assert_eq!(frames.len(), 5);
  for (pixel, classes) in frames {
    let expected = if pixel == bright { 15 } else { 7 };
    assert_eq!(classes, vec![expected]);
  }

  detector.shutdown().unwrap();
  std::fs::remove_file(&graph).unwrap();
}

#[test]
fn pipeline_recovers_after_device_stall() {
  let graph = scratch_graph("stall.graph");
  let driver = Arc::new(
    SimDriver::builder()
      .stalled()
      .responder(|tensor| {
        let class = if tensor[0] > 0.0 { 15.0 } else { 7.0 };
        vec![
          1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, //
          0.0, class, 0.8, 0.2, 0.2, 0.6, 0.6,
        ]
      })
      .build(),
  );
  let mut config = PipelineConfig::default();
  config.session.retrieve_timeout_ms = Some(5);
  let mut detector = SsdDetectorBuilder::new(config)
    .graph(&graph)
    .build(driver.clone())
    .unwrap();

  let bright = [255, 255, 255];
  let dark = [0, 0, 0];
  let frames = {
    let driver = driver.clone();
    (0..6).map(move |i| {
      // 前三帧期间设备无响应
      if i == 3 {
        driver.release_stalled();
      }
      BgrFrame::filled(64, 48, if i % 2 == 0 { bright } else { dark })
    })
  };

  let output = Recorder::default();
  PipelinedTask::default()
    .run_task(frames, &mut detector, &output)
    .unwrap();

  let frames = output.frames.into_inner();
  assert_eq!(frames.len(), 6);
  for (_, classes) in &frames[..3] {
    assert!(classes.is_empty());
  }
  for (pixel, classes) in &frames[3..] {
    let expected = if *pixel == bright { 15 } else { 7 };
    assert_eq!(classes, &vec![expected]);
  }

  detector.shutdown().unwrap();
  std::fs::remove_file(&graph).unwrap();
}
