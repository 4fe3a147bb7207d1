// 该文件是 Qianli （千里眼） 项目的一部分。
// src/model/ssd.rs - MobileNet-SSD 检测器
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
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, DEFAULT_GRAPH_PATH, PipelineConfig};
use crate::device::{DeviceError, DeviceManager};
use crate::frame::BgrFrame;
use crate::graph::{GraphError, GraphStore};
use crate::model::{DecodeError, DetectResult, Model, PipelinedModel, Recoverable, decode};
use crate::ncs::Driver;
use crate::preprocess::{PreprocessError, Preprocessor};
use crate::session::{InferError, Session, SessionError, SessionState, Ticket};

#[derive(Error, Debug)]
pub enum DetectorError {
  #[error("配置错误: {0}")]
  Config(#[from] ConfigError),
  #[error("设备错误: {0}")]
  Device(#[from] DeviceError),
  #[error("计算图错误: {0}")]
  Graph(#[from] GraphError),
  #[error("会话错误: {0}")]
  Session(#[from] SessionError),
  #[error("计算图约定不一致: {}", .0.join("; "))]
  ContractMismatch(Vec<String>),
  #[error("预处理错误: {0}")]
  Preprocess(#[from] PreprocessError),
  #[error("推理错误: {0}")]
  Infer(#[from] InferError),
  #[error("解码错误: {0}")]
  Decode(#[from] DecodeError),
}

impl DetectorError {
  /// 只影响当前帧的错误，处理循环应继续
  pub fn is_recoverable(&self) -> bool {
    match self {
      DetectorError::Preprocess(_) | DetectorError::Decode(_) => true,
      DetectorError::Infer(e) => e.is_recoverable(),
      _ => false,
    }
  }
}

impl Recoverable for DetectorError {
  fn is_recoverable(&self) -> bool {
    DetectorError::is_recoverable(self)
  }
}

pub struct SsdDetectorBuilder {
  config: PipelineConfig,
  graph_path: PathBuf,
}

impl SsdDetectorBuilder {
  pub fn new(config: PipelineConfig) -> Self {
    Self {
      config,
      graph_path: PathBuf::from(DEFAULT_GRAPH_PATH),
    }
  }

  pub fn graph<P: AsRef<Path>>(mut self, path: P) -> Self {
    self.graph_path = path.as_ref().to_path_buf();
    self
  }

  fn check_contract(&self) -> Result<(), DetectorError> {
    let strict = self.config.strict_contract;
    match GraphStore::load_contract(&self.graph_path) {
      Ok(Some(contract)) => {
        let mismatches = contract.mismatches(&self.config.preprocess);
        for mismatch in &mismatches {
          warn!("计算图约定不一致: {}", mismatch);
        }
        if strict && !mismatches.is_empty() {
          error!("严格模式下计算图约定不一致，停止加载");
          return Err(DetectorError::ContractMismatch(mismatches));
        }
        if mismatches.is_empty() {
          debug!("计算图约定校验通过");
        }
        Ok(())
      }
      Ok(None) => {
        warn!(
          "未找到计算图约定文件 {}，无法校验预处理参数",
          GraphStore::contract_path(&self.graph_path).display()
        );
        Ok(())
      }
      Err(e) if strict => Err(e.into()),
      Err(e) => {
        warn!("{}，跳过约定校验", e);
        Ok(())
      }
    }
  }

  /// 打开设备、读取计算图并建立推理会话
  pub fn build<D: Driver>(self, driver: Arc<D>) -> Result<SsdDetector<D>, DetectorError> {
    self.config.validate()?;

    let mut devices = DeviceManager::new(driver, self.config.max_devices);
    devices.discover_and_open()?;
    let device = devices.take_device().ok_or_else(|| {
      error!("没有可用的神经计算设备");
      DeviceError::NoDeviceFound
    })?;

    let blob = GraphStore::load(&self.graph_path)?;
    self.check_contract()?;

    let session = Session::create(device, blob, &self.config.session)?;
    info!("SSD 检测器就绪");

    Ok(SsdDetector {
      session,
      preprocessor: Preprocessor::new(self.config.preprocess),
      _spare_devices: devices,
    })
  }
}

pub struct SsdDetector<D: Driver> {
  session: Session<D>,
  preprocessor: Preprocessor,
  _spare_devices: DeviceManager<D>,
}

impl<D: Driver> SsdDetector<D> {
  pub fn state(&self) -> SessionState {
    self.session.state()
  }

  pub fn preprocessor(&self) -> &Preprocessor {
    &self.preprocessor
  }

  /// 排空在途推理并释放设备资源
  pub fn shutdown(self) -> Result<(), DetectorError> {
    info!("关闭 SSD 检测器");
    self.session.close()?;
    Ok(())
  }
}

impl<D: Driver> Model for SsdDetector<D> {
  type Input = BgrFrame;
  type Output = DetectResult;
  type Error = DetectorError;

  fn infer(&mut self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    let tensor = self.preprocessor.process(input)?;
    let raw = self.session.infer(&tensor)?;
    Self::postprocess(raw.as_slice())
  }

  fn postprocess(output: &[f32]) -> Result<Self::Output, Self::Error> {
    Ok(decode(output)?)
  }
}

impl<D: Driver> PipelinedModel for SsdDetector<D> {
  fn submit(&mut self, input: &Self::Input) -> Result<Ticket, Self::Error> {
    let tensor = self.preprocessor.process(input)?;
    Ok(self.session.dispatch(&tensor)?)
  }

  fn collect(&mut self) -> Result<(Ticket, Self::Output), Self::Error> {
    let raw = self.session.retrieve()?;
    Ok((raw.ticket(), Self::postprocess(raw.as_slice())?))
  }

  fn in_flight(&self) -> usize {
    self.session.in_flight()
  }

  fn depth(&self) -> usize {
    self.session.depth() as usize
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ncs::{NcStatus, SimDriver, SimEvent};

  fn scratch_graph(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("qianli-ssd-{}-{}", std::process::id(), name));
    std::fs::write(&path, [1u8; 256]).unwrap();
    path
  }

  fn person_driver() -> SimDriver {
    SimDriver::builder()
      .responder(|_| {
        vec![
          1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, //
          0.0, 15.0, 0.9, 0.1, 0.1, 0.5, 0.5,
        ]
      })
      .build()
  }

  #[test]
  fn synchronous_inference_decodes_detections() {
    let path = scratch_graph("sync.graph");
    let mut detector = SsdDetectorBuilder::new(PipelineConfig::default())
      .graph(&path)
      .build(Arc::new(person_driver()))
      .unwrap();

    let result = detector.infer(&BgrFrame::filled(64, 48, [255, 0, 0])).unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result.items[0].class_id, 15);

    detector.shutdown().unwrap();
    std::fs::remove_file(&path).unwrap();
  }

  #[test]
  fn pipelined_submissions_are_bounded_by_depth() {
    let path = scratch_graph("pipelined.graph");
    let mut detector = SsdDetectorBuilder::new(PipelineConfig::default())
      .graph(&path)
      .build(Arc::new(person_driver()))
      .unwrap();
    let frame = BgrFrame::filled(64, 48, [0, 0, 0]);

    let first = detector.submit(&frame).unwrap();
    let second = detector.submit(&frame).unwrap();
    assert!(first < second);
    let err = detector.submit(&frame).unwrap_err();
    assert!(err.is_recoverable());
    assert_eq!(detector.in_flight(), detector.depth());

    let (ticket, result) = detector.collect().unwrap();
    assert_eq!((ticket, result.len()), (first, 1));
    let (ticket, result) = detector.collect().unwrap();
    assert_eq!((ticket, result.len()), (second, 1));
    assert!(detector.collect().unwrap_err().is_recoverable());
    std::fs::remove_file(&path).unwrap();
  }

  #[test]
  fn frame_after_timeout_gets_its_own_detections() {
    let path = scratch_graph("timeout.graph");
    let driver = Arc::new(
      SimDriver::builder()
        .stalled()
        .responder(|tensor| {
          let class = if tensor[0] > 0.0 { 15.0 } else { 7.0 };
          vec![
            1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, //
            0.0, class, 0.9, 0.1, 0.1, 0.5, 0.5,
          ]
        })
        .build(),
    );
    let mut config = PipelineConfig::default();
    config.session.retrieve_timeout_ms = Some(5);
    let mut detector = SsdDetectorBuilder::new(config)
      .graph(&path)
      .build(driver.clone())
      .unwrap();

    let err = detector
      .infer(&BgrFrame::filled(64, 48, [255, 255, 255]))
      .unwrap_err();
    assert!(matches!(err, DetectorError::Infer(InferError::Timeout(_))));
    assert!(err.is_recoverable());

    driver.release_stalled();
    let result = detector.infer(&BgrFrame::filled(64, 48, [0, 0, 0])).unwrap();
    assert_eq!(result.items[0].class_id, 7);

    detector.shutdown().unwrap();
    std::fs::remove_file(&path).unwrap();
  }

  #[test]
  fn oversized_result_is_fatal() {
    let path = scratch_graph("oversized.graph");
    let mut detector = SsdDetectorBuilder::new(PipelineConfig::default())
      .graph(&path)
      .build(Arc::new(SimDriver::builder().reported_size(4 << 20).build()))
      .unwrap();

    let err = detector.infer(&BgrFrame::filled(64, 48, [0, 0, 0])).unwrap_err();
    assert!(matches!(err, DetectorError::Infer(InferError::Oversized { .. })));
    assert!(!err.is_recoverable());

    detector.shutdown().unwrap();
    std::fs::remove_file(&path).unwrap();
  }

  #[test]
  fn missing_graph_is_fatal_and_releases_device() {
    let driver = Arc::new(SimDriver::default());
    let err = SsdDetectorBuilder::new(PipelineConfig::default())
      .graph(std::env::temp_dir().join("qianli-ssd-does-not-exist.graph"))
      .build(driver.clone())
      .err()
      .unwrap();

    assert!(matches!(err, DetectorError::Graph(GraphError::Io { .. })));
    assert!(!err.is_recoverable());
    assert!(driver.events().contains(&SimEvent::DeviceDestroyed(0)));
  }

  #[test]
  fn no_device_is_fatal() {
    let path = scratch_graph("nodevice.graph");
    let err = SsdDetectorBuilder::new(PipelineConfig::default())
      .graph(&path)
      .build(Arc::new(SimDriver::builder().devices(0).build()))
      .err()
      .unwrap();
    assert!(matches!(err, DetectorError::Device(DeviceError::NoDeviceFound)));
    std::fs::remove_file(&path).unwrap();
  }

  #[test]
  fn rejected_graph_is_fatal() {
    let path = scratch_graph("rejected.graph");
    let err = SsdDetectorBuilder::new(PipelineConfig::default())
      .graph(&path)
      .build(Arc::new(
        SimDriver::builder()
          .reject_allocation(NcStatus::UnsupportedGraphFile)
          .build(),
      ))
      .err()
      .unwrap();
    assert!(matches!(
      err,
      DetectorError::Session(SessionError::Allocation(NcStatus::UnsupportedGraphFile))
    ));
    std::fs::remove_file(&path).unwrap();
  }

  #[test]
  fn strict_contract_mismatch_is_fatal() {
    let path = scratch_graph("strict.graph");
    let contract = GraphStore::contract_path(&path);
    std::fs::write(
      &contract,
      r#"{ "width": 224, "height": 224, "mean": [127.5, 127.5, 127.5],
           "scale": [0.007843, 0.007843, 0.007843], "channel_order": "bgr" }"#,
    )
    .unwrap();

    let config = PipelineConfig {
      strict_contract: true,
      ..PipelineConfig::default()
    };
    let err = SsdDetectorBuilder::new(config)
      .graph(&path)
      .build(Arc::new(SimDriver::default()))
      .err()
      .unwrap();
    assert!(matches!(err, DetectorError::ContractMismatch(ref m) if m.len() == 1));

    // 非严格模式只告警
    let detector = SsdDetectorBuilder::new(PipelineConfig::default())
      .graph(&path)
      .build(Arc::new(SimDriver::default()));
    assert!(detector.is_ok());

    std::fs::remove_file(&contract).unwrap();
    std::fs::remove_file(&path).unwrap();
  }
}
