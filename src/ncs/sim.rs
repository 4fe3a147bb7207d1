// 该文件是 Qianli （千里眼） 项目的一部分。
// src/ncs/sim.rs - 软件模拟加速器
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

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use crate::ncs::{Driver, FifoKind, FifoSpec, NcStatus};

type Responder = Box<dyn Fn(&[f32]) -> Vec<f32> + Send + Sync>;

/// 模拟驱动记录的调用事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
  DeviceCreated(u32),
  DeviceOpened(u32),
  DeviceClosed(u32),
  DeviceDestroyed(u32),
  GraphCreated(String),
  GraphAllocated(String),
  GraphDestroyed(String),
  FifoCreated(FifoKind),
  FifoDestroyed(FifoKind),
  InferenceQueued(usize),
}

#[derive(Debug)]
pub struct SimDevice {
  index: u32,
  opened: bool,
}

#[derive(Debug)]
pub struct SimGraph {
  name: String,
  allocated: bool,
}

#[derive(Debug)]
pub struct SimFifo {
  id: u64,
  kind: FifoKind,
}

struct Element {
  bytes: Vec<u8>,
  tag: usize,
  ready: bool,
}

struct FifoState {
  depth: u32,
  elements: VecDeque<Element>,
}

#[derive(Default)]
struct SimState {
  next_id: u64,
  events: Vec<SimEvent>,
  fifos: HashMap<u64, FifoState>,
}

/// 软件模拟的神经计算棒
///
/// 推理结果由 responder 根据输入张量即时生成，输出 FIFO 的深度限制与硬件一致。
pub struct SimDriver {
  devices: u32,
  fail_open: HashSet<u32>,
  reject_allocation: Option<NcStatus>,
  stalled: AtomicBool,
  corrupt_tags: bool,
  reported_size: Option<usize>,
  responder: Responder,
  state: Mutex<SimState>,
}

pub struct SimDriverBuilder {
  devices: u32,
  fail_open: HashSet<u32>,
  reject_allocation: Option<NcStatus>,
  stalled: bool,
  corrupt_tags: bool,
  reported_size: Option<usize>,
  responder: Responder,
}

impl Default for SimDriverBuilder {
  fn default() -> Self {
    Self {
      devices: 1,
      fail_open: HashSet::new(),
      reject_allocation: None,
      stalled: false,
      corrupt_tags: false,
      reported_size: None,
      // 只有头部记录、没有检测结果
      responder: Box::new(|_| vec![0.0; 7]),
    }
  }
}

impl SimDriverBuilder {
  pub fn devices(mut self, devices: u32) -> Self {
    self.devices = devices;
    self
  }

  pub fn fail_open(mut self, index: u32) -> Self {
    self.fail_open.insert(index);
    self
  }

  pub fn reject_allocation(mut self, status: NcStatus) -> Self {
    self.reject_allocation = Some(status);
    self
  }

  /// 结果永远不会就绪，直到调用 [`SimDriver::release_stalled`]
  pub fn stalled(mut self) -> Self {
    self.stalled = true;
    self
  }

  pub fn corrupt_tags(mut self) -> Self {
    self.corrupt_tags = true;
    self
  }

  /// 让元素大小查询返回固定值
  pub fn reported_size(mut self, bytes: usize) -> Self {
    self.reported_size = Some(bytes);
    self
  }

  pub fn responder<F>(mut self, responder: F) -> Self
  where
    F: Fn(&[f32]) -> Vec<f32> + Send + Sync + 'static,
  {
    self.responder = Box::new(responder);
    self
  }

  pub fn build(self) -> SimDriver {
    SimDriver {
      devices: self.devices,
      fail_open: self.fail_open,
      reject_allocation: self.reject_allocation,
      stalled: AtomicBool::new(self.stalled),
      corrupt_tags: self.corrupt_tags,
      reported_size: self.reported_size,
      responder: self.responder,
      state: Mutex::new(SimState::default()),
    }
  }
}

impl Default for SimDriver {
  fn default() -> Self {
    SimDriverBuilder::default().build()
  }
}

impl SimDriver {
  pub fn builder() -> SimDriverBuilder {
    SimDriverBuilder::default()
  }

  /// 目前为止的调用记录
  pub fn events(&self) -> Vec<SimEvent> {
    self
      .state
      .lock()
      .map(|state| state.events.clone())
      .unwrap_or_default()
  }

  /// 使所有被挂起的结果就绪，之后的推理不再挂起
  pub fn release_stalled(&self) {
    if let Ok(mut state) = self.state.lock() {
      self.stalled.store(false, Ordering::Release);
      for fifo in state.fifos.values_mut() {
        for element in fifo.elements.iter_mut() {
          element.ready = true;
        }
      }
    }
  }

  fn lock(&self) -> Result<MutexGuard<'_, SimState>, NcStatus> {
    self.state.lock().map_err(|_| NcStatus::Error)
  }
}

impl Driver for SimDriver {
  type Device = SimDevice;
  type Graph = SimGraph;
  type Fifo = SimFifo;

  fn device_create(&self, index: u32) -> Result<Self::Device, NcStatus> {
    if index >= self.devices {
      return Err(NcStatus::DeviceNotFound);
    }
    self.lock()?.events.push(SimEvent::DeviceCreated(index));
    Ok(SimDevice {
      index,
      opened: false,
    })
  }

  fn device_open(&self, device: &mut Self::Device) -> Result<(), NcStatus> {
    if self.fail_open.contains(&device.index) {
      return Err(NcStatus::Error);
    }
    device.opened = true;
    self.lock()?.events.push(SimEvent::DeviceOpened(device.index));
    Ok(())
  }

  fn device_close(&self, device: &mut Self::Device) -> Result<(), NcStatus> {
    if !device.opened {
      return Err(NcStatus::InvalidHandle);
    }
    device.opened = false;
    self.lock()?.events.push(SimEvent::DeviceClosed(device.index));
    Ok(())
  }

  fn device_destroy(&self, device: Self::Device) -> Result<(), NcStatus> {
    self
      .lock()?
      .events
      .push(SimEvent::DeviceDestroyed(device.index));
    Ok(())
  }

  fn graph_create(&self, name: &str) -> Result<Self::Graph, NcStatus> {
    self
      .lock()?
      .events
      .push(SimEvent::GraphCreated(name.to_string()));
    Ok(SimGraph {
      name: name.to_string(),
      allocated: false,
    })
  }

  fn graph_allocate_with_fifos(
    &self,
    device: &Self::Device,
    graph: &mut Self::Graph,
    blob: &[u8],
    input: &FifoSpec,
    output: &FifoSpec,
  ) -> Result<(Self::Fifo, Self::Fifo), NcStatus> {
    if !device.opened {
      return Err(NcStatus::InvalidHandle);
    }
    if let Some(status) = self.reject_allocation {
      return Err(status);
    }
    if blob.is_empty() {
      return Err(NcStatus::UnsupportedGraphFile);
    }

    debug!("模拟加速器加载计算图 {}: {} 字节", graph.name, blob.len());

    let mut state = self.lock()?;
    graph.allocated = true;
    state.events.push(SimEvent::GraphAllocated(graph.name.clone()));

    let mut create = |spec: &FifoSpec| {
      let id = state.next_id;
      state.next_id += 1;
      state.fifos.insert(
        id,
        FifoState {
          depth: spec.depth,
          elements: VecDeque::new(),
        },
      );
      state.events.push(SimEvent::FifoCreated(spec.kind));
      SimFifo {
        id,
        kind: spec.kind,
      }
    };

    let fifo_in = create(input);
    let fifo_out = create(output);
    Ok((fifo_in, fifo_out))
  }

  fn graph_destroy(&self, graph: Self::Graph) -> Result<(), NcStatus> {
    self
      .lock()?
      .events
      .push(SimEvent::GraphDestroyed(graph.name));
    Ok(())
  }

  fn queue_inference(
    &self,
    graph: &Self::Graph,
    input: &Self::Fifo,
    output: &Self::Fifo,
    tensor: &[f32],
    tag: usize,
  ) -> Result<(), NcStatus> {
    if !graph.allocated
      || input.kind != FifoKind::HostWriteOnly
      || output.kind != FifoKind::HostReadOnly
    {
      return Err(NcStatus::InvalidHandle);
    }

    let mut state = self.lock()?;
    let fifo = state
      .fifos
      .get_mut(&output.id)
      .ok_or(NcStatus::InvalidHandle)?;
    if fifo.elements.len() >= fifo.depth as usize {
      return Err(NcStatus::Busy);
    }

    let bytes = (self.responder)(tensor)
      .into_iter()
      .flat_map(f32::to_ne_bytes)
      .collect();
    fifo.elements.push_back(Element {
      bytes,
      tag,
      ready: !self.stalled.load(Ordering::Acquire),
    });
    state.events.push(SimEvent::InferenceQueued(tag));
    Ok(())
  }

  fn fifo_fill_level(&self, fifo: &Self::Fifo) -> Result<u32, NcStatus> {
    let state = self.lock()?;
    let fifo = state.fifos.get(&fifo.id).ok_or(NcStatus::InvalidHandle)?;
    Ok(fifo.elements.iter().take_while(|e| e.ready).count() as u32)
  }

  fn fifo_element_size(&self, fifo: &Self::Fifo) -> Result<usize, NcStatus> {
    if fifo.kind != FifoKind::HostReadOnly {
      return Err(NcStatus::Unauthorized);
    }
    let state = self.lock()?;
    let fifo = state.fifos.get(&fifo.id).ok_or(NcStatus::InvalidHandle)?;
    match fifo.elements.front() {
      Some(element) if element.ready => Ok(self.reported_size.unwrap_or(element.bytes.len())),
      _ => Err(NcStatus::Timeout),
    }
  }

  fn fifo_read(&self, fifo: &Self::Fifo, buffer: &mut [u8]) -> Result<(usize, usize), NcStatus> {
    if fifo.kind != FifoKind::HostReadOnly {
      return Err(NcStatus::Unauthorized);
    }
    let mut state = self.lock()?;
    let fifo = state
      .fifos
      .get_mut(&fifo.id)
      .ok_or(NcStatus::InvalidHandle)?;

    let ready = fifo.elements.front().map(|e| e.ready).unwrap_or(false);
    if !ready {
      return Err(NcStatus::Timeout);
    }
    let len = fifo.elements.front().map(|e| e.bytes.len()).unwrap_or(0);
    if buffer.len() < len {
      return Err(NcStatus::InvalidDataLength);
    }

    let element = fifo.elements.pop_front().ok_or(NcStatus::Error)?;
    buffer[..len].copy_from_slice(&element.bytes);
    let tag = if self.corrupt_tags {
      element.tag.wrapping_add(1000)
    } else {
      element.tag
    };
    Ok((len, tag))
  }

  fn fifo_destroy(&self, fifo: Self::Fifo) -> Result<(), NcStatus> {
    let mut state = self.lock()?;
    state.fifos.remove(&fifo.id).ok_or(NcStatus::InvalidHandle)?;
    state.events.push(SimEvent::FifoDestroyed(fifo.kind));
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn allocate(driver: &SimDriver) -> (SimGraph, SimFifo, SimFifo) {
    let mut device = driver.device_create(0).unwrap();
    driver.device_open(&mut device).unwrap();
    let mut graph = driver.graph_create("g").unwrap();
    let (fifo_in, fifo_out) = driver
      .graph_allocate_with_fifos(
        &device,
        &mut graph,
        &[1, 2, 3],
        &FifoSpec::input(2),
        &FifoSpec::output(2),
      )
      .unwrap();
    (graph, fifo_in, fifo_out)
  }

  #[test]
  fn missing_index_is_not_found() {
    let driver = SimDriver::builder().devices(0).build();
    assert_eq!(driver.device_create(0).unwrap_err(), NcStatus::DeviceNotFound);
  }

  #[test]
  fn output_fifo_enforces_depth() {
    let driver = SimDriver::default();
    let (graph, fifo_in, fifo_out) = allocate(&driver);

    driver.queue_inference(&graph, &fifo_in, &fifo_out, &[0.0], 1).unwrap();
    driver.queue_inference(&graph, &fifo_in, &fifo_out, &[0.0], 2).unwrap();
    assert_eq!(
      driver.queue_inference(&graph, &fifo_in, &fifo_out, &[0.0], 3),
      Err(NcStatus::Busy)
    );
    assert_eq!(driver.fifo_fill_level(&fifo_out), Ok(2));

    let mut buffer = vec![0u8; 28];
    assert_eq!(driver.fifo_read(&fifo_out, &mut buffer), Ok((28, 1)));
    assert_eq!(driver.fifo_read(&fifo_out, &mut buffer), Ok((28, 2)));
  }

  #[test]
  fn stalled_results_are_not_ready() {
    let driver = SimDriver::builder().stalled().build();
    let (graph, fifo_in, fifo_out) = allocate(&driver);
    driver.queue_inference(&graph, &fifo_in, &fifo_out, &[0.0], 7).unwrap();

    assert_eq!(driver.fifo_fill_level(&fifo_out), Ok(0));
    assert_eq!(driver.fifo_element_size(&fifo_out), Err(NcStatus::Timeout));

    driver.release_stalled();
    assert_eq!(driver.fifo_fill_level(&fifo_out), Ok(1));

    driver.queue_inference(&graph, &fifo_in, &fifo_out, &[0.0], 8).unwrap();
    assert_eq!(driver.fifo_fill_level(&fifo_out), Ok(2));
  }

  #[test]
  fn host_cannot_read_input_fifo() {
    let driver = SimDriver::default();
    let (_graph, fifo_in, _fifo_out) = allocate(&driver);
    let mut buffer = [0u8; 4];
    assert_eq!(
      driver.fifo_read(&fifo_in, &mut buffer),
      Err(NcStatus::Unauthorized)
    );
  }
}
