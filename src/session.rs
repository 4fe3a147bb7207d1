// 该文件是 Qianli （千里眼） 项目的一部分。
// src/session.rs - 推理会话
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

//! # 推理会话
//!
//! 一个 [`Session`] 把一个计算图绑定到一个设备上，并独占：
//!
//! - 设备句柄
//! - 计算图句柄
//! - 输入 FIFO（主机只写）与输出 FIFO（主机只读）
//!
//! 释放顺序固定为：输出 FIFO → 输入 FIFO → 计算图 → 设备。
//! 无论是调用 [`Session::close`] 还是直接析构，都按这个顺序进行。
//!
//! 所有队列操作都需要 `&mut self`，同一会话不能被多个线程同时使用。

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::device::{DeviceError, DeviceHandle};
use crate::frame::TensorBuffer;
use crate::graph::GraphBlob;
use crate::ncs::{Driver, FifoSpec, NcStatus};

const POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
  Uninitialized,
  DeviceOpened,
  GraphAllocated,
  Ready,
  Closed,
}

#[derive(Error, Debug)]
pub enum SessionError {
  #[error("设备未打开")]
  DeviceNotOpen,
  #[error("无法创建计算图句柄: {0}")]
  GraphCreate(NcStatus),
  #[error("无法在设备上分配计算图: {0}")]
  Allocation(NcStatus),
  #[error("释放{resource}失败: {status}")]
  Teardown {
    resource: &'static str,
    status: NcStatus,
  },
  #[error("设备错误: {0}")]
  Device(#[from] DeviceError),
}

#[derive(Error, Debug)]
pub enum InferError {
  #[error("推理队列已满 (深度 {depth})")]
  QueueFull { depth: u32 },
  #[error("无法排队推理: {0}")]
  Dispatch(NcStatus),
  #[error("没有等待中的推理")]
  NothingInFlight,
  #[error("等待推理结果超时 ({0:?})")]
  Timeout(Duration),
  #[error("无法获取结果大小: {0}")]
  ResultSize(NcStatus),
  #[error("结果大小异常: {size} 字节 (上限 {max} 字节)")]
  UnexpectedSize { size: usize, max: usize },
  #[error("无法读取推理结果: {0}")]
  Retrieve(NcStatus),
  #[error("结果标记不匹配: 期望 {expected}, 实际 {actual}")]
  TagMismatch { expected: usize, actual: usize },
  #[error("会话不可用 ({0:?})")]
  NotReady(SessionState),
  #[error("结果大小超出上限且无法读出: {size} 字节 (上限 {max} 字节)")]
  Oversized { size: usize, max: usize },
  #[error("输出 FIFO 与在途推理已失步")]
  Desynchronized,
}

impl InferError {
  /// 失步后会话不能再使用，其余错误只影响当前帧
  pub fn is_recoverable(&self) -> bool {
    !matches!(
      self,
      InferError::Oversized { .. } | InferError::Desynchronized
    )
  }
}

/// 一次排队推理的标记，随结果一同返回，按排队先后递增
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ticket(usize);

impl Ticket {
  pub(crate) fn new(tag: usize) -> Self {
    Ticket(tag)
  }

  pub fn tag(&self) -> usize {
    self.0
  }
}

/// 输出 FIFO 中读出的一个原始结果
#[derive(Debug, Clone, PartialEq)]
pub struct RawResult {
  ticket: Ticket,
  data: Vec<f32>,
}

impl RawResult {
  pub fn ticket(&self) -> Ticket {
    self.ticket
  }

  pub fn as_slice(&self) -> &[f32] {
    &self.data
  }

  pub fn into_inner(self) -> Vec<f32> {
    self.data
  }
}

/// 在途推理，等待超时后标记为过期，结果到达时直接丢弃
#[derive(Debug, Clone, Copy)]
struct InFlight {
  ticket: Ticket,
  expired: bool,
}

pub struct Session<D: Driver> {
  driver: Arc<D>,
  state: SessionState,
  depth: u32,
  max_result_bytes: usize,
  retrieve_timeout: Option<Duration>,
  next_tag: usize,
  in_flight: VecDeque<InFlight>,
  desynchronized: bool,
  fifo_out: Option<D::Fifo>,
  fifo_in: Option<D::Fifo>,
  graph: Option<D::Graph>,
  device: DeviceHandle<D>,
}

impl<D: Driver> Session<D> {
  /// 在设备上创建计算图并分配输入输出 FIFO
  ///
  /// 计算图原始数据在上传后释放。失败时已获得的资源按逆序释放。
  pub fn create(
    device: DeviceHandle<D>,
    blob: GraphBlob,
    config: &SessionConfig,
  ) -> Result<Self, SessionError> {
    let driver = device.driver().clone();
    let mut session = Session {
      driver: driver.clone(),
      state: SessionState::Uninitialized,
      depth: config.fifo_depth,
      max_result_bytes: config.max_result_bytes,
      retrieve_timeout: config.retrieve_timeout(),
      next_tag: 1,
      in_flight: VecDeque::with_capacity(config.fifo_depth as usize),
      desynchronized: false,
      fifo_out: None,
      fifo_in: None,
      graph: None,
      device,
    };

    if !session.device.is_open() {
      return Err(SessionError::DeviceNotOpen);
    }
    session.transition(SessionState::DeviceOpened);

    let mut graph = driver
      .graph_create(&config.graph_name)
      .map_err(SessionError::GraphCreate)?;

    let allocated = {
      let raw = session.device.raw().ok_or(SessionError::DeviceNotOpen)?;
      driver.graph_allocate_with_fifos(
        raw,
        &mut graph,
        blob.as_bytes(),
        &FifoSpec::input(config.fifo_depth),
        &FifoSpec::output(config.fifo_depth),
      )
    };
    // 计算图句柄先交给会话，失败时由析构统一释放
    session.graph = Some(graph);
    let (fifo_in, fifo_out) = allocated.map_err(|status| {
      error!(
        "无法在设备 {} 上分配计算图: {} ({})",
        session.device.index(),
        status,
        status.code()
      );
      SessionError::Allocation(status)
    })?;
    session.fifo_in = Some(fifo_in);
    session.fifo_out = Some(fifo_out);
    session.transition(SessionState::GraphAllocated);

    debug!("计算图已上传，释放 {} 字节原始数据", blob.len());
    drop(blob);

    info!(
      "计算图 {} 已分配到设备 {}",
      config.graph_name,
      session.device.index()
    );
    session.transition(SessionState::Ready);
    Ok(session)
  }

  fn transition(&mut self, next: SessionState) {
    debug!("会话状态: {:?} -> {:?}", self.state, next);
    self.state = next;
  }

  pub fn state(&self) -> SessionState {
    self.state
  }

  pub fn depth(&self) -> u32 {
    self.depth
  }

  pub fn in_flight(&self) -> usize {
    self.in_flight.len()
  }

  pub fn device_index(&self) -> u32 {
    self.device.index()
  }

  pub fn retrieve_timeout(&self) -> Option<Duration> {
    self.retrieve_timeout
  }

  pub fn set_retrieve_timeout(&mut self, timeout: Option<Duration>) {
    self.retrieve_timeout = timeout;
  }

  fn resources(&self) -> Result<(&D::Graph, &D::Fifo, &D::Fifo), InferError> {
    if self.desynchronized {
      return Err(InferError::Desynchronized);
    }
    match (&self.state, &self.graph, &self.fifo_in, &self.fifo_out) {
      (SessionState::Ready, Some(graph), Some(fifo_in), Some(fifo_out)) => {
        Ok((graph, fifo_in, fifo_out))
      }
      _ => Err(InferError::NotReady(self.state)),
    }
  }

  /// 输出 FIFO 中是否有可读元素，不阻塞
  fn ready(&self) -> Result<bool, InferError> {
    let (_, _, fifo_out) = self.resources()?;
    let level = self
      .driver
      .fifo_fill_level(fifo_out)
      .map_err(InferError::ResultSize)?;
    Ok(level > 0)
  }

  /// 轮询等待输出 FIFO 可读，`limit` 为 `None` 时一直等待
  fn wait_ready(&self, limit: Option<(Instant, Duration)>) -> Result<(), InferError> {
    loop {
      if self.ready()? {
        return Ok(());
      }
      let now = Instant::now();
      let pause = match limit {
        Some((deadline, timeout)) if now >= deadline => return Err(InferError::Timeout(timeout)),
        Some((deadline, _)) => POLL_INTERVAL.min(deadline - now),
        None => POLL_INTERVAL,
      };
      std::thread::sleep(pause);
    }
  }

  fn deadline(timeout: Option<Duration>) -> Option<(Instant, Duration)> {
    timeout.and_then(|t| Instant::now().checked_add(t).map(|deadline| (deadline, t)))
  }

  /// 读出输出 FIFO 的队首元素，并与最早的在途推理对应
  ///
  /// 读取失败时元素仍在 FIFO 中，在途推理保持不变。
  /// 超过上限的元素无法读出，会话随即失步。
  fn read_front(&mut self) -> Result<(InFlight, Vec<f32>), InferError> {
    let front = *self.in_flight.front().ok_or(InferError::NothingInFlight)?;
    let (_, _, fifo_out) = self.resources()?;

    let size = self
      .driver
      .fifo_element_size(fifo_out)
      .map_err(InferError::ResultSize)?;
    let max = self.max_result_bytes;
    if size > max {
      error!(
        "结果 #{} 大小 {} 字节超出上限 {} 字节，会话不再可用",
        front.ticket.tag(),
        size,
        max
      );
      self.desynchronized = true;
      return Err(InferError::Oversized { size, max });
    }

    let mut buffer = vec![0u8; size];
    let (read, tag) = self
      .driver
      .fifo_read(fifo_out, &mut buffer)
      .map_err(|status| {
        warn!("读取结果 #{} 失败: {}", front.ticket.tag(), status);
        InferError::Retrieve(status)
      })?;
    self.in_flight.pop_front();

    if tag != front.ticket.tag() {
      return Err(InferError::TagMismatch {
        expected: front.ticket.tag(),
        actual: tag,
      });
    }
    if size == 0 || size % std::mem::size_of::<f32>() != 0 {
      return Err(InferError::UnexpectedSize { size, max });
    }

    let data = buffer[..read.min(size)]
      .chunks_exact(4)
      .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
      .collect::<Vec<f32>>();
    Ok((front, data))
  }

  /// 读出并丢弃已经到达的过期结果，返回丢弃的个数
  fn reclaim_expired(&mut self) -> Result<usize, InferError> {
    let mut reclaimed = 0;
    while self.in_flight.front().is_some_and(|e| e.expired) && self.ready()? {
      let (stale, _) = self.read_front()?;
      debug!("丢弃过期结果 #{}", stale.ticket.tag());
      reclaimed += 1;
    }
    Ok(reclaimed)
  }

  /// 将张量排入输入 FIFO
  ///
  /// 队列已满时先回收已到达的过期结果，仍然满则直接拒绝，调用方应跳过这一帧。
  pub fn dispatch(&mut self, tensor: &TensorBuffer) -> Result<Ticket, InferError> {
    self.resources()?;
    if self.in_flight.len() >= self.depth as usize {
      self.reclaim_expired()?;
    }
    if self.in_flight.len() >= self.depth as usize {
      return Err(InferError::QueueFull { depth: self.depth });
    }

    let (graph, fifo_in, fifo_out) = self.resources()?;
    let ticket = Ticket::new(self.next_tag);
    debug!(
      "排队推理 #{}: {} 字节",
      ticket.tag(),
      tensor.byte_len()
    );
    self
      .driver
      .queue_inference(graph, fifo_in, fifo_out, tensor.as_slice(), ticket.tag())
      .map_err(|status| match status {
        NcStatus::Busy => InferError::QueueFull { depth: self.depth },
        status => InferError::Dispatch(status),
      })?;

    self.next_tag = self.next_tag.wrapping_add(1).max(1);
    self.in_flight.push_back(InFlight {
      ticket,
      expired: false,
    });
    Ok(ticket)
  }

  /// 按配置的超时取回最早一次推理的结果
  pub fn retrieve(&mut self) -> Result<RawResult, InferError> {
    self.retrieve_within(self.retrieve_timeout)
  }

  /// 取回最早一次未过期推理的结果，`timeout` 为 `None` 时一直等待
  ///
  /// 超时的推理仍占着输出 FIFO，标记为过期，之后到达时被丢弃。
  pub fn retrieve_within(&mut self, timeout: Option<Duration>) -> Result<RawResult, InferError> {
    self.resources()?;
    let limit = Self::deadline(timeout);

    loop {
      if self.in_flight.is_empty() {
        return Err(InferError::NothingInFlight);
      }
      match self.wait_ready(limit) {
        Ok(()) => {}
        Err(e @ InferError::Timeout(_)) => {
          if let Some(entry) = self.in_flight.iter_mut().find(|e| !e.expired) {
            warn!("等待结果 #{} 超时，到达后丢弃", entry.ticket.tag());
            entry.expired = true;
          }
          return Err(e);
        }
        Err(e) => return Err(e),
      }

      let (entry, data) = self.read_front()?;
      if entry.expired {
        debug!("丢弃过期结果 #{}", entry.ticket.tag());
        continue;
      }
      debug!("取回结果 #{}: {} 个浮点数", entry.ticket.tag(), data.len());
      return Ok(RawResult {
        ticket: entry.ticket,
        data,
      });
    }
  }

  /// 同步推理：排队后等待这一次推理的结果
  pub fn infer(&mut self, tensor: &TensorBuffer) -> Result<RawResult, InferError> {
    let ticket = self.dispatch(tensor)?;
    loop {
      let raw = self.retrieve()?;
      if raw.ticket() == ticket {
        return Ok(raw);
      }
      debug!("丢弃更早的结果 #{}", raw.ticket().tag());
    }
  }

  /// 读出并丢弃所有在途结果，返回成功丢弃的个数
  pub fn drain(&mut self) -> usize {
    let pending = self.in_flight.len();
    let limit = Self::deadline(self.retrieve_timeout);
    let mut drained = 0;

    while !self.in_flight.is_empty() {
      if let Err(e) = self.wait_ready(limit) {
        warn!("排空队列失败，放弃剩余结果: {}", e);
        break;
      }
      let before = self.in_flight.len();
      match self.read_front() {
        Ok(_) => drained += 1,
        Err(e) if self.in_flight.len() < before => warn!("排空队列时出错: {}", e),
        Err(e) => {
          warn!("排空队列时出错，放弃剩余结果: {}", e);
          break;
        }
      }
    }

    self.in_flight.clear();
    if pending > 0 {
      info!("已排空 {}/{} 个在途推理", drained, pending);
    }
    drained
  }

  /// 排空队列后按逆序释放所有资源
  pub fn close(mut self) -> Result<(), SessionError> {
    if self.state == SessionState::Ready {
      self.drain();
    }
    self.teardown()
  }

  fn teardown(&mut self) -> Result<(), SessionError> {
    if self.state == SessionState::Closed {
      return Ok(());
    }
    if !self.in_flight.is_empty() {
      warn!("释放会话时仍有 {} 个在途推理", self.in_flight.len());
      self.in_flight.clear();
    }

    let mut first_error = None;
    let mut record = |resource: &'static str, result: Result<(), NcStatus>| {
      if let Err(status) = result {
        warn!("释放{}失败: {}", resource, status);
        first_error.get_or_insert(SessionError::Teardown { resource, status });
      }
    };

    if let Some(fifo) = self.fifo_out.take() {
      record("输出 FIFO", self.driver.fifo_destroy(fifo));
    }
    if let Some(fifo) = self.fifo_in.take() {
      record("输入 FIFO", self.driver.fifo_destroy(fifo));
    }
    if let Some(graph) = self.graph.take() {
      record("计算图", self.driver.graph_destroy(graph));
    }
    let device = self.device.close();

    self.transition(SessionState::Closed);
    info!("会话已释放");
    match (first_error, device) {
      (Some(e), _) => Err(e),
      (None, Err(e)) => Err(e.into()),
      (None, Ok(())) => Ok(()),
    }
  }
}

impl<D: Driver> Drop for Session<D> {
  fn drop(&mut self) {
    if let Err(e) = self.teardown() {
      warn!("析构会话时释放资源失败: {}", e);
    }
  }
}
