// 该文件是 Qianli （千里眼） 项目的一部分。
// src/task.rs - 处理任务
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

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::{thread, time::Duration, time::Instant};

use anyhow::anyhow;
use tracing::{debug, info, warn};

use crate::model::{Model, PipelinedModel, Recoverable};
use crate::output::Render;
use crate::session::Ticket;

pub trait Task<I, M, O>: Sized {
  type Error;
  fn run_task(self, input: I, model: &mut M, output: &O) -> Result<(), Self::Error>;
}

static INTERRUPTED: OnceLock<Arc<AtomicBool>> = OnceLock::new();

/// 安装一次 Ctrl-C 处理，之后的任务共用同一个中断标志
fn interrupt_flag() -> Arc<AtomicBool> {
  INTERRUPTED
    .get_or_init(|| {
      let flag = Arc::new(AtomicBool::new(false));
      let handler_flag = flag.clone();
      let installed = ctrlc::set_handler(move || {
        info!("收到中断信号，准备退出...");
        handler_flag.store(true, Ordering::SeqCst);
        thread::spawn(|| {
          thread::sleep(Duration::from_secs(30));
          warn!("强制退出程序");
          std::process::exit(1);
        });
      });
      if let Err(e) = installed {
        warn!("无法设置 Ctrl-C 处理: {}", e);
      }
      flag
    })
    .clone()
}

/// 推理失败时按错误类别处理：可恢复错误返回空结果，其余错误向上传递
fn recover<R: Default, E>(result: Result<R, E>, frame_index: usize) -> anyhow::Result<R>
where
  E: std::error::Error + Recoverable + Send + Sync + 'static,
{
  match result {
    Ok(result) => Ok(result),
    Err(e) if e.is_recoverable() => {
      warn!("第 {} 帧检测失败，按原样输出: {}", frame_index, e);
      Ok(R::default())
    }
    Err(e) => Err(e.into()),
  }
}

fn reached_limit(frame_number: Option<usize>, frame_index: usize) -> bool {
  frame_number.map(|n| frame_index >= n).unwrap_or(false)
}

pub struct OneShotTask;

impl<F, D, ME, RE, I, M, O> Task<I, M, O> for OneShotTask
where
  D: Default,
  ME: std::error::Error + Recoverable + Sync + Send + 'static,
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = F>,
  M: Model<Input = F, Output = D, Error = ME>,
  O: Render<F, D, Error = RE>,
{
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, model: &mut M, output: &O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let frame = input.next().ok_or_else(|| anyhow!("没有输入帧"))?;
    info!("输入帧获取成功，开始推理...");
    let now = Instant::now();
    let result = recover(model.infer(&frame), 1)?;
    info!("推理完成，耗时: {:.2?}", now.elapsed());
    output.render_result(&frame, &result)?;
    info!("渲染完成，耗时: {:.2?}", now.elapsed());

    Ok(())
  }
}

#[derive(Default, Debug)]
pub struct ContinuousTask {
  frame_number: Option<usize>,
}

impl ContinuousTask {
  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }
}

impl<F, D, ME, RE, I, M, O> Task<I, M, O> for ContinuousTask
where
  D: Default,
  ME: std::error::Error + Recoverable + Sync + Send + 'static,
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = F>,
  M: Model<Input = F, Output = D, Error = ME>,
  O: Render<F, D, Error = RE>,
{
  type Error = anyhow::Error;

  fn run_task(self, input: I, model: &mut M, output: &O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let interrupted = interrupt_flag();

    let mut frame_index = 0;
    let mut now = Instant::now();
    for frame in input {
      frame_index += 1;
      debug!("处理第 {} 帧图像", frame_index);
      let result = recover(model.infer(&frame), frame_index)?;
      let elapsed_a = now.elapsed();
      output.render_result(&frame, &result)?;
      let elapsed_b = now.elapsed();
      now = Instant::now();
      debug!("推理完成，耗时: {:.2?} / {:.2?}", elapsed_a, elapsed_b);
      if reached_limit(self.frame_number, frame_index) {
        info!("达到指定帧数 {}, 退出任务循环", frame_index);
        break;
      }
      if interrupted.load(Ordering::SeqCst) {
        warn!("中断信号接收，退出任务循环");
        break;
      }
    }

    info!("任务完成，共处理 {} 帧", frame_index);
    Ok(())
  }
}

/// 流水线任务：取回上一帧结果的同时，下一帧已在加速器上推理
#[derive(Default, Debug)]
pub struct PipelinedTask {
  frame_number: Option<usize>,
}

impl PipelinedTask {
  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }
}

struct Pending<F> {
  frame: F,
  index: usize,
  ticket: Option<Ticket>,
}

/// 取回最早一帧的结果并输出
///
/// 比期望标记更早的结果来自之前超时的帧，直接丢弃。
fn flush_front<F, D, ME, RE, M, O>(
  pending: &mut VecDeque<Pending<F>>,
  model: &mut M,
  output: &O,
) -> anyhow::Result<()>
where
  D: Default,
  ME: std::error::Error + Recoverable + Sync + Send + 'static,
  RE: std::error::Error + Sync + Send + 'static,
  M: PipelinedModel<Input = F, Output = D, Error = ME>,
  O: Render<F, D, Error = RE>,
{
  let Some(Pending {
    frame,
    index,
    ticket,
  }) = pending.pop_front()
  else {
    return Ok(());
  };

  let result = match ticket {
    None => D::default(),
    Some(expected) => loop {
      match recover(model.collect().map(Some), index)? {
        Some((ticket, result)) if ticket == expected => break result,
        Some((ticket, _)) if ticket < expected => {
          debug!("丢弃过期结果 #{}", ticket.tag());
        }
        Some((ticket, _)) => {
          warn!("第 {} 帧结果缺失，收到 #{}", index, ticket.tag());
          break D::default();
        }
        None => break D::default(),
      }
    },
  };

  output.render_result(&frame, &result)?;
  Ok(())
}

impl<F, D, ME, RE, I, M, O> Task<I, M, O> for PipelinedTask
where
  D: Default,
  ME: std::error::Error + Recoverable + Sync + Send + 'static,
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = F>,
  M: PipelinedModel<Input = F, Output = D, Error = ME>,
  O: Render<F, D, Error = RE>,
{
  type Error = anyhow::Error;

  fn run_task(self, input: I, model: &mut M, output: &O) -> Result<(), Self::Error> {
    let depth = model.depth().max(1);
    info!("开始流水线任务，队列深度 {}", depth);
    let interrupted = interrupt_flag();

    let mut pending = VecDeque::with_capacity(depth);
    let mut frame_index = 0;
    let start = Instant::now();
    for frame in input {
      frame_index += 1;
      let ticket = recover(model.submit(&frame).map(Some), frame_index)?;
      pending.push_back(Pending {
        frame,
        index: frame_index,
        ticket,
      });

      while pending.len() >= depth {
        flush_front(&mut pending, model, output)?;
      }

      if reached_limit(self.frame_number, frame_index) {
        info!("达到指定帧数 {}, 退出任务循环", frame_index);
        break;
      }
      if interrupted.load(Ordering::SeqCst) {
        warn!("中断信号接收，退出任务循环");
        break;
      }
    }

    while !pending.is_empty() {
      flush_front(&mut pending, model, output)?;
    }

    let elapsed = start.elapsed();
    info!(
      "任务完成，共处理 {} 帧，平均 {:.2?}/帧",
      frame_index,
      elapsed / frame_index.max(1) as u32
    );
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::cell::RefCell;
  use thiserror::Error;

  #[derive(Error, Debug)]
  enum MockError {
    #[error("本帧失败")]
    Frame,
    #[error("设备丢失")]
    Fatal,
  }

  impl Recoverable for MockError {
    fn is_recoverable(&self) -> bool {
      matches!(self, MockError::Frame)
    }
  }

  /// 输出为帧值的两倍，帧值为 3 时本帧失败，为 0 时致命失败
  struct Doubler;

  impl Model for Doubler {
    type Input = u32;
    type Output = u32;
    type Error = MockError;

    fn infer(&mut self, input: &u32) -> Result<u32, MockError> {
      match input {
        0 => Err(MockError::Fatal),
        3 => Err(MockError::Frame),
        n => Ok(n * 2),
      }
    }

    fn postprocess(_: &[f32]) -> Result<u32, MockError> {
      Ok(0)
    }
  }

  #[derive(Default)]
  struct Collect {
    rendered: RefCell<Vec<(u32, u32)>>,
  }

  #[derive(Error, Debug)]
  #[error("不会发生")]
  struct Never;

  impl Render<u32, u32> for Collect {
    type Error = Never;

    fn render_result(&self, frame: &u32, result: &u32) -> Result<(), Never> {
      self.rendered.borrow_mut().push((*frame, *result));
      Ok(())
    }
  }

  #[test]
  fn one_shot_renders_first_frame() {
    let output = Collect::default();
    OneShotTask
      .run_task(vec![5, 6].into_iter(), &mut Doubler, &output)
      .unwrap();
    assert_eq!(output.rendered.into_inner(), vec![(5, 10)]);
  }

  #[test]
  fn one_shot_without_frames_fails() {
    let output = Collect::default();
    assert!(
      OneShotTask
        .run_task(std::iter::empty::<u32>(), &mut Doubler, &output)
        .is_err()
    );
  }

  #[test]
  fn recoverable_failure_renders_frame_unmodified() {
    let output = Collect::default();
    ContinuousTask::default()
      .run_task(vec![1, 3, 4].into_iter(), &mut Doubler, &output)
      .unwrap();
    assert_eq!(output.rendered.into_inner(), vec![(1, 2), (3, 0), (4, 8)]);
  }

  #[test]
  fn fatal_failure_stops_the_loop() {
    let output = Collect::default();
    let err = ContinuousTask::default()
      .run_task(vec![1, 0, 4].into_iter(), &mut Doubler, &output)
      .unwrap_err();
    assert!(err.downcast_ref::<MockError>().is_some());
    assert_eq!(output.rendered.into_inner(), vec![(1, 2)]);
  }

  #[test]
  fn frame_limit_is_honored() {
    let output = Collect::default();
    ContinuousTask::default()
      .with_frame_number(Some(2))
      .run_task(1..100, &mut Doubler, &output)
      .unwrap();
    assert_eq!(output.rendered.into_inner().len(), 2);
  }

  /// 提交时计算结果，按提交顺序取回；帧值为 3 的结果第一次取回时超时
  #[derive(Default)]
  struct Queue {
    next: usize,
    stalled: bool,
    queue: VecDeque<(usize, u32)>,
  }

  impl Model for Queue {
    type Input = u32;
    type Output = u32;
    type Error = MockError;

    fn infer(&mut self, input: &u32) -> Result<u32, MockError> {
      Ok(*input)
    }

    fn postprocess(_: &[f32]) -> Result<u32, MockError> {
      Ok(0)
    }
  }

  impl PipelinedModel for Queue {
    fn submit(&mut self, input: &u32) -> Result<Ticket, MockError> {
      self.next += 1;
      self.queue.push_back((self.next, input * 10));
      Ok(ticket(self.next))
    }

    fn collect(&mut self) -> Result<(Ticket, u32), MockError> {
      if let Some((_, 30)) = self.queue.front()
        && !self.stalled
      {
        self.stalled = true;
        return Err(MockError::Frame);
      }
      let (tag, value) = self.queue.pop_front().ok_or(MockError::Frame)?;
      Ok((ticket(tag), value))
    }

    fn in_flight(&self) -> usize {
      self.queue.len()
    }

    fn depth(&self) -> usize {
      2
    }
  }

  fn ticket(tag: usize) -> Ticket {
    Ticket::new(tag)
  }

  #[test]
  fn pipelined_results_stay_with_their_frames() {
    let output = Collect::default();
    PipelinedTask::default()
      .run_task(1..=5, &mut Queue::default(), &output)
      .unwrap();
    assert_eq!(
      output.rendered.into_inner(),
      vec![(1, 10), (2, 20), (3, 0), (4, 40), (5, 50)]
    );
  }
}
