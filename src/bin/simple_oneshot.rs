// 该文件是 Qianli （千里眼） 项目的一部分。
// src/bin/simple_oneshot.rs - 单张图片检测
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

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use url::Url;

use qianli::{
  FromUrl,
  config::PipelineConfig,
  input::InputWrapper,
  model::SsdDetectorBuilder,
  ncs::{Driver, SimDriver},
  output::{Draw, OutputWrapper},
  task::{OneShotTask, Task},
};

/// 对单张图片做一次检测并保存结果
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 计算图文件路径
  #[arg(long, value_name = "GRAPH", default_value = "./ssd.graph")]
  pub graph: PathBuf,
  /// 输入图片，例如 image:///path/to/input.jpg
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出，例如 image:///path/to/output.png
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// JSON 配置文件
  #[arg(long, value_name = "CONFIG")]
  pub config: Option<PathBuf>,
  /// 使用软件模拟的加速器
  #[arg(long)]
  pub simulate: bool,
}

fn run<D: Driver>(args: Args, config: PipelineConfig, driver: Arc<D>) -> Result<()> {
  let draw = Draw::from_config(&config.display)?;
  let input = InputWrapper::from_url(&args.input)?;
  let output = OutputWrapper::from_url(&args.output)?.with_draw(draw);
  let mut detector = SsdDetectorBuilder::new(config)
    .graph(&args.graph)
    .build(driver)?;

  let result = OneShotTask.run_task(input, &mut detector, &output);
  detector.shutdown()?;
  result
}

#[cfg(feature = "ncsdk")]
fn run_on_hardware(args: Args, config: PipelineConfig) -> Result<()> {
  run(args, config, Arc::new(qianli::ncs::Mvnc))
}

#[cfg(not(feature = "ncsdk"))]
fn run_on_hardware(args: Args, config: PipelineConfig) -> Result<()> {
  warn!("未启用 ncsdk 特性，回退到模拟加速器");
  run(args, config, Arc::new(SimDriver::default()))
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("计算图路径: {}", args.graph.display());
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let config = match &args.config {
    Some(path) => PipelineConfig::from_json_file(path)?,
    None => PipelineConfig::default(),
  };

  if args.simulate {
    warn!("使用模拟加速器，检测结果无实际意义");
    return run(args, config, Arc::new(SimDriver::default()));
  }
  run_on_hardware(args, config)
}
