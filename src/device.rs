// 该文件是 Qianli （千里眼） 项目的一部分。
// src/device.rs - 设备发现与管理
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

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::ncs::{Driver, NcStatus};

#[derive(Error, Debug)]
pub enum DeviceError {
  #[error("未找到神经计算设备")]
  NoDeviceFound,
  #[error("设备 {index} 关闭失败: {status}")]
  Close { index: u32, status: NcStatus },
}

/// 一个已打开的加速器，析构时关闭并销毁
pub struct DeviceHandle<D: Driver> {
  driver: Arc<D>,
  index: u32,
  raw: Option<D::Device>,
}

impl<D: Driver> DeviceHandle<D> {
  pub fn index(&self) -> u32 {
    self.index
  }

  pub fn driver(&self) -> &Arc<D> {
    &self.driver
  }

  pub fn is_open(&self) -> bool {
    self.raw.is_some()
  }

  pub(crate) fn raw(&self) -> Option<&D::Device> {
    self.raw.as_ref()
  }

  /// 关闭并销毁设备，重复调用无副作用
  pub fn close(&mut self) -> Result<(), DeviceError> {
    let Some(mut raw) = self.raw.take() else {
      return Ok(());
    };

    debug!("关闭设备 {}", self.index);
    let closed = self.driver.device_close(&mut raw);
    let destroyed = self.driver.device_destroy(raw);
    closed
      .and(destroyed)
      .map_err(|status| DeviceError::Close {
        index: self.index,
        status,
      })
  }
}

impl<D: Driver> Drop for DeviceHandle<D> {
  fn drop(&mut self) {
    if let Err(e) = self.close() {
      warn!("{}", e);
    }
  }
}

/// 设备管理器，持有不超过 `max_devices` 个已打开的设备
pub struct DeviceManager<D: Driver> {
  driver: Arc<D>,
  max_devices: u32,
  devices: Vec<DeviceHandle<D>>,
}

impl<D: Driver> DeviceManager<D> {
  pub fn new(driver: Arc<D>, max_devices: u32) -> Self {
    Self {
      driver,
      max_devices,
      devices: Vec::new(),
    }
  }

  /// 依次创建并打开 `0..max_devices` 号设备，返回成功打开的数量
  ///
  /// 0 号设备创建失败视为没有设备；之后的序号创建失败只是停止枚举。
  /// 打开失败的设备不计数、不重试。
  pub fn discover_and_open(&mut self) -> Result<usize, DeviceError> {
    let mut not_found = false;

    for index in self.devices.len() as u32..self.max_devices {
      let mut raw = match self.driver.device_create(index) {
        Ok(raw) => raw,
        Err(status) => {
          if index == 0 {
            error!("未找到神经计算设备 ({})", status);
            not_found = true;
          } else {
            debug!("设备 {} 不存在 ({})，停止枚举", index, status);
          }
          break;
        }
      };

      match self.driver.device_open(&mut raw) {
        Ok(()) => self.devices.push(DeviceHandle {
          driver: self.driver.clone(),
          index,
          raw: Some(raw),
        }),
        Err(status) => {
          error!("无法打开设备 {}: {} ({})", index, status, status.code());
          if let Err(status) = self.driver.device_destroy(raw) {
            warn!("销毁设备 {} 失败: {}", index, status);
          }
        }
      }
    }

    if not_found {
      return Err(DeviceError::NoDeviceFound);
    }

    if !self.devices.is_empty() {
      info!("已连接的神经计算设备数量: {}", self.devices.len());
    }
    Ok(self.devices.len())
  }

  pub fn connected(&self) -> usize {
    self.devices.len()
  }

  pub fn max_devices(&self) -> u32 {
    self.max_devices
  }

  /// 取出第一个已打开的设备交给会话
  pub fn take_device(&mut self) -> Option<DeviceHandle<D>> {
    if self.devices.is_empty() {
      None
    } else {
      Some(self.devices.remove(0))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ncs::{SimDriver, SimEvent};

  #[test]
  fn opens_the_single_present_device() {
    let driver = Arc::new(SimDriver::builder().devices(1).build());
    let mut manager = DeviceManager::new(driver, 1);

    assert_eq!(manager.discover_and_open().unwrap(), 1);
    assert_eq!(manager.connected(), 1);
  }

  #[test]
  fn no_device_is_signaled() {
    let driver = Arc::new(SimDriver::builder().devices(0).build());
    let mut manager = DeviceManager::new(driver, 1);

    assert!(matches!(
      manager.discover_and_open(),
      Err(DeviceError::NoDeviceFound)
    ));
    assert_eq!(manager.connected(), 0);
    assert!(manager.take_device().is_none());
  }

  #[test]
  fn fewer_devices_than_maximum_is_fine() {
    let driver = Arc::new(SimDriver::builder().devices(2).build());
    let mut manager = DeviceManager::new(driver, 4);

    assert_eq!(manager.discover_and_open().unwrap(), 2);
  }

  #[test]
  fn failed_open_is_skipped_and_released() {
    let driver = Arc::new(SimDriver::builder().devices(3).fail_open(1).build());
    let mut manager = DeviceManager::new(driver.clone(), 3);

    assert_eq!(manager.discover_and_open().unwrap(), 2);
    assert!(driver.events().contains(&SimEvent::DeviceDestroyed(1)));
    assert!(!driver.events().contains(&SimEvent::DeviceOpened(1)));

    let first = manager.take_device().unwrap();
    assert_eq!(first.index(), 0);
    assert_eq!(manager.connected(), 1);
  }

  #[test]
  fn never_exceeds_maximum() {
    let driver = Arc::new(SimDriver::builder().devices(5).build());
    let mut manager = DeviceManager::new(driver, 2);

    assert_eq!(manager.discover_and_open().unwrap(), 2);
    assert_eq!(manager.discover_and_open().unwrap(), 2);
  }

  #[test]
  fn dropping_handle_closes_device() {
    let driver = Arc::new(SimDriver::default());
    let mut manager = DeviceManager::new(driver.clone(), 1);
    manager.discover_and_open().unwrap();
    drop(manager.take_device());

    let events = driver.events();
    assert_eq!(
      &events[events.len() - 2..],
      &[SimEvent::DeviceClosed(0), SimEvent::DeviceDestroyed(0)]
    );
  }
}
