// 该文件是 Qianli （千里眼） 项目的一部分。
// src/ncs/mvnc.rs - libmvnc (NCSDK v2) 绑定
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

//! # libmvnc 后端
//!
//! 使用前需要安装 NCSDK v2，并保证链接器能找到 `libmvnc.so`：
//!
//! ```bash
//! cargo build --features ncsdk
//! ```

use std::ffi::CString;
use std::ptr;

use libc::{c_char, c_int, c_uint, c_void};
use tracing::debug;

use crate::ncs::{Driver, FifoDataType, FifoKind, FifoSpec, NcStatus};

#[allow(non_camel_case_types)]
#[repr(C)]
pub struct ncDeviceHandle_t {
  _private: [u8; 0],
}

#[allow(non_camel_case_types)]
#[repr(C)]
pub struct ncGraphHandle_t {
  _private: [u8; 0],
}

#[allow(non_camel_case_types)]
#[repr(C)]
pub struct ncFifoHandle_t {
  _private: [u8; 0],
}

const NC_FIFO_HOST_RO: c_int = 0;
const NC_FIFO_HOST_WO: c_int = 1;
const NC_FIFO_FP16: c_int = 0;
const NC_FIFO_FP32: c_int = 1;
const NC_RO_FIFO_READ_FILL_LEVEL: c_int = 2005;
const NC_RO_FIFO_ELEMENT_DATA_SIZE: c_int = 2010;

#[link(name = "mvnc")]
unsafe extern "C" {
  fn ncDeviceCreate(index: c_int, device_handle: *mut *mut ncDeviceHandle_t) -> c_int;
  fn ncDeviceOpen(device_handle: *mut ncDeviceHandle_t) -> c_int;
  fn ncDeviceClose(device_handle: *mut ncDeviceHandle_t) -> c_int;
  fn ncDeviceDestroy(device_handle: *mut *mut ncDeviceHandle_t) -> c_int;

  fn ncGraphCreate(name: *const c_char, graph_handle: *mut *mut ncGraphHandle_t) -> c_int;
  fn ncGraphAllocateWithFifosEx(
    device_handle: *mut ncDeviceHandle_t,
    graph_handle: *mut ncGraphHandle_t,
    graph_buffer: *const c_void,
    graph_buffer_length: c_uint,
    in_fifo_handle: *mut *mut ncFifoHandle_t,
    in_fifo_type: c_int,
    in_num_elem: c_int,
    in_data_type: c_int,
    out_fifo_handle: *mut *mut ncFifoHandle_t,
    out_fifo_type: c_int,
    out_num_elem: c_int,
    out_data_type: c_int,
  ) -> c_int;
  fn ncGraphDestroy(graph_handle: *mut *mut ncGraphHandle_t) -> c_int;

  fn ncGraphQueueInferenceWithFifoElem(
    graph_handle: *mut ncGraphHandle_t,
    fifo_in: *mut ncFifoHandle_t,
    fifo_out: *mut ncFifoHandle_t,
    input_tensor: *const c_void,
    input_tensor_length: *mut c_uint,
    user_param: *mut c_void,
  ) -> c_int;
  fn ncFifoGetOption(
    fifo_handle: *mut ncFifoHandle_t,
    option: c_int,
    data: *mut c_void,
    data_length: *mut c_uint,
  ) -> c_int;
  fn ncFifoReadElem(
    fifo_handle: *mut ncFifoHandle_t,
    output_data: *mut c_void,
    output_data_len: *mut c_uint,
    user_param: *mut *mut c_void,
  ) -> c_int;
  fn ncFifoDestroy(fifo_handle: *mut *mut ncFifoHandle_t) -> c_int;
}

#[derive(Debug)]
pub struct MvncDevice(*mut ncDeviceHandle_t);

#[derive(Debug)]
pub struct MvncGraph(*mut ncGraphHandle_t);

#[derive(Debug)]
pub struct MvncFifo(*mut ncFifoHandle_t);

/// 真实的神经计算棒
#[derive(Debug, Default)]
pub struct Mvnc;

fn fifo_type(kind: FifoKind) -> c_int {
  match kind {
    FifoKind::HostReadOnly => NC_FIFO_HOST_RO,
    FifoKind::HostWriteOnly => NC_FIFO_HOST_WO,
  }
}

fn data_type(data_type: FifoDataType) -> c_int {
  match data_type {
    FifoDataType::Fp16 => NC_FIFO_FP16,
    FifoDataType::Fp32 => NC_FIFO_FP32,
  }
}

impl Mvnc {
  fn fifo_option_u32(&self, fifo: &MvncFifo, option: c_int) -> Result<u32, NcStatus> {
    let mut value: c_uint = 0;
    let mut length = std::mem::size_of::<c_uint>() as c_uint;
    NcStatus::check(unsafe {
      ncFifoGetOption(
        fifo.0,
        option,
        &mut value as *mut c_uint as *mut c_void,
        &mut length,
      )
    })?;
    Ok(value)
  }
}

impl Driver for Mvnc {
  type Device = MvncDevice;
  type Graph = MvncGraph;
  type Fifo = MvncFifo;

  fn device_create(&self, index: u32) -> Result<Self::Device, NcStatus> {
    let mut handle = ptr::null_mut();
    NcStatus::check(unsafe { ncDeviceCreate(index as c_int, &mut handle) })?;
    Ok(MvncDevice(handle))
  }

  fn device_open(&self, device: &mut Self::Device) -> Result<(), NcStatus> {
    NcStatus::check(unsafe { ncDeviceOpen(device.0) })
  }

  fn device_close(&self, device: &mut Self::Device) -> Result<(), NcStatus> {
    NcStatus::check(unsafe { ncDeviceClose(device.0) })
  }

  fn device_destroy(&self, mut device: Self::Device) -> Result<(), NcStatus> {
    NcStatus::check(unsafe { ncDeviceDestroy(&mut device.0) })
  }

  fn graph_create(&self, name: &str) -> Result<Self::Graph, NcStatus> {
    let name = CString::new(name).map_err(|_| NcStatus::InvalidParameters)?;
    let mut handle = ptr::null_mut();
    NcStatus::check(unsafe { ncGraphCreate(name.as_ptr(), &mut handle) })?;
    Ok(MvncGraph(handle))
  }

  fn graph_allocate_with_fifos(
    &self,
    device: &Self::Device,
    graph: &mut Self::Graph,
    blob: &[u8],
    input: &FifoSpec,
    output: &FifoSpec,
  ) -> Result<(Self::Fifo, Self::Fifo), NcStatus> {
    let length = c_uint::try_from(blob.len()).map_err(|_| NcStatus::InvalidDataLength)?;
    let mut fifo_in = ptr::null_mut();
    let mut fifo_out = ptr::null_mut();
    debug!("ncGraphAllocateWithFifosEx: {} 字节", length);
    NcStatus::check(unsafe {
      ncGraphAllocateWithFifosEx(
        device.0,
        graph.0,
        blob.as_ptr() as *const c_void,
        length,
        &mut fifo_in,
        fifo_type(input.kind),
        input.depth as c_int,
        data_type(input.data_type),
        &mut fifo_out,
        fifo_type(output.kind),
        output.depth as c_int,
        data_type(output.data_type),
      )
    })?;
    Ok((MvncFifo(fifo_in), MvncFifo(fifo_out)))
  }

  fn graph_destroy(&self, mut graph: Self::Graph) -> Result<(), NcStatus> {
    NcStatus::check(unsafe { ncGraphDestroy(&mut graph.0) })
  }

  fn queue_inference(
    &self,
    graph: &Self::Graph,
    input: &Self::Fifo,
    output: &Self::Fifo,
    tensor: &[f32],
    tag: usize,
  ) -> Result<(), NcStatus> {
    let mut length = c_uint::try_from(std::mem::size_of_val(tensor))
      .map_err(|_| NcStatus::InvalidDataLength)?;
    NcStatus::check(unsafe {
      ncGraphQueueInferenceWithFifoElem(
        graph.0,
        input.0,
        output.0,
        tensor.as_ptr() as *const c_void,
        &mut length,
        tag as *mut c_void,
      )
    })
  }

  fn fifo_fill_level(&self, fifo: &Self::Fifo) -> Result<u32, NcStatus> {
    self.fifo_option_u32(fifo, NC_RO_FIFO_READ_FILL_LEVEL)
  }

  fn fifo_element_size(&self, fifo: &Self::Fifo) -> Result<usize, NcStatus> {
    self
      .fifo_option_u32(fifo, NC_RO_FIFO_ELEMENT_DATA_SIZE)
      .map(|size| size as usize)
  }

  fn fifo_read(&self, fifo: &Self::Fifo, buffer: &mut [u8]) -> Result<(usize, usize), NcStatus> {
    let mut length = c_uint::try_from(buffer.len()).map_err(|_| NcStatus::InvalidDataLength)?;
    let mut user_param: *mut c_void = ptr::null_mut();
    NcStatus::check(unsafe {
      ncFifoReadElem(
        fifo.0,
        buffer.as_mut_ptr() as *mut c_void,
        &mut length,
        &mut user_param,
      )
    })?;
    Ok((length as usize, user_param as usize))
  }

  fn fifo_destroy(&self, mut fifo: Self::Fifo) -> Result<(), NcStatus> {
    NcStatus::check(unsafe { ncFifoDestroy(&mut fifo.0) })
  }
}
