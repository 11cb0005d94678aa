// 该文件是 Shanan （山南西风） 项目的一部分。
// src/frame.rs - 帧缓冲与 NHWC 张量帧
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

use std::str::FromStr;

use image::{RgbImage, imageops::FilterType};
use thiserror::Error;

use crate::error::{Classify, ErrorKind};

const RGB_CHANNELS: usize = 3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
  #[error("帧尺寸无效: {width}x{height}")]
  InvalidShape { width: u32, height: u32 },
  #[error("缓冲区大小不匹配: 期望 {expected} 字节, 实际 {actual} 字节")]
  BufferSizeMismatch { expected: usize, actual: usize },
  #[error("不支持的像素格式: {0}")]
  UnsupportedFormat(String),
}

impl Classify for FrameError {
  fn kind(&self) -> ErrorKind {
    ErrorKind::InvalidInput
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
  Rgb,
  Bgr,
}

impl FromStr for PixelFormat {
  type Err = FrameError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "RGB" => Ok(PixelFormat::Rgb),
      "BGR" => Ok(PixelFormat::Bgr),
      other => Err(FrameError::UnsupportedFormat(other.to_string())),
    }
  }
}

/// 上游管道在回调期间借出的帧缓冲
///
/// 缓冲区在回调返回后即被回收，需要保留的内容必须复制出去。
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
  pub format: PixelFormat,
  pub width: u32,
  pub height: u32,
  pub data: &'a [u8],
}

impl<'a> FrameView<'a> {
  pub fn new(format: PixelFormat, width: u32, height: u32, data: &'a [u8]) -> Self {
    Self {
      format,
      width,
      height,
      data,
    }
  }

  pub fn rgb(width: u32, height: u32, data: &'a [u8]) -> Self {
    Self::new(PixelFormat::Rgb, width, height, data)
  }

  /// 复制为独立持有的 RGB 图像
  pub fn to_rgb_image(&self) -> Result<RgbImage, FrameError> {
    if self.width == 0 || self.height == 0 {
      return Err(FrameError::InvalidShape {
        width: self.width,
        height: self.height,
      });
    }

    let expected = (self.width as usize)
      .checked_mul(self.height as usize)
      .and_then(|n| n.checked_mul(RGB_CHANNELS))
      .ok_or(FrameError::InvalidShape {
        width: self.width,
        height: self.height,
      })?;
    if self.data.len() != expected {
      return Err(FrameError::BufferSizeMismatch {
        expected,
        actual: self.data.len(),
      });
    }

    let data = match self.format {
      PixelFormat::Rgb => self.data.to_vec(),
      PixelFormat::Bgr => {
        let mut data = Vec::with_capacity(expected);
        for px in self.data.chunks_exact(RGB_CHANNELS) {
          data.extend_from_slice(&[px[2], px[1], px[0]]);
        }
        data
      }
    };

    RgbImage::from_raw(self.width, self.height, data).ok_or(FrameError::BufferSizeMismatch {
      expected,
      actual: self.data.len(),
    })
  }
}

pub trait AsNhwcFrame<const W: u32, const H: u32> {
  fn as_nhwc(&self) -> &[u8];
}

/// 固定尺寸的 NHWC 模型输入
#[derive(Debug, Clone)]
pub struct RgbNhwcFrame<const W: u32, const H: u32> {
  data: Box<[u8]>,
}

impl<const W: u32, const H: u32> TryFrom<Vec<u8>> for RgbNhwcFrame<W, H> {
  type Error = FrameError;

  fn try_from(data: Vec<u8>) -> Result<Self, Self::Error> {
    let expected = RGB_CHANNELS * W as usize * H as usize;
    if data.len() != expected {
      return Err(FrameError::BufferSizeMismatch {
        expected,
        actual: data.len(),
      });
    }

    Ok(Self {
      data: data.into_boxed_slice(),
    })
  }
}

impl<const W: u32, const H: u32> RgbNhwcFrame<W, H> {
  /// 缩放到模型输入尺寸并按 HWC 排布
  pub fn resized_from(image: &RgbImage) -> Result<Self, FrameError> {
    if image.width() == 0 || image.height() == 0 {
      return Err(FrameError::InvalidShape {
        width: image.width(),
        height: image.height(),
      });
    }

    let data = if image.dimensions() == (W, H) {
      image.as_raw().clone()
    } else {
      image::imageops::resize(image, W, H, FilterType::Triangle).into_raw()
    };
    Self::try_from(data)
  }

  pub fn height(&self) -> usize {
    H as usize
  }

  pub fn width(&self) -> usize {
    W as usize
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }
}

impl<const W: u32, const H: u32> AsNhwcFrame<W, H> for RgbNhwcFrame<W, H> {
  fn as_nhwc(&self) -> &[u8] {
    &self.data
  }
}
