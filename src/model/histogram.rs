// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/histogram.rs - 颜色直方图嵌入
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

//! 不依赖加速器的确定性嵌入：RGB 联合直方图，每通道 `bins` 档。
//!
//! URL 格式：`histogram://?bins=8`，维度为 `bins³`（默认 512）。
//! 各档取频率的平方根（Hellinger 映射），余弦相似度即 Bhattacharyya 系数。

use image::RgbImage;
use thiserror::Error;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  error::{Classify, ErrorKind},
  model::{EmbeddingModel, Model},
};

const DEFAULT_BINS: u32 = 8;
const MAX_BINS: u32 = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HistogramError {
  #[error("图像为空")]
  EmptyImage,
  #[error("直方图档数必须位于 [2, 16]: {0}")]
  InvalidBins(u32),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

impl Classify for HistogramError {
  fn kind(&self) -> ErrorKind {
    match self {
      HistogramError::EmptyImage => ErrorKind::InvalidInput,
      HistogramError::InvalidBins(_) | HistogramError::SchemeMismatch => ErrorKind::Configuration,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorHistogram {
  bins: u32,
}

impl Default for ColorHistogram {
  fn default() -> Self {
    Self { bins: DEFAULT_BINS }
  }
}

impl FromUrlWithScheme for ColorHistogram {
  const SCHEME: &'static str = "histogram";
}

impl FromUrl for ColorHistogram {
  type Error = HistogramError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(HistogramError::SchemeMismatch);
    }
    ColorHistogram::new(crate::query_param(url, "bins").unwrap_or(DEFAULT_BINS))
  }
}

impl ColorHistogram {
  pub fn new(bins: u32) -> Result<Self, HistogramError> {
    if !(2..=MAX_BINS).contains(&bins) {
      return Err(HistogramError::InvalidBins(bins));
    }
    Ok(Self { bins })
  }

  fn bin(&self, value: u8) -> usize {
    (value as u32 * self.bins / 256) as usize
  }
}

impl Model for ColorHistogram {
  type Input = RgbImage;
  type Output = Vec<f32>;
  type Error = HistogramError;

  fn infer(&self, image: &Self::Input) -> Result<Self::Output, Self::Error> {
    if image.width() == 0 || image.height() == 0 {
      return Err(HistogramError::EmptyImage);
    }

    let bins = self.bins as usize;
    let mut counts = vec![0u64; self.dimension()];
    for pixel in image.pixels() {
      let [r, g, b] = pixel.0;
      counts[(self.bin(r) * bins + self.bin(g)) * bins + self.bin(b)] += 1;
    }

    let total = (image.width() as u64 * image.height() as u64) as f64;
    Ok(
      counts
        .into_iter()
        .map(|c| (c as f64 / total).sqrt() as f32)
        .collect(),
    )
  }
}

impl EmbeddingModel for ColorHistogram {
  fn dimension(&self) -> usize {
    (self.bins * self.bins * self.bins) as usize
  }
}
