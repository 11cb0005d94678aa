// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - 嵌入模型
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

use image::RgbImage;

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

/// 将图像映射为定长向量的模型
pub trait EmbeddingModel: Model<Input = RgbImage, Output = Vec<f32>> {
  fn dimension(&self) -> usize;
}

mod extractor;
pub use self::extractor::{ExtractError, FeatureExtractor, ModelExtractor, l2_normalize};

mod histogram;
pub use self::histogram::{ColorHistogram, HistogramError};

#[cfg(feature = "rknpu_embedding")]
mod rknn_embed;
#[cfg(feature = "rknpu_embedding")]
pub use self::rknn_embed::{RknnEmbedError, RknnEmbedder, RknnEmbedderBuilder};
