// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/rknn_embed.rs - RKNN 特征提取模型
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

//! URL 格式：`rknn:///path/to/resnet.rknn?dim=512`
//!
//! 去掉分类头的骨干网络，输入 224x224 NHWC，输出第 0 个张量作为特征。

use image::RgbImage;
use rknpu::{Context, InitFlags, TensorType};
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  error::{Classify, ErrorKind},
  frame::{AsNhwcFrame, FrameError, RgbNhwcFrame},
  model::{EmbeddingModel, Model},
};

const INPUT_SIZE: u32 = 224;
const DEFAULT_DIMENSION: usize = 512;
const NUM_INPUTS: u32 = 1;

#[derive(Error, Debug)]
pub enum RknnEmbedError {
  #[error("模型加载错误: {0}")]
  ModelLoadError(#[from] std::io::Error),
  #[error("模型无效: {0}, 错误: {1}")]
  ModelInvalid(String, rknpu::Error),
  #[error("RKNN 错误: {0}")]
  RknnError(rknpu::Error),
  #[error("输入帧错误: {0}")]
  Frame(#[from] FrameError),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

impl Classify for RknnEmbedError {
  fn kind(&self) -> ErrorKind {
    match self {
      RknnEmbedError::Frame(_) => ErrorKind::InvalidInput,
      RknnEmbedError::RknnError(_) => ErrorKind::Permanent,
      RknnEmbedError::ModelLoadError(_)
      | RknnEmbedError::ModelInvalid(..)
      | RknnEmbedError::SchemeMismatch => ErrorKind::Configuration,
    }
  }
}

impl From<rknpu::Error> for RknnEmbedError {
  fn from(err: rknpu::Error) -> Self {
    RknnEmbedError::RknnError(err)
  }
}

impl RknnEmbedError {
  fn invalid(msg: &str, e: rknpu::Error) -> Self {
    RknnEmbedError::ModelInvalid(msg.to_string(), e)
  }
}

pub struct RknnEmbedderBuilder {
  model_path: String,
  flags: InitFlags,
  dimension: usize,
}

impl FromUrlWithScheme for RknnEmbedderBuilder {
  const SCHEME: &'static str = "rknn";
}

impl FromUrl for RknnEmbedderBuilder {
  type Error = RknnEmbedError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(RknnEmbedError::SchemeMismatch);
    }

    Ok(RknnEmbedderBuilder {
      model_path: url.path().to_string(),
      flags: InitFlags::default(),
      dimension: crate::query_param(url, "dim").unwrap_or(DEFAULT_DIMENSION),
    })
  }
}

impl RknnEmbedderBuilder {
  pub fn flags(mut self, flags: InitFlags) -> Self {
    self.flags = flags;
    self
  }

  pub fn build(self) -> Result<RknnEmbedder, RknnEmbedError> {
    info!("加载嵌入模型文件: {}", self.model_path);
    let model_data = std::fs::read(&self.model_path)?;
    debug!(
      "模型文件大小: {:.2} MB",
      model_data.len() as f64 / (1024.0 * 1024.0)
    );

    let context = Context::new(&model_data, self.flags)?;

    let num_inputs = context
      .num_inputs()
      .map_err(|e| RknnEmbedError::invalid("无法获取输入数量", e))?;
    let num_outputs = context
      .num_outputs()
      .map_err(|e| RknnEmbedError::invalid("无法获取输出数量", e))?;
    if num_inputs != NUM_INPUTS || num_outputs == 0 {
      error!(
        "预期模型输入数量为 {}，至少一个输出，实际为 {} / {}",
        NUM_INPUTS, num_inputs, num_outputs
      );
      return Err(RknnEmbedError::invalid(
        &format!("输入 {} 个，输出 {} 个", num_inputs, num_outputs),
        rknpu::Error::InvalidModel,
      ));
    }

    info!("嵌入模型加载完成");
    Ok(RknnEmbedder {
      context,
      dimension: self.dimension,
    })
  }
}

pub struct RknnEmbedder {
  context: Context,
  dimension: usize,
}

impl Model for RknnEmbedder {
  type Input = RgbImage;
  type Output = Vec<f32>;
  type Error = RknnEmbedError;

  fn infer(&self, image: &Self::Input) -> Result<Self::Output, Self::Error> {
    let frame = RgbNhwcFrame::<INPUT_SIZE, INPUT_SIZE>::resized_from(image)?;

    self.context.set_input(
      0,
      frame.as_nhwc(),
      rknpu::TensorFormat::NHWC,
      TensorType::UInt8,
    )?;
    self.context.run()?;

    let output = self.context.get_outputs()?;
    let features = output.get_f32(0)?.to_vec();
    debug!("特征长度: {}", features.len());
    Ok(features)
  }
}

impl EmbeddingModel for RknnEmbedder {
  fn dimension(&self) -> usize {
    self.dimension
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builder_reads_path_and_dimension() {
    let url = Url::parse("rknn:///opt/models/resnet34.rknn?dim=512").unwrap();
    let builder = RknnEmbedderBuilder::from_url(&url).unwrap();
    assert_eq!(builder.model_path, "/opt/models/resnet34.rknn");
    assert_eq!(builder.dimension, 512);

    let url = Url::parse("histogram://").unwrap();
    assert!(matches!(
      RknnEmbedderBuilder::from_url(&url),
      Err(RknnEmbedError::SchemeMismatch)
    ));
  }

  #[test]
  fn missing_model_file_is_a_configuration_error() {
    let url = Url::parse("rknn:///nonexistent/model.rknn").unwrap();
    let err = RknnEmbedderBuilder::from_url(&url).unwrap().build().err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Configuration);
  }
}
