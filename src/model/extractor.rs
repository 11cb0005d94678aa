// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/extractor.rs - 嵌入提取器
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

//! # 嵌入提取器
//!
//! 模型在专用推理线程（`vigil-embed`）中加载一次，之后所有工作线程的请求
//! 经通道串行送入该线程。推理运行时无需支持并发，也无需实现 `Send`。
//! 提取器析构时关闭请求通道并等待推理线程退出。

use std::{
  fmt::Display,
  thread::{self, JoinHandle},
};

use crossbeam_channel::{Sender, bounded, unbounded};
use image::RgbImage;
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  error::{Classify, ErrorKind},
  model::{ColorHistogram, EmbeddingModel},
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractError {
  #[error("输入图像无效: {0}")]
  InvalidInput(String),
  #[error("推理失败: {0}")]
  Extraction(String),
  #[error("模型输出维度不匹配: 期望 {expected}, 实际 {actual}")]
  DimensionMismatch { expected: usize, actual: usize },
  #[error("模型初始化失败: {0}")]
  Init(String),
  #[error("推理线程已退出")]
  Unavailable,
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

impl Classify for ExtractError {
  fn kind(&self) -> ErrorKind {
    match self {
      ExtractError::InvalidInput(_) => ErrorKind::InvalidInput,
      ExtractError::Extraction(_) => ErrorKind::Permanent,
      ExtractError::DimensionMismatch { .. }
      | ExtractError::Init(_)
      | ExtractError::Unavailable
      | ExtractError::SchemeMismatch => ErrorKind::Configuration,
    }
  }
}

/// 图像到单位向量的提取
pub trait FeatureExtractor: Send + Sync {
  fn dimension(&self) -> usize;

  /// 确定性、L2 归一化；失败时不会以零向量代替
  fn extract(&self, image: &RgbImage) -> Result<Vec<f32>, ExtractError>;
}

/// L2 归一化，范数为零或非有限时返回错误
pub fn l2_normalize(mut vector: Vec<f32>) -> Result<Vec<f32>, ExtractError> {
  if vector.iter().any(|v| !v.is_finite()) {
    return Err(ExtractError::Extraction("模型输出包含非有限值".to_string()));
  }
  let norm = vector
    .iter()
    .map(|v| (*v as f64) * (*v as f64))
    .sum::<f64>()
    .sqrt();
  if norm == 0.0 || !norm.is_finite() {
    return Err(ExtractError::Extraction(format!("向量范数无效: {}", norm)));
  }
  for v in vector.iter_mut() {
    *v = (*v as f64 / norm) as f32;
  }
  Ok(vector)
}

type Reply = Sender<Result<Vec<f32>, ExtractError>>;

pub struct ModelExtractor {
  requests: Option<Sender<(RgbImage, Reply)>>,
  worker: Option<JoinHandle<()>>,
  dimension: usize,
}

impl ModelExtractor {
  /// 启动推理线程，并在其中调用 `build` 加载模型；加载完成后返回
  pub fn spawn<M, F, E>(build: F) -> Result<Self, ExtractError>
  where
    M: EmbeddingModel,
    M::Error: Display + Classify,
    F: FnOnce() -> Result<M, E> + Send + 'static,
    E: Display,
  {
    let (ready_tx, ready_rx) = bounded::<Result<usize, ExtractError>>(1);
    let (request_tx, request_rx) = unbounded::<(RgbImage, Reply)>();

    let worker = thread::Builder::new()
      .name("vigil-embed".to_string())
      .spawn(move || {
        let model = match build() {
          Ok(model) => model,
          Err(e) => {
            let _ = ready_tx.send(Err(ExtractError::Init(e.to_string())));
            return;
          }
        };
        let dimension = model.dimension();
        if dimension == 0 {
          let _ = ready_tx.send(Err(ExtractError::Init("模型维度为 0".to_string())));
          return;
        }
        let _ = ready_tx.send(Ok(dimension));
        info!("嵌入模型已加载，维度 {}", dimension);

        for (image, reply) in request_rx.iter() {
          let _ = reply.send(run_model(&model, &image, dimension));
        }
        debug!("推理线程退出");
      })
      .map_err(|e| ExtractError::Init(format!("无法启动推理线程: {}", e)))?;

    let ready = ready_rx.recv().unwrap_or(Err(ExtractError::Unavailable));
    match ready {
      Ok(dimension) => Ok(Self {
        requests: Some(request_tx),
        worker: Some(worker),
        dimension,
      }),
      Err(e) => {
        drop(request_tx);
        if worker.join().is_err() {
          error!("推理线程异常退出");
        }
        Err(e)
      }
    }
  }
}

fn run_model<M>(model: &M, image: &RgbImage, dimension: usize) -> Result<Vec<f32>, ExtractError>
where
  M: EmbeddingModel,
  M::Error: Display + Classify,
{
  let output = model.infer(image).map_err(|e| match e.kind() {
    ErrorKind::InvalidInput => ExtractError::InvalidInput(e.to_string()),
    _ => ExtractError::Extraction(e.to_string()),
  })?;
  if output.len() != dimension {
    return Err(ExtractError::DimensionMismatch {
      expected: dimension,
      actual: output.len(),
    });
  }
  l2_normalize(output)
}

impl FeatureExtractor for ModelExtractor {
  fn dimension(&self) -> usize {
    self.dimension
  }

  fn extract(&self, image: &RgbImage) -> Result<Vec<f32>, ExtractError> {
    if image.width() == 0 || image.height() == 0 {
      return Err(ExtractError::InvalidInput(format!(
        "图像尺寸为 {}x{}",
        image.width(),
        image.height()
      )));
    }
    let requests = self.requests.as_ref().ok_or(ExtractError::Unavailable)?;
    let (reply_tx, reply_rx) = bounded(1);
    requests
      .send((image.clone(), reply_tx))
      .map_err(|_| ExtractError::Unavailable)?;
    reply_rx.recv().map_err(|_| ExtractError::Unavailable)?
  }
}

impl Drop for ModelExtractor {
  fn drop(&mut self) {
    self.requests.take();
    if let Some(worker) = self.worker.take() {
      if worker.join().is_err() {
        error!("推理线程异常退出");
      }
    }
  }
}

impl FromUrl for ModelExtractor {
  type Error = ExtractError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let scheme = url.scheme().to_string();
    let url = url.clone();
    match scheme.as_str() {
      ColorHistogram::SCHEME => ModelExtractor::spawn(move || ColorHistogram::from_url(&url)),
      #[cfg(feature = "rknpu_embedding")]
      crate::model::RknnEmbedderBuilder::SCHEME => ModelExtractor::spawn(move || {
        crate::model::RknnEmbedderBuilder::from_url(&url).and_then(|b| b.build())
      }),
      _ => Err(ExtractError::SchemeMismatch),
    }
  }
}
