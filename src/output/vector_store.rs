// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/vector_store.rs - 向量库抽象
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

//! # 向量库
//!
//! 每条记录包含 `{vector, label, confidence}`，主键由向量库自增分配。
//! 集合结构在启动时确认一次，之后整个进程共用，不再修改。
//! 插入成功返回后，记录对后续查询立即可见（强一致性）。

use std::{sync::OnceLock, time::Duration};

use serde::Serialize;
use thiserror::Error;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  config::ConfigError,
  error::{Classify, ErrorKind},
  output::{memory_store::MemoryStore, milvus::MilvusStore},
};

/// 标签字段的最大长度（字节）
pub const LABEL_MAX_LENGTH: usize = 200;

#[derive(Error, Debug)]
pub enum StoreError {
  #[error("向量库限流")]
  RateLimited { retry_after: Option<Duration> },
  #[error("向量库网络错误: {0}")]
  Transport(String),
  #[error("向量库拒绝请求: {0}")]
  Rejected(String),
  #[error("向量包含非有限值")]
  NonFiniteVector,
  #[error("集合 {0} 尚未初始化")]
  NotInitialized(String),
  #[error("向量维度不匹配: 集合 {expected}, 实际 {actual}")]
  DimensionMismatch { expected: usize, actual: usize },
  #[error("集合结构冲突: {0}")]
  SchemaConflict(String),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("向量库地址无效: {0}")]
  InvalidTarget(String),
}

impl Classify for StoreError {
  fn kind(&self) -> ErrorKind {
    match self {
      StoreError::RateLimited { .. } | StoreError::Transport(_) => ErrorKind::Transient,
      StoreError::Rejected(_) => ErrorKind::Permanent,
      StoreError::NonFiniteVector => ErrorKind::InvalidInput,
      StoreError::NotInitialized(_)
      | StoreError::DimensionMismatch { .. }
      | StoreError::SchemaConflict(_)
      | StoreError::SchemeMismatch
      | StoreError::InvalidTarget(_) => ErrorKind::Configuration,
    }
  }

  fn retry_after(&self) -> Option<Duration> {
    match self {
      StoreError::RateLimited { retry_after } => *retry_after,
      _ => None,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Metric {
  #[default]
  #[serde(rename = "COSINE")]
  Cosine,
}

impl Metric {
  pub fn as_str(&self) -> &'static str {
    match self {
      Metric::Cosine => "COSINE",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSchema {
  pub name: String,
  pub dimension: usize,
  pub metric: Metric,
  pub label_max_length: usize,
}

impl CollectionSchema {
  pub fn new(name: impl Into<String>, dimension: usize) -> Self {
    Self {
      name: name.into(),
      dimension,
      metric: Metric::Cosine,
      label_max_length: LABEL_MAX_LENGTH,
    }
  }
}

/// 待插入的一行
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
  vector: Vec<f32>,
  label: String,
  confidence: f32,
}

impl VectorRecord {
  /// 超长标签在字符边界处截断
  pub fn new(vector: Vec<f32>, label: &str, confidence: f32) -> Self {
    Self {
      vector,
      label: truncate_label(label, LABEL_MAX_LENGTH).to_string(),
      confidence,
    }
  }

  pub fn vector(&self) -> &[f32] {
    &self.vector
  }

  pub fn label(&self) -> &str {
    &self.label
  }

  pub fn confidence(&self) -> f32 {
    self.confidence
  }
}

/// 向量库中已存储的一行
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedRecord {
  pub id: i64,
  pub label: String,
  pub confidence: f32,
  pub vector: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
  pub id: i64,
  pub label: String,
  pub confidence: f32,
  /// 余弦相似度，越大越相似
  pub score: f32,
}

pub fn truncate_label(label: &str, max_bytes: usize) -> &str {
  if label.len() <= max_bytes {
    return label;
  }
  let mut end = max_bytes;
  while !label.is_char_boundary(end) {
    end -= 1;
  }
  &label[..end]
}

pub trait VectorStore: Send + Sync {
  fn collection(&self) -> &str;

  /// URL 中声明的维度，用于启动时与提取器核对
  fn requested_dimension(&self) -> Option<usize> {
    None
  }

  /// 已确认的集合结构
  fn schema(&self) -> Option<&CollectionSchema>;

  /// 幂等：集合不存在时创建集合与余弦索引，存在时核对维度
  fn ensure_collection(&self, schema: &CollectionSchema) -> Result<(), StoreError>;

  /// 插入一行，返回向量库分配的主键
  fn insert(&self, record: &VectorRecord) -> Result<i64, StoreError>;

  fn get(&self, id: i64) -> Result<Option<IndexedRecord>, StoreError>;

  fn search(&self, vector: &[f32], limit: usize) -> Result<Vec<SearchHit>, StoreError>;
}

/// 根据提取器维度生成集合结构，URL 声明了不同维度时拒绝启动
pub fn schema_for<S: VectorStore + ?Sized>(
  store: &S,
  extractor_dimension: usize,
) -> Result<CollectionSchema, ConfigError> {
  match store.requested_dimension() {
    Some(store_dimension) if store_dimension != extractor_dimension => {
      Err(ConfigError::DimensionMismatch {
        extractor: extractor_dimension,
        store: store_dimension,
      })
    }
    _ => Ok(CollectionSchema::new(store.collection(), extractor_dimension)),
  }
}

/// 进程内唯一的集合结构，首次确认后不再改变
#[derive(Debug, Default)]
pub(crate) struct SchemaSlot(OnceLock<CollectionSchema>);

impl SchemaSlot {
  pub(crate) fn get(&self) -> Option<&CollectionSchema> {
    self.0.get()
  }

  pub(crate) fn set(&self, schema: &CollectionSchema) -> Result<(), StoreError> {
    let current = self.0.get_or_init(|| schema.clone());
    if current != schema {
      return Err(StoreError::SchemaConflict(format!(
        "{} 已按维度 {} 初始化，不能改为 {}",
        current.name, current.dimension, schema.dimension
      )));
    }
    Ok(())
  }

  /// 插入前核对：集合已确认、维度一致、数值有限
  pub(crate) fn check(&self, collection: &str, vector: &[f32]) -> Result<&CollectionSchema, StoreError> {
    let schema = self
      .get()
      .ok_or_else(|| StoreError::NotInitialized(collection.to_string()))?;
    if vector.len() != schema.dimension {
      return Err(StoreError::DimensionMismatch {
        expected: schema.dimension,
        actual: vector.len(),
      });
    }
    if vector.iter().any(|v| !v.is_finite()) {
      return Err(StoreError::NonFiniteVector);
    }
    Ok(schema)
  }
}

pub enum StoreWrapper {
  Milvus(MilvusStore),
  Memory(MemoryStore),
}

impl FromUrl for StoreWrapper {
  type Error = StoreError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      MilvusStore::SCHEME => Ok(StoreWrapper::Milvus(MilvusStore::from_url(url)?)),
      MemoryStore::SCHEME => Ok(StoreWrapper::Memory(MemoryStore::from_url(url)?)),
      _ => Err(StoreError::SchemeMismatch),
    }
  }
}

impl VectorStore for StoreWrapper {
  fn collection(&self) -> &str {
    match self {
      StoreWrapper::Milvus(s) => s.collection(),
      StoreWrapper::Memory(s) => s.collection(),
    }
  }

  fn requested_dimension(&self) -> Option<usize> {
    match self {
      StoreWrapper::Milvus(s) => s.requested_dimension(),
      StoreWrapper::Memory(s) => s.requested_dimension(),
    }
  }

  fn schema(&self) -> Option<&CollectionSchema> {
    match self {
      StoreWrapper::Milvus(s) => s.schema(),
      StoreWrapper::Memory(s) => s.schema(),
    }
  }

  fn ensure_collection(&self, schema: &CollectionSchema) -> Result<(), StoreError> {
    match self {
      StoreWrapper::Milvus(s) => s.ensure_collection(schema),
      StoreWrapper::Memory(s) => s.ensure_collection(schema),
    }
  }

  fn insert(&self, record: &VectorRecord) -> Result<i64, StoreError> {
    match self {
      StoreWrapper::Milvus(s) => s.insert(record),
      StoreWrapper::Memory(s) => s.insert(record),
    }
  }

  fn get(&self, id: i64) -> Result<Option<IndexedRecord>, StoreError> {
    match self {
      StoreWrapper::Milvus(s) => s.get(id),
      StoreWrapper::Memory(s) => s.get(id),
    }
  }

  fn search(&self, vector: &[f32], limit: usize) -> Result<Vec<SearchHit>, StoreError> {
    match self {
      StoreWrapper::Milvus(s) => s.search(vector, limit),
      StoreWrapper::Memory(s) => s.search(vector, limit),
    }
  }
}
