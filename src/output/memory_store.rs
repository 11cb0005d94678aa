// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/memory_store.rs - 进程内向量库
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

//! URL 格式：`memory:///<collection>?dim=512`

use parking_lot::Mutex;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  output::vector_store::{
    CollectionSchema, IndexedRecord, SchemaSlot, SearchHit, StoreError, VectorRecord, VectorStore,
  },
};

const DEFAULT_COLLECTION: &str = "detections";

#[derive(Debug, Default)]
struct Rows {
  next_id: i64,
  records: Vec<IndexedRecord>,
}

/// 与远程向量库行为一致的内存实现：自增主键、余弦检索、写入即可见
#[derive(Debug)]
pub struct MemoryStore {
  collection: String,
  requested_dimension: Option<usize>,
  schema: SchemaSlot,
  rows: Mutex<Rows>,
}

impl FromUrlWithScheme for MemoryStore {
  const SCHEME: &'static str = "memory";
}

impl FromUrl for MemoryStore {
  type Error = StoreError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(StoreError::SchemeMismatch);
    }
    let collection = match url.path().trim_matches('/') {
      "" => DEFAULT_COLLECTION,
      name => name,
    };
    let mut store = MemoryStore::new(collection);
    store.requested_dimension = crate::query_param(url, "dim");
    Ok(store)
  }
}

impl MemoryStore {
  pub fn new(collection: impl Into<String>) -> Self {
    Self {
      collection: collection.into(),
      requested_dimension: None,
      schema: SchemaSlot::default(),
      rows: Mutex::new(Rows {
        next_id: 1,
        records: Vec::new(),
      }),
    }
  }

  pub fn len(&self) -> usize {
    self.rows.lock().records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn records(&self) -> Vec<IndexedRecord> {
    self.rows.lock().records.clone()
  }
}

pub(crate) fn cosine(a: &[f32], b: &[f32]) -> f32 {
  let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
  let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
  let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
  if norm_a == 0.0 || norm_b == 0.0 {
    return 0.0;
  }
  dot / (norm_a * norm_b)
}

impl VectorStore for MemoryStore {
  fn collection(&self) -> &str {
    &self.collection
  }

  fn requested_dimension(&self) -> Option<usize> {
    self.requested_dimension
  }

  fn schema(&self) -> Option<&CollectionSchema> {
    self.schema.get()
  }

  fn ensure_collection(&self, schema: &CollectionSchema) -> Result<(), StoreError> {
    if schema.name != self.collection {
      return Err(StoreError::SchemaConflict(format!(
        "集合名 {} 与 {} 不一致",
        schema.name, self.collection
      )));
    }
    self.schema.set(schema)
  }

  fn insert(&self, record: &VectorRecord) -> Result<i64, StoreError> {
    self.schema.check(&self.collection, record.vector())?;

    let mut rows = self.rows.lock();
    let id = rows.next_id;
    rows.next_id += 1;
    rows.records.push(IndexedRecord {
      id,
      label: record.label().to_string(),
      confidence: record.confidence(),
      vector: record.vector().to_vec(),
    });
    Ok(id)
  }

  fn get(&self, id: i64) -> Result<Option<IndexedRecord>, StoreError> {
    Ok(self.rows.lock().records.iter().find(|r| r.id == id).cloned())
  }

  fn search(&self, vector: &[f32], limit: usize) -> Result<Vec<SearchHit>, StoreError> {
    self.schema.check(&self.collection, vector)?;

    let rows = self.rows.lock();
    let mut hits: Vec<SearchHit> = rows
      .records
      .iter()
      .map(|r| SearchHit {
        id: r.id,
        label: r.label.clone(),
        confidence: r.confidence,
        score: cosine(vector, &r.vector),
      })
      .collect();
    hits.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.id.cmp(&b.id)));
    hits.truncate(limit);
    Ok(hits)
  }
}
