// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/milvus.rs - Milvus 向量库
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

//! # Milvus RESTful v2 客户端
//!
//! URL 格式：`milvus://host:19530/<collection>?dim=512&tls&token_env=MILVUS_TOKEN&timeout=10`
//!
//! 集合以 `Strong` 一致性级别创建，插入返回后的查询总能看到该记录。
//! 字段：`id`（Int64，自增主键）、`vector`（FloatVector）、`label`（VarChar）、`confidence`（Float）。

use std::time::Duration;

use reqwest::{StatusCode, blocking::Client};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  error::{ErrorKind, classify_transport, parse_retry_after},
  output::vector_store::{
    CollectionSchema, IndexedRecord, SchemaSlot, SearchHit, StoreError, VectorRecord, VectorStore,
  },
};

const DEFAULT_PORT: u16 = 19530;
const DEFAULT_COLLECTION: &str = "detections";
const DEFAULT_TOKEN_ENV: &str = "MILVUS_TOKEN";
const DEFAULT_TIMEOUT_SECS: u64 = 10;
const CONSISTENCY_LEVEL: &str = "Strong";

/// Milvus 旧版错误码中的限流
const CODE_RATE_LIMIT: i64 = 8;

pub struct MilvusStore {
  client: Client,
  endpoint: String,
  token: Option<String>,
  collection: String,
  requested_dimension: Option<usize>,
  schema: SchemaSlot,
}

impl FromUrlWithScheme for MilvusStore {
  const SCHEME: &'static str = "milvus";
}

impl FromUrl for MilvusStore {
  type Error = StoreError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(StoreError::SchemeMismatch);
    }
    let host = url
      .host_str()
      .filter(|h| !h.is_empty())
      .ok_or_else(|| StoreError::InvalidTarget(format!("{} 缺少主机", url)))?;
    let port = url.port().unwrap_or(DEFAULT_PORT);
    let tls = url.query_pairs().any(|(k, _)| k == "tls");
    let endpoint = format!("{}://{}:{}", if tls { "https" } else { "http" }, host, port);

    let collection = match url.path().trim_matches('/') {
      "" => DEFAULT_COLLECTION,
      name => name,
    };

    let token = crate::query_param::<String>(url, "token").or_else(|| {
      let env = crate::query_param::<String>(url, "token_env").unwrap_or(DEFAULT_TOKEN_ENV.to_string());
      std::env::var(env).ok()
    });
    let timeout = Duration::from_secs(
      crate::query_param(url, "timeout").unwrap_or(DEFAULT_TIMEOUT_SECS),
    );

    let mut store = MilvusStore::new(endpoint, collection, token, timeout)?;
    store.requested_dimension = crate::query_param(url, "dim");
    Ok(store)
  }
}

impl MilvusStore {
  pub fn new(
    endpoint: impl Into<String>,
    collection: impl Into<String>,
    token: Option<String>,
    timeout: Duration,
  ) -> Result<Self, StoreError> {
    let collection = collection.into();
    if !is_valid_collection_name(&collection) {
      return Err(StoreError::InvalidTarget(format!("集合名无效: {}", collection)));
    }
    let client = Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| StoreError::InvalidTarget(format!("无法创建 HTTP 客户端: {}", e)))?;

    Ok(Self {
      client,
      endpoint: endpoint.into().trim_end_matches('/').to_string(),
      token: token.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()),
      collection,
      requested_dimension: None,
      schema: SchemaSlot::default(),
    })
  }

  pub fn endpoint(&self) -> &str {
    &self.endpoint
  }

  fn call(&self, path: &str, body: &Value) -> Result<Value, StoreError> {
    let mut request = self
      .client
      .post(format!("{}/v2/vectordb/{}", self.endpoint, path))
      .json(body);
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }
    let response = request.send().map_err(transport)?;
    let status = response.status();
    let retry_after = parse_retry_after(response.headers());
    let text = response.text().map_err(transport)?;
    interpret_reply(status, retry_after, &text)
  }

  fn has_collection(&self) -> Result<bool, StoreError> {
    let reply = self.call(
      "collections/has",
      &json!({ "collectionName": self.collection }),
    )?;
    Ok(reply["data"]["has"].as_bool().unwrap_or(false))
  }

  fn describe_dimension(&self) -> Result<Option<usize>, StoreError> {
    let reply = self.call(
      "collections/describe",
      &json!({ "collectionName": self.collection }),
    )?;
    Ok(vector_dimension(&reply["data"]))
  }

  fn create_collection(&self, schema: &CollectionSchema) -> Result<(), StoreError> {
    self.call("collections/create", &create_request(schema))?;
    Ok(())
  }
}

impl VectorStore for MilvusStore {
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

    if self.has_collection()? {
      match self.describe_dimension()? {
        Some(existing) if existing != schema.dimension => {
          return Err(StoreError::DimensionMismatch {
            expected: existing,
            actual: schema.dimension,
          });
        }
        Some(_) => debug!("集合 {} 已存在", self.collection),
        None => {
          return Err(StoreError::SchemaConflict(format!(
            "集合 {} 没有向量字段",
            self.collection
          )));
        }
      }
    } else {
      info!(
        "创建集合 {}，维度 {}，度量 {}",
        self.collection,
        schema.dimension,
        schema.metric.as_str()
      );
      self.create_collection(schema)?;
    }

    self.call(
      "collections/load",
      &json!({ "collectionName": self.collection }),
    )?;
    self.schema.set(schema)
  }

  fn insert(&self, record: &VectorRecord) -> Result<i64, StoreError> {
    self.schema.check(&self.collection, record.vector())?;
    let reply = self.call(
      "entities/insert",
      &json!({
        "collectionName": self.collection,
        "data": [{
          "vector": record.vector(),
          "label": record.label(),
          "confidence": record.confidence(),
        }],
      }),
    )?;
    reply["data"]["insertIds"]
      .get(0)
      .and_then(as_id)
      .ok_or_else(|| StoreError::Rejected(format!("插入应答缺少主键: {}", reply["data"])))
  }

  fn get(&self, id: i64) -> Result<Option<IndexedRecord>, StoreError> {
    let reply = self.call(
      "entities/query",
      &json!({
        "collectionName": self.collection,
        "filter": format!("id == {}", id),
        "outputFields": ["id", "label", "confidence", "vector"],
        "limit": 1,
      }),
    )?;
    let rows: Vec<Row> = serde_json::from_value(reply["data"].clone())
      .map_err(|e| StoreError::Rejected(format!("查询应答解析失败: {}", e)))?;
    Ok(rows.into_iter().next().and_then(Row::into_record))
  }

  fn search(&self, vector: &[f32], limit: usize) -> Result<Vec<SearchHit>, StoreError> {
    self.schema.check(&self.collection, vector)?;
    let reply = self.call(
      "entities/search",
      &json!({
        "collectionName": self.collection,
        "data": [vector],
        "annsField": "vector",
        "limit": limit,
        "outputFields": ["label", "confidence"],
      }),
    )?;
    let rows: Vec<Row> = serde_json::from_value(reply["data"].clone())
      .map_err(|e| StoreError::Rejected(format!("检索应答解析失败: {}", e)))?;
    Ok(rows.into_iter().filter_map(Row::into_hit).collect())
  }
}

#[derive(Deserialize)]
struct Row {
  id: Value,
  #[serde(default)]
  label: String,
  #[serde(default)]
  confidence: f32,
  #[serde(default)]
  vector: Vec<f32>,
  #[serde(default)]
  distance: f32,
}

impl Row {
  fn into_record(self) -> Option<IndexedRecord> {
    Some(IndexedRecord {
      id: as_id(&self.id)?,
      label: self.label,
      confidence: self.confidence,
      vector: self.vector,
    })
  }

  fn into_hit(self) -> Option<SearchHit> {
    Some(SearchHit {
      id: as_id(&self.id)?,
      label: self.label,
      confidence: self.confidence,
      score: self.distance,
    })
  }
}

/// Int64 主键可能以数字或字符串返回
fn as_id(value: &Value) -> Option<i64> {
  value
    .as_i64()
    .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn is_valid_collection_name(name: &str) -> bool {
  let mut chars = name.chars();
  matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    && name.len() <= 255
}

fn create_request(schema: &CollectionSchema) -> Value {
  json!({
    "collectionName": schema.name,
    "schema": {
      "autoId": true,
      "enableDynamicField": false,
      "fields": [
        { "fieldName": "id", "dataType": "Int64", "isPrimary": true },
        {
          "fieldName": "vector",
          "dataType": "FloatVector",
          "elementTypeParams": { "dim": schema.dimension.to_string() }
        },
        {
          "fieldName": "label",
          "dataType": "VarChar",
          "elementTypeParams": { "max_length": schema.label_max_length.to_string() }
        },
        { "fieldName": "confidence", "dataType": "Float" }
      ]
    },
    "indexParams": [{
      "fieldName": "vector",
      "indexName": "vector",
      "metricType": schema.metric.as_str(),
      "indexType": "AUTOINDEX"
    }],
    "params": { "consistencyLevel": CONSISTENCY_LEVEL }
  })
}

fn vector_dimension(description: &Value) -> Option<usize> {
  description["fields"]
    .as_array()?
    .iter()
    .find(|f| f["type"] == "FloatVector")?["params"]
    .as_array()?
    .iter()
    .find(|p| p["key"] == "dim")
    .and_then(|p| match &p["value"] {
      Value::String(s) => s.parse().ok(),
      v => v.as_u64().map(|d| d as usize),
    })
}

fn transport(err: reqwest::Error) -> StoreError {
  match classify_transport(&err) {
    ErrorKind::Transient => StoreError::Transport(err.to_string()),
    _ => StoreError::Rejected(err.to_string()),
  }
}

fn interpret_reply(
  status: StatusCode,
  retry_after: Option<Duration>,
  body: &str,
) -> Result<Value, StoreError> {
  if status == StatusCode::TOO_MANY_REQUESTS {
    return Err(StoreError::RateLimited { retry_after });
  }
  if status.is_server_error() {
    return Err(StoreError::Transport(format!("HTTP {}: {}", status, body)));
  }
  if !status.is_success() {
    return Err(StoreError::Rejected(format!("HTTP {}: {}", status, body)));
  }

  let reply: Value = serde_json::from_str(body)
    .map_err(|e| StoreError::Rejected(format!("应答解析失败: {}", e)))?;
  let code = reply["code"].as_i64().unwrap_or(0);
  if code == 0 || code == 200 {
    return Ok(reply);
  }

  let message = reply["message"].as_str().unwrap_or("").to_string();
  if code == CODE_RATE_LIMIT || message.to_ascii_lowercase().contains("rate limit") {
    Err(StoreError::RateLimited { retry_after })
  } else {
    Err(StoreError::Rejected(format!("code {}: {}", code, message)))
  }
}
