// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/slack.rs - Slack 通知
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

//! # Slack 通知
//!
//! URL 格式：`slack://<频道 ID>?token_env=SLACK_BOT_TOKEN&timeout=10`
//!
//! Bot token 只从环境变量读取（默认 `SLACK_BOT_TOKEN`），不接受写在 URL 中。
//! 图片附件走 `files.getUploadURLExternal` -> 上传 -> `files.completeUploadExternal`。

use std::{path::Path, time::Duration};

use reqwest::{
  StatusCode,
  blocking::{Client, RequestBuilder},
};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  error::{ErrorKind, classify_transport, parse_retry_after},
  output::notifier::{Notifier, NotifyError},
};

const SLACK_API_BASE: &str = "https://slack.com/api";
const DEFAULT_TOKEN_ENV: &str = "SLACK_BOT_TOKEN";
const DEFAULT_TIMEOUT_SECS: u64 = 10;

pub struct SlackNotifier {
  client: Client,
  api_base: String,
  token: String,
  channel: String,
}

impl FromUrlWithScheme for SlackNotifier {
  const SCHEME: &'static str = "slack";
}

impl FromUrl for SlackNotifier {
  type Error = NotifyError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(NotifyError::SchemeMismatch);
    }

    let channel = url
      .host_str()
      .filter(|h| !h.is_empty())
      .map(String::from)
      .unwrap_or_else(|| url.path().trim_matches('/').to_string());
    if channel.is_empty() {
      return Err(NotifyError::InvalidTarget(format!("{} 缺少频道", url)));
    }

    let token_env =
      crate::query_param::<String>(url, "token_env").unwrap_or(DEFAULT_TOKEN_ENV.to_string());
    let token = std::env::var(&token_env)
      .ok()
      .filter(|t| !t.trim().is_empty())
      .ok_or_else(|| NotifyError::MissingCredential(token_env.clone()))?;
    let timeout = Duration::from_secs(
      crate::query_param(url, "timeout").unwrap_or(DEFAULT_TIMEOUT_SECS),
    );

    let notifier = SlackNotifier::new(token, channel, timeout)?;
    match crate::query_param::<String>(url, "api") {
      Some(api) => Ok(notifier.with_api_base(api)),
      None => Ok(notifier),
    }
  }
}

#[derive(Serialize)]
struct PostMessage<'a> {
  channel: &'a str,
  text: &'a str,
}

#[derive(Deserialize)]
struct UploadTicket {
  upload_url: String,
  file_id: String,
}

#[derive(Serialize)]
struct CompleteUpload<'a> {
  files: [UploadedFile<'a>; 1],
  channel_id: &'a str,
  initial_comment: &'a str,
}

#[derive(Serialize)]
struct UploadedFile<'a> {
  id: &'a str,
  title: &'a str,
}

impl SlackNotifier {
  pub fn new(
    token: impl Into<String>,
    channel: impl Into<String>,
    timeout: Duration,
  ) -> Result<Self, NotifyError> {
    let token = token.into();
    if token.trim().is_empty() {
      return Err(NotifyError::MissingCredential(DEFAULT_TOKEN_ENV.to_string()));
    }
    let client = Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| NotifyError::Permanent(format!("无法创建 HTTP 客户端: {}", e)))?;

    Ok(Self {
      client,
      api_base: SLACK_API_BASE.to_string(),
      token: token.trim().to_string(),
      channel: channel.into(),
    })
  }

  pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
    self.api_base = api_base.into().trim_end_matches('/').to_string();
    self
  }

  fn method(&self, name: &str) -> String {
    format!("{}/{}", self.api_base, name)
  }

  fn call(&self, request: RequestBuilder) -> Result<serde_json::Value, NotifyError> {
    let response = request.bearer_auth(&self.token).send().map_err(transport)?;
    let status = response.status();
    let retry_after = parse_retry_after(response.headers());
    let body = response.text().map_err(transport)?;
    interpret_reply(status, retry_after, &body)
  }
}

impl Notifier for SlackNotifier {
  fn channel(&self) -> &str {
    &self.channel
  }

  fn post_text(&self, channel: &str, text: &str) -> Result<(), NotifyError> {
    let request = self
      .client
      .post(self.method("chat.postMessage"))
      .json(&PostMessage { channel, text });
    self.call(request)?;
    Ok(())
  }

  fn post_image(
    &self,
    channel: &str,
    path: &Path,
    title: &str,
    caption: &str,
  ) -> Result<(), NotifyError> {
    let bytes = std::fs::read(path)?;
    let filename = path
      .file_name()
      .map(|n| n.to_string_lossy().into_owned())
      .unwrap_or_else(|| "snapshot.jpg".to_string());

    let length = bytes.len().to_string();
    let ticket = self.call(
      self
        .client
        .post(self.method("files.getUploadURLExternal"))
        .form(&[("filename", filename.as_str()), ("length", length.as_str())]),
    )?;
    let ticket: UploadTicket = serde_json::from_value(ticket)
      .map_err(|e| NotifyError::Permanent(format!("上传凭据解析失败: {}", e)))?;
    debug!("Slack 上传地址已获取: {}", ticket.file_id);

    let response = self
      .client
      .post(&ticket.upload_url)
      .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
      .body(bytes)
      .send()
      .map_err(transport)?;
    check_upload_status(response.status(), parse_retry_after(response.headers()))?;

    let complete = CompleteUpload {
      files: [UploadedFile {
        id: &ticket.file_id,
        title,
      }],
      channel_id: channel,
      initial_comment: caption,
    };
    self.call(
      self
        .client
        .post(self.method("files.completeUploadExternal"))
        .json(&complete),
    )?;
    Ok(())
  }
}

fn transport(err: reqwest::Error) -> NotifyError {
  match classify_transport(&err) {
    ErrorKind::Transient => NotifyError::Transport(err.to_string()),
    _ => NotifyError::Permanent(err.to_string()),
  }
}

fn check_upload_status(status: StatusCode, retry_after: Option<Duration>) -> Result<(), NotifyError> {
  if status == StatusCode::TOO_MANY_REQUESTS {
    Err(NotifyError::RateLimited { retry_after })
  } else if status.is_server_error() {
    Err(NotifyError::Transport(format!("上传失败: HTTP {}", status)))
  } else if !status.is_success() {
    Err(NotifyError::Permanent(format!("上传失败: HTTP {}", status)))
  } else {
    Ok(())
  }
}

/// 解析 Slack Web API 应答：HTTP 状态优先，其次是 `ok` / `error` 字段
fn interpret_reply(
  status: StatusCode,
  retry_after: Option<Duration>,
  body: &str,
) -> Result<serde_json::Value, NotifyError> {
  if status == StatusCode::TOO_MANY_REQUESTS {
    return Err(NotifyError::RateLimited { retry_after });
  }
  if status.is_server_error() {
    return Err(NotifyError::Transport(format!("HTTP {}: {}", status, body)));
  }
  if !status.is_success() {
    return Err(NotifyError::Permanent(format!("HTTP {}: {}", status, body)));
  }

  let reply: serde_json::Value = serde_json::from_str(body)
    .map_err(|e| NotifyError::Permanent(format!("应答解析失败: {}", e)))?;
  if reply.get("ok").and_then(|v| v.as_bool()) == Some(true) {
    return Ok(reply);
  }

  let error = reply
    .get("error")
    .and_then(|v| v.as_str())
    .unwrap_or("unknown_error");
  match error {
    "ratelimited" | "rate_limited" => Err(NotifyError::RateLimited { retry_after }),
    "internal_error" | "fatal_error" | "service_unavailable" | "request_timeout" => {
      Err(NotifyError::Transport(error.to_string()))
    }
    _ => Err(NotifyError::Permanent(error.to_string())),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::Classify;

  #[test]
  fn ok_reply_passes_through() {
    let reply = interpret_reply(StatusCode::OK, None, r#"{"ok":true,"ts":"1.2"}"#).unwrap();
    assert_eq!(reply["ts"], "1.2");
  }

  #[test]
  fn http_429_is_rate_limited() {
    let err = interpret_reply(
      StatusCode::TOO_MANY_REQUESTS,
      Some(Duration::from_secs(4)),
      "",
    )
    .unwrap_err();
    assert!(matches!(err, NotifyError::RateLimited { .. }));
    assert_eq!(err.retry_after(), Some(Duration::from_secs(4)));
  }

  #[test]
  fn api_errors_are_classified() {
    let err = interpret_reply(StatusCode::OK, None, r#"{"ok":false,"error":"ratelimited"}"#)
      .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);

    let err = interpret_reply(
      StatusCode::OK,
      None,
      r#"{"ok":false,"error":"invalid_auth"}"#,
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permanent);
    assert_eq!(err.to_string(), "通知服务拒绝请求: invalid_auth");

    let err = interpret_reply(
      StatusCode::OK,
      None,
      r#"{"ok":false,"error":"channel_not_found"}"#,
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permanent);
  }

  #[test]
  fn server_errors_are_transient() {
    let err = interpret_reply(StatusCode::BAD_GATEWAY, None, "bad gateway").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);
    assert!(check_upload_status(StatusCode::SERVICE_UNAVAILABLE, None).unwrap_err().is_transient());
    assert!(check_upload_status(StatusCode::OK, None).is_ok());
    assert_eq!(
      check_upload_status(StatusCode::FORBIDDEN, None).unwrap_err().kind(),
      ErrorKind::Permanent
    );
  }

  #[test]
  fn garbage_body_is_permanent() {
    let err = interpret_reply(StatusCode::OK, None, "<html>").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permanent);
  }

  #[test]
  fn missing_token_is_a_configuration_error() {
    let url = Url::parse("slack://C06NE1FU6SE?token_env=VIGIL_TEST_UNSET_SLACK_TOKEN").unwrap();
    let err = SlackNotifier::from_url(&url).err().unwrap();
    assert!(matches!(err, NotifyError::MissingCredential(_)));
    assert_eq!(err.kind(), ErrorKind::Configuration);
  }

  #[test]
  fn request_bodies_match_web_api() {
    let body = serde_json::to_value(PostMessage {
      channel: "C1",
      text: "Detection: person 0.91",
    })
    .unwrap();
    assert_eq!(body["channel"], "C1");

    let complete = serde_json::to_value(CompleteUpload {
      files: [UploadedFile {
        id: "F1",
        title: "person",
      }],
      channel_id: "C1",
      initial_comment: "Live Camera image",
    })
    .unwrap();
    assert_eq!(complete["files"][0]["id"], "F1");
    assert_eq!(complete["files"][0]["title"], "person");
    assert_eq!(complete["channel_id"], "C1");
  }
}
