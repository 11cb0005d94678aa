// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/notifier.rs - 通知渠道
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

use std::{path::Path, time::Duration};

use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  error::{Classify, ErrorKind},
  output::slack::SlackNotifier,
};

#[derive(Error, Debug)]
pub enum NotifyError {
  #[error("通知服务限流")]
  RateLimited { retry_after: Option<Duration> },
  #[error("通知服务网络错误: {0}")]
  Transport(String),
  #[error("通知服务拒绝请求: {0}")]
  Permanent(String),
  #[error("读取附件失败: {0}")]
  Attachment(#[from] std::io::Error),
  #[error("缺少凭据: {0}")]
  MissingCredential(String),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("通知地址无效: {0}")]
  InvalidTarget(String),
}

impl Classify for NotifyError {
  fn kind(&self) -> ErrorKind {
    match self {
      NotifyError::RateLimited { .. } | NotifyError::Transport(_) => ErrorKind::Transient,
      NotifyError::Permanent(_) => ErrorKind::Permanent,
      NotifyError::Attachment(_) => ErrorKind::InvalidInput,
      NotifyError::MissingCredential(_)
      | NotifyError::SchemeMismatch
      | NotifyError::InvalidTarget(_) => ErrorKind::Configuration,
    }
  }

  fn retry_after(&self) -> Option<Duration> {
    match self {
      NotifyError::RateLimited { retry_after } => *retry_after,
      _ => None,
    }
  }
}

/// 面向人的消息渠道
///
/// 每个方法对应一次远程调用，失败时区分限流（可重试）与永久错误。
pub trait Notifier: Send + Sync {
  /// 默认频道
  fn channel(&self) -> &str;

  fn post_text(&self, channel: &str, text: &str) -> Result<(), NotifyError>;

  fn post_image(&self, channel: &str, path: &Path, title: &str, caption: &str)
  -> Result<(), NotifyError>;
}

/// 只写日志的通知渠道，用于无人值守调试
#[derive(Debug, Clone)]
pub struct LogNotifier {
  channel: String,
}

impl LogNotifier {
  pub fn new(channel: impl Into<String>) -> Self {
    Self {
      channel: channel.into(),
    }
  }
}

impl FromUrlWithScheme for LogNotifier {
  const SCHEME: &'static str = "log";
}

impl FromUrl for LogNotifier {
  type Error = NotifyError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(NotifyError::SchemeMismatch);
    }
    Ok(LogNotifier::new(url.host_str().unwrap_or("log")))
  }
}

impl Notifier for LogNotifier {
  fn channel(&self) -> &str {
    &self.channel
  }

  fn post_text(&self, channel: &str, text: &str) -> Result<(), NotifyError> {
    info!(channel, "通知: {}", text);
    Ok(())
  }

  fn post_image(
    &self,
    channel: &str,
    path: &Path,
    title: &str,
    caption: &str,
  ) -> Result<(), NotifyError> {
    info!(channel, title, "通知附件: {} ({})", path.display(), caption);
    Ok(())
  }
}

pub enum NotifierWrapper {
  Slack(SlackNotifier),
  Log(LogNotifier),
}

impl FromUrl for NotifierWrapper {
  type Error = NotifyError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      SlackNotifier::SCHEME => Ok(NotifierWrapper::Slack(SlackNotifier::from_url(url)?)),
      LogNotifier::SCHEME => Ok(NotifierWrapper::Log(LogNotifier::from_url(url)?)),
      _ => Err(NotifyError::SchemeMismatch),
    }
  }
}

impl Notifier for NotifierWrapper {
  fn channel(&self) -> &str {
    match self {
      NotifierWrapper::Slack(n) => n.channel(),
      NotifierWrapper::Log(n) => n.channel(),
    }
  }

  fn post_text(&self, channel: &str, text: &str) -> Result<(), NotifyError> {
    match self {
      NotifierWrapper::Slack(n) => n.post_text(channel, text),
      NotifierWrapper::Log(n) => n.post_text(channel, text),
    }
  }

  fn post_image(
    &self,
    channel: &str,
    path: &Path,
    title: &str,
    caption: &str,
  ) -> Result<(), NotifyError> {
    match self {
      NotifierWrapper::Slack(n) => n.post_image(channel, path, title, caption),
      NotifierWrapper::Log(n) => n.post_image(channel, path, title, caption),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rate_limit_is_transient_with_hint() {
    let err = NotifyError::RateLimited {
      retry_after: Some(Duration::from_secs(2)),
    };
    assert!(err.is_transient());
    assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
    assert_eq!(
      NotifyError::Permanent("invalid_auth".into()).kind(),
      ErrorKind::Permanent
    );
  }

  #[test]
  fn log_notifier_from_url() {
    let url = Url::parse("log://alerts").unwrap();
    let notifier = NotifierWrapper::from_url(&url).unwrap();
    assert_eq!(notifier.channel(), "alerts");
    assert!(notifier.post_text("alerts", "hello").is_ok());

    let url = Url::parse("smtp://alerts").unwrap();
    assert!(matches!(
      NotifierWrapper::from_url(&url),
      Err(NotifyError::SchemeMismatch)
    ));
  }
}
