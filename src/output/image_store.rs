// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/image_store.rs - 事件快照目录存储
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

use std::path::{Path, PathBuf};

use chrono::Datelike;
use image::ImageFormat;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  error::{Classify, ErrorKind},
  event::DetectionEvent,
};

#[derive(Error, Debug)]
pub enum PersistError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("不支持的图像格式: {0}")]
  UnsupportedFormat(String),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

impl Classify for PersistError {
  fn kind(&self) -> ErrorKind {
    match self {
      PersistError::SchemeMismatch | PersistError::UnsupportedFormat(_) => {
        ErrorKind::Configuration
      }
      PersistError::ImageError(_) | PersistError::IoError(_) => ErrorKind::Permanent,
    }
  }
}

/// 按日期分目录保存事件快照
///
/// 文件名由采集时间、帧序号和帧内序号组成，并发事件之间不会冲突：
/// `<dir>/2026/01/31/08-15-42-0000000042-00.jpg`
#[derive(Debug, Clone)]
pub struct ImageStore {
  directory: PathBuf,
  format: ImageFormat,
  record: bool,
}

impl FromUrlWithScheme for ImageStore {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for ImageStore {
  type Error = PersistError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(PersistError::SchemeMismatch);
    }

    let format = match crate::query_param::<String>(uri, "format").as_deref() {
      None | Some("jpg") | Some("jpeg") => ImageFormat::Jpeg,
      Some("png") => ImageFormat::Png,
      Some(other) => return Err(PersistError::UnsupportedFormat(other.to_string())),
    };
    let record = uri.query_pairs().any(|(k, _)| k == "record");

    Ok(ImageStore {
      directory: PathBuf::from(uri.path()),
      format,
      record,
    })
  }
}

impl ImageStore {
  pub fn new(directory: impl Into<PathBuf>) -> Self {
    Self {
      directory: directory.into(),
      format: ImageFormat::Jpeg,
      record: false,
    }
  }

  pub fn with_record(mut self, record: bool) -> Self {
    self.record = record;
    self
  }

  pub fn directory(&self) -> &Path {
    &self.directory
  }

  pub fn path_for(&self, event: &DetectionEvent) -> PathBuf {
    let at = event.captured_at();
    let extension = match self.format {
      ImageFormat::Png => "png",
      _ => "jpg",
    };
    self
      .directory
      .join(at.year().to_string())
      .join(format!("{:02}", at.month()))
      .join(format!("{:02}", at.day()))
      .join(format!(
        "{}-{:010}-{:02}.{}",
        at.format("%H-%M-%S"),
        event.id().frame_id,
        event.id().seq,
        extension
      ))
  }

  /// 写入快照，先写临时文件再改名，读取方不会看到半个文件
  pub fn persist(&self, event: &DetectionEvent) -> Result<PathBuf, PersistError> {
    let path = self.path_for(event);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let partial = path.with_extension("part");
    event.frame().save_with_format(&partial, self.format)?;
    std::fs::rename(&partial, &path)?;

    if self.record {
      let [x_min, y_min, x_max, y_max] = event.bbox().corners();
      let line = format!(
        "{}, {:.4}, {:.4}, {:.4}, {:.4}, {:.4}",
        event.label(),
        event.confidence(),
        x_min,
        y_min,
        x_max,
        y_max
      );
      std::fs::write(path.with_extension("txt"), line)?;
    }

    debug!(event = %event.id(), "保存快照到文件: {}", path.display());
    Ok(path)
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use chrono::{TimeZone, Utc};
  use image::RgbImage;

  use super::*;
  use crate::event::{BoundingBox, Detection, EventId};

  fn event(frame_id: u64, seq: u16) -> DetectionEvent {
    let detection = Detection::new("person", 0.875, BoundingBox::new(0.25, 0.25, 0.5, 0.5));
    DetectionEvent::new(
      EventId { frame_id, seq },
      &detection,
      Arc::new(RgbImage::from_pixel(8, 8, image::Rgb([10, 20, 30]))),
      Utc.with_ymd_and_hms(2026, 3, 7, 8, 15, 42).unwrap(),
    )
  }

  #[test]
  fn paths_are_unique_per_event() {
    let store = ImageStore::new("/data");
    let a = store.path_for(&event(42, 0));
    let b = store.path_for(&event(42, 1));
    let c = store.path_for(&event(43, 0));
    assert_eq!(
      a,
      PathBuf::from("/data/2026/03/07/08-15-42-0000000042-00.jpg")
    );
    assert_ne!(a, b);
    assert_ne!(a, c);
  }

  #[test]
  fn persist_writes_image_and_record() {
    let dir = tempfile::tempdir().unwrap();
    let store = ImageStore::new(dir.path()).with_record(true);
    let path = store.persist(&event(7, 0)).unwrap();

    assert!(path.exists());
    assert!(!path.with_extension("part").exists());
    let decoded = image::open(&path).unwrap().to_rgb8();
    assert_eq!(decoded.dimensions(), (8, 8));

    let record = std::fs::read_to_string(path.with_extension("txt")).unwrap();
    assert_eq!(record, "person, 0.8750, 0.2500, 0.2500, 0.7500, 0.7500");
  }

  #[test]
  fn from_url_reads_options() {
    let url = Url::parse("folder:///opt/demo/images?format=png&record").unwrap();
    let store = ImageStore::from_url(&url).unwrap();
    assert_eq!(store.directory(), Path::new("/opt/demo/images"));
    assert!(store.record);
    assert_eq!(store.format, ImageFormat::Png);

    let bad = Url::parse("folder:///x?format=gif").unwrap();
    assert!(matches!(
      ImageStore::from_url(&bad),
      Err(PersistError::UnsupportedFormat(_))
    ));
    let wrong = Url::parse("image:///x").unwrap();
    assert!(matches!(
      ImageStore::from_url(&wrong),
      Err(PersistError::SchemeMismatch)
    ));
  }

  #[test]
  fn unwritable_directory_fails() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"file").unwrap();
    let store = ImageStore::new(&blocker);
    assert!(store.persist(&event(1, 0)).is_err());
  }
}
