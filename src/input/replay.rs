// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input/replay.rs - 录制帧回放
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

//! # 回放输入
//!
//! URL 格式：`replay:///path/to/recording?fps=30`
//!
//! 递归读取目录下的 `png` / `jpg` 图像，按路径排序回放。每张图像可带一个同名
//! `.txt` 检测记录，每行 `label, confidence, x_min, y_min, x_max, y_max`
//! （归一化坐标），与快照目录的记录格式相同，因此保存下来的快照目录可直接回放。

use std::path::{Path, PathBuf};

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  error::{Classify, ErrorKind},
  event::{BoundingBox, Detection},
  frame::FrameView,
};

#[derive(Error, Debug)]
pub enum ReplayError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("不是目录: {0}")]
  NotADirectory(PathBuf),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像加载错误: {0}")]
  ImageLoadError(#[from] image::ImageError),
  #[error("{path} 第 {line} 行记录无效: {reason}")]
  BadRecord {
    path: String,
    line: usize,
    reason: String,
  },
}

impl Classify for ReplayError {
  fn kind(&self) -> ErrorKind {
    match self {
      ReplayError::SchemeMismatch | ReplayError::NotADirectory(_) => ErrorKind::Configuration,
      ReplayError::IoError(_) | ReplayError::ImageLoadError(_) | ReplayError::BadRecord { .. } => {
        ErrorKind::InvalidInput
      }
    }
  }
}

/// 一帧回放数据
#[derive(Debug, Clone)]
pub struct ReplayFrame {
  pub path: PathBuf,
  pub image: RgbImage,
  pub detections: Vec<Detection>,
}

impl ReplayFrame {
  pub fn view(&self) -> FrameView<'_> {
    FrameView::rgb(self.image.width(), self.image.height(), self.image.as_raw())
  }
}

pub struct ReplayInput {
  frames: std::vec::IntoIter<PathBuf>,
  total: usize,
  fps: Option<f64>,
}

impl FromUrlWithScheme for ReplayInput {
  const SCHEME: &'static str = "replay";
}

impl FromUrl for ReplayInput {
  type Error = ReplayError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}'，实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ReplayError::SchemeMismatch);
    }
    let input = ReplayInput::open(url.path())?;
    Ok(input.with_fps(crate::query_param(url, "fps")))
  }
}

fn is_image(path: &Path) -> bool {
  matches!(
    path
      .extension()
      .and_then(|e| e.to_str())
      .map(|e| e.to_ascii_lowercase())
      .as_deref(),
    Some("png" | "jpg" | "jpeg")
  )
}

fn collect_images(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), std::io::Error> {
  for entry in std::fs::read_dir(dir)? {
    let path = entry?.path();
    if path.is_dir() {
      collect_images(&path, out)?;
    } else if is_image(&path) {
      out.push(path);
    }
  }
  Ok(())
}

impl ReplayInput {
  pub fn open(directory: impl AsRef<Path>) -> Result<Self, ReplayError> {
    let directory = directory.as_ref();
    if !directory.is_dir() {
      return Err(ReplayError::NotADirectory(directory.to_path_buf()));
    }
    let mut frames = Vec::new();
    collect_images(directory, &mut frames)?;
    frames.sort();
    debug!("回放目录 {} 共 {} 帧", directory.display(), frames.len());

    Ok(Self {
      total: frames.len(),
      frames: frames.into_iter(),
      fps: None,
    })
  }

  /// 回放帧率，`None` 或非正值表示不限速
  pub fn with_fps(mut self, fps: Option<f64>) -> Self {
    self.fps = fps.filter(|f| f.is_finite() && *f > 0.0);
    self
  }

  pub fn fps(&self) -> Option<f64> {
    self.fps
  }

  pub fn len(&self) -> usize {
    self.total
  }

  pub fn is_empty(&self) -> bool {
    self.total == 0
  }

  fn load(path: PathBuf) -> Result<ReplayFrame, ReplayError> {
    let image = ImageReader::open(&path)?.decode()?.to_rgb8();
    let record = path.with_extension("txt");
    let detections = if record.is_file() {
      let text = std::fs::read_to_string(&record)?;
      text
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
          parse_record(line).map_err(|reason| ReplayError::BadRecord {
            path: record.display().to_string(),
            line: n + 1,
            reason,
          })
        })
        .collect::<Result<Vec<_>, _>>()?
    } else {
      Vec::new()
    };

    Ok(ReplayFrame {
      path,
      image,
      detections,
    })
  }
}

impl Iterator for ReplayInput {
  type Item = Result<ReplayFrame, ReplayError>;

  fn next(&mut self) -> Option<Self::Item> {
    self.frames.next().map(ReplayInput::load)
  }
}

/// 解析一行检测记录：`label, confidence, x_min, y_min, x_max, y_max`
pub fn parse_record(line: &str) -> Result<Detection, String> {
  let fields: Vec<&str> = line.split(',').map(str::trim).collect();
  let [label, numbers @ ..] = fields.as_slice() else {
    return Err("空行".to_string());
  };
  if label.is_empty() {
    return Err("缺少标签".to_string());
  }
  if numbers.len() != 5 {
    return Err(format!("需要 6 个字段，实际 {} 个", fields.len()));
  }

  let mut values = [0f32; 5];
  for (value, text) in values.iter_mut().zip(numbers) {
    *value = text
      .parse()
      .map_err(|_| format!("无法解析数值: {}", text))?;
  }
  let [confidence, x_min, y_min, x_max, y_max] = values;
  Ok(Detection::new(
    *label,
    confidence,
    BoundingBox::from_corners([x_min, y_min, x_max, y_max]),
  ))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn record_lines_parse() {
    let detection = parse_record("person, 0.9100, 0.25, 0.5, 0.75, 1.0").unwrap();
    assert_eq!(detection.label, "person");
    assert_eq!(detection.confidence, 0.91);
    assert_eq!(detection.bbox, BoundingBox::new(0.25, 0.5, 0.5, 0.5));

    assert!(parse_record("person, 0.9").is_err());
    assert!(parse_record(", 0.9, 0, 0, 1, 1").is_err());
    assert!(parse_record("person, high, 0, 0, 1, 1").is_err());
  }

  #[test]
  fn frames_are_replayed_in_path_order() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("2026").join("03");
    std::fs::create_dir_all(&nested).unwrap();

    RgbImage::new(2, 2).save(dir.path().join("b.png")).unwrap();
    RgbImage::new(3, 3).save(dir.path().join("a.png")).unwrap();
    RgbImage::new(4, 4).save(nested.join("c.png")).unwrap();
    std::fs::write(dir.path().join("a.txt"), "person, 0.91, 0, 0, 1, 1\ncar, 0.5, 0, 0, 0.5, 0.5\n")
      .unwrap();
    std::fs::write(dir.path().join("notes.md"), "ignored").unwrap();

    let url = Url::parse(&format!("replay://{}?fps=30", dir.path().display())).unwrap();
    let input = ReplayInput::from_url(&url).unwrap();
    assert_eq!(input.len(), 3);
    assert_eq!(input.fps(), Some(30.0));

    let frames: Vec<_> = input.map(|f| f.unwrap()).collect();
    let sizes: Vec<_> = frames.iter().map(|f| f.image.width()).collect();
    // "2026/03/c.png" 排在 "a.png" 之前
    assert_eq!(sizes, vec![4, 3, 2]);
    assert_eq!(frames[1].detections.len(), 2);
    assert!(frames[0].detections.is_empty());
    assert_eq!(frames[1].view().width, 3);
  }

  #[test]
  fn bad_record_is_reported_with_line() {
    let dir = tempfile::tempdir().unwrap();
    RgbImage::new(2, 2).save(dir.path().join("a.png")).unwrap();
    std::fs::write(dir.path().join("a.txt"), "person, 0.9, 0, 0, 1, 1\nbroken\n").unwrap();

    let mut input = ReplayInput::open(dir.path()).unwrap();
    let err = input.next().unwrap().unwrap_err();
    assert!(matches!(err, ReplayError::BadRecord { line: 2, .. }));
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
  }

  #[test]
  fn missing_directory_is_a_configuration_error() {
    let err = ReplayInput::open("/nonexistent/recording").err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Configuration);
  }
}
