// 该文件是 Shanan （山南西风） 项目的一部分。
// src/event.rs - 检测与检测事件
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

use std::sync::Arc;

use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::Serialize;

/// 归一化边界框，坐标相对于帧宽高，取值 [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct BoundingBox {
  pub x: f32,
  pub y: f32,
  pub width: f32,
  pub height: f32,
}

impl BoundingBox {
  pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
    Self {
      x,
      y,
      width,
      height,
    }
  }

  /// 由 `[x_min, y_min, x_max, y_max]` 构造
  pub fn from_corners(corners: [f32; 4]) -> Self {
    let [x_min, y_min, x_max, y_max] = corners;
    Self::new(x_min, y_min, x_max - x_min, y_max - y_min)
  }

  pub fn corners(&self) -> [f32; 4] {
    [self.x, self.y, self.x + self.width, self.y + self.height]
  }

  pub fn is_finite(&self) -> bool {
    [self.x, self.y, self.width, self.height]
      .iter()
      .all(|v| v.is_finite())
  }

  /// 换算为图像内的像素矩形 `(x, y, w, h)`，面积为 0 时返回 `None`
  pub fn to_pixel_rect(&self, image_width: u32, image_height: u32) -> Option<(u32, u32, u32, u32)> {
    if !self.is_finite() || image_width == 0 || image_height == 0 {
      return None;
    }
    let (w, h) = (image_width as f32, image_height as f32);
    let [x_min, y_min, x_max, y_max] = self.corners();

    let x_min = (x_min * w).floor().clamp(0.0, w) as u32;
    let y_min = (y_min * h).floor().clamp(0.0, h) as u32;
    let x_max = (x_max * w).ceil().clamp(0.0, w) as u32;
    let y_max = (y_max * h).ceil().clamp(0.0, h) as u32;

    if x_min >= x_max || y_min >= y_max {
      return None;
    }
    Some((x_min, y_min, x_max - x_min, y_max - y_min))
  }
}

/// 上游检测模型给出的一条检测结果
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  pub label: String,
  pub confidence: f32,
  pub bbox: BoundingBox,
}

impl Detection {
  pub fn new(label: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
    Self {
      label: label.into(),
      confidence,
      bbox,
    }
  }
}

/// 事件标识：帧序号加帧内序号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EventId {
  pub frame_id: u64,
  pub seq: u16,
}

impl std::fmt::Display for EventId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}#{}", self.frame_id, self.seq)
  }
}

/// 一条满足条件的检测，连同帧快照一起排队等待处理
///
/// 事件创建后不可修改，也不可克隆：出队后只归一个工作线程所有。
/// 同一帧的多个事件共享同一份快照。
#[derive(Debug)]
pub struct DetectionEvent {
  id: EventId,
  label: String,
  confidence: f32,
  bbox: BoundingBox,
  frame: Arc<RgbImage>,
  captured_at: DateTime<Utc>,
}

impl DetectionEvent {
  pub fn new(
    id: EventId,
    detection: &Detection,
    frame: Arc<RgbImage>,
    captured_at: DateTime<Utc>,
  ) -> Self {
    Self {
      id,
      label: detection.label.clone(),
      confidence: detection.confidence,
      bbox: detection.bbox,
      frame,
      captured_at,
    }
  }

  pub fn id(&self) -> EventId {
    self.id
  }

  pub fn frame_id(&self) -> u64 {
    self.id.frame_id
  }

  pub fn label(&self) -> &str {
    &self.label
  }

  pub fn confidence(&self) -> f32 {
    self.confidence
  }

  pub fn bbox(&self) -> BoundingBox {
    self.bbox
  }

  pub fn frame(&self) -> &RgbImage {
    &self.frame
  }

  pub fn captured_at(&self) -> DateTime<Utc> {
    self.captured_at
  }

  /// 检测框区域的裁剪，框退化时返回 `None`
  pub fn crop(&self) -> Option<RgbImage> {
    let (x, y, w, h) = self.bbox.to_pixel_rect(self.frame.width(), self.frame.height())?;
    Some(image::imageops::crop_imm(&*self.frame, x, y, w, h).to_image())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn corners_round_trip() {
    let bbox = BoundingBox::from_corners([0.25, 0.5, 0.75, 1.0]);
    assert_eq!(bbox, BoundingBox::new(0.25, 0.5, 0.5, 0.5));
    assert_eq!(bbox.corners(), [0.25, 0.5, 0.75, 1.0]);
  }

  #[test]
  fn pixel_rect_is_clamped() {
    let bbox = BoundingBox::new(-0.5, 0.5, 1.0, 1.0);
    assert_eq!(bbox.to_pixel_rect(100, 50), Some((0, 25, 50, 25)));
  }

  #[test]
  fn degenerate_box_has_no_rect() {
    assert_eq!(BoundingBox::new(0.5, 0.5, 0.0, 0.2).to_pixel_rect(10, 10), None);
    assert_eq!(
      BoundingBox::new(f32::NAN, 0.0, 1.0, 1.0).to_pixel_rect(10, 10),
      None
    );
  }

  #[test]
  fn event_crop_uses_bbox() {
    let mut image = RgbImage::new(8, 8);
    image.put_pixel(4, 4, image::Rgb([255, 0, 0]));
    let detection = Detection::new("person", 0.9, BoundingBox::new(0.5, 0.5, 0.25, 0.25));
    let event = DetectionEvent::new(
      EventId {
        frame_id: 1,
        seq: 0,
      },
      &detection,
      Arc::new(image),
      Utc::now(),
    );

    let crop = event.crop().unwrap();
    assert_eq!(crop.dimensions(), (2, 2));
    assert_eq!(crop.get_pixel(0, 0).0, [255, 0, 0]);
    assert_eq!(event.id().to_string(), "1#0");
  }
}
