// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/draw.rs - 快照上的检测框绘制
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

use image::{Rgb, RgbImage};
use imageproc::{drawing::draw_hollow_rect_mut, rect::Rect};

use crate::event::BoundingBox;

const BOX_COLOR: [u8; 3] = [0, 255, 0]; // 绿色
const BOX_THICKNESS: u32 = 2;

pub struct Draw {
  color: Rgb<u8>,
  thickness: u32,
}

impl Default for Draw {
  fn default() -> Self {
    Self {
      color: Rgb(BOX_COLOR),
      thickness: BOX_THICKNESS,
    }
  }
}

impl Draw {
  pub fn with_color(mut self, color: [u8; 3]) -> Self {
    self.color = Rgb(color);
    self
  }

  /// 在图像上绘制检测框，框越界时裁剪到图像范围
  pub fn draw_boxes<'b>(&self, image: &mut RgbImage, boxes: impl IntoIterator<Item = &'b BoundingBox>) {
    let (width, height) = image.dimensions();
    for bbox in boxes {
      let Some((x, y, w, h)) = bbox.to_pixel_rect(width, height) else {
        continue;
      };

      // 逐层向内收缩以加粗边框
      for t in 0..self.thickness {
        let (w_t, h_t) = (w.saturating_sub(2 * t), h.saturating_sub(2 * t));
        if w_t == 0 || h_t == 0 {
          break;
        }
        let rect = Rect::at((x + t) as i32, (y + t) as i32).of_size(w_t, h_t);
        draw_hollow_rect_mut(image, rect, self.color);
      }
    }
  }
}
