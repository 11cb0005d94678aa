// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/vigil_search.rs - 以图搜索已写入的检测记录
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

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use image::ImageReader;
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

use shanan_vigil::{
  FromUrl,
  event::BoundingBox,
  model::{FeatureExtractor, ModelExtractor},
  output::{StoreWrapper, VectorStore, schema_for},
};

/// Vigil 以图搜索参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 查询图像
  #[arg(value_name = "IMAGE")]
  pub image: PathBuf,
  /// 嵌入模型，须与写入时一致
  #[arg(long, value_name = "MODEL", env = "VIGIL_MODEL", default_value = "histogram://?bins=8")]
  pub model: Url,
  #[arg(long, value_name = "STORE", env = "VIGIL_STORE")]
  pub store: Url,
  /// 只用该区域做查询：`x_min,y_min,x_max,y_max`（归一化坐标）
  #[arg(long, value_parser = parse_corners)]
  pub crop: Option<BoundingBox>,
  #[arg(long, short = 'k', default_value_t = 5)]
  pub limit: usize,
}

fn parse_corners(s: &str) -> Result<BoundingBox, String> {
  let values = s
    .split(',')
    .map(|v| v.trim().parse::<f32>().map_err(|_| format!("无法解析数值: {}", v)))
    .collect::<Result<Vec<_>, _>>()?;
  let corners: [f32; 4] = values
    .try_into()
    .map_err(|_| "需要 4 个数值".to_string())?;
  Ok(BoundingBox::from_corners(corners))
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(std::io::stderr)
    .init();

  let args = Args::parse();

  let mut image = ImageReader::open(&args.image)
    .with_context(|| format!("无法打开 {}", args.image.display()))?
    .decode()?
    .to_rgb8();
  if let Some(bbox) = args.crop {
    let (x, y, w, h) = bbox
      .to_pixel_rect(image.width(), image.height())
      .ok_or_else(|| anyhow!("裁剪区域为空: {:?}", bbox))?;
    image = image::imageops::crop_imm(&image, x, y, w, h).to_image();
  }

  let extractor = ModelExtractor::from_url(&args.model)?;
  let store = StoreWrapper::from_url(&args.store)?;
  let schema = schema_for(&store, extractor.dimension())?;
  store.ensure_collection(&schema)?;

  let vector = extractor.extract(&image)?;
  let hits = store.search(&vector, args.limit)?;
  info!("{} 中找到 {} 条相近记录", schema.name, hits.len());

  println!("{}", serde_json::to_string_pretty(&hits)?);
  Ok(())
}
