// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 检测结果叠加绘制 (draw-overlay)
//
// 在原始帧上原地绘制检测框, 配置了 overlay-font 时同时绘制 "label: score" 文本.
// 支持 RGB / BGR / RGBA / BGRA, 颜色按帧的通道顺序写入.

use std::fs;
use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use image::{ImageBuffer, Pixel, Rgb, Rgba};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use tracing::{debug, info};

use crate::detection::{Detection, Frame, PixelFormat};
use crate::error::{DetectorError, Result};

const LABEL_FONT_SIZE: f32 = 18.0;
const LABEL_PADDING: i32 = 2;

// 调色板 (按类别号循环取色)
const BRIGHT_COLORS: [[u8; 3]; 12] = [
    [255, 0, 0],     // 红色
    [0, 255, 0],     // 绿色
    [0, 0, 255],     // 蓝色
    [255, 255, 0],   // 黄色
    [255, 0, 255],   // 品红
    [0, 255, 255],   // 青色
    [255, 128, 0],   // 橙色
    [255, 0, 128],   // 粉红
    [128, 255, 0],   // 黄绿
    [0, 128, 255],   // 天蓝
    [255, 255, 255], // 白色
    [128, 0, 255],   // 紫色
];

/// 类别颜色 (RGB)
pub fn class_color(class_id: usize) -> [u8; 3] {
    BRIGHT_COLORS[class_id % BRIGHT_COLORS.len()]
}

/// 线宽随帧尺寸缩放
pub fn line_thickness(width: u32, height: u32) -> u32 {
    ((0.6 * (width + height) as f32 / 600.0).round() as u32).max(1)
}

/// 叠加绘制器
pub struct Overlay {
    font: Option<FontVec>,
}

impl std::fmt::Debug for Overlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Overlay")
            .field("font", &self.font.is_some())
            .finish()
    }
}

impl Overlay {
    /// 只绘制检测框
    pub fn boxes_only() -> Self {
        Self { font: None }
    }

    /// 加载字体, 失败时返回 `Config` 错误
    pub fn load(font_path: Option<&Path>) -> Result<Self> {
        let Some(path) = font_path else {
            return Ok(Self::boxes_only());
        };
        let bytes = fs::read(path).map_err(|e| {
            DetectorError::config("overlay-font", format!("{}: {e}", path.display()))
        })?;
        let font = FontVec::try_from_vec(bytes).map_err(|e| {
            DetectorError::config("overlay-font", format!("{}: {e}", path.display()))
        })?;
        info!("叠加字体已加载: {}", path.display());
        Ok(Self { font: Some(font) })
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// 在帧上原地绘制检测结果
    pub fn draw(&self, frame: &mut Frame, detections: &[Detection]) {
        if detections.is_empty() {
            return;
        }
        let (w, h) = (frame.width(), frame.height());
        let format = frame.format();
        let swap = matches!(format, PixelFormat::Bgr | PixelFormat::Bgra);
        let color_of = |class_id: usize| {
            let [r, g, b] = class_color(class_id);
            if swap {
                [b, g, r]
            } else {
                [r, g, b]
            }
        };

        let packed = pack_rows(frame);
        let packed = match format {
            PixelFormat::Rgb | PixelFormat::Bgr => {
                let Some(mut img) = ImageBuffer::<Rgb<u8>, _>::from_raw(w, h, packed) else {
                    return;
                };
                self.draw_on(&mut img, detections, |id| Rgb(color_of(id)), Rgb([0, 0, 0]));
                img.into_raw()
            }
            PixelFormat::Rgba | PixelFormat::Bgra => {
                let Some(mut img) = ImageBuffer::<Rgba<u8>, _>::from_raw(w, h, packed) else {
                    return;
                };
                let rgba = |c: [u8; 3]| Rgba([c[0], c[1], c[2], 255]);
                self.draw_on(
                    &mut img,
                    detections,
                    |id| rgba(color_of(id)),
                    Rgba([0, 0, 0, 255]),
                );
                img.into_raw()
            }
        };
        unpack_rows(frame, &packed);
        debug!("已绘制 {} 个检测框", detections.len());
    }

    fn draw_on<P>(
        &self,
        img: &mut ImageBuffer<P, Vec<u8>>,
        detections: &[Detection],
        color_of: impl Fn(usize) -> P,
        text_color: P,
    ) where
        P: Pixel<Subpixel = u8>,
    {
        let (w, h) = img.dimensions();
        let thickness = line_thickness(w, h);
        let scale = PxScale::from(LABEL_FONT_SIZE);

        for det in detections {
            let color = color_of(det.class_id);
            let x0 = det.bbox.xmin().floor().max(0.0) as i32;
            let y0 = det.bbox.ymin().floor().max(0.0) as i32;
            let x1 = (det.bbox.xmax().ceil() as i32).min(w as i32 - 1);
            let y1 = (det.bbox.ymax().ceil() as i32).min(h as i32 - 1);
            if x1 <= x0 || y1 <= y0 {
                continue;
            }

            for t in 0..thickness as i32 {
                let (bw, bh) = (x1 - x0 - 2 * t, y1 - y0 - 2 * t);
                if bw <= 0 || bh <= 0 {
                    break;
                }
                let rect = Rect::at(x0 + t, y0 + t).of_size(bw as u32 + 1, bh as u32 + 1);
                draw_hollow_rect_mut(img, rect, color);
            }

            let Some(font) = &self.font else {
                continue;
            };
            let text = format!("{}: {:.2}", det.label, det.confidence);
            let (tw, th) = text_size(scale, font, &text);
            if tw == 0 || th == 0 {
                continue;
            }
            let bg_h = th as i32 + 2 * LABEL_PADDING;
            // 标签放在框上方, 放不下时放在框内顶部
            let label_y = if y0 >= bg_h { y0 - bg_h } else { y0 };
            let bg = Rect::at(x0, label_y).of_size(tw + 2 * LABEL_PADDING as u32, bg_h as u32);
            draw_filled_rect_mut(img, bg, color);
            draw_text_mut(
                img,
                text_color,
                x0 + LABEL_PADDING,
                label_y + LABEL_PADDING,
                scale,
                font,
                &text,
            );
        }
    }
}

fn pack_rows(frame: &Frame) -> Vec<u8> {
    let row_bytes = frame.info().row_bytes();
    let mut packed = Vec::with_capacity(row_bytes * frame.height() as usize);
    for y in 0..frame.height() as usize {
        packed.extend_from_slice(frame.row(y));
    }
    packed
}

fn unpack_rows(frame: &mut Frame, packed: &[u8]) {
    let row_bytes = frame.info().row_bytes();
    let stride = frame.stride();
    let data = frame.data_mut();
    for (y, row) in packed.chunks_exact(row_bytes).enumerate() {
        let start = y * stride;
        data[start..start + row_bytes].copy_from_slice(row);
    }
}
