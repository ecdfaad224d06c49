// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// 预处理: 视频帧 → 模型输入张量
//
// 1. 按模型通道顺序重排像素 (丢弃 alpha)
// 2. 等比缩放 (fast_image_resize, 双线性) 并以灰色 (128) 居中填充
// 3. 归一化并写入 NHWC / NCHW 张量

use fast_image_resize as fr;
use ndarray::{s, Array, ArrayView3, Zip};

use crate::detection::{Bbox, Frame};
use crate::error::{DetectorError, Result};
use crate::models::{ChannelOrder, InputShape, TensorLayout, Tensor};

/// letterbox 填充灰度值
pub const LETTERBOX_FILL: u8 = 128;

/// 帧坐标与张量坐标之间的映射
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale_x: f32,
    pub scale_y: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub resized_width: u32,
    pub resized_height: u32,
    pub frame_width: u32,
    pub frame_height: u32,
}

impl Letterbox {
    /// 等比缩放 `frame` 尺寸以放入 `input` 尺寸, 剩余部分两侧均分填充
    pub fn new(frame_width: u32, frame_height: u32, input_width: u32, input_height: u32) -> Self {
        let r = (input_width as f32 / frame_width as f32)
            .min(input_height as f32 / frame_height as f32);
        let resized_width = ((frame_width as f32 * r).round() as u32).clamp(1, input_width);
        let resized_height = ((frame_height as f32 * r).round() as u32).clamp(1, input_height);
        let pad_x = (input_width - resized_width) / 2;
        let pad_y = (input_height - resized_height) / 2;

        Self {
            scale_x: resized_width as f32 / frame_width as f32,
            scale_y: resized_height as f32 / frame_height as f32,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
            resized_width,
            resized_height,
            frame_width,
            frame_height,
        }
    }

    /// 张量坐标 → 帧坐标, 并裁剪到帧范围内
    pub fn to_frame(&self, bbox: &Bbox) -> Bbox {
        let (fw, fh) = (self.frame_width as f32, self.frame_height as f32);
        let x1 = ((bbox.xmin() - self.pad_x) / self.scale_x).clamp(0.0, fw);
        let y1 = ((bbox.ymin() - self.pad_y) / self.scale_y).clamp(0.0, fh);
        let x2 = ((bbox.xmax() - self.pad_x) / self.scale_x).clamp(0.0, fw);
        let y2 = ((bbox.ymax() - self.pad_y) / self.scale_y).clamp(0.0, fh);
        Bbox::from_xyxy(x1, y1, x2, y2)
    }
}

/// 按模型通道顺序提取紧密排列的 3 通道像素
fn pack_pixels(frame: &Frame, order: ChannelOrder) -> Vec<u8> {
    let bpp = frame.format().bytes_per_pixel();
    let [r, g, b] = frame.format().rgb_offsets();
    let offsets = match order {
        ChannelOrder::Rgb => [r, g, b],
        ChannelOrder::Bgr => [b, g, r],
    };

    let (w, h) = (frame.width() as usize, frame.height() as usize);
    let mut packed = Vec::with_capacity(w * h * 3);
    for y in 0..h {
        for px in frame.row(y).chunks_exact(bpp) {
            packed.extend(offsets.iter().map(|&o| px[o]));
        }
    }
    packed
}

fn resize(
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    dst_width: u32,
    dst_height: u32,
) -> Result<Vec<u8>> {
    if (width, height) == (dst_width, dst_height) {
        return Ok(pixels);
    }
    let src = fr::images::ImageRef::new(width, height, &pixels, fr::PixelType::U8x3)
        .map_err(|e| DetectorError::InvalidFrame(e.to_string()))?;
    let mut dst = fr::images::Image::new(dst_width, dst_height, fr::PixelType::U8x3);
    let mut resizer = fr::Resizer::new();
    resizer
        .resize(
            &src,
            &mut dst,
            &fr::ResizeOptions::new()
                .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear)),
        )
        .map_err(|e| DetectorError::InvalidFrame(e.to_string()))?;
    Ok(dst.buffer().to_vec())
}

/// 视频帧 → (模型输入张量, letterbox 映射)
///
/// 纯函数: 相同的帧和几何总是得到逐元素相同的张量
pub fn prepare(frame: &Frame, input: &InputShape) -> Result<(Tensor, Letterbox)> {
    if frame.width() == 0 || frame.height() == 0 {
        return Err(DetectorError::InvalidFrame(format!(
            "empty frame {}x{}",
            frame.width(),
            frame.height()
        )));
    }

    let letterbox = Letterbox::new(frame.width(), frame.height(), input.width, input.height);
    let (nw, nh) = (letterbox.resized_width, letterbox.resized_height);
    let pixels = resize(
        pack_pixels(frame, input.order),
        frame.width(),
        frame.height(),
        nw,
        nh,
    )?;

    let src = ArrayView3::from_shape((nh as usize, nw as usize, InputShape::CHANNELS), &pixels)
        .map_err(|e| DetectorError::InvalidFrame(e.to_string()))?;

    let fill = input.range.normalize(LETTERBOX_FILL);
    let mut tensor = Array::from_elem(input.dims(), fill);

    let (px, py) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
    let (xs, ys) = (px..px + nw as usize, py..py + nh as usize);
    let range = input.range;
    match input.layout {
        TensorLayout::Nhwc => {
            let dst = tensor.slice_mut(s![0, ys, xs, ..]);
            Zip::from(dst)
                .and(&src)
                .for_each(|d, &v| *d = range.normalize(v));
        }
        TensorLayout::Nchw => {
            let dst = tensor.slice_mut(s![0, .., ys, xs]);
            Zip::from(dst)
                .and(src.permuted_axes([2, 0, 1]))
                .for_each(|d, &v| *d = range.normalize(v));
        }
    }

    Ok((tensor.into_dyn(), letterbox))
}
