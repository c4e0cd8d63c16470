//! Pixel format conversion into the encoder's planar YUV 4:2:0 layout.
//!
//! Capture hardware in this class almost always hands out packed 4:2:2
//! (YUYV/UYVY) or semi-planar NV12; libx264 wants planar I420. The
//! converters here are scalar and operate row-by-row so they tolerate
//! driver strides wider than the visible width.

use crate::error::{AppError, Result};
use crate::video::format::{PixelFormat, Resolution};

/// Destination planes for one I420 frame.
///
/// Callers hand in the encoder frame's plane buffers; tests hand in plain
/// vectors.
pub struct Yuv420Planes<'a> {
    pub y: &'a mut [u8],
    pub u: &'a mut [u8],
    pub v: &'a mut [u8],
    /// Row stride of the luma plane; chroma stride is half of it.
    pub y_stride: usize,
}

/// Convert one captured frame into `dst`.
///
/// `stride` is the source luma/packed row stride in bytes as negotiated
/// with the driver. Frames shorter than the negotiated geometry are
/// rejected rather than read out of bounds.
pub fn convert_frame(
    format: PixelFormat,
    resolution: Resolution,
    stride: usize,
    planes: &[&[u8]],
    dst: &mut Yuv420Planes<'_>,
) -> Result<()> {
    let src = planes
        .first()
        .copied()
        .ok_or_else(|| AppError::VideoError("captured frame has no planes".to_string()))?;

    match format {
        PixelFormat::Yuyv => packed_422_to_i420(src, resolution, stride, dst, 0, 1, 3),
        PixelFormat::Uyvy => packed_422_to_i420(src, resolution, stride, dst, 1, 0, 2),
        PixelFormat::Nv12 => nv12_to_i420(planes, resolution, stride, dst),
        PixelFormat::Yuv420 => i420_copy(planes, resolution, stride, dst),
    }
}

/// Packed 4:2:2 to planar 4:2:0. `y_off`/`u_off`/`v_off` locate the samples
/// within each 4-byte macropixel. Chroma rows are averaged in pairs.
fn packed_422_to_i420(
    src: &[u8],
    resolution: Resolution,
    stride: usize,
    dst: &mut Yuv420Planes<'_>,
    y_off: usize,
    u_off: usize,
    v_off: usize,
) -> Result<()> {
    let width = resolution.width as usize;
    let height = resolution.height as usize;
    let row_bytes = width * 2;
    let stride = if stride >= row_bytes { stride } else { row_bytes };

    let needed = stride * (height - 1) + row_bytes;
    if src.len() < needed {
        return Err(AppError::VideoError(format!(
            "short frame: {} bytes, need {}",
            src.len(),
            needed
        )));
    }

    let c_stride = dst.y_stride / 2;
    for row in 0..height {
        let src_row = &src[row * stride..row * stride + row_bytes];
        let dst_y = &mut dst.y[row * dst.y_stride..row * dst.y_stride + width];
        for col in 0..width / 2 {
            let px = &src_row[col * 4..col * 4 + 4];
            dst_y[col * 2] = px[y_off];
            dst_y[col * 2 + 1] = px[y_off + 2];
        }
        // 4:2:2 carries chroma on every row; fold row pairs to 4:2:0.
        if row % 2 == 1 {
            let prev_row = &src[(row - 1) * stride..(row - 1) * stride + row_bytes];
            let c_row = row / 2;
            let dst_u = &mut dst.u[c_row * c_stride..c_row * c_stride + width / 2];
            let dst_v = &mut dst.v[c_row * c_stride..c_row * c_stride + width / 2];
            for col in 0..width / 2 {
                let a = &prev_row[col * 4..col * 4 + 4];
                let b = &src_row[col * 4..col * 4 + 4];
                dst_u[col] = ((a[u_off] as u16 + b[u_off] as u16) / 2) as u8;
                dst_v[col] = ((a[v_off] as u16 + b[v_off] as u16) / 2) as u8;
            }
        }
    }
    Ok(())
}

fn nv12_to_i420(
    planes: &[&[u8]],
    resolution: Resolution,
    stride: usize,
    dst: &mut Yuv420Planes<'_>,
) -> Result<()> {
    let width = resolution.width as usize;
    let height = resolution.height as usize;
    let stride = stride.max(width);

    // Single-plane NV12 packs luma and interleaved chroma contiguously;
    // multi-plane drivers split them.
    let (y_src, uv_src) = match planes {
        [single] => {
            let split = stride * height;
            if single.len() < split {
                return Err(AppError::VideoError("short NV12 frame".to_string()));
            }
            single.split_at(split)
        }
        [y, uv, ..] => (*y, *uv),
        _ => return Err(AppError::VideoError("captured frame has no planes".to_string())),
    };

    let uv_needed = stride * (height / 2);
    if y_src.len() < stride * (height - 1) + width || uv_src.len() < uv_needed {
        return Err(AppError::VideoError("short NV12 frame".to_string()));
    }

    for row in 0..height {
        dst.y[row * dst.y_stride..row * dst.y_stride + width]
            .copy_from_slice(&y_src[row * stride..row * stride + width]);
    }

    let c_stride = dst.y_stride / 2;
    for row in 0..height / 2 {
        let src_row = &uv_src[row * stride..row * stride + width];
        let dst_u = &mut dst.u[row * c_stride..row * c_stride + width / 2];
        let dst_v = &mut dst.v[row * c_stride..row * c_stride + width / 2];
        for col in 0..width / 2 {
            dst_u[col] = src_row[col * 2];
            dst_v[col] = src_row[col * 2 + 1];
        }
    }
    Ok(())
}

fn i420_copy(
    planes: &[&[u8]],
    resolution: Resolution,
    stride: usize,
    dst: &mut Yuv420Planes<'_>,
) -> Result<()> {
    let width = resolution.width as usize;
    let height = resolution.height as usize;
    let stride = stride.max(width);
    let src_c_stride = stride / 2;

    let (y_src, u_src, v_src) = match planes {
        [single] => {
            let y_len = stride * height;
            let c_len = src_c_stride * (height / 2);
            if single.len() < y_len + 2 * c_len {
                return Err(AppError::VideoError("short I420 frame".to_string()));
            }
            let (y, rest) = single.split_at(y_len);
            let (u, v) = rest.split_at(c_len);
            (y, u, v)
        }
        [y, u, v, ..] => (*y, *u, *v),
        _ => return Err(AppError::VideoError("captured frame has no planes".to_string())),
    };

    for row in 0..height {
        dst.y[row * dst.y_stride..row * dst.y_stride + width]
            .copy_from_slice(&y_src[row * stride..row * stride + width]);
    }
    let c_stride = dst.y_stride / 2;
    for row in 0..height / 2 {
        dst.u[row * c_stride..row * c_stride + width / 2]
            .copy_from_slice(&u_src[row * src_c_stride..row * src_c_stride + width / 2]);
        dst.v[row * c_stride..row * c_stride + width / 2]
            .copy_from_slice(&v_src[row * src_c_stride..row * src_c_stride + width / 2]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planes_for(res: Resolution) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        let w = res.width as usize;
        let h = res.height as usize;
        (vec![0u8; w * h], vec![0u8; w * h / 4], vec![0u8; w * h / 4])
    }

    #[test]
    fn yuyv_converts_luma_and_averages_chroma() {
        let res = Resolution::new(4, 2);
        // Two rows of YUYV: Y=10..17, U=100/110 per row, V=200/210.
        let src = vec![
            10, 100, 11, 200, 12, 100, 13, 200, // row 0
            14, 110, 15, 210, 16, 110, 17, 210, // row 1
        ];
        let (mut y, mut u, mut v) = planes_for(res);
        let mut dst = Yuv420Planes {
            y: &mut y,
            u: &mut u,
            v: &mut v,
            y_stride: 4,
        };
        convert_frame(PixelFormat::Yuyv, res, 8, &[&src], &mut dst).unwrap();

        assert_eq!(y, vec![10, 11, 12, 13, 14, 15, 16, 17]);
        assert_eq!(u, vec![105, 105]);
        assert_eq!(v, vec![205, 205]);
    }

    #[test]
    fn uyvy_sample_order_differs_from_yuyv() {
        let res = Resolution::new(2, 2);
        let src = vec![
            100, 10, 200, 11, // row 0: U Y0 V Y1
            100, 12, 200, 13, // row 1
        ];
        let (mut y, mut u, mut v) = planes_for(res);
        let mut dst = Yuv420Planes {
            y: &mut y,
            u: &mut u,
            v: &mut v,
            y_stride: 2,
        };
        convert_frame(PixelFormat::Uyvy, res, 4, &[&src], &mut dst).unwrap();

        assert_eq!(y, vec![10, 11, 12, 13]);
        assert_eq!(u, vec![100]);
        assert_eq!(v, vec![200]);
    }

    #[test]
    fn yuyv_respects_source_stride_padding() {
        let res = Resolution::new(2, 2);
        // stride 8 with 4 visible bytes per row; padding must be skipped.
        let src = vec![
            10, 100, 11, 200, 0xEE, 0xEE, 0xEE, 0xEE, // row 0 + pad
            12, 100, 13, 200, 0xEE, 0xEE, 0xEE, 0xEE, // row 1 + pad
        ];
        let (mut y, mut u, mut v) = planes_for(res);
        let mut dst = Yuv420Planes {
            y: &mut y,
            u: &mut u,
            v: &mut v,
            y_stride: 2,
        };
        convert_frame(PixelFormat::Yuyv, res, 8, &[&src], &mut dst).unwrap();
        assert_eq!(y, vec![10, 11, 12, 13]);
    }

    #[test]
    fn short_frame_is_rejected() {
        let res = Resolution::new(4, 2);
        let src = vec![0u8; 4]; // far too small
        let (mut y, mut u, mut v) = planes_for(res);
        let mut dst = Yuv420Planes {
            y: &mut y,
            u: &mut u,
            v: &mut v,
            y_stride: 4,
        };
        assert!(convert_frame(PixelFormat::Yuyv, res, 8, &[&src], &mut dst).is_err());
    }

    #[test]
    fn nv12_deinterleaves_chroma() {
        let res = Resolution::new(2, 2);
        // 2x2 luma followed by one interleaved UV row.
        let src = vec![1, 2, 3, 4, 100, 200];
        let (mut y, mut u, mut v) = planes_for(res);
        let mut dst = Yuv420Planes {
            y: &mut y,
            u: &mut u,
            v: &mut v,
            y_stride: 2,
        };
        convert_frame(PixelFormat::Nv12, res, 2, &[&src], &mut dst).unwrap();
        assert_eq!(y, vec![1, 2, 3, 4]);
        assert_eq!(u, vec![100]);
        assert_eq!(v, vec![200]);
    }

    #[test]
    fn i420_passthrough_copies_planes() {
        let res = Resolution::new(2, 2);
        let src = vec![1, 2, 3, 4, 100, 200];
        let (mut y, mut u, mut v) = planes_for(res);
        let mut dst = Yuv420Planes {
            y: &mut y,
            u: &mut u,
            v: &mut v,
            y_stride: 2,
        };
        convert_frame(PixelFormat::Yuv420, res, 2, &[&src], &mut dst).unwrap();
        assert_eq!(y, vec![1, 2, 3, 4]);
        assert_eq!(u, vec![100]);
        assert_eq!(v, vec![200]);
    }
}
