//! Aspect-preserving I420 resize with letterbox/pillarbox padding.
//!
//! Pure functions only; every call allocates its own output so frames can be
//! scaled on whichever producer thread received them.

use crate::error::ScaleError;

/// Aspect ratios closer than this are treated as equal and stretched.
const ASPECT_EPSILON: f64 = 1e-6;

/// Padding colour. "Dark" black: Y=0 rather than the video-range 16.
const BLACK_Y: u8 = 0;
const BLACK_UV: u8 = 128;

/// Number of bytes in an I420 frame of the given size.
pub fn i420_size(width: u32, height: u32) -> usize {
    let (w, h) = (width as usize, height as usize);
    w * h + 2 * ((w / 2) * (h / 2))
}

/// Scales `frame` from `src` to exactly `dst`, padding with black when the
/// aspect ratios differ. Output length is always `dst.0 * dst.1 * 3 / 2`.
pub fn scale_i420(frame: &[u8], src: (u32, u32), dst: (u32, u32)) -> Result<Vec<u8>, ScaleError> {
    check_geometry(src)?;
    check_geometry(dst)?;
    let need = i420_size(src.0, src.1);
    if frame.len() < need {
        return Err(ScaleError::ShortBuffer {
            len: frame.len(),
            need,
        });
    }

    let (sw, sh) = (src.0 as usize, src.1 as usize);
    let (dw, dh) = (dst.0 as usize, dst.1 as usize);
    let planes = split_planes(&frame[..need], sw, sh);

    let input_aspect = sw as f64 / sh as f64;
    let output_aspect = dw as f64 / dh as f64;

    if (input_aspect - output_aspect).abs() < ASPECT_EPSILON {
        if src == dst {
            return Ok(frame[..need].to_vec());
        }
        let mut out = Vec::with_capacity(i420_size(dst.0, dst.1));
        for (i, plane) in planes.iter().enumerate() {
            let (w, h) = if i == 0 { (dw, dh) } else { (dw / 2, dh / 2) };
            out.extend_from_slice(&resize_bilinear(plane, w, h));
        }
        return Ok(out);
    }

    let (fit_w, fit_h) = if input_aspect > output_aspect {
        (dw, ((dw as f64 / input_aspect).round() as usize).min(dh))
    } else {
        (((dh as f64 * input_aspect).round() as usize).min(dw), dh)
    };
    if fit_w == 0 || fit_h == 0 {
        return Err(ScaleError::Degenerate {
            width: fit_w as u32,
            height: fit_h as u32,
        });
    }

    let offset_y = (dh - fit_h) / 2;
    let offset_x = (dw - fit_w) / 2;

    let mut out = vec![BLACK_Y; dw * dh];
    out.resize(i420_size(dst.0, dst.1), BLACK_UV);

    let (luma, chroma) = out.split_at_mut(dw * dh);
    let (u_canvas, v_canvas) = chroma.split_at_mut((dw / 2) * (dh / 2));

    let scaled_y = resize_bilinear(&planes[0], fit_w, fit_h);
    blit(&scaled_y, fit_w, luma, dw, offset_x, offset_y);

    let (cw, ch) = (fit_w / 2, fit_h / 2);
    let scaled_u = resize_bilinear(&planes[1], cw, ch);
    let scaled_v = resize_bilinear(&planes[2], cw, ch);
    blit(&scaled_u, cw, u_canvas, dw / 2, offset_x / 2, offset_y / 2);
    blit(&scaled_v, cw, v_canvas, dw / 2, offset_x / 2, offset_y / 2);

    Ok(out)
}

fn check_geometry((width, height): (u32, u32)) -> Result<(), ScaleError> {
    if width == 0 || height == 0 {
        return Err(ScaleError::ZeroDimensions { width, height });
    }
    if width % 2 != 0 || height % 2 != 0 {
        return Err(ScaleError::OddDimensions { width, height });
    }
    Ok(())
}

struct Plane<'a> {
    data: &'a [u8],
    width: usize,
    height: usize,
}

fn split_planes(frame: &[u8], width: usize, height: usize) -> [Plane<'_>; 3] {
    let luma = width * height;
    let chroma = (width / 2) * (height / 2);
    let (y, rest) = frame.split_at(luma);
    let (u, v) = rest.split_at(chroma);
    let half = |data| Plane {
        data,
        width: width / 2,
        height: height / 2,
    };
    [
        Plane {
            data: y,
            width,
            height,
        },
        half(u),
        half(&v[..chroma]),
    ]
}

/// Bilinear resize with pixel-centre alignment, matching the usual
/// `INTER_LINEAR` convention: equal sizes copy through untouched.
fn resize_bilinear(src: &Plane<'_>, out_w: usize, out_h: usize) -> Vec<u8> {
    let mut out = vec![0u8; out_w * out_h];
    if out_w == 0 || out_h == 0 || src.width == 0 || src.height == 0 {
        return out;
    }

    let xs = sample_positions(src.width, out_w);
    let ys = sample_positions(src.height, out_h);

    for (oy, &(y0, y1, fy)) in ys.iter().enumerate() {
        let row0 = &src.data[y0 * src.width..(y0 + 1) * src.width];
        let row1 = &src.data[y1 * src.width..(y1 + 1) * src.width];
        let dst_row = &mut out[oy * out_w..(oy + 1) * out_w];
        for (dst, &(x0, x1, fx)) in dst_row.iter_mut().zip(xs.iter()) {
            let top = row0[x0] as f32 + fx * (row0[x1] as f32 - row0[x0] as f32);
            let bottom = row1[x0] as f32 + fx * (row1[x1] as f32 - row1[x0] as f32);
            let value = top + fy * (bottom - top);
            *dst = value.round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// For every output index: the two neighbouring source indices and the
/// weight of the second one.
fn sample_positions(src_len: usize, out_len: usize) -> Vec<(usize, usize, f32)> {
    let ratio = src_len as f64 / out_len as f64;
    (0..out_len)
        .map(|i| {
            let pos = ((i as f64 + 0.5) * ratio - 0.5).max(0.0);
            let i0 = (pos.floor() as usize).min(src_len - 1);
            let i1 = (i0 + 1).min(src_len - 1);
            (i0, i1, (pos - i0 as f64) as f32)
        })
        .collect()
}

fn blit(src: &[u8], src_w: usize, dst: &mut [u8], dst_w: usize, x: usize, y: usize) {
    if src_w == 0 {
        return;
    }
    for (row, line) in src.chunks_exact(src_w).enumerate() {
        let start = (y + row) * dst_w + x;
        dst[start..start + src_w].copy_from_slice(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_frame(w: u32, h: u32, y: u8, u: u8, v: u8) -> Vec<u8> {
        let luma = (w * h) as usize;
        let chroma = ((w / 2) * (h / 2)) as usize;
        let mut frame = vec![y; luma];
        frame.extend(std::iter::repeat_n(u, chroma));
        frame.extend(std::iter::repeat_n(v, chroma));
        frame
    }

    fn pattern_frame(w: u32, h: u32) -> Vec<u8> {
        (0..i420_size(w, h)).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_output_size_always_matches_target() {
        let sources = [(2, 2), (4, 2), (2, 8), (320, 240), (640, 360)];
        let targets = [(2, 2), (8, 6), (6, 10), (64, 36), (1920, 1080)];
        for src in sources {
            let frame = pattern_frame(src.0, src.1);
            for dst in targets {
                let out = scale_i420(&frame, src, dst).unwrap();
                assert_eq!(
                    out.len(),
                    (dst.0 * dst.1 * 3 / 2) as usize,
                    "{:?} -> {:?}",
                    src,
                    dst
                );
            }
        }
    }

    #[test]
    fn test_same_size_is_identity() {
        let frame = pattern_frame(64, 36);
        let out = scale_i420(&frame, (64, 36), (64, 36)).unwrap();
        assert_eq!(out, frame);
    }

    #[test]
    fn test_same_aspect_upscale_keeps_flat_colour() {
        let frame = solid_frame(16, 18, 90, 100, 110);
        let out = scale_i420(&frame, (16, 18), (32, 36)).unwrap();
        assert_eq!(out, solid_frame(32, 36, 90, 100, 110));
    }

    #[test]
    fn test_pillarbox_pads_left_and_right_symmetrically() {
        let frame = solid_frame(4, 4, 200, 50, 60);
        let out = scale_i420(&frame, (4, 4), (8, 4)).unwrap();

        let (y, chroma) = out.split_at(32);
        let (u, v) = chroma.split_at(8);
        for row in y.chunks(8) {
            assert_eq!(row, &[0, 0, 200, 200, 200, 200, 0, 0]);
        }
        for row in u.chunks(4) {
            assert_eq!(row, &[128, 50, 50, 128]);
        }
        for row in v.chunks(4) {
            assert_eq!(row, &[128, 60, 60, 128]);
        }
    }

    #[test]
    fn test_letterbox_pads_top_and_bottom_symmetrically() {
        let frame = solid_frame(8, 4, 10, 20, 30);
        let out = scale_i420(&frame, (8, 4), (8, 8)).unwrap();

        let (y, chroma) = out.split_at(64);
        let (u, v) = chroma.split_at(16);
        let rows: Vec<_> = y.chunks(8).collect();
        for r in [0, 1, 6, 7] {
            assert!(rows[r].iter().all(|&p| p == 0), "row {} should be padding", r);
        }
        for r in 2..6 {
            assert!(rows[r].iter().all(|&p| p == 10), "row {} should be image", r);
        }
        let u_rows: Vec<_> = u.chunks(4).collect();
        let v_rows: Vec<_> = v.chunks(4).collect();
        assert!(u_rows[0].iter().chain(u_rows[3]).all(|&p| p == 128));
        assert!(v_rows[0].iter().chain(v_rows[3]).all(|&p| p == 128));
        assert!(u_rows[1].iter().chain(u_rows[2]).all(|&p| p == 20));
        assert!(v_rows[1].iter().chain(v_rows[2]).all(|&p| p == 30));
    }

    #[test]
    fn test_invalid_geometry_is_rejected() {
        let frame = pattern_frame(4, 4);
        assert_eq!(
            scale_i420(&frame, (3, 4), (8, 8)),
            Err(ScaleError::OddDimensions {
                width: 3,
                height: 4
            })
        );
        assert!(matches!(
            scale_i420(&frame, (4, 4), (0, 8)),
            Err(ScaleError::ZeroDimensions { .. })
        ));
        assert_eq!(
            scale_i420(&frame[..10], (4, 4), (8, 8)),
            Err(ScaleError::ShortBuffer { len: 10, need: 24 })
        );
    }
}
