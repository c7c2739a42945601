//! Frame validation utilities for test pattern verification.
//!
//! These check that captured frames carry the expected test pattern and that
//! frame counters advance without gaps. Useful for integration testing with
//! simulated or virtual cameras.

use crate::buffer::{FrameBuffer, FrameInfo, FrameStatus};
use crate::error::{CameraError, Result};
use crate::sfnc;
use crate::sim::COLOR_BAR_LUMA;

/// Tolerance for luminance matching (accounts for sensor or codec rounding).
const LUMA_TOLERANCE: u8 = 15;

/// Minimum rise across the frame for a gradient.
const MIN_GRADIENT_RISE: u8 = 50;

/// Luminance of pixel `(x, y)` in a frame described by `info`.
///
/// RGB8 is converted with the Rec. 601 weights. 16-bit formats use the high
/// byte. Returns `None` outside the received payload or for unknown formats.
pub fn luma_at(payload: &[u8], info: &FrameInfo, x: u32, y: u32) -> Option<u8> {
    let bytes_per_pixel = sfnc::bytes_per_pixel(&info.pixel_format)?;
    let offset = (y as usize * info.width as usize + x as usize) * bytes_per_pixel;
    let pixel = payload
        .get(..info.received_size)?
        .get(offset..offset + bytes_per_pixel)?;

    match (info.pixel_format.as_str(), pixel) {
        (sfnc::RGB8, &[r, g, b]) => {
            let luma = 0.114f32.mul_add(
                f32::from(b),
                0.587f32.mul_add(f32::from(g), 0.299 * f32::from(r)),
            );
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            Some(luma.round().clamp(0.0, 255.0) as u8)
        }
        (sfnc::MONO8 | sfnc::YUV422_8, &[y, ..]) => Some(y),
        (_, &[_, high]) => Some(high),
        _ => None,
    }
}

fn checked_frame(buffer: &FrameBuffer) -> Result<FrameInfo> {
    let info = buffer.info();
    if info.status != FrameStatus::Complete {
        return Err(CameraError::InvalidCall(format!(
            "frame {} is {:?}",
            info.frame_id, info.status
        )));
    }
    if info.width == 0 || info.height == 0 {
        return Err(CameraError::InvalidValue(format!(
            "frame {} has no image geometry",
            info.frame_id
        )));
    }
    Ok(info)
}

/// Validates that a frame contains the eight SMPTE color bars.
///
/// Samples the center of each bar on the middle row.
///
/// # Errors
///
/// Returns `InvalidCall` if the frame did not complete, and `InvalidValue`
/// if a pixel cannot be sampled or a bar is off by more than the tolerance.
pub fn validate_color_bars(buffer: &FrameBuffer) -> Result<()> {
    let info = checked_frame(buffer)?;
    let bar_width = info.width / 8;
    let center_y = info.height / 2;

    buffer.with_payload(|payload| {
        for (bar_idx, expected) in COLOR_BAR_LUMA.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let sample_x = (bar_idx as u32 * bar_width) + (bar_width / 2);

            let actual = luma_at(payload, &info, sample_x, center_y).ok_or_else(|| {
                CameraError::InvalidValue(format!(
                    "cannot sample pixel at ({sample_x}, {center_y})"
                ))
            })?;

            if actual.abs_diff(*expected) > LUMA_TOLERANCE {
                return Err(CameraError::InvalidValue(format!(
                    "color bar {bar_idx} mismatch at ({sample_x}, {center_y}): \
                     expected luma {expected}, got {actual}"
                )));
            }
        }
        Ok(())
    })
}

/// Validates that a frame contains a left-to-right gradient.
///
/// The middle row must never drop by more than one step and must rise by a
/// meaningful amount overall, which rules out solid frames.
///
/// # Errors
///
/// Returns `InvalidCall` if the frame did not complete, and `InvalidValue`
/// if the row is not monotonic or is too flat.
pub fn validate_gradient(buffer: &FrameBuffer) -> Result<()> {
    let info = checked_frame(buffer)?;
    let center_y = info.height / 2;
    let step = (info.width / 64).max(1) as usize;

    buffer.with_payload(|payload| {
        let mut first: Option<u8> = None;
        let mut prev: Option<u8> = None;

        for x in (0..info.width).step_by(step) {
            let luma = luma_at(payload, &info, x, center_y).ok_or_else(|| {
                CameraError::InvalidValue(format!("cannot sample pixel at ({x}, {center_y})"))
            })?;

            if let Some(prev) = prev {
                if luma.saturating_add(1) < prev {
                    return Err(CameraError::InvalidValue(format!(
                        "gradient decreases at x={x}: {luma} < {prev}"
                    )));
                }
            }
            first.get_or_insert(luma);
            prev = Some(luma);
        }

        let rise = prev.unwrap_or(0).saturating_sub(first.unwrap_or(0));
        if rise < MIN_GRADIENT_RISE {
            return Err(CameraError::InvalidValue(format!(
                "insufficient luminance change for gradient: {rise} \
                 (expected at least {MIN_GRADIENT_RISE})"
            )));
        }
        Ok(())
    })
}

/// Validates that frame ids increment by exactly one.
///
/// # Errors
///
/// Returns `InvalidValue` if `frames` is empty or an id is skipped or repeated.
pub fn validate_frame_sequence(frames: &[FrameInfo]) -> Result<()> {
    if frames.is_empty() {
        return Err(CameraError::InvalidValue(
            "cannot validate empty frame sequence".to_owned(),
        ));
    }

    for (i, pair) in frames.windows(2).enumerate() {
        if let [prev, curr] = pair {
            let expected = prev.frame_id + 1;
            if curr.frame_id != expected {
                return Err(CameraError::InvalidValue(format!(
                    "frame sequence gap at index {}: expected {expected}, got {}",
                    i + 1,
                    curr.frame_id
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{render, ImageLayout, TestPattern};
    use std::time::Duration;

    fn frame(pixel_format: &str, pattern: TestPattern) -> FrameBuffer {
        let layout = ImageLayout {
            width: 64,
            height: 16,
            pixel_format: pixel_format.to_owned(),
            bytes_per_pixel: sfnc::bytes_per_pixel(pixel_format).expect("known format"),
        };
        let buffer = FrameBuffer::new(layout.image_size());
        buffer.fill_with(|dst| {
            let received_size = render(dst, &layout, pattern, false);
            Ok(FrameInfo {
                frame_id: 0,
                status: FrameStatus::Complete,
                received_size,
                width: layout.width,
                height: layout.height,
                pixel_format: layout.pixel_format.clone(),
                timestamp: Duration::ZERO,
                chunk_present: false,
            })
        });
        buffer
    }

    fn info(frame_id: u64) -> FrameInfo {
        FrameInfo {
            frame_id,
            ..FrameInfo::default()
        }
    }

    #[test]
    fn test_validate_color_bars_success() {
        for format in [sfnc::MONO8, sfnc::MONO16, sfnc::RGB8, sfnc::YUV422_8] {
            let buffer = frame(format, TestPattern::ColorBars);
            let result = validate_color_bars(&buffer);
            assert!(result.is_ok(), "{format} color bars should pass: {result:?}");
        }
    }

    #[test]
    fn test_validate_color_bars_wrong_pattern() {
        let buffer = frame(sfnc::MONO8, TestPattern::Gradient);
        assert!(validate_color_bars(&buffer).is_err());
    }

    #[test]
    fn test_validate_gradient_success() {
        let buffer = frame(sfnc::YUV422_8, TestPattern::Gradient);
        let result = validate_gradient(&buffer);
        assert!(result.is_ok(), "gradient should pass: {result:?}");
    }

    #[test]
    fn test_validate_gradient_rejects_solid() {
        let buffer = frame(sfnc::MONO8, TestPattern::Solid(128));
        assert!(matches!(
            validate_gradient(&buffer),
            Err(CameraError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_unfilled_buffer_is_rejected() {
        let buffer = FrameBuffer::new(64);
        assert!(matches!(
            validate_color_bars(&buffer),
            Err(CameraError::InvalidCall(_))
        ));
    }

    #[test]
    fn test_luma_at_respects_received_size() {
        let payload = [10u8, 20, 30, 40];
        let info = FrameInfo {
            status: FrameStatus::Complete,
            received_size: 2,
            width: 4,
            height: 1,
            pixel_format: sfnc::MONO8.to_owned(),
            ..FrameInfo::default()
        };
        assert_eq!(luma_at(&payload, &info, 1, 0), Some(20));
        assert_eq!(luma_at(&payload, &info, 2, 0), None);
    }

    #[test]
    fn test_validate_frame_sequence() {
        let frames: Vec<FrameInfo> = (3..8).map(info).collect();
        assert!(validate_frame_sequence(&frames).is_ok());
        assert!(validate_frame_sequence(&[]).is_err());

        let gap = [info(0), info(1), info(3)];
        assert!(matches!(
            validate_frame_sequence(&gap),
            Err(CameraError::InvalidValue(_))
        ));
    }
}
