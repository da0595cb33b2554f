//! Soft saturation for the end of the master chain.
//!
//! `x / (1 + |x|)` compresses peaks smoothly instead of clipping them, which
//! keeps many overlapping voices from ever producing a hard edge. The output
//! is normalised by the curve's value at full scale so drive changes colour,
//! not loudness.

#[inline]
pub fn soft_clip(sample: f32, drive: f32) -> f32 {
    let x = sample * drive;
    x / (1.0 + x.abs())
}

/// Soft clip a block in place, keeping unity gain at full scale.
pub fn saturate_buffer(buffer: &mut [f32], drive: f32) {
    let drive = drive.max(0.01);
    let norm = 1.0 / soft_clip(1.0, drive);
    for sample in buffer.iter_mut() {
        *sample = soft_clip(*sample, drive) * norm;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_scale_is_preserved() {
        let mut buffer = [1.0, -1.0];
        saturate_buffer(&mut buffer, 4.0);
        assert!((buffer[0] - 1.0).abs() < 1e-6);
        assert!((buffer[1] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn peaks_are_compressed() {
        let mut buffer = [4.0];
        saturate_buffer(&mut buffer, 1.0);
        assert!(buffer[0] < 4.0);
    }
}
