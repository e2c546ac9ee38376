//! Audio capture and playback.

pub mod capture;
pub mod playback;

/// Encode f32 samples in \[-1, 1\] as PCM16LE bytes.
#[must_use]
pub fn pcm16_from_f32(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let clamped = s.clamp(-1.0, 1.0);
        let v = (clamped * f32::from(i16::MAX)) as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Decode PCM16LE bytes to f32 samples in \[-1, 1\].
///
/// A trailing odd byte is ignored.
#[must_use]
pub fn f32_from_pcm16(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| {
            let v = i16::from_le_bytes([pair[0], pair[1]]);
            f32::from(v) / f32::from(i16::MAX)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm16_round_trip_preserves_shape() {
        let samples = vec![0.0, 0.5, -0.5, 1.0, -1.0];
        let decoded = f32_from_pcm16(&pcm16_from_f32(&samples));
        assert_eq!(decoded.len(), samples.len());
        for (a, b) in samples.iter().zip(&decoded) {
            assert!((a - b).abs() < 1e-3, "{a} vs {b}");
        }
    }

    #[test]
    fn pcm16_clamps_out_of_range() {
        let bytes = pcm16_from_f32(&[2.0, -2.0]);
        let decoded = f32_from_pcm16(&bytes);
        assert!((decoded[0] - 1.0).abs() < 1e-3);
        assert!((decoded[1] + 1.0).abs() < 1e-3);
    }
}
