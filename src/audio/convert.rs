//! Конвертация между PCM16, float32 и байтами

/// Преобразует float32 sample в int16 с насыщением на ±1.0.
fn f32_to_i16(sample: f32) -> i16 {
    if sample > 1.0 {
        return 32767;
    }
    if sample < -1.0 {
        return -32768;
    }
    (sample * 32767.0) as i16
}

/// Заполняет dst значениями float32, сконвертированными в int16.
///
/// Буфер переиспользуется между кадрами, рост только при нехватке capacity.
pub fn f32_to_i16_samples(dst: &mut Vec<i16>, samples: &[f32]) {
    dst.clear();
    dst.reserve(samples.len());
    dst.extend(samples.iter().map(|&s| f32_to_i16(s)));
}

/// Заполняет dst значениями int16, сконвертированными в float32 (деление на 32767).
pub fn i16_to_f32_samples(dst: &mut Vec<f32>, samples: &[i16]) {
    dst.clear();
    dst.reserve(samples.len());
    dst.extend(samples.iter().map(|&s| s as f32 / i16::MAX as f32));
}

/// Заполняет dst little-endian байтами из int16 samples.
pub fn i16_samples_to_bytes(dst: &mut Vec<u8>, samples: &[i16]) {
    dst.clear();
    dst.reserve(samples.len() * 2);
    for &sample in samples {
        dst.extend_from_slice(&sample.to_le_bytes());
    }
}

/// Заполняет dst little-endian int16 значениями из байтов PCM.
///
/// Нечетный хвост дополняется нулевым старшим байтом.
pub fn pcm_bytes_to_i16(dst: &mut Vec<i16>, data: &[u8]) {
    dst.clear();
    let needed = (data.len() + 1) / 2;
    dst.reserve(needed);
    for i in 0..needed {
        let low = data[i * 2];
        let high = if i * 2 + 1 < data.len() {
            data[i * 2 + 1]
        } else {
            0
        };
        dst.push(i16::from_le_bytes([low, high]));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f32_to_i16_saturates() {
        let mut dst = Vec::new();
        f32_to_i16_samples(&mut dst, &[0.0, 1.0, -1.0, 2.0, -2.0]);
        assert_eq!(dst, vec![0, 32767, -32768, 32767, -32768]);
    }

    #[test]
    fn test_i16_bytes_round_trip() {
        let samples: Vec<i16> = vec![0, 1, -1, 32767, -32768, 12345];
        let mut bytes = Vec::new();
        i16_samples_to_bytes(&mut bytes, &samples);
        assert_eq!(bytes.len(), samples.len() * 2);

        let mut back = Vec::new();
        pcm_bytes_to_i16(&mut back, &bytes);
        assert_eq!(back, samples);
    }

    #[test]
    fn test_pcm_bytes_odd_tail() {
        let mut dst = Vec::new();
        pcm_bytes_to_i16(&mut dst, &[0x34, 0x12, 0x78]);
        assert_eq!(dst, vec![0x1234, 0x0078]);
    }

    #[test]
    fn test_buffers_are_reused() {
        let mut dst = vec![7i16; 64];
        f32_to_i16_samples(&mut dst, &[0.5]);
        assert_eq!(dst.len(), 1);
        assert_eq!(dst[0], (0.5f32 * 32767.0) as i16);
    }
}
