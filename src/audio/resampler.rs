//! Потоковый ресемплер микрофонного PCM на rubato

use anyhow::{Context, Result};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use crate::audio::convert::{f32_to_i16_samples, i16_to_f32_samples};

/// Потоковый ресемплер: принимает PCM16 кадры произвольной длины,
/// внутри работает на float32 и отдает кадры фиксированного размера.
///
/// SincFixedIn требует фиксированный входной чанк, поэтому вход копится
/// в pending и обрабатывается кусками по chunk samples.
pub struct StreamResampler {
    resampler: SincFixedIn<f32>,
    in_rate: u32,
    out_rate: u32,
    chunk: usize,
    pending: Vec<f32>,
    out_buf: Vec<f32>,
    f32_scratch: Vec<f32>,
}

impl StreamResampler {
    pub fn new(in_rate: u32, out_rate: u32) -> Result<Self> {
        anyhow::ensure!(in_rate > 0 && out_rate > 0, "invalid resampler rates");

        // Баланс качество/CPU, как и для остального sinc-ресемплинга в проекте
        let params = SincInterpolationParameters {
            sinc_len: 128,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 160,
            window: WindowFunction::BlackmanHarris2,
        };

        // Входной чанк 20 мс: входная частота известна при создании
        let chunk = (in_rate as usize * 20 / 1000).max(1);
        let resampler = SincFixedIn::<f32>::new(
            out_rate as f64 / in_rate as f64,
            2.0,
            params,
            chunk,
            1,
        )
        .with_context(|| format!("create resampler {} -> {}", in_rate, out_rate))?;

        Ok(Self {
            resampler,
            in_rate,
            out_rate,
            chunk,
            pending: Vec::new(),
            out_buf: Vec::new(),
            f32_scratch: Vec::new(),
        })
    }

    pub fn in_rate(&self) -> u32 {
        self.in_rate
    }

    pub fn out_rate(&self) -> u32 {
        self.out_rate
    }

    /// Добавляет PCM16 samples и прогоняет накопленные полные чанки.
    pub fn append_pcm(&mut self, pcm: &[i16]) -> Result<()> {
        if pcm.is_empty() {
            return Ok(());
        }
        let mut scratch = std::mem::take(&mut self.f32_scratch);
        i16_to_f32_samples(&mut scratch, pcm);
        self.pending.extend_from_slice(&scratch);
        self.f32_scratch = scratch;

        while self.pending.len() >= self.chunk {
            let rest = self.pending.split_off(self.chunk);
            let input = std::mem::replace(&mut self.pending, rest);
            let output = self
                .resampler
                .process(&[input], None)
                .context("resampler process")?;
            self.out_buf.extend_from_slice(&output[0]);
        }
        Ok(())
    }

    /// Прогоняет неполный хвост входа и сливает внутреннюю задержку фильтра.
    pub fn flush(&mut self) -> Result<()> {
        if !self.pending.is_empty() {
            let input = std::mem::take(&mut self.pending);
            let output = self
                .resampler
                .process_partial(Some(&[input]), None)
                .context("resampler flush tail")?;
            self.out_buf.extend_from_slice(&output[0]);
        }
        let output = self
            .resampler
            .process_partial(None::<&[Vec<f32>]>, None)
            .context("resampler flush")?;
        self.out_buf.extend_from_slice(&output[0]);
        Ok(())
    }

    /// Возвращает полный кадр frame_size, либо None если данных не хватает.
    pub fn pop_frame(&mut self, frame_size: usize) -> Option<Vec<i16>> {
        if frame_size == 0 || self.out_buf.len() < frame_size {
            return None;
        }
        let rest = self.out_buf.split_off(frame_size);
        let frame_f32 = std::mem::replace(&mut self.out_buf, rest);
        let mut frame = Vec::with_capacity(frame_size);
        f32_to_i16_samples(&mut frame, &frame_f32);
        Some(frame)
    }

    /// Возвращает остаток, дополненный нулями до frame_size. Вызывается после flush.
    pub fn pop_remainder_padded(&mut self, frame_size: usize) -> Option<Vec<i16>> {
        if frame_size == 0 || self.out_buf.is_empty() {
            return None;
        }
        if self.out_buf.len() > frame_size {
            self.out_buf.truncate(frame_size);
        }
        let remainder = std::mem::take(&mut self.out_buf);
        let mut frame = Vec::with_capacity(frame_size);
        f32_to_i16_samples(&mut frame, &remainder);
        frame.resize(frame_size, 0);
        Some(frame)
    }

    /// Количество готовых выходных samples.
    pub fn available(&self) -> usize {
        self.out_buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_pcm(samples: usize, rate: u32) -> Vec<i16> {
        (0..samples)
            .map(|i| {
                let t = i as f32 / rate as f32;
                ((t * 440.0 * 2.0 * std::f32::consts::PI).sin() * 8000.0) as i16
            })
            .collect()
    }

    #[test]
    fn test_downsample_48k_to_16k_sample_count() {
        let mut resampler = StreamResampler::new(48000, 16000).expect("create resampler");
        let input = sine_pcm(48000, 48000); // 1 секунда
        resampler.append_pcm(&input).expect("append");
        resampler.flush().expect("flush");

        let mut total = 0;
        while let Some(frame) = resampler.pop_frame(320) {
            assert_eq!(frame.len(), 320);
            total += frame.len();
        }
        if let Some(frame) = resampler.pop_remainder_padded(320) {
            assert_eq!(frame.len(), 320);
            total += frame.len();
        }

        // 1 секунда @16k = 16000 samples, округление до границы кадра
        let expected = 16000usize;
        assert!(
            total >= expected - 320 && total <= expected + 320,
            "total={} expected around {}",
            total,
            expected
        );
    }

    #[test]
    fn test_pop_frame_requires_full_frame() {
        let mut resampler = StreamResampler::new(48000, 16000).expect("create resampler");
        resampler.append_pcm(&sine_pcm(96, 48000)).expect("append");
        // 96 входных samples дают максимум ~32 выходных, кадра в 320 еще нет
        assert!(resampler.pop_frame(320).is_none());
    }

    #[test]
    fn test_remainder_is_padded_with_zeros() {
        let mut resampler = StreamResampler::new(48000, 16000).expect("create resampler");
        resampler
            .append_pcm(&sine_pcm(960, 48000))
            .expect("append");
        resampler.flush().expect("flush");

        while resampler.pop_frame(320).is_some() {}
        if let Some(frame) = resampler.pop_remainder_padded(320) {
            assert_eq!(frame.len(), 320);
            assert_eq!(*frame.last().expect("last sample"), 0);
        }
        assert_eq!(resampler.available(), 0);
    }
}
