//! Аудио примитивы: конвертация PCM, ресемплинг, Opus

pub mod convert;
pub mod opus;
pub mod resampler;

pub use convert::{f32_to_i16_samples, i16_samples_to_bytes, i16_to_f32_samples, pcm_bytes_to_i16};
pub use opus::{acquire_opus_encoder, release_opus_encoder, OpusDecoder, OpusEncoder};
pub use resampler::StreamResampler;

/// Максимальная длительность одного Opus пакета в миллисекундах.
pub const OPUS_MAX_FRAME_MS: u32 = 120;
