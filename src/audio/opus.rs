//! Opus кодек: обертки над audiopus с пулом энкодеров

use anyhow::{Context, Result};
use audiopus::coder::{Decoder, Encoder, GenericCtl};
use audiopus::{Application, Bandwidth, Bitrate, Channels, SampleRate};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::info;

use crate::audio::convert::pcm_bytes_to_i16;
use crate::audio::OPUS_MAX_FRAME_MS;

const OPUS_OUT_BUFFER_SIZE: usize = 4000;

// Пул держит не больше нескольких энкодеров на ключ, остальные дропаются.
const POOL_LIMIT: usize = 8;

fn sample_rate_from_hz(hz: u32) -> Result<SampleRate> {
    SampleRate::try_from(hz as i32)
        .map_err(|e| anyhow::anyhow!("unsupported opus sample rate {}: {}", hz, e))
}

fn channels_from_count(count: u32) -> Result<Channels> {
    Channels::try_from(count as i32)
        .map_err(|e| anyhow::anyhow!("unsupported opus channel count {}: {}", count, e))
}

/// Настройки Opus энкодера, читаются один раз из переменных окружения.
#[derive(Debug, Default, Clone)]
struct OpusEncodeOptions {
    bitrate: u32,
    complexity: u32,
    vbr: Option<bool>,
    vbr_constraint: Option<bool>,
    fec: Option<bool>,
    packet_loss_perc: u32,
    max_bandwidth: String,
}

static OPUS_OPTIONS: Lazy<OpusEncodeOptions> = Lazy::new(|| {
    let options = OpusEncodeOptions {
        bitrate: getenv_u32("OPUS_BITRATE"),
        complexity: getenv_u32("OPUS_COMPLEXITY"),
        vbr: getenv_bool("OPUS_VBR"),
        vbr_constraint: getenv_bool("OPUS_VBR_CONSTRAINT"),
        fec: getenv_bool("OPUS_FEC"),
        packet_loss_perc: getenv_u32("OPUS_PACKET_LOSS_PERC"),
        max_bandwidth: std::env::var("OPUS_MAX_BANDWIDTH")
            .unwrap_or_default()
            .trim()
            .to_lowercase(),
    };
    info!(
        bitrate = options.bitrate,
        complexity = options.complexity,
        vbr = ?options.vbr,
        vbr_constraint = ?options.vbr_constraint,
        fec = ?options.fec,
        packet_loss = options.packet_loss_perc,
        max_bandwidth = %options.max_bandwidth,
        "Opus encoder options"
    );
    options
});

fn getenv_u32(key: &str) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

fn getenv_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn apply_encoder_options(encoder: &mut Encoder) {
    let options = &*OPUS_OPTIONS;
    if options.bitrate > 0 {
        let _ = encoder.set_bitrate(Bitrate::BitsPerSecond(options.bitrate as i32));
    }
    if options.complexity > 0 {
        let _ = encoder.set_complexity(options.complexity as u8);
    }
    if let Some(vbr) = options.vbr {
        let _ = encoder.set_vbr(vbr);
    }
    if let Some(constraint) = options.vbr_constraint {
        let _ = encoder.set_vbr_constraint(constraint);
    }
    if let Some(fec) = options.fec {
        let _ = encoder.set_inband_fec(fec);
    }
    if options.packet_loss_perc > 0 {
        let _ = encoder.set_packet_loss_perc(options.packet_loss_perc as u8);
    }
    if let Some(bandwidth) = parse_bandwidth(&options.max_bandwidth) {
        let _ = encoder.set_max_bandwidth(bandwidth);
    }
}

fn parse_bandwidth(value: &str) -> Option<Bandwidth> {
    match value {
        "narrowband" | "nb" => Some(Bandwidth::Narrowband),
        "mediumband" | "mb" => Some(Bandwidth::Mediumband),
        "wideband" | "wb" => Some(Bandwidth::Wideband),
        "superwideband" | "swb" => Some(Bandwidth::Superwideband),
        "fullband" | "fb" => Some(Bandwidth::Fullband),
        _ => None,
    }
}

/// Opus энкодер для фиксированного кадра sample_rate * frame_duration / 1000.
///
/// Короткие кадры дополняются нулями, длинные обрезаются до ровно
/// frame_size * channels samples на вызов.
pub struct OpusEncoder {
    encoder: Encoder,
    sample_rate: u32,
    channels: u32,
    frame_duration: u32,
    frame_size: usize,
    opus_buffer: Vec<u8>,
    pcm_scratch: Vec<i16>,
}

impl OpusEncoder {
    pub fn new(sample_rate: u32, channels: u32, frame_duration_ms: u32) -> Result<Self> {
        let mut encoder = Encoder::new(
            sample_rate_from_hz(sample_rate)?,
            channels_from_count(channels)?,
            Application::Voip,
        )
        .context("create opus encoder")?;
        apply_encoder_options(&mut encoder);

        let frame_size = (sample_rate * frame_duration_ms / 1000) as usize;
        Ok(Self {
            encoder,
            sample_rate,
            channels,
            frame_duration: frame_duration_ms,
            frame_size,
            opus_buffer: vec![0u8; OPUS_OUT_BUFFER_SIZE],
            pcm_scratch: Vec::new(),
        })
    }

    /// Кодирует PCM16 байты в один Opus пакет.
    pub fn encode(&mut self, pcm_data: &[u8]) -> Result<Vec<u8>> {
        let expected = self.frame_size * self.channels as usize;
        let mut scratch = std::mem::take(&mut self.pcm_scratch);
        pcm_bytes_to_i16(&mut scratch, pcm_data);
        scratch.resize(expected, 0);

        let written = self
            .encoder
            .encode(&scratch, &mut self.opus_buffer)
            .context("opus encode")?;
        self.pcm_scratch = scratch;

        Ok(self.opus_buffer[..written].to_vec())
    }

    /// Кодирует уже нарезанный кадр int16 samples.
    pub fn encode_samples(&mut self, frame: &[i16]) -> Result<Vec<u8>> {
        let expected = self.frame_size * self.channels as usize;
        let mut scratch = std::mem::take(&mut self.pcm_scratch);
        scratch.clear();
        scratch.extend_from_slice(&frame[..frame.len().min(expected)]);
        scratch.resize(expected, 0);

        let written = self
            .encoder
            .encode(&scratch, &mut self.opus_buffer)
            .context("opus encode")?;
        self.pcm_scratch = scratch;

        Ok(self.opus_buffer[..written].to_vec())
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_size * self.channels as usize * 2
    }

    fn reset(&mut self) -> Result<()> {
        self.encoder.reset_state().context("opus encoder reset")
    }
}

type EncoderKey = (u32, u32, u32);

static ENCODER_POOL: Lazy<Mutex<HashMap<EncoderKey, Vec<OpusEncoder>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Берет энкодер из пула по ключу (rate, channels, frame_duration) или создает новый.
///
/// Переиспользование оппортунистическое: промах пула всегда дает свежий энкодер.
pub fn acquire_opus_encoder(
    sample_rate: u32,
    channels: u32,
    frame_duration_ms: u32,
) -> Result<OpusEncoder> {
    let key = (sample_rate, channels, frame_duration_ms);
    if let Some(encoder) = ENCODER_POOL
        .lock()
        .expect("opus encoder pool poisoned")
        .get_mut(&key)
        .and_then(|pool| pool.pop())
    {
        return Ok(encoder);
    }
    OpusEncoder::new(sample_rate, channels, frame_duration_ms)
}

/// Возвращает энкодер в пул, сбрасывая состояние кодека.
pub fn release_opus_encoder(mut encoder: OpusEncoder) {
    if encoder.reset().is_err() {
        return;
    }
    let key = (
        encoder.sample_rate,
        encoder.channels,
        encoder.frame_duration,
    );
    let mut pool = ENCODER_POOL.lock().expect("opus encoder pool poisoned");
    let entry = pool.entry(key).or_default();
    if entry.len() < POOL_LIMIT {
        entry.push(encoder);
    }
}

/// Opus декодер с буфером под максимальный кадр 120 мс.
pub struct OpusDecoder {
    decoder: Decoder,
    channels: u32,
    pcm_buffer: Vec<i16>,
}

impl OpusDecoder {
    pub fn new(sample_rate: u32, channels: u32) -> Result<Self> {
        let decoder = Decoder::new(
            sample_rate_from_hz(sample_rate)?,
            channels_from_count(channels)?,
        )
        .context("create opus decoder")?;
        let max_samples = (sample_rate * OPUS_MAX_FRAME_MS / 1000) as usize;
        Ok(Self {
            decoder,
            channels,
            pcm_buffer: vec![0i16; max_samples * channels as usize],
        })
    }

    /// Декодирует один Opus пакет в int16 samples (interleaved).
    pub fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>> {
        let decoded = self
            .decoder
            .decode(Some(packet), &mut self.pcm_buffer, false)
            .context("opus decode")?;
        Ok(self.pcm_buffer[..decoded * self.channels as usize].to_vec())
    }
}
