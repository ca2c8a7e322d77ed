//! Клиент бэкенда XiaoZhi: типы, рукопожатие, бинарный фрейминг

pub mod client;
pub mod codec;

pub use client::{Client, Event};

/// Параметры аудио потока, согласуемые в hello.
#[derive(Debug, Clone, Default)]
pub struct AudioParams {
    pub format: String,
    pub output_format: String,
    pub sample_rate: u32,
    pub channels: u32,
    pub frame_duration: u32,
}

/// Конфигурация подключения к бэкенду XiaoZhi.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub backend_url: String,
    pub protocol_version: u32,
    pub audio_params: AudioParams,
    pub listen_mode: String,
    pub device_id: String,
    pub client_id: String,
    pub access_token: String,
    pub feature_aec: bool,
}

/// Один декодированный кадр аудио от бэкенда.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u32,
}

pub fn normalize_listen_mode(mode: &str) -> String {
    let mode = mode.trim().to_lowercase();
    match mode.as_str() {
        "manual" | "realtime" | "auto" => mode.clone(),
        _ => "auto".to_string(),
    }
}

pub fn normalize_audio_format(format: &str) -> String {
    match format.trim().to_lowercase().as_str() {
        "" => String::new(),
        "opus" => "opus".to_string(),
        "pcm" | "pcm16" | "pcm_s16le" => "pcm_s16le".to_string(),
        "wav" => "wav".to_string(),
        other => other.to_string(),
    }
}

pub fn normalize_audio_params(mut params: AudioParams) -> AudioParams {
    params.format = normalize_audio_format(&params.format);
    if params.format.is_empty() {
        params.format = "opus".to_string();
    }
    params.output_format = normalize_audio_format(&params.output_format);
    if params.sample_rate == 0 {
        params.sample_rate = 16000;
    }
    if params.channels == 0 {
        params.channels = 1;
    }
    if params.frame_duration == 0 {
        params.frame_duration = 20;
    }
    params
}

/// Начальные параметры нисходящего аудио: output_format имеет приоритет над format.
pub fn initial_downstream_audio(params: &AudioParams) -> AudioParams {
    let mut downstream = normalize_audio_params(params.clone());
    if !downstream.output_format.is_empty() {
        downstream.format = std::mem::take(&mut downstream.output_format);
    }
    downstream.output_format = String::new();
    downstream
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_listen_mode() {
        assert_eq!(normalize_listen_mode("auto"), "auto");
        assert_eq!(normalize_listen_mode(" MANUAL "), "manual");
        assert_eq!(normalize_listen_mode("Realtime"), "realtime");
        assert_eq!(normalize_listen_mode(""), "auto");
        assert_eq!(normalize_listen_mode("invalid"), "auto");
    }

    #[test]
    fn test_normalize_audio_format() {
        assert_eq!(normalize_audio_format("pcm"), "pcm_s16le");
        assert_eq!(normalize_audio_format("PCM16"), "pcm_s16le");
        assert_eq!(normalize_audio_format("opus"), "opus");
        assert_eq!(normalize_audio_format(""), "");
        assert_eq!(normalize_audio_format("mp3"), "mp3");
    }

    #[test]
    fn test_normalize_audio_params_defaults() {
        let params = normalize_audio_params(AudioParams::default());
        assert_eq!(params.format, "opus");
        assert_eq!(params.sample_rate, 16000);
        assert_eq!(params.channels, 1);
        assert_eq!(params.frame_duration, 20);
    }

    #[test]
    fn test_initial_downstream_uses_output_format() {
        let params = AudioParams {
            format: "opus".to_string(),
            output_format: "wav".to_string(),
            sample_rate: 16000,
            channels: 1,
            frame_duration: 0,
        };
        let downstream = initial_downstream_audio(&params);
        assert_eq!(downstream.format, "wav");
        assert!(downstream.output_format.is_empty());
        assert_eq!(downstream.frame_duration, 20);
    }
}
