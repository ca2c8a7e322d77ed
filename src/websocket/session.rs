//! Клиентская сессия: оркестрация между фронтендом и бэкендом XiaoZhi

use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::audio::{
    acquire_opus_encoder, i16_samples_to_bytes, pcm_bytes_to_i16, release_opus_encoder,
    OpusEncoder, StreamResampler,
};
use crate::config::{self, CharacterConfig};
use crate::mcp::{CaptureResponse, McpBridge};
use crate::server::AppState;
use crate::websocket::fsm::Machine;
use crate::websocket::protocol::{ClientMessage, DisplayText, ServerMessage};
use crate::websocket::broadcast_group_update;
use crate::xiaozhi::{AudioFrame, Client, Event};

/// Длительность одного TTS чанка к клиенту.
const TTS_CHUNK_DURATION_MS: u32 = 300;

const STATS_LOG_INTERVAL: Duration = Duration::from_secs(2);

/// Сессия одного клиента. Владеет всем изменяемым состоянием диалога;
/// оба источника (сокет клиента и события XiaoZhi) обрабатываются
/// одним таском, поэтому внутренних блокировок нет.
pub struct Session {
    app: AppState,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    upstream: Client,
    mcp: McpBridge,
    fsm: Machine,

    pub client_uid: String,

    conf_name: String,
    conf_uid: String,
    live2d_model_name: String,
    character_name: String,
    avatar: String,
    history_uid: String,

    llm_text: String,
    in_conversation: bool,
    tts_active: bool,
    display_sent: bool,

    audio_format: String,
    sample_rate: u32,
    channels: u32,
    frame_duration: u32,
    frame_samples: usize,
    input_sample_rate: u32,
    input_channels: u32,
    listen_mode: String,
    listening: bool,
    unsupported_audio: bool,

    mic_pcm_buffer: Vec<i16>,
    resampler: Option<StreamResampler>,
    opus_encoder: Option<OpusEncoder>,
    pcm_scratch: Vec<i16>,
    byte_scratch: Vec<u8>,

    tts_buffer: Vec<u8>,
    tts_sample_rate: u32,
    tts_channels: u32,

    mic_chunk_count: u64,
    mic_bytes: u64,
    last_mic_log: Option<Instant>,
    last_mic_rate: u32,
    last_mic_channels: u32,

    tts_chunk_count: u64,
    tts_bytes: u64,
    last_tts_log: Option<Instant>,
}

impl Session {
    pub fn new(
        app: AppState,
        outbound: mpsc::UnboundedSender<ServerMessage>,
        upstream: Client,
        mcp: McpBridge,
        client_uid: String,
    ) -> Self {
        let xiaozhi = &app.config.xiaozhi;
        let character = &app.config.character;
        let frame_samples = (xiaozhi.sample_rate * xiaozhi.frame_duration / 1000) as usize;

        let opus_encoder = if xiaozhi.audio_format == "opus" {
            match acquire_opus_encoder(
                xiaozhi.sample_rate,
                xiaozhi.channels,
                xiaozhi.frame_duration,
            ) {
                Ok(encoder) => Some(encoder),
                Err(e) => {
                    warn!(error = %e, "opus encoder init failed");
                    None
                }
            }
        } else {
            None
        };

        let mut fsm = Machine::new();
        fsm.set_mode(&xiaozhi.listen_mode);

        Self {
            outbound,
            upstream,
            mcp,
            fsm,
            client_uid,
            conf_name: character.conf_name.clone(),
            conf_uid: character.conf_uid.clone(),
            live2d_model_name: character.live2d_model_name.clone(),
            character_name: character.character_name.clone(),
            avatar: character.avatar.clone(),
            history_uid: String::new(),
            llm_text: String::new(),
            in_conversation: false,
            tts_active: false,
            display_sent: false,
            audio_format: xiaozhi.audio_format.clone(),
            sample_rate: xiaozhi.sample_rate,
            channels: xiaozhi.channels,
            frame_duration: xiaozhi.frame_duration,
            frame_samples,
            input_sample_rate: xiaozhi.sample_rate,
            input_channels: xiaozhi.channels,
            listen_mode: xiaozhi.listen_mode.clone(),
            listening: false,
            unsupported_audio: false,
            mic_pcm_buffer: Vec::new(),
            resampler: None,
            opus_encoder,
            pcm_scratch: Vec::new(),
            byte_scratch: Vec::new(),
            tts_buffer: Vec::new(),
            tts_sample_rate: 0,
            tts_channels: 0,
            mic_chunk_count: 0,
            mic_bytes: 0,
            last_mic_log: None,
            last_mic_rate: 0,
            last_mic_channels: 0,
            tts_chunk_count: 0,
            tts_bytes: 0,
            last_tts_log: None,
            app,
        }
    }

    fn send(&self, message: ServerMessage) {
        let _ = self.outbound.send(message);
    }

    fn send_error(&self, message: impl Into<String>) {
        self.send(ServerMessage::error(message));
    }

    /// Освобождает аудио ресурсы при закрытии сессии.
    pub fn release_audio(&mut self) {
        if let Some(encoder) = self.opus_encoder.take() {
            release_opus_encoder(encoder);
        }
        self.resampler = None;
    }

    // ------------------------------------------------------------------
    // Клиент -> бэкенд
    // ------------------------------------------------------------------

    pub async fn handle_incoming(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::TextInput { text } => {
                if text.is_empty() {
                    return;
                }
                if let Err(e) = self.upstream.send_text_input(&text).await {
                    self.send_error(e.to_string());
                }
            }
            ClientMessage::InterruptSignal => {
                if let Err(e) = self.upstream.abort().await {
                    self.send_error(e.to_string());
                }
                self.fsm.on_interrupt();
                self.end_conversation();
            }
            ClientMessage::MicAudioData {
                audio,
                audio_pcm,
                audio_sample_rate,
                audio_channels,
            } => {
                if !audio_pcm.is_empty() {
                    self.handle_mic_audio_pcm(&audio_pcm, audio_sample_rate, audio_channels)
                        .await;
                } else {
                    self.handle_mic_audio(&audio).await;
                }
            }
            ClientMessage::MicAudioEnd => self.handle_mic_end().await,
            ClientMessage::SetListenMode { listen_mode } => {
                self.handle_set_listen_mode(&listen_mode)
            }
            ClientMessage::McpCaptureResponse {
                request_id,
                success,
                image,
                mime_type,
                message,
            } => {
                let Some(success) = success else { return };
                if request_id.is_empty() {
                    return;
                }
                self.mcp.deliver_capture(
                    &request_id,
                    CaptureResponse {
                        success,
                        image,
                        mime_type,
                        message,
                    },
                );
            }
            ClientMessage::FrontendPlaybackComplete => {
                self.send(ServerMessage::ForceNewMessage);
            }
            ClientMessage::AudioPlayStart => {}
            ClientMessage::FetchConfigs => self.handle_fetch_configs(),
            ClientMessage::SwitchConfig { file } => self.handle_switch_config(&file),
            ClientMessage::FetchBackgrounds => self.handle_fetch_backgrounds(),
            ClientMessage::RequestInitConfig => self.send_model_and_conf(),
            ClientMessage::FetchHistoryList => self.handle_history_list(),
            ClientMessage::FetchAndSetHistory { history_uid } => {
                self.handle_fetch_history(&history_uid)
            }
            ClientMessage::CreateNewHistory => self.handle_create_history(),
            ClientMessage::DeleteHistory { history_uid } => {
                self.handle_delete_history(&history_uid)
            }
            ClientMessage::RequestGroupInfo => {
                broadcast_group_update(&self.app, std::slice::from_ref(&self.client_uid)).await;
            }
            ClientMessage::AddClientToGroup { invitee_uid } => {
                self.handle_add_to_group(&invitee_uid).await
            }
            ClientMessage::RemoveClientFromGroup { target_uid } => {
                self.handle_remove_from_group(&target_uid).await
            }
            ClientMessage::AiSpeakSignal => {
                self.send_error("proactive speak not supported in XiaoZhi mode");
            }
            ClientMessage::Heartbeat => {}
            ClientMessage::Unknown => {
                debug!(session_id = %self.client_uid, "ws unknown message type");
            }
        }
    }

    // ------------------------------------------------------------------
    // Микрофонный конвейер
    // ------------------------------------------------------------------

    async fn handle_mic_audio(&mut self, samples: &[f64]) {
        if samples.is_empty() {
            return;
        }
        let mut scratch = std::mem::take(&mut self.pcm_scratch);
        scratch.clear();
        scratch.extend(samples.iter().map(|&s| {
            let clamped = s.clamp(-1.0, 1.0);
            (clamped * 32767.0) as i16
        }));
        let mut bytes = std::mem::take(&mut self.byte_scratch);
        i16_samples_to_bytes(&mut bytes, &scratch);
        self.pcm_scratch = scratch;

        let sample_rate = self.sample_rate;
        let channels = self.channels;
        let pcm = std::mem::take(&mut bytes);
        self.handle_mic_pcm_bytes(&pcm, sample_rate, channels).await;
        self.byte_scratch = pcm;
    }

    async fn handle_mic_audio_pcm(&mut self, audio_pcm: &str, sample_rate: u32, channels: u32) {
        let pcm = match BASE64.decode(audio_pcm) {
            Ok(pcm) => pcm,
            Err(e) => {
                warn!(error = %e, "mic audio pcm decode failed");
                self.send_error("invalid mic audio pcm");
                return;
            }
        };
        if pcm.is_empty() {
            return;
        }
        self.last_mic_rate = sample_rate;
        self.last_mic_channels = channels;
        self.handle_mic_pcm_bytes(&pcm, sample_rate, channels).await;
    }

    async fn handle_mic_pcm_bytes(&mut self, pcm: &[u8], sample_rate: u32, channels: u32) {
        if pcm.is_empty() {
            return;
        }
        if !self.listening {
            if let Err(e) = self.upstream.send_listen_state("start").await {
                warn!(error = %e, "xiaozhi listen start failed");
                return;
            }
            info!(session_id = %self.client_uid, "xiaozhi listen start");
            self.listening = true;
            self.fsm.on_listen_start();
        }

        let input_rate = first_positive(sample_rate, self.input_sample_rate, self.sample_rate);
        let input_channels = first_positive(channels, self.input_channels, self.channels);
        if input_rate != self.input_sample_rate || input_channels != self.input_channels {
            self.input_sample_rate = input_rate;
            self.input_channels = input_channels;
            // Смена входного формата: ресемплер пересоздается под новую пару
            self.resampler = None;
        }

        self.mic_chunk_count += 1;
        self.mic_bytes += pcm.len() as u64;
        let now = Instant::now();
        if self
            .last_mic_log
            .map_or(true, |last| now.duration_since(last) >= STATS_LOG_INTERVAL)
        {
            self.last_mic_log = Some(now);
            info!(
                session_id = %self.client_uid,
                chunks = self.mic_chunk_count,
                bytes = self.mic_bytes,
                input_rate,
                input_channels,
                target_rate = self.sample_rate,
                target_channels = self.channels,
                format = %self.audio_format,
                resampling = self.resampler.is_some(),
                listening = self.listening,
                "mic audio stats"
            );
            self.mic_chunk_count = 0;
            self.mic_bytes = 0;
        }

        if self.audio_format != "opus"
            && self.audio_format != "pcm16"
            && self.audio_format != "pcm"
        {
            if !self.unsupported_audio {
                self.unsupported_audio = true;
                warn!(
                    session_id = %self.client_uid,
                    format = %self.audio_format,
                    "unsupported mic audio format"
                );
                self.send_error("unsupported xiaozhi_audio_format for mic input");
            }
            return;
        }

        if input_rate != self.sample_rate && self.resampler.is_none() {
            match StreamResampler::new(input_rate, self.sample_rate) {
                Ok(resampler) => self.resampler = Some(resampler),
                Err(e) => warn!(error = %e, "resampler init failed"),
            }
        }

        let mut scratch = std::mem::take(&mut self.pcm_scratch);
        pcm_bytes_to_i16(&mut scratch, pcm);
        if let Some(resampler) = self.resampler.as_mut() {
            if let Err(e) = resampler.append_pcm(&scratch) {
                warn!(error = %e, "resampler append failed");
                self.pcm_scratch = scratch;
                return;
            }
        } else {
            self.mic_pcm_buffer.extend_from_slice(&scratch);
        }
        self.pcm_scratch = scratch;

        self.forward_mic_frames(false).await;
    }

    async fn handle_mic_end(&mut self) {
        self.forward_mic_frames(true).await;

        let should_stop = self.listen_mode == "manual";
        if should_stop && self.listening {
            match self.upstream.send_listen_state("stop").await {
                Ok(()) => info!(session_id = %self.client_uid, "xiaozhi listen stop"),
                Err(e) => warn!(error = %e, "xiaozhi listen stop failed"),
            }
            self.listening = false;
        }
        info!(
            session_id = %self.client_uid,
            chunks = self.mic_chunk_count,
            bytes = self.mic_bytes,
            input_rate = self.last_mic_rate,
            input_channels = self.last_mic_channels,
            target_rate = self.sample_rate,
            target_channels = self.channels,
            "mic audio end"
        );
        self.mic_chunk_count = 0;
        self.mic_bytes = 0;

        self.ensure_conversation();
        if self.llm_text.is_empty() {
            self.send(ServerMessage::FullText {
                text: "Thinking...".to_string(),
            });
        }
        self.fsm.on_audio_commit();
    }

    fn handle_set_listen_mode(&mut self, mode: &str) {
        let mode = mode.trim();
        if mode.is_empty() {
            return;
        }
        match mode {
            "realtime" | "auto" | "manual" => {
                if self.listen_mode != mode {
                    info!(session_id = %self.client_uid, mode, "listen mode updated");
                }
                self.listen_mode = mode.to_string();
                self.fsm.set_mode(mode);
                self.upstream.set_listen_mode(mode);
            }
            _ => {
                warn!(session_id = %self.client_uid, mode, "invalid listen mode");
            }
        }
    }

    /// Нарезает накопленный микрофонный вход на кадры frame_samples * channels.
    fn drain_mic_frames(&mut self, flush: bool) -> Vec<Vec<i16>> {
        let mut frame_size = self.frame_samples * self.channels as usize;
        if frame_size == 0 {
            frame_size = 960 * self.channels.max(1) as usize;
        }

        let mut frames = Vec::new();
        if let Some(resampler) = self.resampler.as_mut() {
            if flush {
                if let Err(e) = resampler.flush() {
                    warn!(error = %e, "resampler flush failed");
                }
            }
            while let Some(frame) = resampler.pop_frame(frame_size) {
                frames.push(frame);
            }
            if flush {
                if let Some(frame) = resampler.pop_remainder_padded(frame_size) {
                    frames.push(frame);
                }
            }
            return frames;
        }

        while self.mic_pcm_buffer.len() >= frame_size {
            let rest = self.mic_pcm_buffer.split_off(frame_size);
            frames.push(std::mem::replace(&mut self.mic_pcm_buffer, rest));
        }
        if flush && !self.mic_pcm_buffer.is_empty() {
            frames.push(std::mem::take(&mut self.mic_pcm_buffer));
        }
        frames
    }

    async fn forward_mic_frames(&mut self, flush: bool) {
        let frames = self.drain_mic_frames(flush);
        let sent = frames.len();
        for frame in frames {
            self.send_pcm_frame(&frame).await;
        }
        if sent > 0 {
            debug!(session_id = %self.client_uid, frames = sent, "mic audio frames sent");
        }
    }

    async fn send_pcm_frame(&mut self, frame: &[i16]) {
        if frame.is_empty() {
            return;
        }
        if self.audio_format == "opus" {
            if self.opus_encoder.is_none() {
                match acquire_opus_encoder(self.sample_rate, self.channels, self.frame_duration) {
                    Ok(encoder) => self.opus_encoder = Some(encoder),
                    Err(e) => {
                        warn!(error = %e, "opus encoder init failed");
                        self.send_error(e.to_string());
                        return;
                    }
                }
            }
            let Some(encoder) = self.opus_encoder.as_mut() else {
                return;
            };
            let encoded = match encoder.encode_samples(frame) {
                Ok(encoded) => encoded,
                Err(e) => {
                    warn!(error = %e, "opus encode failed");
                    self.send_error(e.to_string());
                    return;
                }
            };
            if encoded.is_empty() {
                return;
            }
            if let Err(e) = self.upstream.send_audio(&encoded).await {
                warn!(error = %e, "xiaozhi send opus audio failed");
                self.send_error(e.to_string());
            }
            return;
        }

        let mut bytes = std::mem::take(&mut self.byte_scratch);
        i16_samples_to_bytes(&mut bytes, frame);
        if let Err(e) = self.upstream.send_audio(&bytes).await {
            warn!(error = %e, "xiaozhi send audio failed");
            self.send_error(e.to_string());
        }
        self.byte_scratch = bytes;
    }

    // ------------------------------------------------------------------
    // Бэкенд -> клиент
    // ------------------------------------------------------------------

    pub async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Stt { text } => {
                debug!(session_id = %self.client_uid, chars = text.len(), "xiaozhi stt");
                self.send(ServerMessage::UserInputTranscription { text });
            }
            Event::Llm { text, state } => {
                debug!(
                    session_id = %self.client_uid,
                    state = %state,
                    chars = text.len(),
                    "xiaozhi llm"
                );
                self.ensure_conversation();
                self.apply_llm_text(&text, &state);
            }
            Event::Text { text } => {
                debug!(session_id = %self.client_uid, chars = text.len(), "xiaozhi text");
                self.ensure_conversation();
                self.llm_text = text;
                self.send(ServerMessage::FullText {
                    text: self.llm_text.clone(),
                });
            }
            Event::Tts { state, text } => {
                debug!(
                    session_id = %self.client_uid,
                    state = %state,
                    chars = text.len(),
                    "xiaozhi tts"
                );
                self.handle_tts(&state, &text).await;
            }
            Event::Mcp { payload } => {
                debug!(session_id = %self.client_uid, "xiaozhi mcp");
                self.mcp.handle_mcp(payload).await;
            }
            Event::Goodbye => {
                self.send_error("xiaozhi backend disconnected");
                self.end_conversation();
            }
            Event::Audio(frame) => self.handle_audio(frame),
            Event::Connected => self.handle_upstream_connected().await,
            Event::Disconnected { error } => {
                self.listening = false;
                warn!(
                    session_id = %self.client_uid,
                    error = %error,
                    "xiaozhi disconnected, reset local listen state"
                );
            }
            Event::Error { message } => {
                warn!(session_id = %self.client_uid, error = %message, "xiaozhi error");
            }
        }
    }

    /// После (пере)подключения прослушивание взводится заново:
    /// manual ждет действия пользователя, остальные режимы стартуют сразу.
    async fn handle_upstream_connected(&mut self) {
        self.listening = false;
        if self.listen_mode == "manual" {
            info!(
                session_id = %self.client_uid,
                "xiaozhi reconnected, manual mode waits for mic trigger"
            );
            return;
        }
        if let Err(e) = self.upstream.send_listen_state("start").await {
            warn!(
                session_id = %self.client_uid,
                mode = %self.listen_mode,
                error = %e,
                "xiaozhi listen start on reconnect failed"
            );
            return;
        }
        self.listening = true;
        self.fsm.on_listen_start();
        info!(
            session_id = %self.client_uid,
            mode = %self.listen_mode,
            "xiaozhi reconnected and listen primed"
        );
    }

    fn apply_llm_text(&mut self, text: &str, state: &str) {
        if state == "stream" {
            self.llm_text.push_str(text);
        } else {
            self.llm_text = text.to_string();
        }
        self.send(ServerMessage::FullText {
            text: self.llm_text.clone(),
        });
    }

    async fn handle_tts(&mut self, state: &str, text: &str) {
        match state {
            "sentence_start" => {
                if text.is_empty() {
                    return;
                }
                self.ensure_conversation();
                self.llm_text.push_str(text);
                self.send(ServerMessage::FullText {
                    text: self.llm_text.clone(),
                });
            }
            "start" => {
                self.ensure_conversation();
                self.tts_active = true;
                self.display_sent = false;
                self.tts_buffer.clear();
                self.tts_sample_rate = 0;
                self.tts_channels = 0;
                self.tts_chunk_count = 0;
                self.tts_bytes = 0;
                self.last_tts_log = Some(Instant::now());
                self.fsm.on_tts_start();
                info!(session_id = %self.client_uid, "tts start");
                if self.llm_text.is_empty() {
                    self.send(ServerMessage::FullText {
                        text: "Thinking...".to_string(),
                    });
                }
            }
            "stop" => {
                self.tts_active = false;
                self.flush_tts_audio(true);
                self.send(ServerMessage::BackendSynthComplete);
                info!(
                    session_id = %self.client_uid,
                    chunks = self.tts_chunk_count,
                    bytes = self.tts_bytes,
                    sample_rate = self.tts_sample_rate,
                    channels = self.tts_channels,
                    "tts stop"
                );
                // auto режим заново взводит прослушивание после каждой TTS
                // реплики, а не на каждый сегмент микрофона
                if self.listen_mode == "auto" {
                    match self.upstream.send_listen_state("start").await {
                        Ok(()) => {
                            self.listening = true;
                            info!(
                                session_id = %self.client_uid,
                                "xiaozhi listen start after tts stop"
                            );
                        }
                        Err(e) => {
                            self.listening = false;
                            warn!(
                                session_id = %self.client_uid,
                                error = %e,
                                "xiaozhi listen start after tts stop failed"
                            );
                        }
                    }
                }
                self.fsm.on_tts_stop();
                self.end_conversation();
            }
            _ => {}
        }
    }

    fn handle_audio(&mut self, frame: AudioFrame) {
        if !self.tts_active || frame.pcm.is_empty() {
            return;
        }
        if self.tts_sample_rate == 0 {
            self.tts_sample_rate = frame.sample_rate;
            self.tts_channels = frame.channels;
        } else if self.tts_sample_rate != frame.sample_rate
            || self.tts_channels != frame.channels
        {
            // Формат сменился посреди потока: остаток уходит в старом формате
            self.flush_tts_audio(true);
            self.tts_sample_rate = frame.sample_rate;
            self.tts_channels = frame.channels;
        }
        self.tts_buffer.extend_from_slice(&frame.pcm);
        self.flush_tts_audio(false);
    }

    fn flush_tts_audio(&mut self, final_flush: bool) {
        if self.tts_buffer.is_empty() {
            return;
        }
        let sample_rate = self.tts_sample_rate;
        let channels = self.tts_channels;
        if sample_rate == 0 || channels == 0 {
            return;
        }
        let mut chunk_frames = (sample_rate * TTS_CHUNK_DURATION_MS / 1000) as usize;
        if chunk_frames == 0 {
            chunk_frames = (self.tts_buffer.len() / 2) / channels as usize;
        }
        let chunk_bytes = chunk_frames * channels as usize * 2;
        if chunk_bytes == 0 {
            return;
        }
        while self.tts_buffer.len() >= chunk_bytes {
            let rest = self.tts_buffer.split_off(chunk_bytes);
            let chunk = std::mem::replace(&mut self.tts_buffer, rest);
            self.send_audio_chunk(&chunk, sample_rate, channels);
        }
        if final_flush && !self.tts_buffer.is_empty() {
            let chunk = std::mem::take(&mut self.tts_buffer);
            self.send_audio_chunk(&chunk, sample_rate, channels);
        }
    }

    fn send_audio_chunk(&mut self, pcm: &[u8], sample_rate: u32, channels: u32) {
        let frames = (pcm.len() / 2) / channels.max(1) as usize;
        let mut slice_length = self.frame_duration;
        if sample_rate > 0 && frames > 0 {
            slice_length = ((frames as f64 * 1000.0) / sample_rate as f64).round() as u32;
        }
        if slice_length == 0 {
            slice_length = self.frame_duration;
        }
        // Огибающая громкости режется локальной длительностью кадра,
        // даже если сервер объявил свою
        let volumes = compute_volumes(pcm, sample_rate, channels, self.frame_duration);
        let display_text = if self.display_sent {
            None
        } else {
            self.build_display_text()
        };

        self.send(ServerMessage::Audio {
            audio_pcm: BASE64.encode(pcm),
            audio_format: "pcm16".to_string(),
            audio_sample_rate: sample_rate,
            audio_channels: channels,
            volumes,
            slice_length,
            display_text,
            actions: None,
            forwarded: false,
        });
        self.display_sent = true;

        self.tts_chunk_count += 1;
        self.tts_bytes += pcm.len() as u64;
        let now = Instant::now();
        if self
            .last_tts_log
            .map_or(true, |last| now.duration_since(last) >= STATS_LOG_INTERVAL)
        {
            self.last_tts_log = Some(now);
            info!(
                session_id = %self.client_uid,
                chunks = self.tts_chunk_count,
                bytes = self.tts_bytes,
                sample_rate,
                channels,
                "tts audio stats"
            );
            self.tts_chunk_count = 0;
            self.tts_bytes = 0;
        }
    }

    fn build_display_text(&self) -> Option<DisplayText> {
        if self.llm_text.is_empty() {
            return None;
        }
        Some(DisplayText {
            text: self.llm_text.clone(),
            name: String::new(),
            avatar: String::new(),
        })
    }

    // ------------------------------------------------------------------
    // Жизненный цикл диалога
    // ------------------------------------------------------------------

    fn ensure_conversation(&mut self) {
        if self.in_conversation {
            return;
        }
        self.in_conversation = true;
        self.llm_text.clear();
        self.tts_buffer.clear();
        self.tts_sample_rate = 0;
        self.tts_channels = 0;
        self.fsm.on_conversation_start();
        self.send(ServerMessage::Control {
            text: "conversation-chain-start".to_string(),
        });
    }

    fn end_conversation(&mut self) {
        if !self.in_conversation {
            return;
        }
        self.in_conversation = false;
        self.tts_active = false;
        self.display_sent = false;
        self.llm_text.clear();
        self.tts_buffer.clear();
        self.tts_sample_rate = 0;
        self.tts_channels = 0;
        self.send(ServerMessage::Control {
            text: "conversation-chain-end".to_string(),
        });
    }

    // ------------------------------------------------------------------
    // Конфигурации, история, группы
    // ------------------------------------------------------------------

    pub fn send_model_and_conf(&self) {
        let model_info = match config::load_model_info(
            &self.live2d_model_name,
            &self.app.config.storage.model_dict_path,
        ) {
            Ok(info) => info,
            Err(e) => {
                self.send_error(e.to_string());
                return;
            }
        };
        self.send(ServerMessage::SetModelAndConf {
            model_info,
            conf_name: self.conf_name.clone(),
            conf_uid: self.conf_uid.clone(),
            client_uid: self.client_uid.clone(),
        });
    }

    fn handle_fetch_configs(&self) {
        let active = CharacterConfig {
            conf_name: self.conf_name.clone(),
            conf_uid: self.conf_uid.clone(),
            live2d_model_name: self.live2d_model_name.clone(),
            character_name: self.character_name.clone(),
            avatar: self.avatar.clone(),
        };
        let configs =
            config::scan_config_files(&active, &self.app.config.storage.config_alts_dir);
        self.send(ServerMessage::ConfigFiles { configs });
    }

    fn handle_switch_config(&mut self, filename: &str) {
        if filename.is_empty() {
            return;
        }
        let character = if filename == "default" {
            self.app.config.character.clone()
        } else {
            let base = std::path::Path::new(filename)
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default();
            let path = self.app.config.storage.config_alts_dir.join(base);
            match config::read_character_config(&path) {
                Ok(character) => character,
                Err(e) => {
                    self.send_error(e.to_string());
                    return;
                }
            }
        };

        // Смена персонажа обрывает текущий диалог
        self.end_conversation();
        self.conf_name = character.conf_name;
        self.conf_uid = character.conf_uid;
        self.live2d_model_name = character.live2d_model_name;
        self.character_name = character.character_name;
        self.avatar = character.avatar;
        self.history_uid.clear();

        self.send_model_and_conf();
        self.send(ServerMessage::ConfigSwitched);
    }

    fn handle_fetch_backgrounds(&self) {
        let files = config::scan_backgrounds(&self.app.config.storage.backgrounds_dir);
        self.send(ServerMessage::BackgroundFiles { files });
    }

    fn handle_history_list(&self) {
        let histories = self.app.history.list(&self.conf_uid);
        self.send(ServerMessage::HistoryList { histories });
    }

    fn handle_fetch_history(&mut self, history_uid: &str) {
        if history_uid.is_empty() {
            return;
        }
        match self.app.history.get(&self.conf_uid, history_uid) {
            Ok(messages) => {
                self.history_uid = history_uid.to_string();
                self.send(ServerMessage::HistoryData { messages });
            }
            Err(e) => self.send_error(e.to_string()),
        }
    }

    fn handle_create_history(&mut self) {
        match self.app.history.create(&self.conf_uid) {
            Ok(history_uid) => {
                self.history_uid = history_uid.clone();
                self.send(ServerMessage::NewHistoryCreated { history_uid });
            }
            Err(e) => self.send_error(e.to_string()),
        }
    }

    fn handle_delete_history(&mut self, history_uid: &str) {
        if history_uid.is_empty() {
            return;
        }
        let success = self.app.history.delete(&self.conf_uid, history_uid);
        self.send(ServerMessage::HistoryDeleted {
            success,
            history_uid: history_uid.to_string(),
        });
        if success && self.history_uid == history_uid {
            self.history_uid.clear();
        }
    }

    async fn handle_add_to_group(&self, invitee_uid: &str) {
        if invitee_uid.is_empty() {
            return;
        }
        let result = self.app.groups.add_client(&self.client_uid, invitee_uid).await;
        self.send(ServerMessage::GroupOperationResult {
            success: result.success,
            message: result.message,
        });
        if result.success {
            broadcast_group_update(&self.app, &result.members).await;
        }
    }

    async fn handle_remove_from_group(&self, target_uid: &str) {
        if target_uid.is_empty() {
            return;
        }
        let result = self
            .app
            .groups
            .remove_client_from_group(&self.client_uid, target_uid)
            .await;
        self.send(ServerMessage::GroupOperationResult {
            success: result.success,
            message: result.message,
        });
        if result.success {
            broadcast_group_update(&self.app, &result.members).await;
        }
    }
}

fn first_positive(value: u32, fallback: u32, default: u32) -> u32 {
    if value > 0 {
        return value;
    }
    if fallback > 0 {
        return fallback;
    }
    default
}

/// Огибающая громкости чанка: RMS по под-срезам длиной
/// sample_rate * frame_duration / 1000 кадров, нормированная к максимуму 1.0.
fn compute_volumes(pcm: &[u8], sample_rate: u32, channels: u32, frame_duration: u32) -> Vec<f64> {
    if pcm.is_empty() || sample_rate == 0 || channels == 0 {
        return Vec::new();
    }
    let samples = pcm.len() / 2;
    if samples == 0 {
        return Vec::new();
    }
    let frames = samples / channels as usize;
    if frames == 0 {
        return Vec::new();
    }
    let mut chunk_size = (sample_rate * frame_duration / 1000) as usize;
    if chunk_size == 0 {
        chunk_size = frames;
    }

    let mut volumes = Vec::with_capacity((frames + chunk_size - 1) / chunk_size);
    let mut start = 0;
    while start < frames {
        let end = (start + chunk_size).min(frames);
        volumes.push(rms_pcm(pcm, channels, start, end));
        start = end;
    }

    let max_volume = volumes.iter().cloned().fold(0.0f64, f64::max);
    if max_volume == 0.0 {
        return volumes;
    }
    for volume in volumes.iter_mut() {
        *volume /= max_volume;
    }
    volumes
}

fn rms_pcm(pcm: &[u8], channels: u32, start_frame: usize, end_frame: usize) -> f64 {
    if start_frame >= end_frame {
        return 0.0;
    }
    let mut sum = 0.0f64;
    let mut count = 0usize;
    for frame in start_frame..end_frame {
        for ch in 0..channels as usize {
            let idx = (frame * channels as usize + ch) * 2;
            if idx + 2 > pcm.len() {
                return finalize_rms(sum, count);
            }
            let sample = i16::from_le_bytes([pcm[idx], pcm[idx + 1]]) as f64;
            sum += sample * sample;
            count += 1;
        }
    }
    finalize_rms(sum, count)
}

fn finalize_rms(sum: f64, count: usize) -> f64 {
    if count == 0 {
        return 0.0;
    }
    (sum / count as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::group::GroupManager;
    use crate::storage::HistoryStore;
    use crate::websocket::SessionRegistry;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        session: Session,
        out_rx: mpsc::UnboundedReceiver<ServerMessage>,
        _events: mpsc::UnboundedSender<Event>,
        _dir: TempDir,
    }

    fn fixture_with(audio_format: &str, listen_mode: &str) -> Fixture {
        let dir = TempDir::new().expect("tempdir");
        let mut config = Config::default();
        config.xiaozhi.audio_format = audio_format.to_string();
        config.xiaozhi.listen_mode = listen_mode.to_string();
        config.storage.chat_history_dir = dir.path().join("chat");
        config.storage.model_dict_path = dir.path().join("model_dict.json");
        std::fs::write(
            &config.storage.model_dict_path,
            r#"[{"name":"mio","url":"/live2d/mio.model3.json"}]"#,
        )
        .expect("write model dict");
        config.character.live2d_model_name = "mio".to_string();
        config.character.conf_name = "mio".to_string();
        config.character.conf_uid = "mio".to_string();

        let history = Arc::new(HistoryStore::new(&config.storage.chat_history_dir));
        let app = AppState {
            config,
            groups: Arc::new(GroupManager::new()),
            registry: Arc::new(SessionRegistry::new()),
            history,
        };

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ev_tx, _ev_rx) = mpsc::unbounded_channel();
        let upstream = Client::new(crate::xiaozhi::Config::default(), ev_tx.clone());
        let mcp = McpBridge::new(
            "device-test".to_string(),
            "client-test".to_string(),
            out_tx.clone(),
            upstream.clone(),
        );
        let session = Session::new(app, out_tx, upstream, mcp, "uid-1".to_string());
        Fixture {
            session,
            out_rx,
            _events: ev_tx,
            _dir: dir,
        }
    }

    fn drain(out_rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = out_rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    #[test]
    fn test_compute_volumes_lengths_and_bounds() {
        // 600 мс @16k mono, под-срез 20 мс -> 30 значений
        let pcm: Vec<u8> = (0..9600i32)
            .flat_map(|i| (((i % 300) * 100 - 15000) as i16).to_le_bytes())
            .collect();
        let volumes = compute_volumes(&pcm, 16000, 1, 20);
        assert_eq!(volumes.len(), 30);
        assert!(volumes.iter().all(|&v| (0.0..=1.0).contains(&v)));
        assert!(volumes.iter().any(|&v| (v - 1.0).abs() < f64::EPSILON));
    }

    #[test]
    fn test_compute_volumes_silence_stays_zero() {
        let pcm = vec![0u8; 9600];
        let volumes = compute_volumes(&pcm, 16000, 1, 20);
        assert!(!volumes.is_empty());
        assert!(volumes.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_compute_volumes_partial_tail() {
        // 25 мс @16k: 400 кадров -> срезы 320 + 80
        let pcm = vec![1u8; 800];
        let volumes = compute_volumes(&pcm, 16000, 1, 20);
        assert_eq!(volumes.len(), 2);
    }

    #[tokio::test]
    async fn test_tts_chunking_two_seconds() {
        let mut fx = fixture_with("pcm16", "manual");
        fx.session
            .handle_event(Event::Tts {
                state: "start".to_string(),
                text: String::new(),
            })
            .await;
        fx.session
            .handle_event(Event::Tts {
                state: "sentence_start".to_string(),
                text: "Hello!".to_string(),
            })
            .await;
        fx.session
            .handle_event(Event::Audio(AudioFrame {
                pcm: vec![1u8; 64000],
                sample_rate: 16000,
                channels: 1,
            }))
            .await;
        fx.session
            .handle_event(Event::Tts {
                state: "stop".to_string(),
                text: String::new(),
            })
            .await;

        let messages = drain(&mut fx.out_rx);
        let audio: Vec<&ServerMessage> = messages
            .iter()
            .filter(|m| matches!(m, ServerMessage::Audio { .. }))
            .collect();
        assert_eq!(audio.len(), 7);

        // display_text только на первом чанке
        for (i, message) in audio.iter().enumerate() {
            if let ServerMessage::Audio {
                display_text,
                audio_sample_rate,
                audio_channels,
                ..
            } = message
            {
                assert_eq!(*audio_sample_rate, 16000);
                assert_eq!(*audio_channels, 1);
                if i == 0 {
                    assert_eq!(
                        display_text.as_ref().expect("first chunk display").text,
                        "Hello!"
                    );
                } else {
                    assert!(display_text.is_none());
                }
            }
        }

        // Суммарный PCM равен входному потоку
        let total: usize = audio
            .iter()
            .map(|m| match m {
                ServerMessage::Audio { audio_pcm, .. } => {
                    BASE64.decode(audio_pcm).expect("decode").len()
                }
                _ => 0,
            })
            .sum();
        assert_eq!(total, 64000);

        assert!(messages
            .iter()
            .any(|m| matches!(m, ServerMessage::BackendSynthComplete)));
        let starts = messages
            .iter()
            .filter(|m| {
                matches!(m, ServerMessage::Control { text } if text == "conversation-chain-start")
            })
            .count();
        let ends = messages
            .iter()
            .filter(|m| {
                matches!(m, ServerMessage::Control { text } if text == "conversation-chain-end")
            })
            .count();
        assert_eq!(starts, 1);
        assert_eq!(ends, 1);
    }

    #[tokio::test]
    async fn test_audio_dropped_when_tts_inactive() {
        let mut fx = fixture_with("pcm16", "manual");
        fx.session
            .handle_event(Event::Audio(AudioFrame {
                pcm: vec![1u8; 9600],
                sample_rate: 16000,
                channels: 1,
            }))
            .await;
        assert!(drain(&mut fx.out_rx).is_empty());
    }

    #[tokio::test]
    async fn test_format_switch_flushes_before_new_rate() {
        let mut fx = fixture_with("pcm16", "manual");
        fx.session
            .handle_event(Event::Tts {
                state: "start".to_string(),
                text: String::new(),
            })
            .await;
        drain(&mut fx.out_rx);

        fx.session
            .handle_event(Event::Audio(AudioFrame {
                pcm: vec![1u8; 4000],
                sample_rate: 16000,
                channels: 1,
            }))
            .await;
        fx.session
            .handle_event(Event::Audio(AudioFrame {
                pcm: vec![2u8; 4000],
                sample_rate: 24000,
                channels: 1,
            }))
            .await;

        let messages = drain(&mut fx.out_rx);
        let rates: Vec<u32> = messages
            .iter()
            .filter_map(|m| match m {
                ServerMessage::Audio {
                    audio_sample_rate, ..
                } => Some(*audio_sample_rate),
                _ => None,
            })
            .collect();
        // Хвост на 16k ушел до переключения на 24k
        assert_eq!(rates, vec![16000]);
        assert_eq!(fx.session.tts_sample_rate, 24000);
    }

    #[tokio::test]
    async fn test_mic_end_announces_thinking_and_commits() {
        let mut fx = fixture_with("pcm16", "manual");
        fx.session.handle_incoming(ClientMessage::MicAudioEnd).await;

        let messages = drain(&mut fx.out_rx);
        assert!(messages.iter().any(|m| {
            matches!(m, ServerMessage::Control { text } if text == "conversation-chain-start")
        }));
        assert!(messages
            .iter()
            .any(|m| matches!(m, ServerMessage::FullText { text } if text == "Thinking...")));
        assert_eq!(
            fx.session.fsm.state(),
            crate::websocket::fsm::State::ProcessingAsr
        );
    }

    #[tokio::test]
    async fn test_mic_frames_sliced_without_resampling() {
        let mut fx = fixture_with("pcm16", "manual");
        fx.session.listening = true; // без живого бэкенда listen:start не пройдет

        // 3.5 кадра по 320 samples
        let pcm: Vec<u8> = vec![1u8; 320 * 2 * 3 + 320];
        let mut scratch = Vec::new();
        pcm_bytes_to_i16(&mut scratch, &pcm);
        fx.session.mic_pcm_buffer.extend_from_slice(&scratch);

        let frames = fx.session.drain_mic_frames(false);
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.len() == 320));

        let frames = fx.session.drain_mic_frames(true);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 160);
    }

    #[tokio::test]
    async fn test_mic_frames_with_resampler_flush_pads() {
        let mut fx = fixture_with("pcm16", "manual");
        fx.session.listening = true;
        fx.session.input_sample_rate = 48000;
        fx.session.resampler = Some(StreamResampler::new(48000, 16000).expect("resampler"));

        // 100 кадров по 960 samples @48k -> ~32000 samples @16k -> 100 кадров по 320
        let samples: Vec<i16> = (0..960 * 100).map(|i| (i % 2000) as i16).collect();
        fx.session
            .resampler
            .as_mut()
            .expect("resampler")
            .append_pcm(&samples)
            .expect("append");

        let mut total = fx.session.drain_mic_frames(false).len();
        total += fx.session.drain_mic_frames(true).len();
        // 96000 входных samples -> 32000 выходных = ровно 100 кадров,
        // плюс возможный хвост задержки фильтра
        assert!(
            (100..=102).contains(&total),
            "frames={} expected around 100",
            total
        );
    }

    #[tokio::test]
    async fn test_unsupported_audio_format_errors_once() {
        let mut fx = fixture_with("mp3", "manual");
        fx.session.listening = true;

        let pcm = BASE64.encode(vec![1u8; 640]);
        fx.session
            .handle_incoming(ClientMessage::MicAudioData {
                audio: Vec::new(),
                audio_pcm: pcm.clone(),
                audio_sample_rate: 16000,
                audio_channels: 1,
            })
            .await;
        fx.session
            .handle_incoming(ClientMessage::MicAudioData {
                audio: Vec::new(),
                audio_pcm: pcm,
                audio_sample_rate: 16000,
                audio_channels: 1,
            })
            .await;

        let errors = drain(&mut fx.out_rx)
            .into_iter()
            .filter(|m| matches!(m, ServerMessage::Error { .. }))
            .count();
        assert_eq!(errors, 1);
    }

    #[tokio::test]
    async fn test_set_listen_mode_validation() {
        let mut fx = fixture_with("pcm16", "auto");
        fx.session.handle_set_listen_mode("manual");
        assert_eq!(fx.session.listen_mode, "manual");
        fx.session.handle_set_listen_mode("bogus");
        assert_eq!(fx.session.listen_mode, "manual");
        fx.session.handle_set_listen_mode("");
        assert_eq!(fx.session.listen_mode, "manual");
    }

    #[tokio::test]
    async fn test_goodbye_ends_conversation() {
        let mut fx = fixture_with("pcm16", "auto");
        fx.session.ensure_conversation();
        drain(&mut fx.out_rx);

        fx.session.handle_event(Event::Goodbye).await;
        let messages = drain(&mut fx.out_rx);
        assert!(messages
            .iter()
            .any(|m| matches!(m, ServerMessage::Error { .. })));
        assert!(messages.iter().any(|m| {
            matches!(m, ServerMessage::Control { text } if text == "conversation-chain-end")
        }));
        assert!(!fx.session.in_conversation);
    }

    #[tokio::test]
    async fn test_history_round_trip() {
        let mut fx = fixture_with("pcm16", "auto");
        fx.session.handle_incoming(ClientMessage::CreateNewHistory).await;
        let messages = drain(&mut fx.out_rx);
        let uid = messages
            .iter()
            .find_map(|m| match m {
                ServerMessage::NewHistoryCreated { history_uid } => Some(history_uid.clone()),
                _ => None,
            })
            .expect("history created");
        assert_eq!(fx.session.history_uid, uid);

        fx.session
            .handle_incoming(ClientMessage::DeleteHistory {
                history_uid: uid.clone(),
            })
            .await;
        let messages = drain(&mut fx.out_rx);
        assert!(messages.iter().any(|m| matches!(
            m,
            ServerMessage::HistoryDeleted { success: true, .. }
        )));
        assert!(fx.session.history_uid.is_empty());
    }

    #[tokio::test]
    async fn test_switch_config_ends_conversation_and_reannounces() {
        let mut fx = fixture_with("pcm16", "auto");
        fx.session.ensure_conversation();
        drain(&mut fx.out_rx);

        fx.session.handle_switch_config("default");
        let messages = drain(&mut fx.out_rx);
        assert!(messages.iter().any(|m| {
            matches!(m, ServerMessage::Control { text } if text == "conversation-chain-end")
        }));
        assert!(messages
            .iter()
            .any(|m| matches!(m, ServerMessage::SetModelAndConf { .. })));
        assert!(messages
            .iter()
            .any(|m| matches!(m, ServerMessage::ConfigSwitched)));
    }
}
