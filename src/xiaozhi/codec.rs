//! Бинарный фрейминг XiaoZhi: три версии протокола

use anyhow::Result;

pub const VERSION1: u32 = 1;
pub const VERSION2: u32 = 2;
pub const VERSION3: u32 = 3;

const PAYLOAD_TYPE_AUDIO: u8 = 0;
const PAYLOAD_TYPE_CMD: u8 = 1;

const V2_HEADER_SIZE: usize = 16;
const V3_HEADER_SIZE: usize = 4;

/// Категория декодированного payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// Аудио байты
    Audio,
    /// JSON команда
    Command,
}

/// Приводит версию протокола к поддерживаемой. Неизвестные версии деградируют до 1.
pub fn normalize_version(version: u32) -> u32 {
    match version {
        VERSION2 | VERSION3 => version,
        _ => VERSION1,
    }
}

/// Разбирает бинарный кадр по версии протокола.
pub fn decode(version: u32, frame: &[u8]) -> Result<(&[u8], PayloadKind)> {
    match normalize_version(version) {
        VERSION2 => decode_v2(frame),
        VERSION3 => decode_v3(frame),
        _ => Ok((frame, PayloadKind::Audio)),
    }
}

/// Собирает бинарный кадр по версии протокола. Всегда помечает payload как аудио.
pub fn pack(version: u32, payload: &[u8]) -> Vec<u8> {
    match normalize_version(version) {
        VERSION2 => pack_v2(payload),
        VERSION3 => pack_v3(payload),
        _ => payload.to_vec(),
    }
}

fn decode_v2(frame: &[u8]) -> Result<(&[u8], PayloadKind)> {
    if frame.len() < V2_HEADER_SIZE {
        anyhow::bail!("xiaozhi binary v2 frame too short");
    }
    let msg_type = u16::from_be_bytes([frame[2], frame[3]]);
    let payload_size =
        u32::from_be_bytes([frame[12], frame[13], frame[14], frame[15]]) as usize;
    if payload_size > frame.len() - V2_HEADER_SIZE {
        anyhow::bail!("xiaozhi binary v2 invalid payload size");
    }
    let payload = &frame[V2_HEADER_SIZE..V2_HEADER_SIZE + payload_size];
    match msg_type {
        x if x == PAYLOAD_TYPE_AUDIO as u16 => Ok((payload, PayloadKind::Audio)),
        x if x == PAYLOAD_TYPE_CMD as u16 => Ok((payload, PayloadKind::Command)),
        _ => anyhow::bail!("xiaozhi binary v2 unsupported payload type"),
    }
}

fn decode_v3(frame: &[u8]) -> Result<(&[u8], PayloadKind)> {
    if frame.len() < V3_HEADER_SIZE {
        anyhow::bail!("xiaozhi binary v3 frame too short");
    }
    let msg_type = frame[0];
    let payload_size = u16::from_be_bytes([frame[2], frame[3]]) as usize;
    if payload_size > frame.len() - V3_HEADER_SIZE {
        anyhow::bail!("xiaozhi binary v3 invalid payload size");
    }
    let payload = &frame[V3_HEADER_SIZE..V3_HEADER_SIZE + payload_size];
    match msg_type {
        PAYLOAD_TYPE_AUDIO => Ok((payload, PayloadKind::Audio)),
        PAYLOAD_TYPE_CMD => Ok((payload, PayloadKind::Command)),
        _ => anyhow::bail!("xiaozhi binary v3 unsupported payload type"),
    }
}

fn pack_v2(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(V2_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&(VERSION2 as u16).to_be_bytes());
    frame.extend_from_slice(&(PAYLOAD_TYPE_AUDIO as u16).to_be_bytes());
    frame.extend_from_slice(&0u32.to_be_bytes());
    let timestamp = chrono::Utc::now().timestamp_millis() as u32;
    frame.extend_from_slice(&timestamp.to_be_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

fn pack_v3(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(V3_HEADER_SIZE + payload.len());
    frame.push(PAYLOAD_TYPE_AUDIO);
    frame.push(0);
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_decode_v2_audio() {
        let payload = [0x01u8, 0x02, 0x03, 0x04];
        let frame = pack(VERSION2, &payload);

        assert_eq!(frame.len(), 20);
        assert_eq!(&frame[0..2], &[0x00, 0x02]);
        assert_eq!(&frame[2..4], &[0x00, 0x00]);
        assert_eq!(&frame[12..16], &[0x00, 0x00, 0x00, 0x04]);

        let (got, kind) = decode(VERSION2, &frame).expect("decode v2");
        assert_eq!(kind, PayloadKind::Audio);
        assert_eq!(got, &payload);
    }

    #[test]
    fn test_pack_decode_v3_audio() {
        let payload = [0x09u8, 0x08, 0x07];
        let frame = pack(VERSION3, &payload);

        let (got, kind) = decode(VERSION3, &frame).expect("decode v3");
        assert_eq!(kind, PayloadKind::Audio);
        assert_eq!(got, &payload);
    }

    #[test]
    fn test_decode_v2_command_payload() {
        let payload = br#"{"type":"hello"}"#;
        let mut frame = vec![0u8; 16];
        frame[0..2].copy_from_slice(&(VERSION2 as u16).to_be_bytes());
        frame[2..4].copy_from_slice(&(PAYLOAD_TYPE_CMD as u16).to_be_bytes());
        frame[12..16].copy_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(payload);

        let (got, kind) = decode(VERSION2, &frame).expect("decode v2 cmd");
        assert_eq!(kind, PayloadKind::Command);
        assert_eq!(got, payload);
    }

    #[test]
    fn test_decode_v2_invalid_payload_size() {
        let mut frame = vec![0u8; 16];
        frame[0..2].copy_from_slice(&(VERSION2 as u16).to_be_bytes());
        frame[12..16].copy_from_slice(&10u32.to_be_bytes());

        assert!(decode(VERSION2, &frame).is_err());
    }

    #[test]
    fn test_decode_v2_frame_too_short() {
        assert!(decode(VERSION2, &[0u8; 8]).is_err());
        assert!(decode(VERSION3, &[0u8; 2]).is_err());
    }

    #[test]
    fn test_decode_v2_unsupported_payload_type() {
        let mut frame = vec![0u8; 16];
        frame[2..4].copy_from_slice(&7u16.to_be_bytes());
        assert!(decode(VERSION2, &frame).is_err());
    }

    #[test]
    fn test_unknown_version_degrades_to_v1() {
        let payload = [0xAAu8, 0xBB];
        assert_eq!(pack(0, &payload), payload.to_vec());
        assert_eq!(pack(9, &payload), payload.to_vec());

        let (got, kind) = decode(9, &payload).expect("decode as v1");
        assert_eq!(kind, PayloadKind::Audio);
        assert_eq!(got, &payload);
    }
}
