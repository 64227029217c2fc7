//! AudioHook wire protocol
//!
//! Binary frames carry packets of `[type, len(u24 BE), payload]`: type 0x01
//! is a JSON control command, 0x10 is media. Media payloads may carry a
//! header block (terminated by a blank line) whose values are JSON where
//! they parse, ahead of the raw audio. Text frames are bare JSON commands.
//! Outbound commands are 0x01-framed.

use serde_json::{Map, Value};

use crate::{Error, Result};

pub const PACKET_TYPE_COMMAND: u8 = 0x01;
pub const PACKET_TYPE_AUDIO: u8 = 0x10;
pub const MAX_PACKET_PAYLOAD: usize = 0xFF_FFFF;

/// One decoded packet from a binary frame
#[derive(Debug)]
pub enum Packet {
    Command(Value),
    Audio { headers: Map<String, Value>, audio: Vec<u8> },
    Unknown { packet_type: u8, size: usize },
}

/// Tolerant packet walk: stops at the first truncated or oversized packet
pub fn decode_packets(data: &[u8]) -> Vec<Packet> {
    let mut packets = Vec::new();
    let mut offset = 0usize;

    while offset + 4 <= data.len() {
        let packet_type = data[offset];
        let size = (usize::from(data[offset + 1]) << 16)
            | (usize::from(data[offset + 2]) << 8)
            | usize::from(data[offset + 3]);
        offset += 4;
        if size > MAX_PACKET_PAYLOAD || offset + size > data.len() {
            break;
        }
        let payload = &data[offset..offset + size];
        offset += size;

        match packet_type {
            PACKET_TYPE_COMMAND => {
                if let Ok(command) = serde_json::from_slice::<Value>(payload) {
                    packets.push(Packet::Command(command));
                }
            }
            PACKET_TYPE_AUDIO => {
                let (headers, audio) = parse_audio_frame(payload);
                packets.push(Packet::Audio {
                    headers,
                    audio: audio.to_vec(),
                });
            }
            other => packets.push(Packet::Unknown {
                packet_type: other,
                size,
            }),
        }
    }

    packets
}

/// Frame an outbound control command
pub fn encode_command(command: &Value) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(command)
        .map_err(|err| Error::Protocol(format!("command encode failed: {err}")))?;
    if payload.len() > MAX_PACKET_PAYLOAD {
        return Err(Error::Protocol("Command payload too large".to_string()));
    }
    let size = payload.len();
    let mut frame = Vec::with_capacity(4 + size);
    frame.push(PACKET_TYPE_COMMAND);
    frame.push(((size >> 16) & 0xFF) as u8);
    frame.push(((size >> 8) & 0xFF) as u8);
    frame.push((size & 0xFF) as u8);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Split a media payload into its header block and raw audio
pub fn parse_audio_frame(payload: &[u8]) -> (Map<String, Value>, &[u8]) {
    let (header_blob, audio) = match find_delimiter(payload, b"\r\n\r\n") {
        Some(position) => (&payload[..position], &payload[position + 4..]),
        None => match find_delimiter(payload, b"\n\n") {
            Some(position) => (&payload[..position], &payload[position + 2..]),
            None => return (Map::new(), payload),
        },
    };

    let mut headers = Map::new();
    for line in header_blob.split(|byte| *byte == b'\n') {
        let Ok(line) = std::str::from_utf8(line) else {
            continue;
        };
        let line = line.trim();
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_lowercase();
        let value = value.trim();
        if key.is_empty() {
            continue;
        }
        let parsed = serde_json::from_str::<Value>(value)
            .unwrap_or_else(|_| Value::String(value.to_string()));
        headers.insert(key, parsed);
    }

    (headers, audio)
}

fn find_delimiter(payload: &[u8], delimiter: &[u8]) -> Option<usize> {
    payload
        .windows(delimiter.len())
        .position(|window| window == delimiter)
}

/// Inbound control commands as tagged variants
#[derive(Debug)]
pub enum IngressCommand {
    Open {
        id: String,
        seq: i64,
        parameters: Value,
        media: Value,
    },
    Ping {
        id: String,
        seq: i64,
    },
    Event {
        id: String,
        seq: i64,
        event_type: String,
        parameters: Value,
    },
    Close {
        id: String,
        seq: i64,
    },
    Disconnect {
        id: String,
        seq: i64,
    },
    Error {
        id: String,
        seq: i64,
    },
    Other {
        command_type: String,
    },
}

pub fn parse_command(command: &Value) -> IngressCommand {
    let object = command.as_object();
    let field = |key: &str| -> String {
        object
            .and_then(|object| object.get(key))
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string()
    };
    let id = field("id");
    let seq = object
        .and_then(|object| object.get("seq"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let parameters = object
        .and_then(|object| object.get("parameters"))
        .cloned()
        .unwrap_or(Value::Null);

    match field("type").to_lowercase().as_str() {
        "open" => {
            // Offered media shows up either at the command root or inside parameters
            let media = object
                .and_then(|object| object.get("media"))
                .cloned()
                .or_else(|| parameters.get("media").cloned())
                .unwrap_or(Value::Null);
            IngressCommand::Open {
                id,
                seq,
                parameters,
                media,
            }
        }
        "ping" => IngressCommand::Ping { id, seq },
        "close" => IngressCommand::Close { id, seq },
        "disconnect" => IngressCommand::Disconnect { id, seq },
        "error" => IngressCommand::Error { id, seq },
        "event" => IngressCommand::Event {
            id,
            seq,
            event_type: {
                let explicit = field("eventType");
                if explicit.is_empty() {
                    field("subType")
                } else {
                    explicit
                }
            },
            parameters,
        },
        other => IngressCommand::Other {
            command_type: other.to_string(),
        },
    }
}

/// Media parameters extracted from an `open` offer or a media header block
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaDetails {
    pub format: String,
    pub rate: u32,
    pub channels: u16,
    pub channel_labels: Vec<String>,
}

pub fn extract_media_details(media: &Value) -> MediaDetails {
    let Some(object) = media.as_object() else {
        return MediaDetails::default();
    };

    let format = object
        .get("format")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_uppercase();
    let rate = object
        .get("rate")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;

    let mut channel_labels = Vec::new();
    let mut channels = 0u16;
    match object.get("channels") {
        Some(Value::Array(items)) => {
            for item in items {
                let label = match item {
                    Value::String(name) => name.trim().to_string(),
                    Value::Object(nested) => nested
                        .get("name")
                        .or_else(|| nested.get("channel"))
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .trim()
                        .to_string(),
                    _ => String::new(),
                };
                if !label.is_empty() {
                    channel_labels.push(label);
                }
            }
            channels = if channel_labels.is_empty() {
                items.len() as u16
            } else {
                channel_labels.len() as u16
            };
        }
        Some(Value::Number(count)) => {
            channels = count.as_u64().unwrap_or(0) as u16;
        }
        _ => {}
    }

    MediaDetails {
        format,
        rate,
        channels,
        channel_labels,
    }
}

/// Participant mapping when the offer does not label channels:
/// agent on the left channel, customer on the right.
pub fn default_channel_labels(channels: u16) -> Vec<String> {
    match channels {
        0 | 1 => vec!["mono".to_string()],
        2 => vec!["agent".to_string(), "customer".to_string()],
        more => (1..=more).map(|index| format!("ch{index}")).collect(),
    }
}

/// Pick from an offered media list: L16 16 kHz, then PCMU 8 kHz, then
/// PCMA 8 kHz, then whatever was offered first.
pub fn negotiate_media(offered: &Value, default_rate: u32, default_channels: u16) -> MediaDetails {
    const PREFERENCES: [(&str, u32); 3] = [("L16", 16_000), ("PCMU", 8_000), ("PCMA", 8_000)];

    let candidates: Vec<MediaDetails> = match offered {
        Value::Array(items) => items.iter().map(extract_media_details).collect(),
        Value::Object(_) => vec![extract_media_details(offered)],
        _ => Vec::new(),
    };
    let candidates: Vec<MediaDetails> = candidates
        .into_iter()
        .filter(|details| !details.format.is_empty())
        .collect();

    let mut chosen = PREFERENCES
        .iter()
        .find_map(|(format, rate)| {
            candidates
                .iter()
                .find(|details| details.format == *format && details.rate == *rate)
                .cloned()
        })
        .or_else(|| candidates.first().cloned())
        .unwrap_or_default();

    if chosen.format.is_empty() {
        chosen.format = "PCMU".to_string();
    }
    if chosen.rate == 0 {
        chosen.rate = default_rate;
    }
    if chosen.channels == 0 {
        chosen.channels = default_channels;
    }
    if chosen.channel_labels.is_empty() {
        chosen.channel_labels = default_channel_labels(chosen.channels);
    }
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_packet_round_trip() {
        let command = json!({"version": "2", "type": "pong", "id": "c-1", "seq": 4});
        let frame = encode_command(&command).unwrap();
        assert_eq!(frame[0], PACKET_TYPE_COMMAND);

        let packets = decode_packets(&frame);
        assert_eq!(packets.len(), 1);
        match &packets[0] {
            Packet::Command(decoded) => assert_eq!(decoded, &command),
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn test_audio_packet_with_header_block() {
        let mut payload = Vec::new();
        payload.extend_from_slice(b"media: {\"format\":\"PCMU\",\"rate\":8000}\r\n");
        payload.extend_from_slice(b"x-note: plain\r\n\r\n");
        payload.extend_from_slice(&[0xFF, 0x7F, 0x00]);

        let mut frame = vec![PACKET_TYPE_AUDIO, 0, 0, payload.len() as u8];
        frame.extend_from_slice(&payload);

        let packets = decode_packets(&frame);
        match &packets[0] {
            Packet::Audio { headers, audio } => {
                assert_eq!(headers["media"]["format"], json!("PCMU"));
                assert_eq!(headers["x-note"], json!("plain"));
                assert_eq!(audio, &vec![0xFF, 0x7F, 0x00]);
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn test_audio_without_headers_is_all_audio() {
        let samples = [0x01u8, 0x02, 0x03, 0x04];
        let mut frame = vec![PACKET_TYPE_AUDIO, 0, 0, samples.len() as u8];
        frame.extend_from_slice(&samples);

        match &decode_packets(&frame)[0] {
            Packet::Audio { headers, audio } => {
                assert!(headers.is_empty());
                assert_eq!(audio.as_slice(), &samples);
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn test_truncated_packet_stops_walk() {
        let frame = vec![PACKET_TYPE_AUDIO, 0, 0, 200, 1, 2, 3];
        assert!(decode_packets(&frame).is_empty());
    }

    #[test]
    fn test_multiple_packets_in_one_frame() {
        let mut frame = encode_command(&json!({"type": "ping", "id": "p", "seq": 1})).unwrap();
        frame.extend_from_slice(&[PACKET_TYPE_AUDIO, 0, 0, 2, 0xAA, 0xBB]);
        frame.extend_from_slice(&[0x42, 0, 0, 1, 0x00]);

        let packets = decode_packets(&frame);
        assert_eq!(packets.len(), 3);
        assert!(matches!(packets[2], Packet::Unknown { packet_type: 0x42, .. }));
    }

    #[test]
    fn test_parse_open_command() {
        let command = json!({
            "version": "2",
            "type": "open",
            "id": "open-1",
            "seq": 1,
            "parameters": {"conversationId": "conv-1"},
            "media": [{"type": "audio", "format": "PCMU", "rate": 8000}]
        });
        match parse_command(&command) {
            IngressCommand::Open { id, seq, media, .. } => {
                assert_eq!(id, "open-1");
                assert_eq!(seq, 1);
                assert!(media.is_array());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_negotiation_prefers_l16_at_16k() {
        let offered = json!([
            {"type": "audio", "format": "PCMA", "rate": 8000, "channels": ["external", "internal"]},
            {"type": "audio", "format": "L16", "rate": 16000, "channels": ["external", "internal"]},
            {"type": "audio", "format": "PCMU", "rate": 8000, "channels": ["external", "internal"]}
        ]);
        let chosen = negotiate_media(&offered, 16_000, 1);
        assert_eq!(chosen.format, "L16");
        assert_eq!(chosen.rate, 16_000);
        assert_eq!(chosen.channels, 2);
    }

    #[test]
    fn test_negotiation_falls_back_to_first_offer() {
        let offered = json!([{"type": "audio", "format": "OPUS", "rate": 48000, "channels": 1}]);
        let chosen = negotiate_media(&offered, 16_000, 1);
        assert_eq!(chosen.format, "OPUS");
        assert_eq!(chosen.rate, 48_000);
    }

    #[test]
    fn test_negotiation_defaults_when_nothing_offered() {
        let chosen = negotiate_media(&Value::Null, 16_000, 1);
        assert_eq!(chosen.format, "PCMU");
        assert_eq!(chosen.rate, 16_000);
        assert_eq!(chosen.channels, 1);
        assert_eq!(chosen.channel_labels, vec!["mono".to_string()]);
    }

    #[test]
    fn test_dual_channel_default_labels_map_agent_left() {
        assert_eq!(
            default_channel_labels(2),
            vec!["agent".to_string(), "customer".to_string()]
        );
    }
}
