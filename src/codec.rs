//! Audio codec decoders
//!
//! Stateless mappings from codec-tagged byte buffers to signed 16-bit
//! little-endian PCM, plus minimal RIFF/WAVE parse and render. G.711
//! expansion follows the ITU formulation (µ=255 with bias 0x84, A-law with
//! the 0x55 toggle); L16 payloads are treated as big-endian per RFC 3551.

use crate::{Error, Result};

const MU_LAW_BIAS: i32 = 0x84;

/// Wire encodings accepted on the audio ingest paths
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioEncoding {
    /// Already signed 16-bit little-endian PCM
    PcmS16le,
    /// RIFF/WAVE container carrying 16-bit PCM
    Wav,
    /// G.711 µ-law, one byte per sample
    Pcmu,
    /// G.711 A-law, one byte per sample
    Pcma,
    /// Raw 16-bit PCM, big-endian on the wire
    L16,
}

impl AudioEncoding {
    /// Case-insensitive tag parse covering the aliases providers actually send
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "pcm_s16le" | "pcm16" | "s16le" | "l16le" => Some(AudioEncoding::PcmS16le),
            "wav" | "wave" | "audio/wav" | "audio/x-wav" => Some(AudioEncoding::Wav),
            "pcmu" | "mulaw" | "mu-law" | "ulaw" => Some(AudioEncoding::Pcmu),
            "pcma" | "alaw" | "a-law" => Some(AudioEncoding::Pcma),
            "l16" | "linear16" | "pcm_s16be" | "s16be" => Some(AudioEncoding::L16),
            _ => None,
        }
    }
}

/// Decode a codec frame to S16LE PCM. WAV is a container, not a frame
/// encoding; route it through [`parse_wav`] instead.
pub fn decode_frames(encoding: AudioEncoding, data: &[u8]) -> Result<Vec<u8>> {
    match encoding {
        AudioEncoding::PcmS16le => Ok(trim_to_even(data).to_vec()),
        AudioEncoding::Pcmu => Ok(expand_g711(data, mu_law_to_linear)),
        AudioEncoding::Pcma => Ok(expand_g711(data, a_law_to_linear)),
        AudioEncoding::L16 => Ok(byteswap_16(trim_to_even(data))),
        AudioEncoding::Wav => Err(Error::Decode(
            "WAV payloads must be parsed as a container".to_string(),
        )),
    }
}

fn expand_g711(data: &[u8], expand: fn(u8) -> i16) -> Vec<u8> {
    let mut pcm = Vec::with_capacity(data.len() * 2);
    for &byte in data {
        pcm.extend_from_slice(&expand(byte).to_le_bytes());
    }
    pcm
}

fn trim_to_even(data: &[u8]) -> &[u8] {
    if data.len() % 2 == 0 {
        data
    } else {
        &data[..data.len() - 1]
    }
}

fn byteswap_16(data: &[u8]) -> Vec<u8> {
    let mut swapped = Vec::with_capacity(data.len());
    for pair in data.chunks_exact(2) {
        swapped.push(pair[1]);
        swapped.push(pair[0]);
    }
    swapped
}

/// Expand one µ-law byte to a linear sample
pub fn mu_law_to_linear(encoded: u8) -> i16 {
    let value = !encoded;
    let exponent = u32::from((value >> 4) & 0x07);
    let mantissa = i32::from(value & 0x0F);
    let magnitude = (((mantissa << 3) + MU_LAW_BIAS) << exponent) - MU_LAW_BIAS;
    if value & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Expand one A-law byte to a linear sample
pub fn a_law_to_linear(encoded: u8) -> i16 {
    let value = encoded ^ 0x55;
    let exponent = u32::from((value >> 4) & 0x07);
    let mantissa = i32::from(value & 0x0F);
    let magnitude = if exponent == 0 {
        (mantissa << 4) + 8
    } else {
        ((mantissa << 4) + 0x108) << (exponent - 1)
    };
    // A-law stores 1 in the sign bit for positive samples
    if value & 0x80 != 0 {
        magnitude as i16
    } else {
        -magnitude as i16
    }
}

#[cfg(test)]
fn linear_to_mu_law(sample: i16) -> u8 {
    const CLIP: i32 = 32_635;
    let mut value = i32::from(sample);
    let sign: u8 = if value < 0 {
        value = -value;
        0x80
    } else {
        0
    };
    value = value.min(CLIP) + MU_LAW_BIAS;

    let mut exponent = 7u32;
    let mut mask = 0x4000;
    while exponent > 0 && value & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = ((value >> (exponent + 3)) & 0x0F) as u8;
    !(sign | ((exponent as u8) << 4) | mantissa)
}

#[cfg(test)]
fn linear_to_a_law(sample: i16) -> u8 {
    let mut ix = if sample < 0 {
        i32::from(!sample) >> 4
    } else {
        i32::from(sample) >> 4
    };
    if ix > 15 {
        let mut exponent = 1;
        while ix > 16 + 15 {
            ix >>= 1;
            exponent += 1;
        }
        ix = ix - 16 + (exponent << 4);
    }
    if sample >= 0 {
        ix |= 0x80;
    }
    (ix as u8) ^ 0x55
}

/// Parsed 16-bit PCM WAV container
#[derive(Debug, Clone)]
pub struct WavAudio {
    pub sample_rate: u32,
    pub channels: u16,
    pub pcm: Vec<u8>,
}

/// Parse a RIFF/WAVE blob: PCM format tag 1, 16 bits per sample.
pub fn parse_wav(data: &[u8]) -> Result<WavAudio> {
    let malformed = || Error::Decode("Unable to parse WAV audio chunk".to_string());

    if data.len() < 12 || &data[0..4] != b"RIFF" || &data[8..12] != b"WAVE" {
        return Err(malformed());
    }

    let mut format: Option<(u16, u16, u32, u16)> = None;
    let mut pcm: Option<Vec<u8>> = None;
    let mut offset = 12usize;

    while offset + 8 <= data.len() {
        let chunk_id = &data[offset..offset + 4];
        let chunk_size = u32::from_le_bytes([
            data[offset + 4],
            data[offset + 5],
            data[offset + 6],
            data[offset + 7],
        ]) as usize;
        offset += 8;
        let end = offset.checked_add(chunk_size).ok_or_else(malformed)?;
        if end > data.len() {
            return Err(malformed());
        }
        let body = &data[offset..end];

        match chunk_id {
            b"fmt " => {
                if body.len() < 16 {
                    return Err(malformed());
                }
                let audio_format = u16::from_le_bytes([body[0], body[1]]);
                let channels = u16::from_le_bytes([body[2], body[3]]);
                let sample_rate = u32::from_le_bytes([body[4], body[5], body[6], body[7]]);
                let bits_per_sample = u16::from_le_bytes([body[14], body[15]]);
                format = Some((audio_format, channels, sample_rate, bits_per_sample));
            }
            b"data" => {
                pcm = Some(body.to_vec());
            }
            _ => {}
        }

        // RIFF chunks are word-aligned
        offset = end + (chunk_size & 1);
    }

    let (audio_format, channels, sample_rate, bits_per_sample) = format.ok_or_else(malformed)?;
    if audio_format != 1 {
        return Err(Error::Decode(
            "WAV chunk must contain uncompressed PCM".to_string(),
        ));
    }
    if bits_per_sample != 16 {
        return Err(Error::Decode(
            "WAV chunk must use 16-bit PCM (sample_width=2)".to_string(),
        ));
    }
    if channels == 0 || sample_rate == 0 {
        return Err(malformed());
    }

    Ok(WavAudio {
        sample_rate,
        channels,
        pcm: pcm.ok_or_else(malformed)?,
    })
}

/// Emit a canonical 44-byte-header PCM WAV stream
pub fn write_wav(sample_rate: u32, channels: u16, pcm: &[u8]) -> Vec<u8> {
    const SAMPLE_WIDTH: u32 = 2;
    let byte_rate = sample_rate * u32::from(channels) * SAMPLE_WIDTH;
    let block_align = channels * SAMPLE_WIDTH as u16;
    let data_len = pcm.len() as u32;

    let mut out = Vec::with_capacity(44 + pcm.len());
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    out.extend_from_slice(pcm);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_parse_aliases() {
        assert_eq!(AudioEncoding::parse("PCMU"), Some(AudioEncoding::Pcmu));
        assert_eq!(AudioEncoding::parse("ulaw"), Some(AudioEncoding::Pcmu));
        assert_eq!(AudioEncoding::parse("A-Law"), Some(AudioEncoding::Pcma));
        assert_eq!(AudioEncoding::parse("L16"), Some(AudioEncoding::L16));
        assert_eq!(AudioEncoding::parse("l16le"), Some(AudioEncoding::PcmS16le));
        assert_eq!(AudioEncoding::parse("wav"), Some(AudioEncoding::Wav));
        assert_eq!(AudioEncoding::parse("opus"), None);
    }

    #[test]
    fn test_mu_law_round_trip_within_tolerance() {
        for &sample in &[0i16, 8, 500, 8192, 16384, 32767, -8, -500, -16384, -32768] {
            let decoded = mu_law_to_linear(linear_to_mu_law(sample));
            let error = (i32::from(sample) - i32::from(decoded)).abs();
            assert!(
                error <= 1024,
                "mu-law error too large: {sample} -> {decoded}"
            );
        }
    }

    #[test]
    fn test_mu_law_known_values() {
        // 0xFF encodes digital silence, 0x80/0x00 encode the extremes
        assert_eq!(mu_law_to_linear(0xFF), 0);
        assert_eq!(mu_law_to_linear(0x80), 32_124);
        assert_eq!(mu_law_to_linear(0x00), -32_124);
    }

    #[test]
    fn test_a_law_round_trip_within_tolerance() {
        for &sample in &[0i16, 16, 1000, 8192, 16384, 32767, -16, -1000, -16384, -32768] {
            let decoded = a_law_to_linear(linear_to_a_law(sample));
            let error = (i32::from(sample) - i32::from(decoded)).abs();
            assert!(error <= 1024, "a-law error too large: {sample} -> {decoded}");
        }
    }

    #[test]
    fn test_l16_decode_is_byteswapped_bit_exact() {
        let samples: Vec<i16> = vec![0, 1, -1, 12345, -12345, i16::MAX, i16::MIN];
        let mut wire = Vec::new();
        for sample in &samples {
            wire.extend_from_slice(&sample.to_be_bytes());
        }
        let decoded = decode_frames(AudioEncoding::L16, &wire).unwrap();
        for (index, sample) in samples.iter().enumerate() {
            let got = i16::from_le_bytes([decoded[index * 2], decoded[index * 2 + 1]]);
            assert_eq!(got, *sample);
        }
    }

    #[test]
    fn test_pcm_passthrough_trims_odd_tail() {
        let decoded = decode_frames(AudioEncoding::PcmS16le, &[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(decoded, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_wav_round_trip() {
        let pcm: Vec<u8> = (0..64).collect();
        let rendered = write_wav(8000, 1, &pcm);
        assert_eq!(rendered.len(), 44 + pcm.len());

        let parsed = parse_wav(&rendered).unwrap();
        assert_eq!(parsed.sample_rate, 8000);
        assert_eq!(parsed.channels, 1);
        assert_eq!(parsed.pcm, pcm);
    }

    #[test]
    fn test_wav_data_size_header_matches() {
        let pcm = vec![0u8; 320];
        let rendered = write_wav(16_000, 1, &pcm);
        let declared = u32::from_le_bytes([rendered[40], rendered[41], rendered[42], rendered[43]]);
        assert_eq!(declared as usize, pcm.len());
    }

    #[test]
    fn test_wav_rejects_compressed_or_wide_formats() {
        let mut rendered = write_wav(8000, 1, &[0u8; 16]);
        rendered[20] = 7; // format tag -> mu-law
        assert!(parse_wav(&rendered).is_err());

        let mut wide = write_wav(8000, 1, &[0u8; 16]);
        wide[34] = 24; // bits per sample
        assert!(parse_wav(&wide).is_err());
    }

    #[test]
    fn test_wav_rejects_garbage() {
        assert!(parse_wav(b"definitely not a wav").is_err());
    }
}
