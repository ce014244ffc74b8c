//! # Frame Codec
//!
//! Pure conversion between raw sample buffers and the wire frame format used on the
//! remote agent channel.
//!
//! ## Wire Format:
//! - **Encoding**: 16-bit signed PCM, little-endian, interleaved
//! - **Transport wrapping**: standard base64 so the payload survives a JSON text message
//! - **Format tag**: `audio/pcm;rate=16000` (encoding plus sample rate)
//!
//! ## Quantization:
//! Samples in `[-1.0, 1.0]` are scaled by 32768, rounded to nearest and hard-clamped
//! to the i16 range. Out-of-range input saturates; it never wraps. Decoding divides
//! by 32768, so a round trip is accurate to within one quantization step.

use crate::error::DecodeError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::fmt;

const PCM_MIME: &str = "audio/pcm";
const I16_SCALE: f32 = 32768.0;

/// Sample encodings understood by the codec. The frame format is fixed, so there is one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleEncoding {
    Pcm16Le,
}

/// Describes the samples inside a wire frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameFormat {
    pub encoding: SampleEncoding,
    pub sample_rate: u32,
    pub channels: u16,
}

impl FrameFormat {
    pub fn pcm16(sample_rate: u32, channels: u16) -> Self {
        Self {
            encoding: SampleEncoding::Pcm16Le,
            sample_rate,
            channels,
        }
    }

    /// The format tag sent next to every outbound payload.
    pub fn mime_type(&self) -> String {
        format!("{};rate={}", PCM_MIME, self.sample_rate)
    }

    /// Extract the sample rate declared by an inbound format tag.
    ///
    /// Returns `Ok(None)` for a bare `audio/pcm` tag. Anything that is not PCM
    /// is rejected.
    pub fn rate_from_mime(mime: &str) -> Result<Option<u32>, DecodeError> {
        let mut parts = mime.split(';').map(str::trim);
        let base = parts.next().unwrap_or_default();
        if !base.eq_ignore_ascii_case(PCM_MIME) {
            return Err(DecodeError::UnsupportedFormat(mime.to_string()));
        }

        for param in parts {
            if let Some((key, value)) = param.split_once('=') {
                if key.trim().eq_ignore_ascii_case("rate") {
                    return value
                        .trim()
                        .parse::<u32>()
                        .map(Some)
                        .map_err(|_| DecodeError::UnsupportedFormat(mime.to_string()));
                }
            }
        }

        Ok(None)
    }
}

impl fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} ch)", self.mime_type(), self.channels)
    }
}

/// An encoded payload plus its format descriptor.
///
/// Fields are private: a frame is never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    format: FrameFormat,
    data: String,
}

impl WireFrame {
    /// Wrap an already base64-encoded payload, typically one received from the agent.
    pub fn new(format: FrameFormat, data: impl Into<String>) -> Self {
        Self {
            format,
            data: data.into(),
        }
    }

    /// The base64 payload.
    pub fn data(&self) -> &str {
        &self.data
    }

    pub fn mime_type(&self) -> String {
        self.format.mime_type()
    }
}

/// A block of decoded samples, one plane per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    sample_rate: u32,
    planes: Vec<Vec<f32>>,
}

impl AudioFrame {
    /// Build a frame from per-channel planes. All planes must have the same length.
    pub fn new(sample_rate: u32, planes: Vec<Vec<f32>>) -> Self {
        debug_assert!(planes.windows(2).all(|w| w[0].len() == w[1].len()));
        Self { sample_rate, planes }
    }

    #[cfg(test)]
    pub fn mono(sample_rate: u32, samples: Vec<f32>) -> Self {
        Self::new(sample_rate, vec![samples])
    }

    #[cfg(test)]
    pub fn channel_count(&self) -> usize {
        self.planes.len()
    }

    /// Samples per channel.
    pub fn frame_count(&self) -> usize {
        self.planes.first().map(Vec::len).unwrap_or(0)
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frame_count() as f64 / self.sample_rate as f64
    }

    #[cfg(test)]
    pub fn plane(&self, channel: usize) -> Option<&[f32]> {
        self.planes.get(channel).map(Vec::as_slice)
    }

    /// Sample `index` of `channel`, falling back to the first channel when the
    /// frame has fewer channels than requested.
    pub fn sample(&self, channel: usize, index: usize) -> f32 {
        self.planes
            .get(channel)
            .or_else(|| self.planes.first())
            .and_then(|plane| plane.get(index))
            .copied()
            .unwrap_or(0.0)
    }
}

/// Stateless encoder/decoder for wire frames.
pub struct FrameCodec;

impl FrameCodec {
    /// Quantize interleaved `[-1, 1]` samples to PCM16 and wrap them in a wire frame.
    pub fn encode_outbound(samples: &[f32], format: FrameFormat) -> WireFrame {
        let quantized: Vec<i16> = samples.iter().map(|&s| quantize(s)).collect();
        let mut bytes = vec![0u8; quantized.len() * 2];
        LittleEndian::write_i16_into(&quantized, &mut bytes);

        WireFrame {
            format,
            data: STANDARD.encode(&bytes),
        }
    }

    /// Unwrap, reinterpret and de-interleave a wire frame across `channels`.
    ///
    /// ## Errors:
    /// - **InvalidEncoding**: payload is not base64
    /// - **Empty**: payload decodes to zero bytes
    /// - **ZeroChannels**: `channels` is 0
    /// - **Misaligned**: byte length is not a multiple of `2 * channels`
    pub fn decode_inbound(frame: &WireFrame, channels: u16) -> Result<AudioFrame, DecodeError> {
        if channels == 0 {
            return Err(DecodeError::ZeroChannels);
        }

        let bytes = STANDARD
            .decode(frame.data.as_bytes())
            .map_err(|e| DecodeError::InvalidEncoding(e.to_string()))?;

        if bytes.is_empty() {
            return Err(DecodeError::Empty);
        }

        let stride = 2 * channels as usize;
        if bytes.len() % stride != 0 {
            return Err(DecodeError::Misaligned {
                len: bytes.len(),
                channels,
            });
        }

        let mut interleaved = vec![0i16; bytes.len() / 2];
        LittleEndian::read_i16_into(&bytes, &mut interleaved);

        let channel_count = channels as usize;
        let frames = interleaved.len() / channel_count;
        let mut planes = vec![Vec::with_capacity(frames); channel_count];
        for chunk in interleaved.chunks_exact(channel_count) {
            for (plane, &sample) in planes.iter_mut().zip(chunk) {
                plane.push(sample as f32 / I16_SCALE);
            }
        }

        Ok(AudioFrame::new(frame.format.sample_rate, planes))
    }
}

/// Round-to-nearest with saturation. NaN maps to silence.
fn quantize(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    (sample * I16_SCALE)
        .round()
        .clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture_format() -> FrameFormat {
        FrameFormat::pcm16(16000, 1)
    }

    #[test]
    fn test_round_trip_within_one_step() {
        let input: Vec<f32> = (0..480)
            .map(|i| (i as f32 / 480.0 * std::f32::consts::TAU).sin() * 0.8)
            .collect();
        let frame = FrameCodec::encode_outbound(&input, capture_format());
        let decoded = FrameCodec::decode_inbound(&frame, 1).unwrap();

        assert_eq!(decoded.frame_count(), input.len());
        for (a, b) in input.iter().zip(decoded.plane(0).unwrap()) {
            assert!((a - b).abs() <= 1.0 / 32768.0 + f32::EPSILON, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_quantization_clamps_instead_of_wrapping() {
        assert_eq!(quantize(1.0), i16::MAX);
        assert_eq!(quantize(1.5), i16::MAX);
        assert_eq!(quantize(-1.0), i16::MIN);
        assert_eq!(quantize(-3.0), i16::MIN);
        assert_eq!(quantize(0.0), 0);
        assert_eq!(quantize(f32::NAN), 0);
    }

    #[test]
    fn test_encoded_bytes_are_little_endian() {
        let frame = FrameCodec::encode_outbound(&[0.5], capture_format());
        let bytes = STANDARD.decode(frame.data()).unwrap();
        // 0.5 * 32768 = 16384 = 0x4000
        assert_eq!(bytes, vec![0x00, 0x40]);
        assert_eq!(frame.mime_type(), "audio/pcm;rate=16000");
    }

    #[test]
    fn test_misaligned_payload_is_rejected() {
        let frame = WireFrame::new(FrameFormat::pcm16(24000, 1), STANDARD.encode([1u8, 2, 3]));
        assert_eq!(
            FrameCodec::decode_inbound(&frame, 1),
            Err(DecodeError::Misaligned { len: 3, channels: 1 })
        );

        // Six bytes are three mono samples but one and a half stereo frames.
        let frame = WireFrame::new(FrameFormat::pcm16(24000, 2), STANDARD.encode([0u8; 6]));
        assert_eq!(
            FrameCodec::decode_inbound(&frame, 2),
            Err(DecodeError::Misaligned { len: 6, channels: 2 })
        );
    }

    #[test]
    fn test_empty_and_garbage_payloads() {
        let empty = WireFrame::new(FrameFormat::pcm16(24000, 1), "");
        assert_eq!(FrameCodec::decode_inbound(&empty, 1), Err(DecodeError::Empty));

        let garbage = WireFrame::new(FrameFormat::pcm16(24000, 1), "not base64!!");
        assert!(matches!(
            FrameCodec::decode_inbound(&garbage, 1),
            Err(DecodeError::InvalidEncoding(_))
        ));

        let ok = WireFrame::new(FrameFormat::pcm16(24000, 1), STANDARD.encode([0u8; 4]));
        assert_eq!(FrameCodec::decode_inbound(&ok, 0), Err(DecodeError::ZeroChannels));
    }

    #[test]
    fn test_stereo_deinterleave() {
        let frame =
            FrameCodec::encode_outbound(&[0.25, -0.25, 0.5, -0.5], FrameFormat::pcm16(24000, 2));
        let decoded = FrameCodec::decode_inbound(&frame, 2).unwrap();

        assert_eq!(decoded.channel_count(), 2);
        assert_eq!(decoded.frame_count(), 2);
        assert_eq!(decoded.plane(0).unwrap(), &[0.25, 0.5]);
        assert_eq!(decoded.plane(1).unwrap(), &[-0.25, -0.5]);
        assert!((decoded.duration_secs() - 2.0 / 24000.0).abs() < 1e-12);
    }

    #[test]
    fn test_rate_from_mime() {
        assert_eq!(FrameFormat::rate_from_mime("audio/pcm;rate=24000"), Ok(Some(24000)));
        assert_eq!(FrameFormat::rate_from_mime("audio/pcm; rate=16000"), Ok(Some(16000)));
        assert_eq!(FrameFormat::rate_from_mime("audio/pcm"), Ok(None));
        assert!(FrameFormat::rate_from_mime("audio/opus;rate=48000").is_err());
        assert!(FrameFormat::rate_from_mime("audio/pcm;rate=fast").is_err());
    }
}
