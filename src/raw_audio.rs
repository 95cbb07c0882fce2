//! Raw PCM format tags and owned buffers (spec §3).

/// Closed set of PCM sample encodings the queue and stream understand.
///
/// Mirrors `RawAudioFormat` in
/// `examples/original_source/ffi/include/audio.h`, extended with
/// `Unspecified` as the explicit "no format yet" sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, uniffi::Enum)]
pub enum RawAudioFormat {
    U8,
    S16LE,
    S16BE,
    S24LE,
    S24BE,
    S32LE,
    S32BE,
    F32LE,
    F32BE,
    Unspecified,
}

impl RawAudioFormat {
    /// Byte width of a single sample in this format, or `None` for
    /// `Unspecified` (which has no fixed width and must never reach a
    /// buffer — spec §9 Open Question: rejected at enqueue time).
    pub fn byte_width(self) -> Option<usize> {
        match self {
            RawAudioFormat::U8 => Some(1),
            RawAudioFormat::S16LE | RawAudioFormat::S16BE => Some(2),
            RawAudioFormat::S24LE | RawAudioFormat::S24BE => Some(3),
            RawAudioFormat::S32LE
            | RawAudioFormat::S32BE
            | RawAudioFormat::F32LE
            | RawAudioFormat::F32BE => Some(4),
            RawAudioFormat::Unspecified => None,
        }
    }
}

/// An owned, append-only run of PCM bytes tagged with the format and
/// sample rate it was produced at.
#[derive(Debug, Clone)]
pub struct RawAudioBuffer {
    bytes: Vec<u8>,
    format: RawAudioFormat,
    sample_rate: u32,
}

impl RawAudioBuffer {
    pub fn new(bytes: Vec<u8>, format: RawAudioFormat, sample_rate: u32) -> Self {
        Self {
            bytes,
            format,
            sample_rate,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn format(&self) -> RawAudioFormat {
        self.format
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len_bytes(&self) -> usize {
        self.bytes.len()
    }

    /// Number of whole samples contained in this buffer. `0` for
    /// `Unspecified` format, since it has no defined width.
    pub fn no_samples(&self) -> usize {
        match self.format.byte_width() {
            Some(width) if width > 0 => self.bytes.len() / width,
            _ => 0,
        }
    }

    /// Duration of this buffer in microseconds, used by the queue's
    /// `max_duration` accounting (spec §3).
    pub fn duration_usec(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.no_samples() as u64) * 1_000_000 / self.sample_rate as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_widths_match_spec_table() {
        assert_eq!(RawAudioFormat::U8.byte_width(), Some(1));
        assert_eq!(RawAudioFormat::S16LE.byte_width(), Some(2));
        assert_eq!(RawAudioFormat::S16BE.byte_width(), Some(2));
        assert_eq!(RawAudioFormat::S24LE.byte_width(), Some(3));
        assert_eq!(RawAudioFormat::S24BE.byte_width(), Some(3));
        assert_eq!(RawAudioFormat::S32LE.byte_width(), Some(4));
        assert_eq!(RawAudioFormat::S32BE.byte_width(), Some(4));
        assert_eq!(RawAudioFormat::F32LE.byte_width(), Some(4));
        assert_eq!(RawAudioFormat::F32BE.byte_width(), Some(4));
        assert_eq!(RawAudioFormat::Unspecified.byte_width(), None);
    }

    #[test]
    fn no_samples_divides_by_byte_width() {
        let buf = RawAudioBuffer::new(vec![0u8; 4800], RawAudioFormat::U8, 8000);
        assert_eq!(buf.no_samples(), 4800);

        let buf = RawAudioBuffer::new(vec![0u8; 4800], RawAudioFormat::S16LE, 8000);
        assert_eq!(buf.no_samples(), 2400);
    }

    #[test]
    fn duration_usec_matches_sample_rate() {
        // 4800 bytes of U8 @ 8000 Hz = 4800 samples = 600_000us.
        let buf = RawAudioBuffer::new(vec![0u8; 4800], RawAudioFormat::U8, 8000);
        assert_eq!(buf.duration_usec(), 600_000);
    }
}
