//! Ogg Opus container (RFC 3533 pages carrying RFC 7845 Opus packets).
//!
//! `demux_frames` turns a TTS response into the Opus frames that get
//! packetized onto the outbound track. `mux_frames` / [`OggWriter`] turn a
//! batch of relayed frames back into a file for the STT provider.

use bytes::Bytes;
use thiserror::Error;

use super::crc;
use super::{AudioFormat, SAMPLES_PER_FRAME};

/// Page capture pattern
pub const CAPTURE_PATTERN: &[u8; 4] = b"OggS";
/// Fixed part of every page header
pub const PAGE_HEADER_LEN: usize = 27;
/// Offset of the CRC field inside the page header
const CHECKSUM_OFFSET: usize = 22;

pub const HEADER_TYPE_CONTINUED: u8 = 0x01;
pub const HEADER_TYPE_BOS: u8 = 0x02;
pub const HEADER_TYPE_EOS: u8 = 0x04;

/// Largest packet that fits in one page with a terminated lacing table
pub const MAX_FRAME_LEN: usize = 255 * 255 - 1;

pub const OPUS_HEAD: &[u8; 8] = b"OpusHead";
pub const OPUS_TAGS: &[u8; 8] = b"OpusTags";

/// Vendor string written into the comment header
pub const VENDOR: &str = "voice-relay";

/// Container parse/build errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContainerError {
    #[error("truncated page at offset {0}")]
    Truncated(usize),

    #[error("missing capture pattern at offset {0}")]
    BadCapturePattern(usize),

    #[error("unsupported stream structure version {0}")]
    UnsupportedVersion(u8),

    #[error("checksum mismatch on page {sequence}: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        sequence: u32,
        stored: u32,
        computed: u32,
    },

    #[error("missing {0} header packet")]
    MissingHeader(&'static str),

    #[error("empty frame")]
    EmptyFrame,

    #[error("frame of {0} bytes does not fit in a page")]
    FrameTooLarge(usize),
}

/// One parsed page, borrowing from the input buffer
#[derive(Debug, Clone)]
pub struct Page<'a> {
    pub header_type: u8,
    pub granule_position: u64,
    pub serial: u32,
    pub sequence: u32,
    pub checksum: u32,
    pub lacing: &'a [u8],
    pub data: &'a [u8],
}

impl Page<'_> {
    pub fn is_continued(&self) -> bool {
        self.header_type & HEADER_TYPE_CONTINUED != 0
    }

    pub fn is_bos(&self) -> bool {
        self.header_type & HEADER_TYPE_BOS != 0
    }

    pub fn is_eos(&self) -> bool {
        self.header_type & HEADER_TYPE_EOS != 0
    }
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

/// Parse the page starting at `offset`.
///
/// Returns the page and its total length in bytes. The checksum is verified
/// with the CRC field treated as zero.
pub fn parse_page(input: &[u8], offset: usize) -> Result<(Page<'_>, usize), ContainerError> {
    let page = &input[offset..];
    if page.len() < PAGE_HEADER_LEN {
        return Err(ContainerError::Truncated(offset));
    }
    if &page[..4] != CAPTURE_PATTERN {
        return Err(ContainerError::BadCapturePattern(offset));
    }
    if page[4] != 0 {
        return Err(ContainerError::UnsupportedVersion(page[4]));
    }

    let header_type = page[5];
    let granule_position = le_u64(&page[6..14]);
    let serial = le_u32(&page[14..18]);
    let sequence = le_u32(&page[18..22]);
    let stored = le_u32(&page[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4]);
    let segments = page[26] as usize;

    let header_len = PAGE_HEADER_LEN + segments;
    if page.len() < header_len {
        return Err(ContainerError::Truncated(offset));
    }
    let lacing = &page[PAGE_HEADER_LEN..header_len];
    let body_len: usize = lacing.iter().map(|&l| l as usize).sum();
    let total = header_len + body_len;
    if page.len() < total {
        return Err(ContainerError::Truncated(offset));
    }

    let mut computed = crc::update(0, &page[..CHECKSUM_OFFSET]);
    computed = crc::update(computed, &[0u8; 4]);
    computed = crc::update(computed, &page[CHECKSUM_OFFSET + 4..total]);
    if computed != stored {
        return Err(ContainerError::ChecksumMismatch {
            sequence,
            stored,
            computed,
        });
    }

    Ok((
        Page {
            header_type,
            granule_position,
            serial,
            sequence,
            checksum: stored,
            lacing,
            data: &page[header_len..total],
        },
        total,
    ))
}

/// Parse every page in the buffer, in file order.
pub fn read_pages(input: &[u8]) -> Result<Vec<Page<'_>>, ContainerError> {
    let mut pages = Vec::new();
    let mut offset = 0;
    while offset < input.len() {
        let (page, len) = parse_page(input, offset)?;
        pages.push(page);
        offset += len;
    }
    Ok(pages)
}

/// Reassemble every packet (header packets included) from the lacing values.
///
/// A lacing value of 255 continues the packet, possibly onto the next page.
pub fn demux_packets(input: &[u8]) -> Result<Vec<Bytes>, ContainerError> {
    let mut packets = Vec::new();
    let mut partial: Vec<u8> = Vec::new();

    for page in read_pages(input)? {
        if !page.is_continued() && !partial.is_empty() {
            log::warn!(
                "[Ogg] Dropping {} bytes of unterminated packet before page {}",
                partial.len(),
                page.sequence
            );
            partial.clear();
        }

        let mut cursor = 0;
        for &lace in page.lacing {
            let end = cursor + lace as usize;
            partial.extend_from_slice(&page.data[cursor..end]);
            cursor = end;
            if lace < 255 {
                packets.push(Bytes::from(std::mem::take(&mut partial)));
            }
        }
    }

    if !partial.is_empty() {
        log::warn!("[Ogg] Dropping {} bytes of unterminated packet at end of stream", partial.len());
    }

    Ok(packets)
}

/// Container -> ordered Opus frames.
///
/// The identification and comment header packets are validated and skipped.
/// Empty frames are rejected and never returned.
pub fn demux_frames(input: &[u8]) -> Result<Vec<Bytes>, ContainerError> {
    let mut packets = demux_packets(input)?.into_iter();

    match packets.next() {
        Some(p) if p.starts_with(OPUS_HEAD) => {}
        _ => return Err(ContainerError::MissingHeader("OpusHead")),
    }
    match packets.next() {
        Some(p) if p.starts_with(OPUS_TAGS) => {}
        _ => return Err(ContainerError::MissingHeader("OpusTags")),
    }

    let mut frames = Vec::new();
    for (index, packet) in packets.enumerate() {
        if packet.is_empty() {
            log::warn!("[Ogg] Skipping empty frame {}", index);
            continue;
        }
        frames.push(packet);
    }
    Ok(frames)
}

/// Check that a frame can be carried by one page.
pub fn validate_frame(frame: &[u8]) -> Result<(), ContainerError> {
    if frame.is_empty() {
        return Err(ContainerError::EmptyFrame);
    }
    if frame.len() > MAX_FRAME_LEN {
        return Err(ContainerError::FrameTooLarge(frame.len()));
    }
    Ok(())
}

fn lacing_values(len: usize) -> Vec<u8> {
    let mut lacing = vec![255u8; len / 255];
    lacing.push((len % 255) as u8);
    lacing
}

fn opus_head(format: AudioFormat) -> Vec<u8> {
    let mut head = Vec::with_capacity(19);
    head.extend_from_slice(OPUS_HEAD);
    head.push(1); // version
    head.push(format.channels);
    head.extend_from_slice(&0u16.to_le_bytes()); // pre-skip
    head.extend_from_slice(&format.sample_rate.to_le_bytes());
    head.extend_from_slice(&0i16.to_le_bytes()); // output gain
    head.push(0); // channel mapping family
    head
}

fn opus_tags() -> Vec<u8> {
    let mut tags = Vec::with_capacity(16 + VENDOR.len());
    tags.extend_from_slice(OPUS_TAGS);
    tags.extend_from_slice(&(VENDOR.len() as u32).to_le_bytes());
    tags.extend_from_slice(VENDOR.as_bytes());
    tags.extend_from_slice(&0u32.to_le_bytes()); // user comment count
    tags
}

/// Writes an Ogg Opus stream, one frame per page.
pub struct OggWriter {
    buffer: Vec<u8>,
    serial: u32,
    sequence: u32,
    granule_position: u64,
}

impl OggWriter {
    /// Create a writer and emit the identification and comment header pages.
    pub fn new(serial: u32, format: AudioFormat) -> Self {
        let mut writer = Self {
            buffer: Vec::new(),
            serial,
            sequence: 0,
            granule_position: 0,
        };
        writer.write_page(HEADER_TYPE_BOS, 0, &opus_head(format));
        writer.write_page(0, 0, &opus_tags());
        writer
    }

    /// Append one frame as its own page.
    ///
    /// `end_of_stream` marks the page EOS; set it only on the final frame.
    pub fn write_frame(&mut self, frame: &[u8], end_of_stream: bool) -> Result<(), ContainerError> {
        validate_frame(frame)?;
        self.append_frame(frame, end_of_stream);
        Ok(())
    }

    fn append_frame(&mut self, frame: &[u8], end_of_stream: bool) {
        self.granule_position += SAMPLES_PER_FRAME as u64;
        let header_type = if end_of_stream { HEADER_TYPE_EOS } else { 0 };
        self.write_page(header_type, self.granule_position, frame);
    }

    fn write_page(&mut self, header_type: u8, granule_position: u64, data: &[u8]) {
        let start = self.buffer.len();
        let lacing = lacing_values(data.len());

        self.buffer.extend_from_slice(CAPTURE_PATTERN);
        self.buffer.push(0); // stream structure version
        self.buffer.push(header_type);
        self.buffer.extend_from_slice(&granule_position.to_le_bytes());
        self.buffer.extend_from_slice(&self.serial.to_le_bytes());
        self.buffer.extend_from_slice(&self.sequence.to_le_bytes());
        self.buffer.extend_from_slice(&[0u8; 4]); // checksum, filled below
        self.buffer.push(lacing.len() as u8);
        self.buffer.extend_from_slice(&lacing);
        self.buffer.extend_from_slice(data);

        let checksum = crc::checksum(&self.buffer[start..]);
        self.buffer[start + CHECKSUM_OFFSET..start + CHECKSUM_OFFSET + 4]
            .copy_from_slice(&checksum.to_le_bytes());

        self.sequence += 1;
    }

    /// Pages written so far, header pages included
    pub fn pages_written(&self) -> u32 {
        self.sequence
    }

    /// Granule position of the last page written
    pub fn granule_position(&self) -> u64 {
        self.granule_position
    }

    /// Consume the writer and return the container bytes
    pub fn finish(self) -> Vec<u8> {
        self.buffer
    }
}

/// Ordered frames -> container.
///
/// Empty and oversized frames are skipped with a warning; the EOS flag lands
/// on the last page actually written.
pub fn mux_frames(frames: &[Bytes], serial: u32) -> Vec<u8> {
    let valid: Vec<&Bytes> = frames
        .iter()
        .enumerate()
        .filter_map(|(index, frame)| match validate_frame(frame) {
            Ok(()) => Some(frame),
            Err(e) => {
                log::warn!("[Ogg] Skipping frame {}: {}", index, e);
                None
            }
        })
        .collect();

    let mut writer = OggWriter::new(serial, AudioFormat::standard());
    let last = valid.len().saturating_sub(1);
    for (index, frame) in valid.iter().enumerate() {
        writer.append_frame(frame, index == last);
    }
    writer.finish()
}

/// Pseudo-random 32-bit id, used as Ogg stream serial and RTP SSRC
pub fn stream_serial() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u32)
        .unwrap_or(0x1234_5678)
        ^ std::process::id()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_hex(hex: &str) -> Vec<u8> {
        (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).unwrap())
            .collect()
    }

    /// Build a page with an explicit lacing table (for multi-packet pages)
    fn raw_page(header_type: u8, granule: u64, sequence: u32, lacing: &[u8], data: &[u8]) -> Vec<u8> {
        let mut page = Vec::new();
        page.extend_from_slice(CAPTURE_PATTERN);
        page.push(0);
        page.push(header_type);
        page.extend_from_slice(&granule.to_le_bytes());
        page.extend_from_slice(&7u32.to_le_bytes());
        page.extend_from_slice(&sequence.to_le_bytes());
        page.extend_from_slice(&[0u8; 4]);
        page.push(lacing.len() as u8);
        page.extend_from_slice(lacing);
        page.extend_from_slice(data);
        let checksum = crc::checksum(&page);
        page[22..26].copy_from_slice(&checksum.to_le_bytes());
        page
    }

    fn frames(sizes: &[usize]) -> Vec<Bytes> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, &len)| Bytes::from(vec![i as u8 + 1; len]))
            .collect()
    }

    #[test]
    fn test_identification_page_bytes() {
        let container = OggWriter::new(0x0102_0304, AudioFormat::standard()).finish();
        let expected = from_hex(
            "4f676753000200000000000000000403020100000000176d719301134f707573486561640102000080bb0000000000",
        );
        assert_eq!(&container[..expected.len()], expected.as_slice());
    }

    #[test]
    fn test_round_trip_preserves_payloads() {
        let input = frames(&[120, 3, 254, 255, 300, 80]);
        let container = mux_frames(&input, 42);
        let output = demux_frames(&container).unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn test_granule_and_flags() {
        let container = mux_frames(&frames(&[10, 20, 30]), 42);
        let pages = read_pages(&container).unwrap();
        assert_eq!(pages.len(), 5);

        assert!(pages[0].is_bos());
        assert_eq!(pages[0].granule_position, 0);
        assert_eq!(pages[1].granule_position, 0);

        let granules: Vec<u64> = pages[2..].iter().map(|p| p.granule_position).collect();
        assert_eq!(granules, vec![960, 1920, 2880]);
        assert!(granules.windows(2).all(|w| w[0] < w[1]));

        let sequences: Vec<u32> = pages.iter().map(|p| p.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3, 4]);

        assert!(!pages[2].is_eos());
        assert!(!pages[3].is_eos());
        assert!(pages[4].is_eos());
        assert!(pages.iter().all(|p| p.serial == 42));
    }

    #[test]
    fn test_zero_frames_yields_header_pages_only() {
        let container = mux_frames(&[], 1);
        let pages = read_pages(&container).unwrap();
        assert_eq!(pages.len(), 2);
        assert!(demux_frames(&container).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_frames_skipped_and_eos_moves() {
        let mut input = frames(&[10, 20]);
        input.push(Bytes::new());
        input.push(Bytes::from(vec![9u8; MAX_FRAME_LEN + 1]));
        let container = mux_frames(&input, 5);

        let pages = read_pages(&container).unwrap();
        assert_eq!(pages.len(), 4);
        assert!(pages[3].is_eos());
        assert_eq!(demux_frames(&container).unwrap(), input[..2].to_vec());
    }

    #[test]
    fn test_writer_rejects_empty_frame() {
        let mut writer = OggWriter::new(1, AudioFormat::standard());
        assert_eq!(writer.write_frame(&[], true), Err(ContainerError::EmptyFrame));
        assert_eq!(writer.pages_written(), 2);
        assert_eq!(writer.granule_position(), 0);
    }

    #[test]
    fn test_corrupted_page_is_rejected() {
        let mut container = mux_frames(&frames(&[40]), 9);
        let last = container.len() - 1;
        container[last] ^= 0xff;
        match demux_frames(&container) {
            Err(ContainerError::ChecksumMismatch { sequence, .. }) => assert_eq!(sequence, 2),
            other => panic!("expected checksum mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_capture_pattern() {
        let mut container = mux_frames(&[], 9);
        container[0] = b'X';
        assert_eq!(demux_frames(&container), Err(ContainerError::BadCapturePattern(0)));
    }

    #[test]
    fn test_truncated_page() {
        let container = mux_frames(&frames(&[40]), 9);
        let cut = &container[..container.len() - 5];
        assert!(matches!(demux_frames(cut), Err(ContainerError::Truncated(_))));
    }

    #[test]
    fn test_missing_header() {
        let page = raw_page(HEADER_TYPE_BOS, 0, 0, &[3], b"abc");
        assert_eq!(demux_frames(&page), Err(ContainerError::MissingHeader("OpusHead")));
    }

    #[test]
    fn test_multi_packet_and_spanning_pages() {
        let mut container = mux_frames(&[], 7);
        // Two packets in one page
        container.extend(raw_page(0, 1920, 2, &[3, 2], b"abcde"));
        // One packet spanning two pages
        let long = vec![0x5a; 265];
        container.extend(raw_page(0, 1920, 3, &[255], &long[..255]));
        container.extend(raw_page(HEADER_TYPE_CONTINUED | HEADER_TYPE_EOS, 2880, 4, &[10], &long[255..]));

        let output = demux_frames(&container).unwrap();
        assert_eq!(output.len(), 3);
        assert_eq!(&output[0][..], b"abc");
        assert_eq!(&output[1][..], b"de");
        assert_eq!(&output[2][..], long.as_slice());
    }

    #[test]
    fn test_empty_packet_rejected_on_demux() {
        let mut container = mux_frames(&[], 7);
        container.extend(raw_page(0, 960, 2, &[0, 4], b"opus"));
        let output = demux_frames(&container).unwrap();
        assert_eq!(output, vec![Bytes::from_static(b"opus")]);
    }
}
