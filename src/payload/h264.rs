use anyhow::Result;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

use super::{RTCP_CHANNEL, RTP_CHANNEL};

mod nal_type {
    pub const NAL_SLICE: u8 = 1;
    pub const NAL_SLICE_IDR: u8 = 5;
    pub const NAL_SEI: u8 = 6;
    pub const NAL_SPS: u8 = 7;
    pub const NAL_PPS: u8 = 8;
    pub const NAL_FU_A: u8 = 28;
}

const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// RTP fixed header, before the CSRC list.
const RTP_BASE_HEADER_LEN: usize = 12;

/// Turns interleaved RTP payloads into an Annex-B elementary stream.
///
/// Caches the first SPS and PPS seen and replays them in front of every
/// slice so the stream is decodable from any point after the first
/// keyframe. FU-A fragments are reassembled across packets; anything
/// arriving before the parameter sets is dropped as an orphan.
pub struct H264Depacketizer {
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
    current_fu: Option<Vec<u8>>,
}

impl H264Depacketizer {
    pub fn new() -> Self {
        Self {
            sps: None,
            pps: None,
            current_fu: None,
        }
    }

    pub fn has_parameter_sets(&self) -> bool {
        self.sps.is_some() && self.pps.is_some()
    }

    /// Handles one interleaved frame. Channel 0 carries media; channel 1
    /// is RTCP and dropped; anything else is logged and dropped.
    pub async fn process_frame<W>(&mut self, channel: u8, payload: &[u8], sink: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        match channel {
            RTP_CHANNEL => self.process_rtp(payload, sink).await,
            RTCP_CHANNEL => Ok(()),
            other => {
                debug!("ignoring frame on unknown channel {}", other);
                Ok(())
            }
        }
    }

    async fn process_rtp<W>(&mut self, packet: &[u8], sink: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if packet.len() <= RTP_BASE_HEADER_LEN {
            warn!("RTP packet too short: {} bytes", packet.len());
            return Ok(());
        }

        let csrc_count = (packet[0] & 0x0F) as usize;
        let header_len = RTP_BASE_HEADER_LEN + csrc_count * 4;
        if packet.len() < header_len {
            warn!("RTP header length exceeds packet size");
            return Ok(());
        }

        self.handle_nal(&packet[header_len..], sink).await
    }

    async fn handle_nal<W>(&mut self, nal: &[u8], sink: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let Some(&header) = nal.first() else {
            return Ok(());
        };
        let nal_type = header & 0x1F;
        trace!("NAL type {}", nal_type);

        match nal_type {
            nal_type::NAL_SPS => {
                if self.sps.is_none() {
                    self.sps = Some(with_start_code(nal));
                    debug!("cached SPS ({} bytes)", nal.len());
                }
            }
            nal_type::NAL_PPS => {
                if self.pps.is_none() {
                    self.pps = Some(with_start_code(nal));
                    debug!("cached PPS ({} bytes)", nal.len());
                }
            }
            nal_type::NAL_SLICE | nal_type::NAL_SLICE_IDR | nal_type::NAL_SEI => {
                let Some(sps) = self.sps.as_deref() else {
                    debug!("orphaned NAL (type {}) before any SPS, dropping", nal_type);
                    return Ok(());
                };
                sink.write_all(sps).await?;
                if let Some(pps) = self.pps.as_deref() {
                    sink.write_all(pps).await?;
                }
                sink.write_all(&START_CODE).await?;
                sink.write_all(nal).await?;
            }
            nal_type::NAL_FU_A => self.handle_fragment(nal, sink).await?,
            _ => {}
        }

        Ok(())
    }

    /// FU-A reassembly, RFC 6184 §5.8. The first payload byte is the FU
    /// indicator, the second the FU header carrying start/end bits and
    /// the type of the fragmented NAL.
    async fn handle_fragment<W>(&mut self, nal: &[u8], sink: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let [indicator, fu_header, fragment @ ..] = nal else {
            return Ok(());
        };
        let start = fu_header & 0x80 != 0;
        let end = fu_header & 0x40 != 0;
        let reconstructed_header = (indicator & 0xE0) | (fu_header & 0x1F);

        if start {
            let mut unit = Vec::with_capacity(nal.len() - 1);
            unit.push(reconstructed_header);
            unit.extend_from_slice(fragment);
            self.current_fu = Some(unit);
        } else if let Some(unit) = &mut self.current_fu {
            unit.extend_from_slice(fragment);
        } else {
            debug!("orphaned FU-A fragment without a start, dropping");
            return Ok(());
        }

        if !end {
            return Ok(());
        }

        let Some(unit) = self.current_fu.take() else {
            return Ok(());
        };
        let (Some(sps), Some(pps)) = (self.sps.as_deref(), self.pps.as_deref()) else {
            debug!("reassembled unit arrived before SPS/PPS, dropping");
            return Ok(());
        };

        if unit[0] & 0x1F == nal_type::NAL_SLICE_IDR {
            sink.write_all(sps).await?;
            sink.write_all(pps).await?;
        }
        sink.write_all(&START_CODE).await?;
        sink.write_all(&unit).await?;

        Ok(())
    }
}

impl Default for H264Depacketizer {
    fn default() -> Self {
        Self::new()
    }
}

fn with_start_code(nal: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(START_CODE.len() + nal.len());
    buf.extend_from_slice(&START_CODE);
    buf.extend_from_slice(nal);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const SPS: [u8; 4] = [0x67, 0x64, 0x00, 0x1F];
    const PPS: [u8; 4] = [0x68, 0xEE, 0x06, 0xF2];
    const IDR: [u8; 4] = [0x65, 0x88, 0x84, 0x21];

    /// Wraps a NAL payload in a minimal RTP packet (12-byte header, no
    /// CSRC entries) as it arrives on channel 0.
    fn rtp(nal: &[u8]) -> Vec<u8> {
        let mut packet = vec![0x80, 0x60, 0x00, 0x01, 0, 0, 0, 0, 0, 0, 0, 0];
        packet.extend_from_slice(nal);
        packet
    }

    async fn feed(depack: &mut H264Depacketizer, channel: u8, payload: &[u8]) -> Vec<u8> {
        let mut sink = Cursor::new(Vec::new());
        depack.process_frame(channel, payload, &mut sink).await.unwrap();
        sink.into_inner()
    }

    async fn prime(depack: &mut H264Depacketizer) {
        feed(depack, 0, &rtp(&SPS)).await;
        feed(depack, 0, &rtp(&PPS)).await;
        assert!(depack.has_parameter_sets());
    }

    #[tokio::test]
    async fn caches_parameter_sets_without_emitting() {
        let mut depack = H264Depacketizer::new();

        assert!(feed(&mut depack, 0, &rtp(&SPS)).await.is_empty());
        assert!(feed(&mut depack, 0, &rtp(&PPS)).await.is_empty());
        assert!(depack.has_parameter_sets());
    }

    #[tokio::test]
    async fn first_parameter_sets_win() {
        let mut depack = H264Depacketizer::new();
        prime(&mut depack).await;

        feed(&mut depack, 0, &rtp(&[0x67, 0xFF])).await;
        feed(&mut depack, 0, &rtp(&[0x68, 0xFF])).await;
        let out = feed(&mut depack, 0, &rtp(&IDR)).await;

        let mut expected = Vec::new();
        expected.extend_from_slice(&[0, 0, 0, 1]);
        expected.extend_from_slice(&SPS);
        assert!(out.starts_with(&expected));
    }

    #[tokio::test]
    async fn idr_before_sps_is_dropped() {
        let mut depack = H264Depacketizer::new();

        feed(&mut depack, 0, &rtp(&PPS)).await;
        let out = feed(&mut depack, 0, &rtp(&IDR)).await;

        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn slice_and_sei_before_sps_are_dropped() {
        let mut depack = H264Depacketizer::new();

        assert!(feed(&mut depack, 0, &rtp(&[0x61, 0x9A, 0x22])).await.is_empty());
        assert!(feed(&mut depack, 0, &rtp(&[0x66, 0xAA, 0xBB])).await.is_empty());
    }

    #[tokio::test]
    async fn idr_is_prefixed_with_parameter_sets() {
        let mut depack = H264Depacketizer::new();
        prime(&mut depack).await;

        let out = feed(&mut depack, 0, &rtp(&IDR)).await;

        let mut expected = Vec::new();
        expected.extend_from_slice(&[0, 0, 0, 1]);
        expected.extend_from_slice(&SPS);
        expected.extend_from_slice(&[0, 0, 0, 1]);
        expected.extend_from_slice(&PPS);
        expected.extend_from_slice(&[0, 0, 0, 1]);
        expected.extend_from_slice(&IDR);
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn non_idr_slice_is_emitted_after_parameter_sets() {
        let mut depack = H264Depacketizer::new();
        prime(&mut depack).await;

        let slice = [0x61, 0x9A, 0x22];
        let out = feed(&mut depack, 0, &rtp(&slice)).await;

        let mut expected = Vec::new();
        expected.extend_from_slice(&[0, 0, 0, 1]);
        expected.extend_from_slice(&SPS);
        expected.extend_from_slice(&[0, 0, 0, 1]);
        expected.extend_from_slice(&PPS);
        expected.extend_from_slice(&[0, 0, 0, 1]);
        expected.extend_from_slice(&slice);
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn reassembles_fu_a_fragments() {
        let mut depack = H264Depacketizer::new();
        prime(&mut depack).await;

        // indicator 0x7C, fragmented type 5: start, middle, end
        assert!(feed(&mut depack, 0, &rtp(&[0x7C, 0x85, 0xAA, 0xBB])).await.is_empty());
        assert!(feed(&mut depack, 0, &rtp(&[0x7C, 0x05, 0xAA, 0xBB])).await.is_empty());
        let out = feed(&mut depack, 0, &rtp(&[0x7C, 0x45, 0xAA, 0xBB])).await;

        let mut expected = Vec::new();
        expected.extend_from_slice(&[0, 0, 0, 1]);
        expected.extend_from_slice(&SPS);
        expected.extend_from_slice(&[0, 0, 0, 1]);
        expected.extend_from_slice(&PPS);
        expected.extend_from_slice(&[0, 0, 0, 1]);
        expected.extend_from_slice(&[0x65, 0xAA, 0xBB, 0xAA, 0xBB, 0xAA, 0xBB]);
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn reassembled_non_idr_gets_no_parameter_set_prefix() {
        let mut depack = H264Depacketizer::new();
        prime(&mut depack).await;

        // fragmented type 1
        feed(&mut depack, 0, &rtp(&[0x7C, 0x81, 0x10])).await;
        let out = feed(&mut depack, 0, &rtp(&[0x7C, 0x41, 0x20])).await;

        assert_eq!(out, vec![0, 0, 0, 1, 0x61, 0x10, 0x20]);
    }

    #[tokio::test]
    async fn orphaned_fu_a_fragment_is_dropped() {
        let mut depack = H264Depacketizer::new();
        prime(&mut depack).await;

        // middle and end with no start seen
        assert!(feed(&mut depack, 0, &rtp(&[0x7C, 0x05, 0xAA])).await.is_empty());
        assert!(feed(&mut depack, 0, &rtp(&[0x7C, 0x45, 0xBB])).await.is_empty());
    }

    #[tokio::test]
    async fn reassembled_unit_without_parameter_sets_is_dropped() {
        let mut depack = H264Depacketizer::new();

        feed(&mut depack, 0, &rtp(&[0x7C, 0x85, 0xAA])).await;
        let out = feed(&mut depack, 0, &rtp(&[0x7C, 0x45, 0xBB])).await;

        assert!(out.is_empty());
        // the buffer was cleared: a following end fragment is an orphan
        assert!(feed(&mut depack, 0, &rtp(&[0x7C, 0x45, 0xCC])).await.is_empty());
    }

    #[tokio::test]
    async fn rtcp_channel_produces_no_output() {
        let mut depack = H264Depacketizer::new();
        prime(&mut depack).await;

        let out = feed(&mut depack, 1, &rtp(&IDR)).await;

        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn unknown_channel_produces_no_output() {
        let mut depack = H264Depacketizer::new();
        prime(&mut depack).await;

        let out = feed(&mut depack, 9, &rtp(&IDR)).await;

        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn short_rtp_packets_are_dropped() {
        let mut depack = H264Depacketizer::new();
        prime(&mut depack).await;

        assert!(feed(&mut depack, 0, &[0x80; 12]).await.is_empty());
        assert!(feed(&mut depack, 0, &[]).await.is_empty());
    }

    #[tokio::test]
    async fn csrc_entries_extend_the_header() {
        let mut depack = H264Depacketizer::new();
        prime(&mut depack).await;

        // CC = 2: two CSRC entries push the payload out by 8 bytes
        let mut packet = vec![0x82, 0x60, 0x00, 0x01, 0, 0, 0, 0, 0, 0, 0, 0];
        packet.extend_from_slice(&[0xAA; 8]);
        packet.extend_from_slice(&IDR);
        let out = feed(&mut depack, 0, &packet).await;

        let mut tail = Vec::new();
        tail.extend_from_slice(&[0, 0, 0, 1]);
        tail.extend_from_slice(&IDR);
        assert!(out.ends_with(&tail));
    }

    #[tokio::test]
    async fn packet_shorter_than_its_csrc_list_is_dropped() {
        let mut depack = H264Depacketizer::new();
        prime(&mut depack).await;

        // CC = 15 claims a 72-byte header the packet doesn't have
        let mut packet = vec![0x8F, 0x60, 0x00, 0x01, 0, 0, 0, 0, 0, 0, 0, 0];
        packet.extend_from_slice(&IDR);
        let out = feed(&mut depack, 0, &packet).await;

        assert!(out.is_empty());
    }
}
