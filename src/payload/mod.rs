mod h264;

pub use h264::H264Depacketizer;

/// Interleaved channel carrying RTP media.
pub const RTP_CHANNEL: u8 = 0;
/// Interleaved channel carrying RTCP, which playback ignores.
pub const RTCP_CHANNEL: u8 = 1;
