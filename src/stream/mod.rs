//! Audio streams over RTP.
//!
//! - output: frames -> paced RTP on an outbound track
//! - input: inbound RTP -> frame batches
//! - relay: peer-to-peer forwarding

pub mod input;
pub mod output;
pub mod relay;

pub use input::{collect_batches, FrameBatch, FrameBatcher};
pub use output::{send_paced, Packetizer};
pub use relay::{Direction, PacketSink, PacketSource, RelayEngine, RelayError, RelayPeer};
