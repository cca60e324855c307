//! Speak job: join a room and say each phrase.
//!
//! Every phrase is synthesized, split into Opus frames and sent as paced RTP.
//! A failed phrase is logged and skipped. The job ends with the closing
//! phrase, lingers briefly so the last packets drain, and hangs up.

use std::sync::Arc;

use crate::codec::{demux_frames, OPUS_PAYLOAD_TYPE};
use crate::signaling::{whip_endpoint, WhipClient, WhipClientError};
use crate::stream::output::{frame_interval, send_paced, Packetizer};
use crate::stream::PacketSink;

use super::{ClientConfig, ClientError, SpeechProvider};

/// Synthesize one phrase and send it. Returns the number of packets sent.
pub async fn speak_phrase<K: PacketSink>(
    provider: &SpeechProvider,
    packetizer: &mut Packetizer,
    sink: &K,
    text: &str,
) -> Result<usize, ClientError> {
    let audio = provider.synthesize(text).await?;
    let frames = demux_frames(&audio)?;
    let sent = send_paced(packetizer, &frames, sink, frame_interval()).await?;
    Ok(sent)
}

/// Say every phrase in order, then the closing phrase.
///
/// One packetizer is used for the whole job so sequence numbers and
/// timestamps keep running between phrases. The gaps between phrases show up
/// as timestamp jumps.
pub async fn speak_all<K: PacketSink>(
    config: &ClientConfig,
    provider: &SpeechProvider,
    sink: &K,
    room_id: &str,
    phrases: &[String],
) -> usize {
    let mut packetizer = Packetizer::new(OPUS_PAYLOAD_TYPE);
    let mut spoken = 0;

    for (i, phrase) in phrases.iter().enumerate() {
        log::info!("[Speak] {} phrase {}/{}: {}", room_id, i + 1, phrases.len(), phrase);
        match speak_phrase(provider, &mut packetizer, sink, phrase).await {
            Ok(packets) => {
                spoken += 1;
                log::info!("[Speak] {} sent {} packets", room_id, packets);
            }
            Err(e) => log::error!("[Speak] {} phrase {} failed: {}", room_id, i + 1, e),
        }

        if i + 1 < phrases.len() {
            tokio::time::sleep(config.phrase_gap).await;
        }
    }

    tokio::time::sleep(config.closing_delay).await;
    match speak_phrase(provider, &mut packetizer, sink, &config.closing_phrase).await {
        Ok(_) => spoken += 1,
        Err(e) => log::error!("[Speak] {} closing phrase failed: {}", room_id, e),
    }

    spoken
}

/// Run a whole speak job against the relay.
pub async fn run_speak(
    config: Arc<ClientConfig>,
    provider: Arc<SpeechProvider>,
    room_id: String,
    phrases: Vec<String>,
) -> Result<(), ClientError> {
    let endpoint = whip_endpoint(&config.relay_server, &room_id).map_err(WhipClientError::from)?;
    let client = WhipClient::connect(&endpoint, &config.ice_servers).await?;
    log::info!("[Speak] Connected to room '{}'", room_id);

    tokio::time::sleep(config.settle_delay).await;

    let spoken = speak_all(&config, &provider, client.audio_track().as_ref(), &room_id, &phrases).await;
    log::info!("[Speak] {} finished, {} of {} phrases spoken", room_id, spoken, phrases.len() + 1);

    tokio::time::sleep(config.linger).await;
    client.close().await?;
    Ok(())
}
