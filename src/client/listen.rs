//! Listen job: join a room and transcribe what the partner says.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::signaling::{whip_endpoint, WhipClient, WhipClientError};
use crate::stream::input::{collect_batches, FrameBatch};
use crate::stream::PacketSource;

use super::{ClientConfig, ClientError, SpeechProvider};

/// Batches queued while a transcription is in flight
const BATCH_QUEUE: usize = 16;

/// Package one batch as Ogg Opus and transcribe it.
pub async fn transcribe_batch(provider: &SpeechProvider, batch: FrameBatch) -> Result<String, ClientError> {
    let frames = batch.len();
    let text = provider.transcribe(batch.into_container()).await?;
    log::info!("[Listen] {} frames -> \"{}\"", frames, text);
    Ok(text)
}

/// Transcribe batches until the channel closes. Returns the texts in order;
/// failed batches are logged and left out.
pub async fn transcribe_batches(provider: &SpeechProvider, mut batches: mpsc::Receiver<FrameBatch>) -> Vec<String> {
    let mut texts = Vec::new();
    while let Some(batch) = batches.recv().await {
        match transcribe_batch(provider, batch).await {
            Ok(text) => texts.push(text),
            Err(e) => log::error!("[Listen] Transcription failed: {}", e),
        }
    }
    texts
}

/// Batch and transcribe `source` until it ends or `session_end` resolves.
///
/// Batches already handed over are still transcribed after the session
/// ends; frames of the unfinished window are dropped.
pub async fn transcribe_session<S, F>(
    source: &S,
    window: Duration,
    provider: &SpeechProvider,
    session_end: F,
) -> Vec<String>
where
    S: PacketSource,
    F: Future<Output = ()>,
{
    let (batch_tx, batch_rx) = mpsc::channel(BATCH_QUEUE);

    let collect = async move {
        tokio::select! {
            result = collect_batches(source, window, batch_tx) => match result {
                Ok(()) => log::info!("[Listen] Inbound stream ended"),
                Err(e) => log::warn!("[Listen] Inbound stream error: {}", e),
            },
            _ = session_end => log::info!("[Listen] Session ended, stopping collection"),
        }
    };

    let ((), texts) = tokio::join!(collect, transcribe_batches(provider, batch_rx));
    texts
}

/// Run a whole listen job against the relay. Ends with the session.
pub async fn run_listen(
    config: Arc<ClientConfig>,
    provider: Arc<SpeechProvider>,
    room_id: String,
) -> Result<(), ClientError> {
    let endpoint = whip_endpoint(&config.relay_server, &room_id).map_err(WhipClientError::from)?;
    let client = WhipClient::connect(&endpoint, &config.ice_servers).await?;
    log::info!("[Listen] Connected to room '{}', waiting for audio", room_id);

    let Some(track) = client.wait_for_inbound().await else {
        log::info!("[Listen] Session for room '{}' ended before any audio", room_id);
        client.close().await?;
        return Ok(());
    };

    let texts = transcribe_session(track.as_ref(), config.batch_window, &provider, client.wait_closed()).await;
    log::info!("[Listen] Room '{}' done, {} transcriptions", room_id, texts.len());

    client.close().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ProviderConfig;
    use crate::codec::demux_frames;
    use crate::test_support::{packet, FakeSource};
    use bytes::Bytes;
    use mockito::Matcher;
    use tokio::sync::oneshot;

    fn batch(frames: usize) -> FrameBatch {
        FrameBatch {
            frames: (0..frames).map(|i| Bytes::from(vec![i as u8 + 1; 40])).collect(),
            ended_by_marker: false,
        }
    }

    #[tokio::test]
    async fn test_transcribe_batch_uploads_container() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/audio/transcriptions")
            .match_body(Matcher::Regex("OggS".to_string()))
            .with_status(200)
            .with_body(r#"{"text": "olá mundo"}"#)
            .create_async()
            .await;

        let provider = SpeechProvider::new(ProviderConfig::new("k").with_base_url(&server.url()));
        let text = transcribe_batch(&provider, batch(5)).await.unwrap();

        mock.assert_async().await;
        assert_eq!(text, "olá mundo");
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_stop_the_job() {
        let mut server = mockito::Server::new_async().await;
        let fail = server
            .mock("POST", "/audio/transcriptions")
            .with_status(500)
            .expect(2)
            .create_async()
            .await;

        let provider = SpeechProvider::new(ProviderConfig::new("k").with_base_url(&server.url()));
        let (tx, rx) = mpsc::channel(4);
        tx.send(batch(2)).await.unwrap();
        tx.send(batch(3)).await.unwrap();
        drop(tx);

        // Both batches are attempted even though the first fails
        let texts = transcribe_batches(&provider, rx).await;
        fail.assert_async().await;
        assert!(texts.is_empty());
    }

    #[test]
    fn test_batch_container_is_decodable() {
        let input = batch(4);
        let frames = input.frames.clone();
        assert_eq!(demux_frames(&input.into_container()).unwrap(), frames);
    }

    #[tokio::test]
    async fn test_session_end_stops_a_silent_stream() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/audio/transcriptions")
            .with_status(200)
            .with_body(r#"{"text": "antes da queda"}"#)
            .expect(1)
            .create_async()
            .await;
        let provider = SpeechProvider::new(ProviderConfig::new("k").with_base_url(&server.url()));

        // The feeding handle stays alive, so reads would block forever
        let (source, feed) = FakeSource::audio();
        feed.send(packet(0, 0, b"one")).unwrap();
        let mut last = packet(1, 960, b"two");
        last.header.marker = true;
        feed.send(last).unwrap();

        let (end_tx, end_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = end_tx.send(());
        });

        let texts = tokio::time::timeout(
            Duration::from_secs(5),
            transcribe_session(&source, Duration::from_secs(30), &provider, async {
                let _ = end_rx.await;
            }),
        )
        .await
        .expect("listen kept running after the session ended");

        mock.assert_async().await;
        assert_eq!(texts, vec!["antes da queda".to_string()]);
        drop(feed);
    }
}
