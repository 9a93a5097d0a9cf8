use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use rtsp::{InterleavedReader, RtspSession};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use url::Url;

use crate::payload::H264Depacketizer;
use crate::sink::Sink;

const DEFAULT_RTSP_PORT: u16 = 554;

/// Where the Annex-B stream ends up.
pub enum Output {
    /// Raw elementary stream appended to a file.
    File(PathBuf),
    /// Remuxed into an MP4 by an ffmpeg child process.
    Mp4(PathBuf),
}

/// Negotiates the session, then streams until the connection ends or a
/// stop signal arrives.
///
/// After PLAY the socket, depacketiser state and sink are owned by a
/// single reader task; the control flow here only waits and, on a
/// signal, tells the reader to stop. The socket closes when the reader
/// drops it.
pub async fn run(input: &str, output: Output) -> Result<()> {
    let url = Url::parse(input).context("invalid input URL")?;
    if url.scheme() != "rtsp" {
        bail!("expected an rtsp:// URL, got {}://", url.scheme());
    }
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("no host in {input}"))?;
    let port = url.port().unwrap_or(DEFAULT_RTSP_PORT);
    let path = url.path().trim_start_matches('/');

    info!("connecting to rtsp://{}:{}/{}", host, port, path);
    let mut session = RtspSession::connect(host, port, path).await?;
    if let Err(e) = establish(&mut session).await {
        let _ = session.close().await;
        return Err(e);
    }

    let sink = match output {
        Output::File(path) => Sink::append_file(&path).await?,
        Output::Mp4(path) => Sink::spawn_transcoder(&path).await?,
    };

    let mut framer = InterleavedReader::new(session.into_stream());
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    let (complete_tx, mut complete_rx) = mpsc::unbounded_channel::<()>();

    let reader = tokio::spawn(async move {
        let mut depacketizer = H264Depacketizer::new();
        let mut sink = sink;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("reader shutting down");
                    break;
                }
                frame = framer.next_frame() => {
                    match frame {
                        Ok((channel, payload)) => {
                            if let Err(e) = depacketizer
                                .process_frame(channel, &payload, &mut sink)
                                .await
                            {
                                error!("failed to write to sink: {}", e);
                                break;
                            }
                        }
                        Err(e) => {
                            error!("streaming stopped: {}", e);
                            break;
                        }
                    }
                }
            }
        }

        if let Err(e) = sink.close().await {
            warn!("failed to close sink: {}", e);
        }
        let _ = complete_tx.send(());
    });

    tokio::select! {
        _ = complete_rx.recv() => {}
        msg = wait_for_stop_signal() => {
            warn!("received {}, shutting down", msg);
            let _ = shutdown_tx.send(()).await;
            let _ = complete_rx.recv().await;
        }
    }
    reader.await?;
    info!("shutdown complete");

    Ok(())
}

async fn establish<T>(session: &mut RtspSession<T>) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    session.options().await.context("OPTIONS failed")?;
    session.describe().await.context("DESCRIBE failed")?;
    session.setup().await.context("SETUP failed")?;
    info!(
        "session {} established (timeout {:?})",
        session.session_id().unwrap_or_default(),
        session.timeout()
    );
    session.play().await.context("PLAY failed")?;
    Ok(())
}

async fn wait_for_stop_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = signal(SignalKind::terminate()).unwrap();
        let mut interrupt = signal(SignalKind::interrupt()).unwrap();

        tokio::select! {
            _ = terminate.recv() => "SIGTERM",
            _ = interrupt.recv() => "SIGINT",
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "interrupt"
    }
}
