use std::io;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};

use anyhow::{Context as _, Result, anyhow};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tracing::{error, info, warn};

/// Downstream consumer of the Annex-B stream: an append-mode file, or the
/// stdin of an ffmpeg child remuxing into MP4. Writers upstream only see
/// the [`AsyncWrite`] surface and stay agnostic of which.
pub enum Sink {
    File(File),
    Transcoder {
        stdin: Option<ChildStdin>,
        child: Child,
    },
}

impl Sink {
    pub async fn append_file(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .await
            .with_context(|| format!("failed to open {} for appending", path.display()))?;
        info!("appending elementary stream to {}", path.display());
        Ok(Self::File(file))
    }

    /// Starts the transcoder child and pipes its stdin. Its stderr is
    /// drained into the log by a background task.
    pub async fn spawn_transcoder(output: &Path) -> Result<Self> {
        let mut child = Command::new("ffmpeg")
            .args(["-f", "h264", "-i", "-", "-c:v", "copy", "-f", "mp4"])
            .arg(output)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("failed to start ffmpeg")?;
        info!("transcoding to {} via ffmpeg", output.display());

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("ffmpeg child has no stdin pipe"))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.contains("error") || line.contains("Error") {
                        error!("ffmpeg: {}", line);
                    } else {
                        info!("ffmpeg: {}", line);
                    }
                }
            });
        }

        Ok(Self::Transcoder {
            stdin: Some(stdin),
            child,
        })
    }

    /// Flushes and releases the sink. The transcoder is closed in two
    /// stages: its stdin is dropped to signal end-of-stream, then the
    /// process is awaited. A non-zero exit is reported, not fatal.
    pub async fn close(self) -> Result<()> {
        match self {
            Self::File(mut file) => {
                file.flush().await?;
            }
            Self::Transcoder { stdin, mut child } => {
                drop(stdin);
                let status = child.wait().await.context("failed to await ffmpeg")?;
                if status.success() {
                    info!("transcoder finished");
                } else {
                    warn!("transcoder exited with {}", status);
                }
            }
        }
        Ok(())
    }
}

impl AsyncWrite for Sink {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            Self::File(file) => Pin::new(file).poll_write(cx, buf),
            Self::Transcoder {
                stdin: Some(stdin), ..
            } => Pin::new(stdin).poll_write(cx, buf),
            Self::Transcoder { stdin: None, .. } => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "transcoder input already closed",
            ))),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Self::File(file) => Pin::new(file).poll_flush(cx),
            Self::Transcoder {
                stdin: Some(stdin), ..
            } => Pin::new(stdin).poll_flush(cx),
            Self::Transcoder { stdin: None, .. } => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Self::File(file) => Pin::new(file).poll_shutdown(cx),
            Self::Transcoder {
                stdin: Some(stdin), ..
            } => Pin::new(stdin).poll_shutdown(cx),
            Self::Transcoder { stdin: None, .. } => Poll::Ready(Ok(())),
        }
    }
}
