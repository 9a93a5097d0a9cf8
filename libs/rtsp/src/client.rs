use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::response::{self, Response};

const USER_AGENT: &str = "rtsp_test (LIVE555 Streaming Media v2015.09.24)";
const TRANSPORT: &str = "RTP/AVP/TCP;unicast;interleaved=0-1";
const RESPONSE_BUF_SIZE: usize = 4096;

/// Where the session is in the OPTIONS → DESCRIBE → SETUP → PLAY sequence.
/// Transitions are advisory except for PLAY, which requires a session
/// token from a completed SETUP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Fresh,
    Optioned,
    Described,
    SetUp,
    Playing,
    Closed,
}

/// An RTSP 1.0 client session over a single stream.
///
/// Generic over the transport so tests can drive it with in-memory duplex
/// pairs. After `play()` the socket is surrendered with [`into_stream`]
/// and owned exclusively by the interleaved reader.
///
/// [`into_stream`]: RtspSession::into_stream
pub struct RtspSession<T> {
    stream: T,
    url: String,
    cseq: u32,
    session_id: Option<String>,
    timeout: Option<u64>,
    state: SessionState,
    previous: Response,
}

impl RtspSession<TcpStream> {
    /// Dials `host:port` and prepares a session for `rtsp://host:port/path`.
    pub async fn connect(host: &str, port: u16, path: &str) -> Result<Self> {
        let addr = format!("{host}:{port}");
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| Error::Connect { addr, source })?;

        let url = format!("rtsp://{host}:{port}/{path}");
        Ok(Self::new(stream, url))
    }
}

impl<T> RtspSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: T, url: String) -> Self {
        Self {
            stream,
            url,
            cseq: 1,
            session_id: None,
            timeout: None,
            state: SessionState::Fresh,
            previous: Response::default(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn cseq(&self) -> u32 {
        self.cseq
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Session timeout in seconds as announced by SETUP. Stored but not
    /// applied to the socket.
    pub fn timeout(&self) -> Option<u64> {
        self.timeout
    }

    pub fn previous_response(&self) -> &Response {
        &self.previous
    }

    pub async fn options(&mut self) -> Result<Response> {
        self.send_request("OPTIONS", &[]).await;
        let response = self.read_response().await?;
        self.state = SessionState::Optioned;
        Ok(response)
    }

    pub async fn describe(&mut self) -> Result<Response> {
        self.send_request("DESCRIBE", &[("Accept", "application/sdp")])
            .await;
        let response = self.read_response().await?;
        self.state = SessionState::Described;
        Ok(response)
    }

    /// Negotiates interleaved TCP transport and captures the session
    /// token. The control URL gains the `/track1` selector here; the
    /// proper value would come from the SDP `a=control:` attribute.
    pub async fn setup(&mut self) -> Result<Response> {
        if self.state != SessionState::Described {
            warn!("SETUP issued without a preceding DESCRIBE");
        }

        self.url = format!("{}/track1", self.url);
        self.send_request("SETUP", &[("User-Agent", USER_AGENT), ("Transport", TRANSPORT)])
            .await;
        let response = self.read_response().await?;

        let token = response
            .header("Session")
            .filter(|token| !token.is_empty())
            .ok_or(Error::NoSession)?;
        self.session_id = Some(token.to_string());
        debug!("session established: {}", token);

        if let Some(timeout) = response.header("timeout") {
            match timeout.parse::<u64>() {
                Ok(secs) => self.timeout = Some(secs),
                Err(e) => warn!("failed to parse session timeout {:?}: {}", timeout, e),
            }
        }

        self.state = SessionState::SetUp;
        Ok(response)
    }

    pub async fn play(&mut self) -> Result<Response> {
        if self.session_id.is_none() {
            return Err(Error::NoSession);
        }

        self.send_request("PLAY", &[("User-Agent", USER_AGENT), ("Range", "npt=0.000-")])
            .await;
        let response = self.read_response().await?;
        self.state = SessionState::Playing;
        Ok(response)
    }

    /// Shuts the connection down. Streaming sessions hand the socket to
    /// the interleaved reader with [`into_stream`] instead.
    ///
    /// [`into_stream`]: RtspSession::into_stream
    pub async fn close(mut self) -> Result<()> {
        self.state = SessionState::Closed;
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Surrenders the socket once PLAY has completed. The reader that
    /// takes it owns the read cursor from here on.
    pub fn into_stream(self) -> T {
        self.stream
    }

    /// Serialises and sends one request. Write failures are logged only;
    /// the read that follows surfaces the consequence. The CSeq counter
    /// advances whether or not the write went through.
    async fn send_request(&mut self, method: &str, extra_headers: &[(&str, &str)]) {
        let mut request = format!("{} {} RTSP/1.0\r\nCSeq: {}\r\n", method, self.url, self.cseq);
        if let Some(session_id) = &self.session_id {
            request.push_str(&format!("Session: {session_id}\r\n"));
        }
        for (name, value) in extra_headers {
            request.push_str(&format!("{name}: {value}\r\n"));
        }
        request.push_str("\r\n");

        trace!("sending request:\n{}", request);
        if let Err(e) = self.stream.write_all(request.as_bytes()).await {
            warn!("failed to send {} request: {}", method, e);
        }
        self.cseq += 1;
    }

    /// One blocking read of up to 4 KiB. A closed connection yields an
    /// empty response rather than an error.
    async fn read_response(&mut self) -> Result<Response> {
        let mut buf = vec![0u8; RESPONSE_BUF_SIZE];
        let n = self.stream.read(&mut buf).await?;
        if n == 0 {
            debug!("connection closed before a response arrived");
            self.previous = Response::default();
            return Ok(Response::default());
        }

        trace!("response:\n{}", String::from_utf8_lossy(&buf[..n]));
        let response = response::parse(&buf[..n]);
        self.previous = response.clone();
        Ok(response)
    }
}
