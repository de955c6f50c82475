//! Long-lived HTTP/2-over-TLS client session to the assignment server.
//!
//! One session owns one multiplexed connection. Request/response streams are
//! opened over a shared [`h2::client::SendRequest`] handle; the connection
//! driver runs as a background task. Any stream-level error (including a
//! peer RST_STREAM) is surfaced to the caller, which tears the whole session
//! down and reconnects — the session is the retry unit, individual requests
//! are never retried.

mod liveness;
mod tls;

pub use liveness::{DEAD_THRESHOLD, Liveness, RECONNECT_DELAY, STALE_ID_AFTER};

use bytes::{Bytes, BytesMut};
use futures::future::poll_fn;
use http::{HeaderMap, Method, Request, StatusCode};
use rustls_pki_types::ServerName;
use std::path::PathBuf;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// All request paths are rooted here.
const ROOT: &str = "/mnat-ds";

const CONTENT_TYPE: &str = "application/yang-data+json";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Server hostname; also used for certificate verification.
    pub server: String,
    pub port: u16,
    /// CA bundle to verify the server with; system roots if absent.
    pub ca_cert: Option<PathBuf>,
    /// Client certificate PEM (with private key) for mutual TLS.
    pub client_cert: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid server name `{0}`")]
    InvalidServerName(String),
    #[error("failed to read PEM file")]
    ReadPem(#[source] rustls_pki_types::pem::Error),
    #[error(transparent)]
    Tls(rustls::Error),
    #[error("failed to connect TCP socket")]
    Connect(#[source] std::io::Error),
    #[error("TLS handshake failed")]
    TlsHandshake(#[source] std::io::Error),
    #[error("HTTP/2 handshake failed")]
    Handshake(#[source] h2::Error),
    #[error("HTTP/2 stream failed")]
    Stream(#[source] h2::Error),
    #[error("stream closed while sending the request body")]
    BodySend,
    #[error("failed to build request")]
    BuildRequest(#[source] http::Error),
}

impl SessionError {
    /// True if the peer reset our stream. The reference behavior treats this
    /// as fatal to the session, which our caller implements by reconnecting.
    pub fn is_reset(&self) -> bool {
        match self {
            SessionError::Stream(e) | SessionError::Handshake(e) => e.is_reset(),
            SessionError::InvalidServerName(_)
            | SessionError::ReadPem(_)
            | SessionError::Tls(_)
            | SessionError::Connect(_)
            | SessionError::TlsHandshake(_)
            | SessionError::BodySend
            | SessionError::BuildRequest(_) => false,
        }
    }
}

/// A finished response: status, headers and the accumulated body.
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub struct Session {
    send_request: h2::client::SendRequest<Bytes>,
    authority: String,
}

impl Session {
    /// Establishes TCP + TLS (ALPN `h2`) and performs the HTTP/2 handshake.
    ///
    /// The connection preface and SETTINGS exchange happen inside the
    /// handshake; the returned handle only accepts requests once the
    /// connection is ready, so callers never race the SETTINGS ack.
    pub async fn connect(config: &SessionConfig) -> Result<Self, SessionError> {
        let tls_config = tls::client_config(
            config.ca_cert.as_deref(),
            config.client_cert.as_deref(),
        )?;

        let server_name = ServerName::try_from(config.server.clone())
            .map_err(|_| SessionError::InvalidServerName(config.server.clone()))?;

        let tcp = TcpStream::connect((config.server.as_str(), config.port))
            .await
            .map_err(SessionError::Connect)?;

        let tls = TlsConnector::from(tls_config)
            .connect(server_name, tcp)
            .await
            .map_err(SessionError::TlsHandshake)?;

        let (send_request, connection) = h2::client::handshake(tls)
            .await
            .map_err(SessionError::Handshake)?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!("HTTP/2 connection task finished: {e}");
            }
        });

        let send_request = send_request
            .ready()
            .await
            .map_err(SessionError::Handshake)?;

        tracing::info!(server = %config.server, port = config.port, "Connected to assignment server");

        Ok(Self {
            send_request,
            authority: config.server.clone(),
        })
    }

    /// Sends one request under [`ROOT`] and accumulates the full response.
    pub async fn request(
        &mut self,
        method: Method,
        path: &str,
        body: Option<Bytes>,
    ) -> Result<Response, SessionError> {
        let uri = format!("https://{}{ROOT}{path}", self.authority);

        let mut builder = Request::builder()
            .method(method.clone())
            .uri(&uri)
            .header(http::header::CONTENT_TYPE, CONTENT_TYPE);
        if let Some(body) = &body {
            builder = builder.header(http::header::CONTENT_LENGTH, body.len());
        }
        let request = builder.body(()).map_err(SessionError::BuildRequest)?;

        tracing::debug!(%method, %uri, "Sending request");

        let ready = self
            .send_request
            .clone()
            .ready()
            .await
            .map_err(SessionError::Stream)?;
        self.send_request = ready;

        let (response, send_stream) = self
            .send_request
            .send_request(request, body.is_none())
            .map_err(SessionError::Stream)?;

        if let Some(body) = body {
            send_body(send_stream, body).await?;
        }

        let (parts, mut recv_stream) = response
            .await
            .map_err(SessionError::Stream)?
            .into_parts();

        let mut buf = BytesMut::new();
        while let Some(chunk) = recv_stream.data().await {
            let chunk = chunk.map_err(SessionError::Stream)?;

            // Hand the consumed bytes back to the connection window, else
            // the session stalls once 64 KiB have been received in total.
            recv_stream
                .flow_control()
                .release_capacity(chunk.len())
                .map_err(SessionError::Stream)?;

            buf.extend_from_slice(&chunk);
        }

        tracing::debug!(status = %parts.status, body_len = buf.len(), "Received response");

        Ok(Response {
            status: parts.status,
            headers: parts.headers,
            body: buf.freeze(),
        })
    }
}

/// Writes a request body, respecting the connection and stream send windows.
///
/// If the window is exhausted mid-body the remainder is parked until the
/// peer opens it again with a WINDOW_UPDATE.
async fn send_body(
    mut stream: h2::SendStream<Bytes>,
    mut body: Bytes,
) -> Result<(), SessionError> {
    if body.is_empty() {
        return stream
            .send_data(Bytes::new(), true)
            .map_err(SessionError::Stream);
    }

    while !body.is_empty() {
        stream.reserve_capacity(body.len());

        let allowed = poll_fn(|cx| stream.poll_capacity(cx))
            .await
            .ok_or(SessionError::BodySend)?
            .map_err(SessionError::Stream)?;

        if allowed == 0 {
            continue;
        }

        let chunk = body.split_to(allowed.min(body.len()));
        stream
            .send_data(chunk, body.is_empty())
            .map_err(SessionError::Stream)?;
    }

    Ok(())
}
