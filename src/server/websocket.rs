use crate::capture::session::{ PersistOutcome, SessionState };
use crate::cli::Args;
use crate::models::websocket::{ ClientMessage, ServerMessage };
use crate::service::CaptureService;

use std::error::Error;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::collections::HashMap;

use tokio::net::TcpListener;
use tokio::io::{ AsyncRead, AsyncWrite };
use tokio::sync::mpsc::{ self, UnboundedSender };
use tokio::task::JoinHandle;

use tokio_tungstenite::{ accept_hdr_async, WebSocketStream };
use tokio_tungstenite::tungstenite::handshake::server::{ Request, Response, ErrorResponse };
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_rustls::TlsAcceptor;

use rustls::ServerConfig;
use rustls::pki_types::{ CertificateDer, PrivateKeyDer };
use rustls_pemfile::{ certs, pkcs8_private_keys };

use lazy_static::lazy_static;
use governor::{ RateLimiter, Quota, state::{ InMemoryState, NotKeyed }, clock::DefaultClock };

use hmac::{ Hmac, Mac };
use sha2::Sha256;
use chrono::Utc;
use url::form_urlencoded;

use log::{ debug, info, warn, error };
use futures::{ SinkExt, StreamExt };
use futures::stream::SplitSink;

type HmacSha256 = Hmac<Sha256>;

const MAX_MESSAGE_SIZE: usize = 1 * 1024 * 1024;
const MAX_CLOCK_SKEW_SECS: i64 = 300;

lazy_static! {
    static ref CONNECTION_LIMITER: RateLimiter<NotKeyed, InMemoryState, DefaultClock> =
        RateLimiter::direct(Quota::per_second(NonZeroU32::MIN.saturating_add(9)));
}

pub(crate) fn load_tls_config(
    cert_path: &str,
    key_path: &str
) -> Result<Arc<ServerConfig>, Box<dyn Error + Send + Sync>> {
    let cert_file = File::open(cert_path).map_err(|e|
        format!("Failed to open TLS certificate file '{}': {}", cert_path, e)
    )?;
    let key_file = File::open(key_path).map_err(|e|
        format!("Failed to open TLS key file '{}': {}", key_path, e)
    )?;

    let mut cert_reader = BufReader::new(cert_file);
    let mut key_reader = BufReader::new(key_file);
    let cert_chain: Vec<CertificateDer<'static>> = certs(&mut cert_reader)
        .collect::<Result<_, _>>()
        .map_err(|e| format!("Failed to read certificate(s): {}", e))?;

    let mut keys = pkcs8_private_keys(&mut key_reader);
    let key = match keys.next() {
        Some(Ok(k)) => PrivateKeyDer::Pkcs8(k),
        Some(Err(e)) => {
            return Err(format!("Error reading private key: {}", e).into());
        }
        None => {
            return Err("No PKCS8 private key found in key file".into());
        }
    };

    let config = ServerConfig::builder().with_no_client_auth().with_single_cert(cert_chain, key)?;
    Ok(Arc::new(config))
}

pub async fn start_ws_server(
    addr: &str,
    service: Arc<CaptureService>,
    args: Args,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    let api_key = args.server_api_key.clone().filter(|k| !k.trim().is_empty());

    if api_key.is_some() {
        info!("Capture server requires signed handshakes.");
    } else {
        warn!("Capture server configured WITHOUT API key authentication. Connections are open.");
    }

    let protocol = if
        args.enable_tls &&
        args.tls_cert_path.is_some() &&
        args.tls_key_path.is_some()
    {
        "wss"
    } else {
        "ws"
    };
    info!("{} server listening on: {}", protocol.to_uppercase(), addr);

    let tls_acceptor = if args.enable_tls {
        match (&args.tls_cert_path, &args.tls_key_path) {
            (Some(cert_path), Some(key_path)) => {
                info!(
                    "TLS enabled. Loading certificate from '{}' and key from '{}'",
                    cert_path,
                    key_path
                );
                let config = load_tls_config(cert_path, key_path)?;
                Some(TlsAcceptor::from(config))
            }
            (Some(_), None) | (None, Some(_)) => {
                error!("Both --tls-cert-path and --tls-key-path must be provided to enable TLS.");
                return Err("Missing TLS certificate or key path".into());
            }
            (None, None) => {
                error!("--enable-tls was set but no certificate/key paths provided.");
                return Err("TLS enabled without cert/key".into());
            }
        }
    } else {
        info!("TLS not enabled. Running plain WebSocket (WS) server.");
        None
    };

    loop {
        let (stream, peer) = listener.accept().await?;

        if CONNECTION_LIMITER.check().is_err() {
            warn!("Global connection rate limit exceeded for {}. Dropping connection.", peer);
            continue;
        }

        info!("Incoming connection from: {}", peer);
        let service_clone = Arc::clone(&service);
        let required_api_key = api_key.clone();
        let tls_acceptor_clone = tls_acceptor.clone();

        tokio::spawn(async move {
            let process_result = if let Some(acceptor) = tls_acceptor_clone {
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        info!("TLS handshake successful for {}", peer);
                        process_connection(
                            peer,
                            tls_stream,
                            service_clone,
                            required_api_key
                        ).await
                    }
                    Err(e) => {
                        error!("TLS handshake error for {}: {}", peer, e);
                        Err(Box::new(e) as Box<dyn Error + Send + Sync>)
                    }
                }
            } else {
                process_connection(peer, stream, service_clone, required_api_key).await
            };

            if let Err(e) = process_result {
                error!("Failed to process connection for {}: {}", peer, e);
            }
        });
    }
}

fn reject(reason: &str) -> ErrorResponse {
    let mut res = ErrorResponse::new(Some(reason.to_string()));
    *res.status_mut() = StatusCode::UNAUTHORIZED;
    res
}

/// Checks `ts`/`sig` query parameters: `sig` must be the hex HMAC-SHA256 of `ts`
/// under the shared secret, and `ts` must be within the allowed clock skew.
pub(crate) fn verify_signature(query: &str, secret: &str, now: i64) -> Result<(), &'static str> {
    let params: HashMap<String, String> = form_urlencoded
        ::parse(query.as_bytes())
        .into_owned()
        .collect();

    let ts = params.get("ts").or_else(|| params.get("X-Api-Ts"));
    let sig = params.get("sig").or_else(|| params.get("X-Api-Sign"));
    let (Some(ts), Some(sig)) = (ts, sig) else {
        return Err("missing ts/sig");
    };

    let ts_i: i64 = ts.parse().unwrap_or(0);
    if (now - ts_i).abs() > MAX_CLOCK_SKEW_SECS {
        return Err("timestamp out of range");
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| "bad secret")?;
    mac.update(ts.as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());
    if expected.eq_ignore_ascii_case(sig) {
        Ok(())
    } else {
        Err("bad signature")
    }
}

async fn process_connection<S>(
    peer: SocketAddr,
    stream: S,
    service: Arc<CaptureService>,
    required_api_key: Option<String>
) -> Result<(), Box<dyn Error + Send + Sync>>
    where S: AsyncRead + AsyncWrite + Unpin + Send + 'static
{
    let auth_callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let secret = match &required_api_key {
            Some(k) if !k.is_empty() => k,
            _ => return Ok(response),
        };
        let query = req.uri().query().unwrap_or("");
        match verify_signature(query, secret, Utc::now().timestamp()) {
            Ok(()) => {
                info!("{} authenticated", peer);
                Ok(response)
            }
            Err(reason) => {
                warn!("{}: rejected handshake ({})", peer, reason);
                Err(reject(reason))
            }
        }
    };

    match accept_hdr_async(stream, auth_callback).await {
        Ok(ws) => {
            handle_connection(peer, ws, service).await;
            Ok(())
        }
        Err(e) => {
            error!("Handshake failed for {}: {}", peer, e);
            Err(Box::new(e) as _)
        }
    }
}

async fn send_frame<S>(
    tx: &mut SplitSink<WebSocketStream<S>, Message>,
    peer: SocketAddr,
    frame: &ServerMessage
) -> bool
    where S: AsyncRead + AsyncWrite + Unpin
{
    let json = match serde_json::to_string(frame) {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to encode frame for {}: {}", peer, e);
            return true;
        }
    };
    match tx.send(Message::Text(json)).await {
        Ok(()) => true,
        Err(e) => {
            error!("Error sending frame to {}: {}", peer, e);
            false
        }
    }
}

/// Per-connection state: the mount and its in-flight helpers.
struct Connection {
    peer: SocketAddr,
    service: Arc<CaptureService>,
    state: SessionState,
    probes: Option<JoinHandle<()>>,
    frames: UnboundedSender<ServerMessage>,
    outcomes: UnboundedSender<PersistOutcome>,
}

enum Flow {
    Continue,
    Close,
}

impl Connection {
    fn emit(&self, frame: ServerMessage) {
        if self.frames.send(frame).is_err() {
            debug!("Frame queue closed for {}", self.peer);
        }
    }

    fn cancel_probes(&mut self) {
        if let Some(handle) = self.probes.take() {
            handle.abort();
        }
    }

    fn on_client_message(&mut self, message: ClientMessage) -> Flow {
        match message {
            ClientMessage::Mount { profile, response_id } => {
                self.cancel_probes();
                let session = self.service.mount(profile.unwrap_or_default(), response_id);
                let session = self.state.mount(session);
                info!("Assigned session ID {} to {}", session.session_id(), self.peer);

                let mounted = session.mounted_message();
                let opening = session.opening_records();
                let summary = session.summary(false);
                let probes = self.service.schedule_probes(session, self.frames.clone());

                self.emit(mounted);
                for record in opening {
                    self.service.dispatch(record, self.outcomes.clone());
                }
                if let Some(summary) = summary {
                    self.emit(summary);
                }
                self.probes = Some(probes);
            }
            ClientMessage::WidgetMessage { origin, data } => {
                let Some(session) = self.state.active_mut() else {
                    debug!("Widget message from {} before mount, ignoring", self.peer);
                    return Flow::Continue;
                };
                let records = self.service.ingest(session, &origin, data);
                if records.is_empty() {
                    return Flow::Continue;
                }
                let summary = session.summary(false);
                for record in records {
                    self.service.dispatch(record, self.outcomes.clone());
                }
                if let Some(summary) = summary {
                    self.emit(summary);
                }
            }
            ClientMessage::WidgetStatus { status } => {
                let frame = self.state.active_mut().and_then(|s| s.widget_status(status));
                if let Some(frame) = frame {
                    self.emit(frame);
                }
            }
            ClientMessage::RetryTransport => {
                if let Some(frame) = self.state.active_mut().map(|s| s.retry_transport()) {
                    self.emit(frame);
                }
            }
            ClientMessage::Unmount => {
                self.cancel_probes();
                if let Some(summary) = self.state.active().and_then(|s| s.summary(true)) {
                    self.emit(summary);
                }
                return Flow::Close;
            }
        }
        Flow::Continue
    }

    fn on_outcome(&mut self, outcome: PersistOutcome) {
        let frames = match self.state.active_mut() {
            Some(session) => session.record_outcome(&outcome),
            None => Vec::new(),
        };
        for frame in frames {
            self.emit(frame);
        }
    }
}

pub async fn handle_connection<S>(
    peer: SocketAddr,
    websocket: WebSocketStream<S>,
    service: Arc<CaptureService>
)
    where S: AsyncRead + AsyncWrite + Unpin
{
    info!("New WebSocket connection: {}", peer);

    let (mut tx, mut rx) = websocket.split();
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let (outcomes_tx, mut outcomes_rx) = mpsc::unbounded_channel::<PersistOutcome>();
    let mut conn = Connection {
        peer,
        service,
        state: SessionState::default(),
        probes: None,
        frames: frames_tx,
        outcomes: outcomes_tx,
    };
    let mut closing = false;

    loop {
        tokio::select! {
            Some(frame) = frames_rx.recv() => {
                if !send_frame(&mut tx, peer, &frame).await {
                    break;
                }
            }
            Some(outcome) = outcomes_rx.recv() => {
                conn.on_outcome(outcome);
            }
            msg = rx.next(), if !closing => {
                let Some(msg) = msg else {
                    break;
                };
                match msg {
                    Ok(message) => {
                        if message.len() > MAX_MESSAGE_SIZE {
                            warn!(
                                "Message from {} exceeds size limit ({} > {})",
                                peer,
                                message.len(),
                                MAX_MESSAGE_SIZE
                            );
                            let error_msg = ServerMessage::Error {
                                message: "Message too large".to_string(),
                            };
                            send_frame(&mut tx, peer, &error_msg).await;
                            break;
                        }

                        match message {
                            Message::Text(text) => {
                                match serde_json::from_str::<ClientMessage>(&text) {
                                    Ok(client_message) => {
                                        if let Flow::Close = conn.on_client_message(client_message) {
                                            closing = true;
                                        }
                                    }
                                    Err(e) => {
                                        warn!("Failed to parse message from {}: {}", peer, e);
                                        conn.emit(ServerMessage::Error {
                                            message: format!("Failed to parse message: {}", e),
                                        });
                                    }
                                }
                            }
                            Message::Close(_) => {
                                info!("Received close frame from {}", peer);
                                break;
                            }
                            Message::Ping(ping_data) => {
                                if tx.send(Message::Pong(ping_data)).await.is_err() {
                                    error!("Failed to send pong to {}", peer);
                                    break;
                                }
                            }
                            Message::Pong(_) => {/* Usually ignore pongs */}
                            Message::Binary(_) => {
                                warn!("Ignoring binary message from {}", peer);
                            }
                            Message::Frame(_) => {/* Usually ignore raw frames */}
                        }
                    }
                    Err(e) => {
                        match e {
                            | tokio_tungstenite::tungstenite::Error::ConnectionClosed
                            | tokio_tungstenite::tungstenite::Error::Protocol(_)
                            | tokio_tungstenite::tungstenite::Error::Utf8 => {
                                info!("WebSocket connection closed or protocol error for {}: {}", peer, e);
                            }
                            tokio_tungstenite::tungstenite::Error::Io(ref io_err) if
                                io_err.kind() == std::io::ErrorKind::ConnectionReset
                            => {
                                info!("WebSocket connection reset by peer {}", peer);
                            }
                            _ => {
                                error!("Error receiving message from {}: {}", peer, e);
                            }
                        }
                        break;
                    }
                }
            }
            else => break,
        }

        // Flush what the last client frame queued before honouring an unmount.
        if closing && frames_rx.is_empty() {
            break;
        }
    }

    conn.cancel_probes();
    let _ = tx.close().await;
    let session_id = conn.state
        .active()
        .map(|s| s.session_id().to_string())
        .unwrap_or_else(|| "none".to_string());
    info!("WebSocket connection closed for {} (Session ID: {})", peer, session_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, ts: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(ts.to_string().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn accepts_fresh_signed_timestamp() {
        let now = 1_760_000_000;
        let query = format!("ts={}&sig={}", now, sign("secret", now));
        assert_eq!(verify_signature(&query, "secret", now + 10), Ok(()));
    }

    #[test]
    fn rejects_bad_or_stale_signatures() {
        let now = 1_760_000_000;
        assert_eq!(verify_signature("", "secret", now), Err("missing ts/sig"));

        let stale = format!("ts={}&sig={}", now - 600, sign("secret", now - 600));
        assert_eq!(verify_signature(&stale, "secret", now), Err("timestamp out of range"));

        let forged = format!("ts={}&sig={}", now, sign("other", now));
        assert_eq!(verify_signature(&forged, "secret", now), Err("bad signature"));
    }

    #[test]
    fn reject_sets_unauthorized() {
        let res = reject("bad signature");
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(res.body().as_deref(), Some("bad signature"));
    }
}
