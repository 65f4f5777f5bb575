//! Relay WebSocket session
//!
//! One [`RelayListener::listen`] call owns exactly one streaming connection.
//! The socket is split: the read half belongs to the receive loop, the write
//! half sits behind a mutex shared by the receive loop (acknowledgments), the
//! liveness loop (pings) and the shutdown sequence.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::sink::SinkExt;
use futures_util::stream::{SplitSink, SplitStream, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, oneshot, watch};
use tokio::time::{Instant, interval_at, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, Request};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};
use url::Url;

use super::types::{
    DISCONNECT_MESSAGE, InboundEvent, LISTEN_PATH, LISTEN_REQUEST_HEADER, ListenRequest,
    RelayError, SessionState,
};
use crate::forward::Forwarder;

/// Time allowed to write a frame to the relay
pub const DEFAULT_WRITE_WAIT: Duration = Duration::from_secs(10);

/// Read timeout tolerated by the relay before it drops a silent client
pub const DEFAULT_PONG_WAIT: Duration = Duration::from_secs(10);

/// Upper bound on the opening handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(45);

/// How long shutdown waits for the receive loop after the close frame
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SharedSink = Arc<Mutex<SplitSink<WsStream, Message>>>;

/// Send pings with this period; must stay below the relay's read timeout
pub fn ping_period(pong_wait: Duration) -> Duration {
    pong_wait * 9 / 10
}

#[derive(Debug, Clone)]
pub struct ListenerOptions {
    /// Relay host, e.g. `https://relay.example.com`
    pub host: String,
    /// Device credential presented as a bearer token
    pub credential: String,
    pub handshake_timeout: Duration,
    pub write_wait: Duration,
    pub ping_period: Duration,
    pub shutdown_grace: Duration,
}

impl ListenerOptions {
    pub fn new(host: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            credential: credential.into(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            write_wait: DEFAULT_WRITE_WAIT,
            ping_period: ping_period(DEFAULT_PONG_WAIT),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Streaming endpoint derived from the host reference
    pub fn stream_url(&self) -> Result<Url, RelayError> {
        let host = self.host.trim();
        let mut url = Url::parse(host)
            .map_err(|e| RelayError::Config(format!("Error parsing host URL {}: {}", host, e)))?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(RelayError::Config(format!(
                    "unsupported host scheme {} in {}",
                    other, host
                )));
            }
        };
        if url.host_str().is_none() {
            return Err(RelayError::Config(format!("host URL {} has no host", host)));
        }

        url.set_scheme(scheme)
            .map_err(|_| RelayError::Config(format!("cannot use scheme {} for {}", scheme, host)))?;
        url.set_path(LISTEN_PATH);
        url.set_query(None);
        url.set_fragment(None);

        Ok(url)
    }
}

/// Counters reported when a session ends
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStats {
    pub frames_received: u64,
    pub malformed_frames: u64,
    pub events_forwarded: u64,
    pub forward_failures: u64,
    pub acks_sent: u64,
}

#[derive(Debug, Default)]
struct Counters {
    frames_received: AtomicU64,
    malformed_frames: AtomicU64,
    events_forwarded: AtomicU64,
    forward_failures: AtomicU64,
    acks_sent: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SessionStats {
        SessionStats {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            events_forwarded: self.events_forwarded.load(Ordering::Relaxed),
            forward_failures: self.forward_failures.load(Ordering::Relaxed),
            acks_sent: self.acks_sent.load(Ordering::Relaxed),
        }
    }
}

/// What ended the active phase
#[derive(Debug, Clone, Copy, PartialEq)]
enum DrainTrigger {
    Interrupt,
    ReceiverDone,
    LivenessLost,
}

/// State shared by the receive loop
struct ReceiveContext {
    sink: SharedSink,
    forwarder: Arc<Forwarder>,
    forward_to: String,
    counters: Arc<Counters>,
    /// Held while one event is forwarded and acknowledged
    in_flight: Arc<Mutex<()>>,
    write_wait: Duration,
}

/// Relay subscription session
pub struct RelayListener {
    options: ListenerOptions,
    forwarder: Arc<Forwarder>,
    state_tx: watch::Sender<SessionState>,
    state_rx: watch::Receiver<SessionState>,
}

impl RelayListener {
    pub fn new(options: ListenerOptions, forwarder: Forwarder) -> Self {
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);

        Self {
            options,
            forwarder: Arc::new(forwarder),
            state_tx,
            state_rx,
        }
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        self.state_rx.borrow().clone()
    }

    /// Watch state transitions from another task
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    fn set_state(&self, state: SessionState) {
        debug!("Session state -> {:?}", state);
        self.state_tx.send_replace(state);
    }

    /// Run one session until `interrupt` resolves or the connection ends
    ///
    /// The interrupt future must already be registered with the signal source
    /// when passed in.
    pub async fn listen<F>(
        &self,
        request: &ListenRequest,
        interrupt: F,
    ) -> Result<SessionStats, RelayError>
    where
        F: Future<Output = ()>,
    {
        request.validate()?;
        let url = self.options.stream_url()?;
        let handshake = self.handshake_request(&url, request)?;

        self.set_state(SessionState::Connecting);
        info!("Connecting to relay at {}", url);

        tokio::pin!(interrupt);
        let connected = tokio::select! {
            result = timeout(self.options.handshake_timeout, connect_async(handshake)) => match result {
                Ok(Ok((ws_stream, _))) => Ok(ws_stream),
                Ok(Err(e)) => Err(handshake_error(e)),
                Err(_) => Err(RelayError::Handshake(format!(
                    "no handshake response from relay within {:?}",
                    self.options.handshake_timeout
                ))),
            },
            _ = &mut interrupt => Err(RelayError::Handshake(
                "interrupted before the relay answered the handshake".to_string(),
            )),
        };

        let ws_stream = match connected {
            Ok(ws_stream) => ws_stream,
            Err(err) => {
                error!("{}", err);
                self.set_state(SessionState::Failed(err.to_string()));
                return Err(err);
            }
        };

        let (sink, stream) = ws_stream.split();
        let sink: SharedSink = Arc::new(Mutex::new(sink));

        if let Err(e) = write_frame(&sink, Message::Ping(Vec::new()), self.options.write_wait).await
        {
            error!("Initial liveness probe failed: {}", e);
            self.set_state(SessionState::Failed(e.to_string()));
            return Err(e);
        }

        self.set_state(SessionState::Active);
        info!(
            "Connected to relay, forwarding events to {}",
            request.forward_to
        );

        if let Some(marker) = &request.since {
            // Written before the loops start so it precedes every event frame
            let frame = Message::Text(marker.to_wire());
            if let Err(e) = write_frame(&sink, frame, self.options.write_wait).await {
                error!("an error occurred sending 'since' message: {}", e);
            }
        }

        let counters = Arc::new(Counters::default());
        let in_flight = Arc::new(Mutex::new(()));
        let (done_tx, mut done_rx) = oneshot::channel();

        let context = ReceiveContext {
            sink: sink.clone(),
            forwarder: self.forwarder.clone(),
            forward_to: request.forward_to.clone(),
            counters: counters.clone(),
            in_flight: in_flight.clone(),
            write_wait: self.options.write_wait,
        };
        let receiver = tokio::spawn(receive_loop(stream, context, done_tx));
        let mut liveness = tokio::spawn(liveness_loop(
            sink.clone(),
            self.options.ping_period,
            self.options.write_wait,
        ));

        let trigger = tokio::select! {
            _ = &mut interrupt => DrainTrigger::Interrupt,
            _ = &mut done_rx => DrainTrigger::ReceiverDone,
            _ = &mut liveness => DrainTrigger::LivenessLost,
        };

        self.set_state(SessionState::Draining);
        info!("Session draining ({:?})", trigger);
        self.drain(&sink, &in_flight, trigger, done_rx).await;

        liveness.abort();
        receiver.abort();

        let stats = counters.snapshot();
        self.set_state(SessionState::Closed);
        info!(
            frames = stats.frames_received,
            forwarded = stats.events_forwarded,
            failed = stats.forward_failures,
            malformed = stats.malformed_frames,
            acks = stats.acks_sent,
            "Relay session closed"
        );

        Ok(stats)
    }

    /// Courtesy close: disconnect notice, close frame, bounded wait
    async fn drain(
        &self,
        sink: &SharedSink,
        in_flight: &Mutex<()>,
        trigger: DrainTrigger,
        done_rx: oneshot::Receiver<()>,
    ) {
        // Let the current event finish; nothing new starts after this
        let _in_flight = in_flight.lock().await;

        let disconnect = Message::Text(DISCONNECT_MESSAGE.to_string());
        if let Err(e) = write_frame(sink, disconnect, self.options.write_wait).await {
            log_shutdown_failure(trigger, &e);
            return;
        }

        let close = Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        }));
        if let Err(e) = write_frame(sink, close, self.options.write_wait).await {
            log_shutdown_failure(trigger, &e);
            return;
        }

        if trigger == DrainTrigger::ReceiverDone {
            return;
        }

        match timeout(self.options.shutdown_grace, done_rx).await {
            Ok(_) => info!("Receiver Channel Closed! Exiting...."),
            Err(_) => info!("Timeout in closing receiving channel. Exiting...."),
        }
    }

    fn handshake_request(
        &self,
        url: &Url,
        request: &ListenRequest,
    ) -> Result<Request<()>, RelayError> {
        let mut handshake = url
            .as_str()
            .into_client_request()
            .map_err(|e| RelayError::Config(format!("invalid relay URL {}: {}", url, e)))?;

        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.options.credential))
            .map_err(|e| RelayError::Config(format!("invalid device credential: {}", e)))?;
        let body = HeaderValue::from_bytes(request.to_header_value()?.as_bytes())
            .map_err(|e| RelayError::Config(format!("invalid listen request: {}", e)))?;
        let body_header = HeaderName::from_bytes(LISTEN_REQUEST_HEADER.as_bytes())
            .map_err(|e| RelayError::Config(e.to_string()))?;

        let headers = handshake.headers_mut();
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(body_header, body);

        Ok(handshake)
    }
}

async fn receive_loop(
    mut stream: SplitStream<WsStream>,
    context: ReceiveContext,
    done_tx: oneshot::Sender<()>,
) {
    while let Some(message) = stream.next().await {
        let frame = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Skipping binary frame that is not UTF-8: {}", e);
                    Counters::bump(&context.counters.malformed_frames);
                    continue;
                }
            },
            Ok(Message::Close(frame)) => {
                info!("Relay closed the connection: {:?}", frame);
                break;
            }
            Ok(other) => {
                debug!("Ignoring control frame: {:?}", other);
                continue;
            }
            Err(e) => {
                if is_expected_close(&e) {
                    info!("Relay connection closed: {}", e);
                } else {
                    error!("an error occurred in the receive handler: {}", e);
                }
                break;
            }
        };

        Counters::bump(&context.counters.frames_received);

        let event = match InboundEvent::from_frame(&frame) {
            Ok(event) => event,
            Err(e) => {
                error!("an error occurred in unmarshalling json: {}", e);
                Counters::bump(&context.counters.malformed_frames);
                continue;
            }
        };

        let _in_flight = context.in_flight.lock().await;
        handle_event(&context, event).await;
    }

    let _ = done_tx.send(());
}

/// Forward one event, then acknowledge it whatever the outcome
async fn handle_event(context: &ReceiveContext, event: InboundEvent) {
    debug!(uid = %event.uid, "Received event");

    match context
        .forwarder
        .forward_event(&context.forward_to, &event)
        .await
    {
        Ok(outcome) => {
            if outcome.is_success() {
                Counters::bump(&context.counters.events_forwarded);
                info!(
                    uid = %event.uid,
                    status = outcome.status_code,
                    elapsed_ms = outcome.elapsed.as_millis() as u64,
                    "Forwarded event"
                );
            } else {
                Counters::bump(&context.counters.forward_failures);
                warn!(
                    uid = %event.uid,
                    status = outcome.status_code,
                    error = outcome.error.as_deref().unwrap_or(""),
                    "Forwarding did not succeed"
                );
            }
            info!("{}", outcome.body_text());
        }
        Err(e) => {
            Counters::bump(&context.counters.forward_failures);
            error!(uid = %event.uid, "an error occurred while forwarding the event: {}", e);
        }
    }

    let ack = match event.ack().to_frame() {
        Ok(ack) => ack,
        Err(e) => {
            error!("an error occurred in marshalling json: {}", e);
            return;
        }
    };

    match write_frame(&context.sink, Message::Text(ack), context.write_wait).await {
        Ok(()) => Counters::bump(&context.counters.acks_sent),
        Err(e) => error!(uid = %event.uid, "an error occurred while acknowledging the event: {}", e),
    }
}

/// Probe the connection until a write fails
async fn liveness_loop(sink: SharedSink, period: Duration, write_wait: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);

    loop {
        ticker.tick().await;
        if let Err(e) = write_frame(&sink, Message::Ping(Vec::new()), write_wait).await {
            error!("failed to write ping message: {}", e);
            return;
        }
        debug!("Sent liveness probe");
    }
}

/// Serialized write with a deadline covering lock acquisition and send
async fn write_frame(
    sink: &SharedSink,
    message: Message,
    deadline: Duration,
) -> Result<(), RelayError> {
    let write = async {
        let mut sink = sink.lock().await;
        sink.send(message).await
    };

    match timeout(deadline, write).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(RelayError::Connection(e.to_string())),
        Err(_) => Err(RelayError::Connection(format!(
            "write deadline of {:?} exceeded",
            deadline
        ))),
    }
}

fn log_shutdown_failure(trigger: DrainTrigger, error: &RelayError) {
    if trigger == DrainTrigger::Interrupt {
        error!("error during closing websocket: {}", error);
    } else {
        warn!("connection already gone while closing websocket: {}", error);
    }
}

/// Going-away style closes that end the loop without being reported as errors
fn is_expected_close(error: &WsError) -> bool {
    match error {
        WsError::ConnectionClosed | WsError::AlreadyClosed => true,
        WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => true,
        WsError::Io(e) => matches!(
            e.kind(),
            std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::UnexpectedEof
        ),
        _ => false,
    }
}

/// Prefer the relay's response body, it usually explains the refusal
fn handshake_error(error: WsError) -> RelayError {
    match error {
        WsError::Http(response) => {
            let body = response
                .body()
                .as_deref()
                .map(String::from_utf8_lossy)
                .filter(|body| !body.trim().is_empty());

            match body {
                Some(body) => RelayError::Handshake(body.into_owned()),
                None => RelayError::Handshake(format!("HTTP error: {}", response.status())),
            }
        }
        other => RelayError::Handshake(other.to_string()),
    }
}
