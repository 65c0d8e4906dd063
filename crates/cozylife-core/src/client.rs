use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info_span, Instrument, Span};

use crate::config::Endpoint;
use crate::protocol::{Attributes, CommandEnvelope, LineDecoder, ResponseEnvelope, SequenceGenerator};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("cannot connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },
    #[error("connect backoff, next attempt in {}ms", .remaining.as_millis())]
    BackingOff { remaining: Duration },
    #[error("write failed: {0}")]
    Write(String),
    #[error("read timeout")]
    ReadTimeout,
    #[error("device disconnected")]
    Disconnected,
    #[error("io error: {0}")]
    Io(String),
    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("device rejected request: res={0:?}")]
    Protocol(Option<i64>),
}

// Transport and protocol failures degrade to `false` / `None` here.
#[async_trait]
pub trait SwitchDriver: Send + Sync {
    async fn test_connection(&self) -> bool;
    async fn send_command(&self, on: bool) -> bool;
    async fn query_state(&self) -> Option<Attributes>;
    // Only true when the last request was turned away by the retry window.
    fn is_backing_off(&self) -> bool;
}

#[derive(Debug)]
pub(crate) struct BackoffGate {
    retry_delay: Duration,
    last_attempt: Option<Instant>,
    connected: bool,
    turned_away: bool,
}

impl BackoffGate {
    pub(crate) fn new(retry_delay: Duration) -> Self {
        Self {
            retry_delay,
            last_attempt: None,
            connected: false,
            turned_away: false,
        }
    }

    pub(crate) fn remaining(&self, now: Instant) -> Option<Duration> {
        let last = self.last_attempt?;
        let elapsed = now.saturating_duration_since(last);
        (elapsed < self.retry_delay).then(|| self.retry_delay - elapsed)
    }

    pub(crate) fn admit(&mut self, now: Instant) -> Result<(), Duration> {
        if let Some(remaining) = self.remaining(now) {
            self.turned_away = true;
            return Err(remaining);
        }
        self.turned_away = false;
        self.last_attempt = Some(now);
        Ok(())
    }

    pub(crate) fn mark_connected(&mut self) {
        self.connected = true;
    }

    pub(crate) fn mark_closed(&mut self, orderly: bool) {
        self.connected = false;
        // An orderly close does not delay the next connect.
        if orderly {
            self.last_attempt = None;
            self.turned_away = false;
        }
    }

    pub(crate) fn is_backing_off(&self, now: Instant) -> bool {
        !self.connected && self.turned_away && self.remaining(now).is_some()
    }
}

// A reply to an abandoned request must not be taken for the next one.
fn discard_stale(stream: &TcpStream) -> Result<(), DriverError> {
    let mut scratch = [0_u8; 1024];
    loop {
        match stream.try_read(&mut scratch) {
            Ok(0) => return Err(DriverError::Disconnected),
            Ok(read) => debug!(read, "discarding stale bytes"),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
            Err(err) => return Err(io_error(err)),
        }
    }
}

fn accepted_data(response: &ResponseEnvelope) -> Option<Attributes> {
    if matches!(response.res, Some(res) if res != 0) {
        debug!(err = %DriverError::Protocol(response.res), "query rejected");
        return None;
    }
    let data = response.data();
    if data.is_none() {
        debug!("query reply carried no message");
    }
    data
}

fn io_error(err: std::io::Error) -> DriverError {
    match err.kind() {
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::BrokenPipe => DriverError::Disconnected,
        _ => DriverError::Io(err.to_string()),
    }
}

#[derive(Debug)]
pub struct TcpDeviceClient {
    endpoint: Endpoint,
    link: tokio::sync::Mutex<Option<TcpStream>>,
    gate: Mutex<BackoffGate>,
    sequence: SequenceGenerator,
    connect_attempts: AtomicU64,
    span: Span,
}

impl TcpDeviceClient {
    pub fn new(endpoint: Endpoint) -> Self {
        let span = info_span!("cozylife", device = %endpoint);
        Self {
            gate: Mutex::new(BackoffGate::new(endpoint.retry_delay)),
            endpoint,
            link: tokio::sync::Mutex::new(None),
            sequence: SequenceGenerator::default(),
            connect_attempts: AtomicU64::new(0),
            span,
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.gate.lock().connected
    }

    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    pub async fn device_info(&self) -> Option<Map<String, Value>> {
        let command = CommandEnvelope::info(self.sequence.next());
        match self.request(&command).instrument(self.span.clone()).await {
            Ok(response) => response.message().cloned(),
            Err(err) => {
                debug!(parent: &self.span, %err, "info request failed");
                None
            }
        }
    }

    pub async fn close(&self) {
        let mut link = self.link.lock().await;
        self.teardown(&mut link, true).await;
    }

    async fn request(&self, command: &CommandEnvelope) -> Result<ResponseEnvelope, DriverError> {
        let mut link = self.link.lock().await;
        self.exchange(&mut link, command).await
    }

    async fn exchange(
        &self,
        link: &mut Option<TcpStream>,
        command: &CommandEnvelope,
    ) -> Result<ResponseEnvelope, DriverError> {
        self.ensure_connected(link).await?;
        let frame = command.encode()?;

        let result = match link.as_mut() {
            Some(stream) => self.round_trip(stream, &frame).await,
            None => Err(DriverError::Disconnected),
        };

        match result {
            Ok(response) => Ok(response),
            Err(err) => {
                debug!(%err, "exchange failed, dropping connection");
                self.teardown(link, false).await;
                Err(err)
            }
        }
    }

    async fn ensure_connected(&self, link: &mut Option<TcpStream>) -> Result<(), DriverError> {
        if link.is_some() {
            return Ok(());
        }

        self.gate
            .lock()
            .admit(Instant::now())
            .map_err(|remaining| DriverError::BackingOff { remaining })?;
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);

        let addr = self.endpoint.to_string();
        let target = (self.endpoint.host.as_str(), self.endpoint.port);
        let stream = match timeout(self.endpoint.connect_timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                return Err(DriverError::Connect {
                    addr,
                    reason: err.to_string(),
                })
            }
            Err(_) => {
                return Err(DriverError::Connect {
                    addr,
                    reason: format!(
                        "timed out after {}ms",
                        self.endpoint.connect_timeout.as_millis()
                    ),
                })
            }
        };

        if let Err(err) = stream.set_nodelay(true) {
            debug!(%err, "failed to set TCP_NODELAY");
        }
        self.gate.lock().mark_connected();
        debug!(%addr, "connected");
        *link = Some(stream);
        Ok(())
    }

    async fn round_trip(
        &self,
        stream: &mut TcpStream,
        frame: &[u8],
    ) -> Result<ResponseEnvelope, DriverError> {
        discard_stale(stream)?;
        match timeout(self.endpoint.read_timeout, stream.write_all(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(DriverError::Write(err.to_string())),
            Err(_) => return Err(DriverError::Write("timed out".to_string())),
        }
        self.read_response(stream).await
    }

    async fn read_response(&self, stream: &mut TcpStream) -> Result<ResponseEnvelope, DriverError> {
        let deadline = Instant::now() + self.endpoint.read_timeout;
        let mut decoder = LineDecoder::default();
        let mut chunk = [0_u8; 1024];

        loop {
            if let Some(response) = decoder.next_response() {
                return Ok(response);
            }

            let read = match timeout_at(deadline, stream.read(&mut chunk)).await {
                Ok(Ok(read)) => read,
                Ok(Err(err)) => return Err(io_error(err)),
                Err(_) => return Err(DriverError::ReadTimeout),
            };
            if read == 0 {
                return Err(DriverError::Disconnected);
            }
            decoder.push(&chunk[..read]);
        }
    }

    async fn teardown(&self, link: &mut Option<TcpStream>, orderly: bool) {
        if let Some(mut stream) = link.take() {
            if let Err(err) = stream.shutdown().await {
                debug!(%err, "ignoring error while closing connection");
            }
        }
        self.gate.lock().mark_closed(orderly);
    }
}

#[async_trait]
impl SwitchDriver for TcpDeviceClient {
    async fn test_connection(&self) -> bool {
        async {
            let mut link = self.link.lock().await;
            let command = CommandEnvelope::query(
                self.sequence.next(),
                self.endpoint.query_mode.attributes(),
            );
            let outcome = self.exchange(&mut link, &command).await;
            self.teardown(&mut link, outcome.is_ok()).await;

            match outcome {
                Ok(response) => accepted_data(&response).is_some(),
                Err(err) => {
                    debug!(%err, "connection test failed");
                    false
                }
            }
        }
        .instrument(self.span.clone())
        .await
    }

    async fn send_command(&self, on: bool) -> bool {
        let command = CommandEnvelope::switch(self.sequence.next(), on);
        async {
            match self.request(&command).await {
                Ok(response) if response.is_success() => true,
                Ok(response) => {
                    debug!(on, err = %DriverError::Protocol(response.res), "switch command rejected");
                    false
                }
                Err(err) => {
                    debug!(on, %err, "switch command failed");
                    false
                }
            }
        }
        .instrument(self.span.clone())
        .await
    }

    async fn query_state(&self) -> Option<Attributes> {
        let command = CommandEnvelope::query(
            self.sequence.next(),
            self.endpoint.query_mode.attributes(),
        );
        async {
            match self.request(&command).await {
                Ok(response) => accepted_data(&response),
                Err(err) => {
                    debug!(%err, "query failed");
                    None
                }
            }
        }
        .instrument(self.span.clone())
        .await
    }

    fn is_backing_off(&self) -> bool {
        self.gate.lock().is_backing_off(Instant::now())
    }
}
