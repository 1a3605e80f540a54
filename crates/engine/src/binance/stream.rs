use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Deserializer};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use url::Url;

use common::{Bar, BarHandler, Error, Result, StreamSettings};

/// Binance futures kline WebSocket stream for one symbol and interval.
///
/// Keeps a single live connection, delivers every parsed bar to the handler
/// in arrival order, and reconnects with exponential backoff, rotating
/// through the candidate endpoints after each failure.
pub struct KlineStream {
    settings: StreamSettings,
    endpoints: Vec<Url>,
}

/// How a session ended without an error.
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Shutdown,
    Closed,
}

impl KlineStream {
    pub fn new(settings: StreamSettings) -> Result<Self> {
        let endpoints = endpoints(&settings)?;
        if endpoints.is_empty() {
            return Err(Error::Config("No WebSocket host configured".into()));
        }
        Ok(Self {
            settings,
            endpoints,
        })
    }

    pub fn endpoints(&self) -> &[Url] {
        &self.endpoints
    }

    /// Run until `shutdown` flips to true (or its sender is dropped).
    ///
    /// Connection problems never escape this loop; they are logged and
    /// retried. Errors from `handler` are logged and the stream continues.
    pub async fn run<H>(&self, handler: &mut H, mut shutdown: watch::Receiver<bool>) -> Result<()>
    where
        H: BarHandler + ?Sized,
    {
        let mut reconnect = Reconnect::new(Backoff::new(
            self.settings.backoff_initial,
            self.settings.backoff_max,
        ));

        loop {
            if *shutdown.borrow() {
                break;
            }

            let url = &self.endpoints[reconnect.cursor % self.endpoints.len()];
            info!(url = %url, "Connecting to kline stream");

            let mut delivered = 0u64;
            let outcome = self
                .session(url, handler, &mut shutdown, &mut delivered)
                .await;

            let rotate = match outcome {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Closed) if delivered > 0 => {
                    info!(url = %url, delivered, "Kline stream closed by server, reconnecting");
                    false
                }
                Ok(SessionEnd::Closed) => {
                    warn!(url = %url, "Kline stream closed before delivering data");
                    true
                }
                Err(e) => {
                    warn!(url = %url, error = %e, delivered, "Kline stream failed");
                    true
                }
            };

            let delay = reconnect.after_session(delivered, rotate);
            debug!(delay = ?delay, "Waiting before reconnect");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("Kline stream stopped");
        Ok(())
    }

    async fn session<H>(
        &self,
        url: &Url,
        handler: &mut H,
        shutdown: &mut watch::Receiver<bool>,
        delivered: &mut u64,
    ) -> Result<SessionEnd>
    where
        H: BarHandler + ?Sized,
    {
        let (ws, _) = tokio::time::timeout(self.settings.open_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| Error::WebSocket(format!("Timed out opening {url}")))?
            .map_err(|e| Error::WebSocket(e.to_string()))?;
        info!(url = %url, "Kline stream connected");

        let (mut write, mut read) = ws.split();

        let mut ping = tokio::time::interval(self.settings.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ping.tick().await;
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Shutdown);
                }
                msg = read.next() => {
                    let Some(msg) = msg else {
                        return Ok(SessionEnd::Closed);
                    };
                    let msg = msg.map_err(|e| Error::WebSocket(e.to_string()))?;
                    last_seen = Instant::now();

                    match msg {
                        Message::Text(text) => {
                            *delivered += 1;
                            match parse_kline(&text) {
                                Ok(Some(bar)) => {
                                    if let Err(e) = handler.on_bar(bar).await {
                                        error!(open_time = bar.open_time, error = %e, "Bar handler failed");
                                    }
                                    // Time spent in the handler is not server silence.
                                    last_seen = Instant::now();
                                }
                                Ok(None) => debug!("Ignoring non-kline message"),
                                Err(e) => warn!(error = %e, "Dropping malformed kline message"),
                            }
                        }
                        Message::Ping(payload) => {
                            write
                                .send(Message::Pong(payload))
                                .await
                                .map_err(|e| Error::WebSocket(e.to_string()))?;
                        }
                        Message::Close(frame) => {
                            info!(frame = ?frame, "Server sent close frame");
                            return Ok(SessionEnd::Closed);
                        }
                        _ => {}
                    }
                }
                _ = ping.tick() => {
                    if last_seen.elapsed() >= self.settings.ping_timeout {
                        return Err(Error::WebSocket(format!(
                            "No frame received for {:?}",
                            last_seen.elapsed()
                        )));
                    }
                    write
                        .send(Message::Ping(Vec::new()))
                        .await
                        .map_err(|e| Error::WebSocket(e.to_string()))?;
                }
            }
        }
    }
}

/// Candidate stream URLs: every host (primary first, de-duplicated) with the
/// raw path, then the combined-stream path.
pub fn endpoints(settings: &StreamSettings) -> Result<Vec<Url>> {
    let stream = format!(
        "{}@kline_{}",
        settings.symbol.to_lowercase(),
        settings.interval
    );

    let mut hosts: Vec<&str> = Vec::new();
    for host in std::iter::once(&settings.ws_base).chain(settings.fallback_hosts.iter()) {
        let host = host.trim().trim_end_matches('/');
        if !host.is_empty() && !hosts.contains(&host) {
            hosts.push(host);
        }
    }

    let mut urls = Vec::with_capacity(hosts.len() * 2);
    for host in hosts {
        for path in [
            format!("/ws/{stream}"),
            format!("/stream?streams={stream}"),
        ] {
            let url = Url::parse(&format!("{host}{path}"))
                .map_err(|e| Error::Config(format!("Invalid WebSocket host '{host}': {e}")))?;
            urls.push(url);
        }
    }
    Ok(urls)
}

/// Exponential reconnect delay: `initial`, `2 × initial`, … capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial.min(max),
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self
            .current
            .checked_mul(2)
            .unwrap_or(self.max)
            .min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial.min(self.max);
    }
}

/// Which candidate to dial next and how long to wait before dialing it.
#[derive(Debug)]
struct Reconnect {
    backoff: Backoff,
    cursor: usize,
}

impl Reconnect {
    fn new(backoff: Backoff) -> Self {
        Self { backoff, cursor: 0 }
    }

    /// Record a finished session. A session that delivered data resets the
    /// backoff; `rotate` moves on to the next candidate.
    fn after_session(&mut self, delivered: u64, rotate: bool) -> Duration {
        if delivered > 0 {
            self.backoff.reset();
        }
        if rotate {
            self.cursor += 1;
        }
        self.backoff.next_delay()
    }
}

// ─── Binance kline JSON parsing ──────────────────────────────────────────────

#[derive(Deserialize)]
struct KlineData {
    #[serde(rename = "t", deserialize_with = "lenient_i64")]
    open_time: i64,
    #[serde(rename = "T", deserialize_with = "lenient_i64")]
    close_time: i64,
    #[serde(rename = "o", deserialize_with = "lenient_f64")]
    open: f64,
    #[serde(rename = "h", deserialize_with = "lenient_f64")]
    high: f64,
    #[serde(rename = "l", deserialize_with = "lenient_f64")]
    low: f64,
    #[serde(rename = "c", deserialize_with = "lenient_f64")]
    close: f64,
    #[serde(rename = "v", deserialize_with = "lenient_f64")]
    volume: f64,
    #[serde(rename = "x")]
    is_closed: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Lenient<T> {
    Num(T),
    Str(String),
}

fn lenient_f64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<f64, D::Error> {
    match Lenient::<f64>::deserialize(d)? {
        Lenient::Num(v) => Ok(v),
        Lenient::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

fn lenient_i64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<i64, D::Error> {
    match Lenient::<i64>::deserialize(d)? {
        Lenient::Num(v) => Ok(v),
        Lenient::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Parse one text frame. Accepts raw kline events and enveloped ones
/// (`{"data": {...}}`, with or without a `stream` key). Any object carrying
/// a `k` payload is a kline; the `e` tag is optional.
///
/// `Ok(None)` for anything that is not a kline event.
pub fn parse_kline(text: &str) -> Result<Option<Bar>> {
    let mut value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| Error::Parse(format!("invalid JSON: {e}")))?;

    if let Some(data) = value.get_mut("data").filter(|d| d.is_object()) {
        value = data.take();
    }

    let tagged = value.get("e").and_then(|v| v.as_str()) == Some("kline");
    let payload = match value.get_mut("k").map(serde_json::Value::take) {
        Some(payload) => payload,
        None if tagged => return Err(Error::Parse("kline event without 'k' payload".into())),
        None => return Ok(None),
    };
    let k: KlineData = serde_json::from_value(payload)
        .map_err(|e| Error::Parse(format!("kline payload: {e}")))?;

    Ok(Some(Bar {
        open_time: k.open_time,
        close_time: k.close_time,
        open: k.open,
        high: k.high,
        low: k.low,
        close: k.close,
        volume: k.volume,
        is_closed: k.is_closed,
    }))
}
