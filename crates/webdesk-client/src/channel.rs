//! Topic-multiplexed WebSocket connection to the hub.
//!
//! A single driver task owns the socket. It reconnects with capped
//! exponential backoff, re-subscribes every tracked topic after each
//! successful connect, and fans inbound data frames out to per-topic
//! handlers. `connect()` always replaces the previous driver, so backoff
//! timers from an older connection can never stack with a newer one.

use crate::lock;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;
use webdesk_core::wire::{
    decode_frame, encode_frame, ClientFrame, FrameError, Inbound, ServerFrame, MAX_FRAME_BYTES,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("missing token")]
    MissingToken,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// `base * 2^(attempt - 1)`, capped at `max_delay`. Attempts are 1-based.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Disconnected => "disconnected",
            ChannelState::Connecting => "connecting",
            ChannelState::Connected => "connected",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelStatus {
    pub state: ChannelState,
    /// Automatic reconnect attempts made since the last successful connect.
    pub attempt: u32,
    pub last_delay: Option<Duration>,
    /// Set once the reconnect budget is spent; cleared by the next `connect()`.
    pub exhausted: bool,
}

/// A live, text-framed duplex connection.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, text: String) -> Result<(), ChannelError>;
    /// `None` once the peer has closed the connection.
    async fn recv(&mut self) -> Option<Result<String, ChannelError>>;
    async fn close(&mut self);
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Transport>, ChannelError>;
}

pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Transport>, ChannelError> {
        let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|err| ChannelError::Connect(err.to_string()))?;
        Ok(Box::new(TungsteniteTransport { ws }))
    }
}

struct TungsteniteTransport {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn send(&mut self, text: String) -> Result<(), ChannelError> {
        self.ws
            .send(Message::Text(text))
            .await
            .map_err(|err| ChannelError::Send(err.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, ChannelError>> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => {
                    return Some(
                        String::from_utf8(bytes)
                            .map_err(|err| ChannelError::Receive(err.to_string())),
                    )
                }
                Ok(Message::Close(frame)) => {
                    if let Some(frame) = frame {
                        info!(
                            event = "channel_close_frame",
                            code = u16::from(frame.code),
                            reason = %frame.reason
                        );
                    }
                    return None;
                }
                Ok(_) => continue,
                Err(err) => return Some(Err(ChannelError::Receive(err.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    pub reconnect: ReconnectPolicy,
    /// Keepalive interval; zero disables pings.
    pub ping_interval: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            ping_interval: Duration::from_secs(25),
        }
    }
}

/// A registered handler for one topic. Frames arrive in channel order.
pub struct Subscription {
    topic: String,
    id: u64,
    receiver: mpsc::UnboundedReceiver<Value>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn recv(&mut self) -> Option<Value> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Value> {
        self.receiver.try_recv().ok()
    }
}

#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

struct Inner {
    url: Url,
    connector: Arc<dyn Connector>,
    options: ChannelOptions,
    topics: Mutex<HashMap<String, Vec<(u64, mpsc::UnboundedSender<Value>)>>>,
    outbound: Mutex<Option<(u64, mpsc::UnboundedSender<String>)>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    epoch: AtomicU64,
    next_handler: AtomicU64,
    status: watch::Sender<ChannelStatus>,
}

impl Channel {
    pub fn new(url: Url, connector: Arc<dyn Connector>, options: ChannelOptions) -> Self {
        let (status, _) = watch::channel(ChannelStatus::default());
        Self {
            inner: Arc::new(Inner {
                url,
                connector,
                options,
                topics: Mutex::new(HashMap::new()),
                outbound: Mutex::new(None),
                driver: Mutex::new(None),
                epoch: AtomicU64::new(0),
                next_handler: AtomicU64::new(0),
                status,
            }),
        }
    }

    pub fn from_config(config: &crate::ClientConfig) -> Self {
        Self::new(
            config.ws_url.clone(),
            Arc::new(TungsteniteConnector),
            ChannelOptions {
                reconnect: config.reconnect,
                ping_interval: config.ping_interval,
            },
        )
    }

    /// Starts (or restarts) the driver with `token`. Any previous driver,
    /// including one sleeping in backoff, is aborted first.
    pub fn connect(&self, token: &str) -> Result<(), ChannelError> {
        if token.trim().is_empty() {
            return Err(ChannelError::MissingToken);
        }
        let mut url = self.inner.url.clone();
        url.query_pairs_mut().append_pair("token", token);

        let mut driver = lock(&self.inner.driver);
        if let Some(previous) = driver.take() {
            previous.abort();
        }
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        *lock(&self.inner.outbound) = None;
        self.inner.status.send_modify(|status| {
            *status = ChannelStatus {
                state: ChannelState::Connecting,
                ..ChannelStatus::default()
            }
        });
        let inner = self.inner.clone();
        *driver = Some(tokio::spawn(async move { inner.drive(epoch, url).await }));
        Ok(())
    }

    /// Stops the driver without reconnecting. Subscriptions are kept and
    /// re-sent on the next `connect()`.
    pub fn disconnect(&self) {
        let mut driver = lock(&self.inner.driver);
        if let Some(previous) = driver.take() {
            previous.abort();
        }
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        *lock(&self.inner.outbound) = None;
        self.inner
            .status
            .send_modify(|status| *status = ChannelStatus::default());
        info!(event = "channel_disconnect");
    }

    pub fn subscribe(&self, topic: &str) -> Subscription {
        let (tx, receiver) = mpsc::unbounded_channel();
        let id = self.inner.next_handler.fetch_add(1, Ordering::SeqCst);
        let mut topics = lock(&self.inner.topics);
        let handlers = topics.entry(topic.to_string()).or_default();
        let first = handlers.is_empty();
        handlers.push((id, tx));
        if first {
            self.inner.send_control(&ClientFrame::subscribe(topic));
        }
        debug!(event = "channel_subscribe", topic = topic, handlers = handlers.len());
        Subscription {
            topic: topic.to_string(),
            id,
            receiver,
        }
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        let mut topics = lock(&self.inner.topics);
        let Some(handlers) = topics.get_mut(&subscription.topic) else {
            return;
        };
        handlers.retain(|(id, _)| *id != subscription.id);
        if handlers.is_empty() {
            topics.remove(&subscription.topic);
            self.inner
                .send_control(&ClientFrame::unsubscribe(subscription.topic.as_str()));
        }
    }

    pub fn status(&self) -> watch::Receiver<ChannelStatus> {
        self.inner.status.subscribe()
    }

    pub fn state(&self) -> ChannelState {
        self.inner.status.borrow().state
    }

    pub fn topics(&self) -> Vec<String> {
        self.inner.tracked_topics()
    }
}

impl Inner {
    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    fn update_status(&self, epoch: u64, apply: impl FnOnce(&mut ChannelStatus)) {
        if self.is_current(epoch) {
            self.status.send_modify(apply);
        }
    }

    fn tracked_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = lock(&self.topics).keys().cloned().collect();
        topics.sort();
        topics
    }

    fn send_control(&self, frame: &ClientFrame) {
        let text = match encode_frame(frame, MAX_FRAME_BYTES) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "channel_encode_error", error = %err);
                return;
            }
        };
        if let Some((_, tx)) = lock(&self.outbound).as_ref() {
            let _ = tx.send(text);
        }
    }

    async fn drive(self: Arc<Self>, epoch: u64, url: Url) {
        let policy = self.options.reconnect;
        let mut attempt: u32 = 0;
        loop {
            self.update_status(epoch, |status| {
                status.state = ChannelState::Connecting;
                status.attempt = attempt;
            });
            match self.connector.connect(&url).await {
                Ok(transport) => {
                    attempt = 0;
                    self.run_session(epoch, transport).await;
                    info!(event = "channel_closed");
                }
                Err(err) => {
                    warn!(event = "channel_connect_error", attempt = attempt, error = %err);
                }
            }
            {
                let mut outbound = lock(&self.outbound);
                if matches!(outbound.as_ref(), Some((owner, _)) if *owner == epoch) {
                    *outbound = None;
                }
            }

            attempt += 1;
            if attempt > policy.max_attempts {
                self.update_status(epoch, |status| {
                    status.state = ChannelState::Disconnected;
                    status.exhausted = true;
                });
                warn!(event = "channel_reconnect_exhausted", attempts = policy.max_attempts);
                return;
            }
            let delay = policy.delay_for(attempt);
            self.update_status(epoch, |status| {
                status.state = ChannelState::Disconnected;
                status.attempt = attempt;
                status.last_delay = Some(delay);
            });
            info!(
                event = "channel_reconnect_scheduled",
                attempt = attempt,
                delay_ms = delay.as_millis() as u64
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Installs this session's outbound queue and seeds it with a subscribe
    /// frame per tracked topic. Both happen under the topics lock, so a
    /// concurrent `subscribe()` either lands in the replay or finds the queue.
    fn open_outbound(&self, epoch: u64) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let topics = lock(&self.topics);
        let mut replay: Vec<&String> = topics.keys().collect();
        replay.sort();
        for topic in replay {
            match encode_frame(&ClientFrame::subscribe(topic.as_str()), MAX_FRAME_BYTES) {
                Ok(frame) => {
                    let _ = tx.send(frame);
                }
                Err(err) => {
                    warn!(event = "channel_resubscribe_error", topic = %topic, error = %err)
                }
            }
        }
        *lock(&self.outbound) = Some((epoch, tx));
        rx
    }

    async fn run_session(&self, epoch: u64, mut transport: Box<dyn Transport>) {
        let mut rx = self.open_outbound(epoch);
        self.update_status(epoch, |status| {
            *status = ChannelStatus {
                state: ChannelState::Connected,
                ..ChannelStatus::default()
            }
        });
        info!(event = "channel_connected", url = %self.url);

        let ping_interval = self.options.ping_interval;
        let mut ping = (!ping_interval.is_zero()).then(|| {
            tokio::time::interval_at(tokio::time::Instant::now() + ping_interval, ping_interval)
        });

        loop {
            tokio::select! {
                inbound = transport.recv() => match inbound {
                    Some(Ok(text)) => self.dispatch(&text),
                    Some(Err(err)) => {
                        warn!(event = "channel_read_error", error = %err);
                        break;
                    }
                    None => break,
                },
                Some(out) = rx.recv() => {
                    if let Err(err) = transport.send(out).await {
                        warn!(event = "channel_write_error", error = %err);
                        break;
                    }
                }
                _ = next_tick(&mut ping) => {
                    let Ok(frame) = encode_frame(&ClientFrame::ping(), MAX_FRAME_BYTES) else {
                        continue;
                    };
                    if let Err(err) = transport.send(frame).await {
                        warn!(event = "channel_ping_error", error = %err);
                        break;
                    }
                }
            }
        }
        transport.close().await;
    }

    fn dispatch(&self, text: &str) {
        let frame: ServerFrame = match decode_frame(text, MAX_FRAME_BYTES) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "channel_frame_dropped", error = %err);
                return;
            }
        };
        match frame.classify() {
            Inbound::Ack(ack) => debug!(event = "channel_ack", ack = ?ack),
            Inbound::Ignored => debug!(event = "channel_frame_ignored"),
            Inbound::Data { topic, data } => {
                let mut topics = lock(&self.topics);
                let Some(handlers) = topics.get_mut(&topic) else {
                    debug!(event = "channel_no_handlers", topic = %topic);
                    return;
                };
                handlers.retain(|(_, tx)| tx.send(data.clone()).is_ok());
                if handlers.is_empty() {
                    topics.remove(&topic);
                    self.send_control(&ClientFrame::unsubscribe(topic.as_str()));
                }
            }
        }
    }
}

async fn next_tick(ping: &mut Option<tokio::time::Interval>) {
    match ping.as_mut() {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use tokio::time::Instant;

    struct MockPeer {
        to_client: mpsc::UnboundedSender<String>,
        from_client: mpsc::UnboundedReceiver<String>,
    }

    impl MockPeer {
        fn push(&self, frame: Value) {
            self.to_client.send(frame.to_string()).expect("client alive");
        }

        async fn next_control(&mut self) -> Value {
            loop {
                let raw = self.from_client.recv().await.expect("client frame");
                let value: Value = serde_json::from_str(&raw).expect("json");
                if value["action"] != "ping" {
                    return value;
                }
            }
        }
    }

    struct MockTransport {
        inbound: mpsc::UnboundedReceiver<String>,
        outbound: mpsc::UnboundedSender<String>,
        send_delay: Duration,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send(&mut self, text: String) -> Result<(), ChannelError> {
            if !self.send_delay.is_zero() {
                tokio::time::sleep(self.send_delay).await;
            }
            self.outbound
                .send(text)
                .map_err(|err| ChannelError::Send(err.to_string()))
        }

        async fn recv(&mut self) -> Option<Result<String, ChannelError>> {
            self.inbound.recv().await.map(Ok)
        }

        async fn close(&mut self) {}
    }

    struct ScriptedConnector {
        accept: Mutex<VecDeque<bool>>,
        calls: Mutex<Vec<(Instant, Url)>>,
        peers: mpsc::UnboundedSender<MockPeer>,
        send_delay: Duration,
    }

    impl ScriptedConnector {
        fn new(accept: &[bool]) -> (Arc<Self>, mpsc::UnboundedReceiver<MockPeer>) {
            Self::with_send_delay(accept, Duration::ZERO)
        }

        fn with_send_delay(
            accept: &[bool],
            send_delay: Duration,
        ) -> (Arc<Self>, mpsc::UnboundedReceiver<MockPeer>) {
            let (peers, peer_rx) = mpsc::unbounded_channel();
            let connector = Arc::new(Self {
                accept: Mutex::new(accept.iter().copied().collect()),
                calls: Mutex::new(Vec::new()),
                peers,
                send_delay,
            });
            (connector, peer_rx)
        }

        fn call_times(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().iter().map(|(at, _)| *at).collect()
        }

        fn call_urls(&self) -> Vec<Url> {
            self.calls.lock().unwrap().iter().map(|(_, url)| url.clone()).collect()
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self, url: &Url) -> Result<Box<dyn Transport>, ChannelError> {
            self.calls.lock().unwrap().push((Instant::now(), url.clone()));
            let accept = self.accept.lock().unwrap().pop_front().unwrap_or(false);
            if !accept {
                return Err(ChannelError::Connect("connection refused".to_string()));
            }
            let (to_client, inbound) = mpsc::unbounded_channel();
            let (outbound, from_client) = mpsc::unbounded_channel();
            let _ = self.peers.send(MockPeer {
                to_client,
                from_client,
            });
            Ok(Box::new(MockTransport {
                inbound,
                outbound,
                send_delay: self.send_delay,
            }))
        }
    }

    fn channel_with(connector: Arc<ScriptedConnector>, ping_interval: Duration) -> Channel {
        Channel::new(
            Url::parse("ws://hub.test/ws").expect("url"),
            connector,
            ChannelOptions {
                reconnect: ReconnectPolicy::default(),
                ping_interval,
            },
        )
    }

    fn gaps(times: &[Instant]) -> Vec<Duration> {
        times.windows(2).map(|pair| pair[1] - pair[0]).collect()
    }

    fn assert_delays(actual: &[Duration], expected_secs: &[u64]) {
        assert_eq!(actual.len(), expected_secs.len(), "gaps: {actual:?}");
        for (gap, secs) in actual.iter().zip(expected_secs) {
            let expected = Duration::from_secs(*secs);
            assert!(
                *gap >= expected && *gap < expected + Duration::from_millis(50),
                "gap {gap:?} expected ~{expected:?}"
            );
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (1..=7).map(|n| policy.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(policy.delay_for(200), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_five_reconnect_attempts() {
        let (connector, _peers) = ScriptedConnector::new(&[]);
        let channel = channel_with(connector.clone(), Duration::from_secs(25));
        let mut status = channel.status();

        channel.connect("tok-1").expect("connect");
        let last = status
            .wait_for(|status| status.exhausted)
            .await
            .expect("status")
            .clone();
        assert_eq!(last.state, ChannelState::Disconnected);

        let times = connector.call_times();
        assert_eq!(times.len(), 6, "one explicit connect plus five retries");
        let delays = gaps(&times);
        assert_delays(&delays, &[1, 2, 4, 8, 16]);
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(delays.iter().all(|gap| *gap <= Duration::from_secs(30)));
        assert!(connector
            .call_urls()
            .iter()
            .all(|url| url.query() == Some("token=tok-1")));

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(connector.call_times().len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_during_backoff_replaces_pending_timer() {
        let (connector, _peers) = ScriptedConnector::new(&[]);
        let channel = channel_with(connector.clone(), Duration::from_secs(25));
        let mut status = channel.status();

        channel.connect("old").expect("connect");
        status
            .wait_for(|status| status.last_delay.is_some())
            .await
            .expect("status");
        assert_eq!(connector.call_times().len(), 1);

        channel.connect("new").expect("reconnect");
        status
            .wait_for(|status| status.exhausted)
            .await
            .expect("status");

        let times = connector.call_times();
        assert_eq!(times.len(), 7);
        assert_delays(&gaps(&times[1..]), &[1, 2, 4, 8, 16]);
        let urls = connector.call_urls();
        assert!(urls[1..].iter().all(|url| url.query() == Some("token=new")));
    }

    #[tokio::test(start_paused = true)]
    async fn subscriptions_are_tracked_and_replayed_on_reconnect() {
        let (connector, mut peers) = ScriptedConnector::new(&[true, true]);
        let channel = channel_with(connector.clone(), Duration::ZERO);
        let mut status = channel.status();

        let mut first = channel.subscribe("vproc.events");
        let mut second = channel.subscribe("vproc.events");
        channel.connect("tok").expect("connect");

        let mut peer = peers.recv().await.expect("peer");
        assert_eq!(
            peer.next_control().await,
            json!({"action": "subscribe", "topic": "vproc.events"})
        );
        status
            .wait_for(|status| status.state == ChannelState::Connected)
            .await
            .expect("connected");

        peer.push(json!({"type": "subscribed", "topic": "vproc.events"}));
        peer.push(json!({"topic": "vproc.events", "data": {"seq": 1}}));
        peer.push(json!({"type": "pong"}));
        peer.push(json!({"topic": "vproc.events", "data": {"seq": 2}}));

        assert_eq!(first.recv().await, Some(json!({"seq": 1})));
        assert_eq!(first.recv().await, Some(json!({"seq": 2})));
        assert_eq!(second.recv().await, Some(json!({"seq": 1})));
        assert_eq!(second.recv().await, Some(json!({"seq": 2})));
        assert_eq!(first.try_recv(), None);

        let fs = channel.subscribe("fs.events");
        assert_eq!(
            peer.next_control().await,
            json!({"action": "subscribe", "topic": "fs.events"})
        );

        channel.unsubscribe(second);
        channel.unsubscribe(fs);
        assert_eq!(
            peer.next_control().await,
            json!({"action": "unsubscribe", "topic": "fs.events"})
        );
        assert_eq!(channel.topics(), vec!["vproc.events".to_string()]);

        drop(peer);
        let mut peer = peers.recv().await.expect("second peer");
        assert_eq!(
            peer.next_control().await,
            json!({"action": "subscribe", "topic": "vproc.events"})
        );
        assert_eq!(connector.call_times().len(), 2);

        peer.push(json!({"topic": "vproc.events", "data": {"seq": 3}}));
        assert_eq!(first.recv().await, Some(json!({"seq": 3})));
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_during_resubscribe_replay_still_reaches_the_peer() {
        let (connector, mut peers) =
            ScriptedConnector::with_send_delay(&[true], Duration::from_millis(50));
        let channel = channel_with(connector, Duration::ZERO);
        let _vproc = channel.subscribe("vproc.events");
        channel.connect("tok").expect("connect");

        let mut peer = peers.recv().await.expect("peer");
        tokio::time::sleep(Duration::from_millis(10)).await;
        let _fs = channel.subscribe("fs.events");

        let mut sent = Vec::new();
        for _ in 0..2 {
            let frame = tokio::time::timeout(Duration::from_secs(1), peer.next_control())
                .await
                .expect("frame reaches the peer");
            sent.push(frame);
        }
        assert_eq!(
            sent,
            vec![
                json!({"action": "subscribe", "topic": "vproc.events"}),
                json!({"action": "subscribe", "topic": "fs.events"}),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sends_keepalive_pings_while_connected() {
        let (connector, mut peers) = ScriptedConnector::new(&[true]);
        let channel = channel_with(connector, Duration::from_secs(25));
        channel.connect("tok").expect("connect");

        let mut peer = peers.recv().await.expect("peer");
        let connected_at = Instant::now();
        let raw = peer.from_client.recv().await.expect("ping");
        assert_eq!(raw, r#"{"action":"ping"}"#);
        assert!(Instant::now() - connected_at >= Duration::from_secs(25));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_stops_reconnecting() {
        let (connector, mut peers) = ScriptedConnector::new(&[true]);
        let channel = channel_with(connector.clone(), Duration::ZERO);
        let mut status = channel.status();
        channel.connect("tok").expect("connect");
        let _peer = peers.recv().await.expect("peer");
        status
            .wait_for(|status| status.state == ChannelState::Connected)
            .await
            .expect("connected");

        channel.disconnect();
        assert_eq!(channel.state(), ChannelState::Disconnected);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.call_times().len(), 1);
    }

    #[test]
    fn empty_token_is_rejected() {
        let (connector, _peers) = ScriptedConnector::new(&[]);
        let channel = channel_with(connector, Duration::ZERO);
        assert_eq!(channel.connect("  "), Err(ChannelError::MissingToken));
    }
}
