use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use webdesk_core::wire::{
    decode_frame, encode_frame, is_known_topic, ClientFrame, ControlAck, ControlAction,
    ServerFrame, CLOSE_UNAUTHORIZED, MAX_FRAME_BYTES, TOPIC_METRICS_HOST,
};

pub mod collaborators;

pub use collaborators::{
    ApiMetricsSource, ApiTokenValidator, CollaboratorError, FixedMetrics, MetricsSource,
    StaticTokens, TokenValidator,
};

pub const DEFAULT_HUB_ADDR: &str = "127.0.0.1:8001";
const CLOSE_NORMAL: u16 = 1000;
const CLOSE_GOING_AWAY: u16 = 1001;
const MIN_METRICS_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub addr: SocketAddr,
    pub metrics_interval: Duration,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 8001)),
            metrics_interval: Duration::from_secs(2),
            write_timeout: Duration::from_secs(2),
            queue_capacity: 256,
        }
    }
}

struct Client {
    conn_id: String,
    user: String,
    sender: mpsc::Sender<Message>,
}

impl Client {
    async fn send_text(&self, text: &str) -> bool {
        self.sender.send(Message::Text(text.to_string())).await.is_ok()
    }

    async fn close(&self, code: u16, reason: &str) {
        let _ = self
            .sender
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.to_string().into(),
            })))
            .await;
    }
}

pub struct HubState {
    config: HubConfig,
    validator: Arc<dyn TokenValidator>,
    metrics: Arc<dyn MetricsSource>,
    conn_counter: AtomicU64,
    clients: RwLock<HashMap<String, Arc<Client>>>,
    topics: RwLock<HashMap<String, HashMap<String, Arc<Client>>>>,
}

impl HubState {
    pub fn new(
        config: HubConfig,
        validator: Arc<dyn TokenValidator>,
        metrics: Arc<dyn MetricsSource>,
    ) -> Self {
        Self {
            config,
            validator,
            metrics,
            conn_counter: AtomicU64::new(0),
            clients: RwLock::new(HashMap::new()),
            topics: RwLock::new(HashMap::new()),
        }
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    async fn register_client(&self, client: Arc<Client>) {
        self.clients
            .write()
            .await
            .insert(client.conn_id.clone(), client.clone());
        info!(event = "client_connected", conn_id = %client.conn_id, user = %client.user);
    }

    async fn remove_client(&self, client: &Client, code: u16, reason: &str) {
        client.close(code, reason).await;
        self.clients.write().await.remove(&client.conn_id);
        let mut topics = self.topics.write().await;
        for subscribers in topics.values_mut() {
            subscribers.remove(&client.conn_id);
        }
        topics.retain(|_, subscribers| !subscribers.is_empty());
        info!(
            event = "client_disconnected",
            conn_id = %client.conn_id,
            user = %client.user,
            reason = reason
        );
    }

    async fn close_all(&self, reason: &str) {
        let clients: Vec<Arc<Client>> = self.clients.read().await.values().cloned().collect();
        for client in clients {
            self.remove_client(&client, CLOSE_GOING_AWAY, reason).await;
        }
    }

    async fn subscribe(&self, client: &Arc<Client>, topic: &str) {
        self.topics
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .insert(client.conn_id.clone(), client.clone());
        debug!(event = "topic_subscribe", conn_id = %client.conn_id, topic = topic);
    }

    async fn unsubscribe(&self, client: &Client, topic: &str) {
        let mut topics = self.topics.write().await;
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.remove(&client.conn_id);
            if subscribers.is_empty() {
                topics.remove(topic);
            }
        }
        debug!(event = "topic_unsubscribe", conn_id = %client.conn_id, topic = topic);
    }

    async fn snapshot_subscribers(&self, topic: &str) -> Vec<Arc<Client>> {
        self.topics
            .read()
            .await
            .get(topic)
            .map(|subscribers| subscribers.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Sends `data` to every subscriber of `topic`; returns how many got it.
    /// Subscribers whose queue is gone are dropped.
    pub async fn publish(&self, topic: &str, data: Value) -> usize {
        let raw = match encode_frame(&ServerFrame::data(topic, data), MAX_FRAME_BYTES) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "publish_encode_error", topic = topic, error = %err);
                return 0;
            }
        };
        let mut delivered = 0;
        for sub in self.snapshot_subscribers(topic).await {
            if sub.send_text(&raw).await {
                delivered += 1;
            } else {
                warn!(event = "send_error", conn_id = %sub.conn_id, topic = topic);
                self.remove_client(&sub, CLOSE_GOING_AWAY, "send_error").await;
            }
        }
        debug!(event = "publish", topic = topic, delivered = delivered);
        delivered
    }

    async fn authorize(&self, token: Option<&str>) -> Option<String> {
        let token = token.map(str::trim).filter(|value| !value.is_empty())?;
        match self.validator.validate(token).await {
            Ok(user) => user,
            Err(err) => {
                warn!(event = "token_check_failed", error = %err);
                None
            }
        }
    }

    async fn handle_frame(&self, client: &Arc<Client>, frame: ClientFrame) -> Option<ControlAck> {
        match (frame.action, frame.topic) {
            (ControlAction::Ping, _) => Some(ControlAck::Pong),
            (ControlAction::Subscribe, Some(topic)) if is_known_topic(&topic) => {
                self.subscribe(client, &topic).await;
                Some(ControlAck::Subscribed(Some(topic)))
            }
            (ControlAction::Unsubscribe, Some(topic)) if is_known_topic(&topic) => {
                self.unsubscribe(client, &topic).await;
                Some(ControlAck::Unsubscribed(Some(topic)))
            }
            (action, topic) => {
                debug!(
                    event = "control_ignored",
                    conn_id = %client.conn_id,
                    action = ?action,
                    topic = ?topic
                );
                None
            }
        }
    }

    async fn handle_socket(
        self: Arc<Self>,
        mut socket: WebSocket,
        token: Option<String>,
        remote: SocketAddr,
    ) {
        let Some(user) = self.authorize(token.as_deref()).await else {
            warn!(event = "ws_unauthorized", remote = %remote);
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_UNAUTHORIZED,
                    reason: "unauthorized".into(),
                })))
                .await;
            return;
        };

        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(self.config.queue_capacity.max(1));
        let write_timeout = self.config.write_timeout;
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                let send = ws_sender.send(msg);
                if tokio::time::timeout(write_timeout, send).await.is_err() || closing {
                    return;
                }
            }
        });

        let client = Arc::new(Client {
            conn_id: self.next_conn_id(),
            user,
            sender: tx,
        });
        self.register_client(client.clone()).await;

        while let Some(result) = ws_receiver.next().await {
            let msg = match result {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "read_error", conn_id = %client.conn_id, error = %err);
                    break;
                }
            };
            let text = match msg {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };
            let frame: ClientFrame = match decode_frame(&text, MAX_FRAME_BYTES) {
                Ok(value) => value,
                Err(err) => {
                    debug!(event = "frame_invalid", conn_id = %client.conn_id, error = %err);
                    continue;
                }
            };
            let Some(ack) = self.handle_frame(&client, frame).await else {
                continue;
            };
            let raw = match encode_frame(&ServerFrame::ack(&ack), MAX_FRAME_BYTES) {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "ack_encode_error", error = %err);
                    continue;
                }
            };
            if !client.send_text(&raw).await {
                break;
            }
        }

        self.remove_client(&client, CLOSE_NORMAL, "disconnect").await;
        drop(client);
        let _ = write_task.await;
    }

    /// Pushes host metrics on `metrics.host` while anyone is listening.
    fn spawn_metrics_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.config.metrics_interval.max(MIN_METRICS_INTERVAL);
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if self.subscriber_count(TOPIC_METRICS_HOST).await > 0 {
                            self.push_metrics().await;
                        }
                    }
                }
            }
        })
    }

    async fn push_metrics(&self) {
        let sample = match self.metrics.sample().await {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "metrics_sample_failed", error = %err);
                return;
            }
        };
        match serde_json::to_value(&sample) {
            Ok(data) => {
                self.publish(TOPIC_METRICS_HOST, data).await;
            }
            Err(err) => warn!(event = "metrics_encode_error", error = %err),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WsParams {
    token: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<WsParams>,
    State(hub): State<Arc<HubState>>,
) -> impl IntoResponse {
    ws.max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| async move {
            hub.handle_socket(socket, params.token, addr).await;
        })
}

async fn publish_handler(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(hub): State<Arc<HubState>>,
    Path(topic): Path<String>,
    Json(data): Json<Value>,
) -> Response {
    if !addr.ip().is_loopback() {
        warn!(event = "publish_forbidden", remote = %addr);
        return StatusCode::FORBIDDEN.into_response();
    }
    if !is_known_topic(&topic) {
        return (StatusCode::NOT_FOUND, "unknown topic").into_response();
    }
    let delivered = hub.publish(&topic, data).await;
    Json(json!({ "topic": topic, "delivered": delivered })).into_response()
}

pub fn router(hub: Arc<HubState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/publish/:topic", post(publish_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(hub)
}

/// Serves the hub on an already bound listener until `shutdown` flips.
pub async fn serve(
    listener: TcpListener,
    hub: Arc<HubState>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let metrics_task = hub.clone().spawn_metrics_loop(shutdown.clone());
    let closing = hub.clone();
    let signal = async move {
        loop {
            if shutdown.changed().await.is_err() || *shutdown.borrow() {
                break;
            }
        }
        closing.close_all("shutdown").await;
    };
    let result = axum::serve(
        listener,
        router(hub).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(signal)
    .await;
    metrics_task.abort();
    result
}

pub async fn run(
    config: HubConfig,
    validator: Arc<dyn TokenValidator>,
    metrics: Arc<dyn MetricsSource>,
    shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let listener = TcpListener::bind(config.addr).await?;
    info!(
        event = "hub_start",
        addr = %config.addr,
        metrics_interval_ms = config.metrics_interval.as_millis() as u64
    );
    let hub = Arc::new(HubState::new(config, validator, metrics));
    serve(listener, hub, shutdown).await
}
