//! Process Monitor view-model.
//!
//! Holds the raw virtual and host collections as last written by a pull or a
//! channel push, plus the sort/search state. Rows are derived on demand and
//! never stored.

use crate::channel::Channel;
use crate::error::GatewayError;
use crate::gateway::RecordGateway;
use crate::lock;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};
use webdesk_core::wire::{decode_payload, VprocEvent, TOPIC_METRICS_HOST, TOPIC_VPROC_EVENTS};
use webdesk_core::{HostProcess, SystemMetrics, VirtualProcess};

pub const DEFAULT_HISTORY_CAPACITY: usize = 60;

pub type SharedMonitor = Arc<Mutex<ProcessMonitor>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    fn flipped(self) -> Self {
        match self {
            SortDirection::Ascending => SortDirection::Descending,
            SortDirection::Descending => SortDirection::Ascending,
        }
    }
}

pub trait SortField: Copy + Eq {
    fn is_numeric(self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualField {
    App,
    Id,
    Status,
    Cpu,
    Mem,
    StartedAt,
}

impl SortField for VirtualField {
    fn is_numeric(self) -> bool {
        matches!(
            self,
            VirtualField::Cpu | VirtualField::Mem | VirtualField::StartedAt
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostField {
    Pid,
    Name,
    Username,
    Status,
    Cpu,
    Memory,
    Threads,
}

impl SortField for HostField {
    fn is_numeric(self) -> bool {
        matches!(
            self,
            HostField::Pid | HostField::Cpu | HostField::Memory | HostField::Threads
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortSpec<F> {
    pub field: F,
    pub direction: SortDirection,
}

impl<F: SortField> SortSpec<F> {
    pub fn new(field: F) -> Self {
        Self {
            field,
            direction: default_direction(field),
        }
    }

    /// Same field flips direction; a new field starts at its default.
    pub fn toggle(&mut self, field: F) {
        if self.field == field {
            self.direction = self.direction.flipped();
        } else {
            *self = Self::new(field);
        }
    }
}

fn default_direction<F: SortField>(field: F) -> SortDirection {
    if field.is_numeric() {
        SortDirection::Descending
    } else {
        SortDirection::Ascending
    }
}

enum SortKey {
    Number(f64),
    Text(String),
}

impl SortKey {
    fn text(value: &str) -> Self {
        SortKey::Text(value.to_lowercase())
    }

    fn compare(&self, other: &SortKey) -> Ordering {
        match (self, other) {
            (SortKey::Number(left), SortKey::Number(right)) => left.total_cmp(right),
            (SortKey::Text(left), SortKey::Text(right)) => left.cmp(right),
            (SortKey::Number(_), SortKey::Text(_)) => Ordering::Less,
            (SortKey::Text(_), SortKey::Number(_)) => Ordering::Greater,
        }
    }
}

fn virtual_key(process: &VirtualProcess, field: VirtualField) -> SortKey {
    match field {
        VirtualField::App => SortKey::text(&process.app),
        VirtualField::Id => SortKey::text(&process.id),
        VirtualField::Status => SortKey::text(process.status.as_str()),
        VirtualField::Cpu => SortKey::Number(process.cpu),
        VirtualField::Mem => SortKey::Number(process.mem),
        VirtualField::StartedAt => SortKey::Number(process.started_at.timestamp_millis() as f64),
    }
}

fn host_key(process: &HostProcess, field: HostField) -> SortKey {
    match field {
        HostField::Pid => SortKey::Number(process.pid as f64),
        HostField::Name => SortKey::text(&process.name),
        HostField::Username => SortKey::text(process.username.as_deref().unwrap_or_default()),
        HostField::Status => SortKey::text(&process.status),
        HostField::Cpu => SortKey::Number(process.cpu_percent),
        HostField::Memory => SortKey::Number(process.memory_percent),
        HostField::Threads => SortKey::Number(process.num_threads as f64),
    }
}

/// Stable sort: equal keys keep collection order in both directions.
fn sorted<'a, T, K>(rows: Vec<&'a T>, direction: SortDirection, key: K) -> Vec<&'a T>
where
    K: Fn(&T) -> SortKey,
{
    let mut keyed: Vec<(SortKey, &'a T)> = rows.into_iter().map(|row| (key(row), row)).collect();
    keyed.sort_by(|(left, _), (right, _)| match direction {
        SortDirection::Ascending => left.compare(right),
        SortDirection::Descending => right.compare(left),
    });
    keyed.into_iter().map(|(_, row)| row).collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSample {
    pub at: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

#[derive(Debug, Clone)]
pub struct ProcessMonitor {
    virtual_procs: Vec<VirtualProcess>,
    host_procs: Vec<HostProcess>,
    latest_metrics: Option<SystemMetrics>,
    history: VecDeque<MetricsSample>,
    capacity: usize,
    virtual_sort: SortSpec<VirtualField>,
    host_sort: SortSpec<HostField>,
    search: String,
}

impl Default for ProcessMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl ProcessMonitor {
    pub fn new(history_capacity: usize) -> Self {
        let capacity = history_capacity.max(1);
        Self {
            virtual_procs: Vec::new(),
            host_procs: Vec::new(),
            latest_metrics: None,
            history: VecDeque::with_capacity(capacity),
            capacity,
            virtual_sort: SortSpec::new(VirtualField::Cpu),
            host_sort: SortSpec::new(HostField::Cpu),
            search: String::new(),
        }
    }

    pub fn shared(history_capacity: usize) -> SharedMonitor {
        Arc::new(Mutex::new(Self::new(history_capacity)))
    }

    pub fn set_virtual(&mut self, processes: Vec<VirtualProcess>) {
        self.virtual_procs = processes;
    }

    pub fn set_host(&mut self, processes: Vec<HostProcess>) {
        self.host_procs = processes;
    }

    /// Replaces the current reading without adding a history sample. Pulled
    /// snapshots go here so the history keeps the push cadence.
    pub fn set_latest_metrics(&mut self, metrics: SystemMetrics) {
        self.latest_metrics = Some(metrics);
    }

    pub fn apply_metrics(&mut self, metrics: SystemMetrics, at: DateTime<Utc>) {
        self.history.push_back(MetricsSample {
            at,
            cpu_percent: metrics.cpu_percent,
            memory_percent: metrics.memory_percent,
        });
        while self.history.len() > self.capacity {
            self.history.pop_front();
        }
        self.latest_metrics = Some(metrics);
    }

    pub fn apply_vproc_event(&mut self, event: VprocEvent) {
        match event {
            VprocEvent::Started { process } | VprocEvent::Stopped { process } => {
                match self
                    .virtual_procs
                    .iter_mut()
                    .find(|existing| existing.id == process.id)
                {
                    Some(existing) => *existing = process,
                    None => self.virtual_procs.push(process),
                }
            }
            VprocEvent::Deleted { id, .. } => {
                self.virtual_procs.retain(|existing| existing.id != id);
            }
            VprocEvent::Cleared => self.virtual_procs.clear(),
        }
    }

    /// Applies a pushed channel payload. Returns whether the topic was one
    /// the monitor consumes and the payload decoded.
    pub fn apply_frame(&mut self, topic: &str, data: &Value) -> bool {
        match topic {
            TOPIC_METRICS_HOST => match decode_payload::<SystemMetrics>(data) {
                Ok(metrics) => {
                    self.apply_metrics(metrics, Utc::now());
                    true
                }
                Err(err) => {
                    warn!(event = "monitor_frame_invalid", topic, error = %err);
                    false
                }
            },
            TOPIC_VPROC_EVENTS => match decode_payload::<VprocEvent>(data) {
                Ok(event) => {
                    self.apply_vproc_event(event);
                    true
                }
                Err(err) => {
                    warn!(event = "monitor_frame_invalid", topic, error = %err);
                    false
                }
            },
            _ => false,
        }
    }

    pub fn set_search(&mut self, term: impl Into<String>) {
        self.search = term.into();
    }

    pub fn search(&self) -> &str {
        &self.search
    }

    pub fn toggle_virtual_sort(&mut self, field: VirtualField) {
        self.virtual_sort.toggle(field);
    }

    pub fn toggle_host_sort(&mut self, field: HostField) {
        self.host_sort.toggle(field);
    }

    pub fn virtual_sort(&self) -> SortSpec<VirtualField> {
        self.virtual_sort
    }

    pub fn host_sort(&self) -> SortSpec<HostField> {
        self.host_sort
    }

    pub fn virtual_rows(&self) -> Vec<&VirtualProcess> {
        let needle = self.search.trim().to_lowercase();
        let rows = self
            .virtual_procs
            .iter()
            .filter(|process| {
                needle.is_empty()
                    || [process.app.as_str(), process.id.as_str(), process.status.as_str()]
                        .iter()
                        .any(|field| field.to_lowercase().contains(&needle))
            })
            .collect();
        let field = self.virtual_sort.field;
        sorted(rows, self.virtual_sort.direction, |process| {
            virtual_key(process, field)
        })
    }

    pub fn host_rows(&self) -> Vec<&HostProcess> {
        let needle = self.search.trim().to_lowercase();
        let rows = self
            .host_procs
            .iter()
            .filter(|process| {
                needle.is_empty()
                    || process.name.to_lowercase().contains(&needle)
                    || process.pid.to_string().contains(&needle)
                    || process.status.to_lowercase().contains(&needle)
            })
            .collect();
        let field = self.host_sort.field;
        sorted(rows, self.host_sort.direction, |process| {
            host_key(process, field)
        })
    }

    pub fn latest_metrics(&self) -> Option<&SystemMetrics> {
        self.latest_metrics.as_ref()
    }

    /// Oldest first.
    pub fn history(&self) -> impl Iterator<Item = &MetricsSample> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

pub async fn refresh_virtual(
    monitor: &Mutex<ProcessMonitor>,
    gateway: &dyn RecordGateway,
) -> Result<(), GatewayError> {
    let processes = gateway.list_virtual().await?;
    lock(monitor).set_virtual(processes);
    Ok(())
}

pub async fn refresh_host(
    monitor: &Mutex<ProcessMonitor>,
    gateway: &dyn RecordGateway,
) -> Result<(), GatewayError> {
    let (processes, metrics) = tokio::join!(gateway.list_host(), gateway.host_metrics());
    let processes = processes?;
    let mut monitor = lock(monitor);
    monitor.set_host(processes);
    if let Ok(metrics) = metrics {
        monitor.set_latest_metrics(metrics);
    }
    Ok(())
}

/// Background loop feeding a shared monitor from periodic pulls and channel
/// pushes until `shutdown` flips to `true`.
pub struct MonitorDriver {
    handle: JoinHandle<()>,
}

impl MonitorDriver {
    pub fn spawn(
        monitor: SharedMonitor,
        gateway: Arc<dyn RecordGateway>,
        channel: Channel,
        refresh_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut metrics = channel.subscribe(TOPIC_METRICS_HOST);
            let mut vproc = channel.subscribe(TOPIC_VPROC_EVENTS);
            let mut ticker = tokio::time::interval(refresh_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = refresh_virtual(&monitor, gateway.as_ref()).await {
                            warn!(
                                event = "monitor_refresh_failed",
                                collection = "virtual",
                                error = %err
                            );
                        }
                        if let Err(err) = refresh_host(&monitor, gateway.as_ref()).await {
                            warn!(
                                event = "monitor_refresh_failed",
                                collection = "host",
                                error = %err
                            );
                        }
                    }
                    Some(data) = metrics.recv() => {
                        lock(&monitor).apply_frame(TOPIC_METRICS_HOST, &data);
                    }
                    Some(data) = vproc.recv() => {
                        lock(&monitor).apply_frame(TOPIC_VPROC_EVENTS, &data);
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            channel.unsubscribe(metrics);
            channel.unsubscribe(vproc);
            debug!(event = "monitor_driver_stopped");
        });
        Self { handle }
    }

    pub fn abort(&self) {
        self.handle.abort();
    }

    pub async fn join(self) {
        let _ = self.handle.await;
    }
}
