//! In-process record API used by tests and offline demos.
//!
//! Mirrors the HTTP API's observable behavior (ownership, status codes,
//! running-only process lists) and records every call so tests can assert
//! ordering. Individual operations can be made to fail, to answer slowly or
//! to hang forever.

use super::RecordGateway;
use crate::error::GatewayError;
use crate::lock;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use webdesk_core::validators::sanitize_path;
use webdesk_core::{
    CreateFile, CreateFolder, Credentials, DesktopState, FsNode, HostProcess, NodeKind,
    ProcessStatus, SystemMetrics, TerminateResult, Token, UpdateNode, User, VirtualProcess,
};

pub const OP_REGISTER: &str = "register";
pub const OP_LOGIN: &str = "login";
pub const OP_WHOAMI: &str = "whoami";
pub const OP_TREE: &str = "tree";
pub const OP_CREATE_FOLDER: &str = "create_folder";
pub const OP_CREATE_FILE: &str = "create_file";
pub const OP_NODE: &str = "node";
pub const OP_UPDATE_NODE: &str = "update_node";
pub const OP_DELETE_NODE: &str = "delete_node";
pub const OP_DESKTOP_STATE: &str = "desktop_state";
pub const OP_SAVE_DESKTOP_STATE: &str = "save_desktop_state";
pub const OP_LIST_VIRTUAL: &str = "list_virtual";
pub const OP_START_VIRTUAL: &str = "start_virtual";
pub const OP_STOP_VIRTUAL: &str = "stop_virtual";
pub const OP_DELETE_VIRTUAL: &str = "delete_virtual";
pub const OP_DELETE_ALL_VIRTUAL: &str = "delete_all_virtual";
pub const OP_LIST_HOST: &str = "list_host";
pub const OP_HOST_METRICS: &str = "host_metrics";
pub const OP_TERMINATE_HOST: &str = "terminate_host";

#[derive(Debug, Clone, PartialEq)]
pub struct SavedState {
    pub at: Instant,
    pub state: DesktopState,
}

struct Account {
    password: String,
    user: User,
}

#[derive(Default)]
struct State {
    token: Option<String>,
    accounts: HashMap<String, Account>,
    sessions: HashMap<String, String>,
    desktops: HashMap<String, DesktopState>,
    processes: Vec<VirtualProcess>,
    nodes: Vec<FsNode>,
    host: Vec<HostProcess>,
    metrics: Option<SystemMetrics>,
    failures: HashMap<String, GatewayError>,
    hangs: HashSet<String>,
    delays: HashMap<String, Duration>,
    calls: Vec<String>,
    saves: Vec<SavedState>,
    next_id: u64,
}

impl State {
    fn mint_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn current_user(&self) -> Result<User, GatewayError> {
        let token = self
            .token
            .as_ref()
            .ok_or_else(|| GatewayError::Auth("missing token".to_string()))?;
        let username = self
            .sessions
            .get(token)
            .ok_or_else(|| GatewayError::Auth("Invalid token".to_string()))?;
        self.accounts
            .get(username)
            .map(|account| account.user.clone())
            .ok_or_else(|| GatewayError::Auth("Invalid token".to_string()))
    }

    fn issue_token(&mut self, username: &str) -> Token {
        let access_token = self.mint_id("token");
        self.sessions
            .insert(access_token.clone(), username.to_string());
        Token {
            access_token,
            token_type: "bearer".to_string(),
        }
    }

    fn parent_path(&self, owner: &str, parent_id: Option<&str>) -> Result<String, GatewayError> {
        let Some(parent_id) = parent_id else {
            return Ok("/".to_string());
        };
        self.nodes
            .iter()
            .find(|node| node.id == parent_id && node.owner_id == owner)
            .filter(|node| node.kind == NodeKind::Folder)
            .map(|node| node.path.clone())
            .ok_or_else(|| GatewayError::NotFound("Parent folder not found".to_string()))
    }

    fn insert_node(
        &mut self,
        owner: &str,
        kind: NodeKind,
        name: &str,
        parent_id: Option<String>,
        content: Option<String>,
        mime_type: Option<String>,
    ) -> Result<FsNode, GatewayError> {
        let parent_path = self.parent_path(owner, parent_id.as_deref())?;
        let path = sanitize_path(&format!("{parent_path}/{name}"));
        if self
            .nodes
            .iter()
            .any(|node| node.owner_id == owner && node.path == path)
        {
            return Err(GatewayError::Conflict(format!("{path} already exists")));
        }
        let now = Utc::now();
        let node = FsNode {
            id: self.mint_id("node"),
            owner_id: owner.to_string(),
            kind,
            name: name.to_string(),
            parent_id,
            path,
            size: content.as_ref().map(|text| text.len() as u64),
            content,
            mime_type,
            created_at: now,
            updated_at: now,
        };
        self.nodes.push(node.clone());
        Ok(node)
    }
}

/// A shareable, in-memory `RecordGateway`.
#[derive(Default)]
pub struct MemoryGateway {
    state: Mutex<State>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// A gateway with one registered account whose token is already set.
    pub fn signed_in(username: &str) -> Self {
        let gateway = Self::new();
        let token = gateway.add_account(username, "password", &[]);
        gateway.set_token(Some(token.access_token));
        gateway
    }

    pub fn add_account(&self, username: &str, password: &str, roles: &[&str]) -> Token {
        let mut state = lock(&self.state);
        let id = state.mint_id("user");
        state.accounts.insert(
            username.to_string(),
            Account {
                password: password.to_string(),
                user: User {
                    id,
                    username: username.to_string(),
                    roles: roles.iter().map(|role| role.to_string()).collect(),
                    created_at: Utc::now(),
                },
            },
        );
        state.issue_token(username)
    }

    /// Makes every later call to `op` fail with `err` until `recover(op)`.
    pub fn fail(&self, op: &str, err: GatewayError) {
        lock(&self.state).failures.insert(op.to_string(), err);
    }

    pub fn recover(&self, op: &str) {
        lock(&self.state).failures.remove(op);
    }

    /// Delays every later call to `op` by `by` before it takes effect.
    pub fn delay(&self, op: &str, by: Duration) {
        lock(&self.state).delays.insert(op.to_string(), by);
    }

    /// Makes every later call to `op` never resolve.
    pub fn hang(&self, op: &str) {
        lock(&self.state).hangs.insert(op.to_string());
    }

    /// Inserts a record as if another session had started it.
    pub fn seed_virtual(&self, app: &str, metadata: Map<String, Value>) -> VirtualProcess {
        let mut state = lock(&self.state);
        let owner = state
            .current_user()
            .map(|user| user.id)
            .unwrap_or_else(|_| "user-0".to_string());
        let now = Utc::now();
        let process = VirtualProcess {
            id: state.mint_id("proc"),
            owner_id: owner,
            app: app.to_string(),
            status: ProcessStatus::Running,
            cpu: 1.0,
            mem: 32.0,
            started_at: now,
            updated_at: now,
            metadata,
        };
        state.processes.push(process.clone());
        process
    }

    pub fn seed_desktop(&self, desktop: DesktopState) {
        let mut state = lock(&self.state);
        if let Ok(user) = state.current_user() {
            state.desktops.insert(user.id, desktop);
        }
    }

    pub fn seed_host(&self, processes: Vec<HostProcess>, metrics: SystemMetrics) {
        let mut state = lock(&self.state);
        state.host = processes;
        state.metrics = Some(metrics);
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        lock(&self.state).calls.iter().filter(|call| *call == op).count()
    }

    pub fn saves(&self) -> Vec<SavedState> {
        lock(&self.state).saves.clone()
    }

    /// Every stored virtual record, including stopped ones.
    pub fn virtual_records(&self) -> Vec<VirtualProcess> {
        lock(&self.state).processes.clone()
    }

    async fn enter(&self, op: &str) -> Result<(), GatewayError> {
        let (hang, delay) = {
            let mut state = lock(&self.state);
            state.calls.push(op.to_string());
            if let Some(err) = state.failures.get(op) {
                return Err(err.clone());
            }
            (state.hangs.contains(op), state.delays.get(op).copied())
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

#[async_trait]
impl RecordGateway for MemoryGateway {
    fn set_token(&self, token: Option<String>) {
        lock(&self.state).token = token;
    }

    fn token(&self) -> Option<String> {
        lock(&self.state).token.clone()
    }

    async fn register(&self, credentials: &Credentials) -> Result<Token, GatewayError> {
        self.enter(OP_REGISTER).await?;
        if lock(&self.state).accounts.contains_key(&credentials.username) {
            return Err(GatewayError::Validation(
                "Username already registered".to_string(),
            ));
        }
        Ok(self.add_account(&credentials.username, &credentials.password, &[]))
    }

    async fn login(&self, credentials: &Credentials) -> Result<Token, GatewayError> {
        self.enter(OP_LOGIN).await?;
        let mut state = lock(&self.state);
        let valid = state
            .accounts
            .get(&credentials.username)
            .is_some_and(|account| account.password == credentials.password);
        if !valid {
            return Err(GatewayError::Auth(
                "Invalid username or password".to_string(),
            ));
        }
        Ok(state.issue_token(&credentials.username))
    }

    async fn whoami(&self) -> Result<User, GatewayError> {
        self.enter(OP_WHOAMI).await?;
        lock(&self.state).current_user()
    }

    async fn tree(&self) -> Result<Vec<FsNode>, GatewayError> {
        self.enter(OP_TREE).await?;
        let state = lock(&self.state);
        let user = state.current_user()?;
        Ok(state
            .nodes
            .iter()
            .filter(|node| node.owner_id == user.id)
            .cloned()
            .collect())
    }

    async fn create_folder(&self, request: &CreateFolder) -> Result<FsNode, GatewayError> {
        self.enter(OP_CREATE_FOLDER).await?;
        let mut state = lock(&self.state);
        let user = state.current_user()?;
        state.insert_node(
            &user.id,
            NodeKind::Folder,
            &request.name,
            request.parent_id.clone(),
            None,
            None,
        )
    }

    async fn create_file(&self, request: &CreateFile) -> Result<FsNode, GatewayError> {
        self.enter(OP_CREATE_FILE).await?;
        let mut state = lock(&self.state);
        let user = state.current_user()?;
        state.insert_node(
            &user.id,
            NodeKind::File,
            &request.name,
            request.parent_id.clone(),
            Some(request.content.clone()),
            Some(request.mime_type.clone()),
        )
    }

    async fn node(&self, id: &str) -> Result<FsNode, GatewayError> {
        self.enter(OP_NODE).await?;
        let state = lock(&self.state);
        let user = state.current_user()?;
        state
            .nodes
            .iter()
            .find(|node| node.id == id && node.owner_id == user.id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound("Node not found".to_string()))
    }

    async fn update_node(&self, id: &str, update: &UpdateNode) -> Result<FsNode, GatewayError> {
        self.enter(OP_UPDATE_NODE).await?;
        let mut state = lock(&self.state);
        let user = state.current_user()?;
        let index = state
            .nodes
            .iter()
            .position(|node| node.id == id && node.owner_id == user.id)
            .ok_or_else(|| GatewayError::NotFound("Node not found".to_string()))?;

        let current = state.nodes[index].clone();
        let name = update.name.clone().unwrap_or_else(|| current.name.clone());
        let parent_id = update.parent_id.clone().or_else(|| current.parent_id.clone());
        let parent_path = state.parent_path(&user.id, parent_id.as_deref())?;
        let path = sanitize_path(&format!("{parent_path}/{name}"));
        if path != current.path
            && state
                .nodes
                .iter()
                .any(|node| node.owner_id == user.id && node.path == path)
        {
            return Err(GatewayError::Conflict(format!("{path} already exists")));
        }

        let prefix = format!("{}/", current.path);
        for node in state
            .nodes
            .iter_mut()
            .filter(|node| node.owner_id == user.id && node.path.starts_with(&prefix))
        {
            node.path = format!("{path}/{}", &node.path[prefix.len()..]);
        }
        let node = &mut state.nodes[index];
        node.name = name;
        node.parent_id = parent_id;
        node.path = path;
        if let Some(content) = &update.content {
            node.size = Some(content.len() as u64);
            node.content = Some(content.clone());
        }
        node.updated_at = Utc::now();
        Ok(node.clone())
    }

    async fn delete_node(&self, id: &str) -> Result<(), GatewayError> {
        self.enter(OP_DELETE_NODE).await?;
        let mut state = lock(&self.state);
        let user = state.current_user()?;
        let node = state
            .nodes
            .iter()
            .find(|node| node.id == id && node.owner_id == user.id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound("Node not found".to_string()))?;
        let prefix = format!("{}/", node.path);
        state.nodes.retain(|candidate| {
            candidate.owner_id != user.id
                || (candidate.id != node.id && !candidate.path.starts_with(&prefix))
        });
        Ok(())
    }

    async fn desktop_state(&self) -> Result<DesktopState, GatewayError> {
        self.enter(OP_DESKTOP_STATE).await?;
        let state = lock(&self.state);
        let user = state.current_user()?;
        Ok(state.desktops.get(&user.id).cloned().unwrap_or_default())
    }

    async fn save_desktop_state(&self, desktop: &DesktopState) -> Result<(), GatewayError> {
        self.enter(OP_SAVE_DESKTOP_STATE).await?;
        let mut state = lock(&self.state);
        let user = state.current_user()?;
        state.desktops.insert(user.id, desktop.clone());
        state.saves.push(SavedState {
            at: Instant::now(),
            state: desktop.clone(),
        });
        Ok(())
    }

    async fn list_virtual(&self) -> Result<Vec<VirtualProcess>, GatewayError> {
        self.enter(OP_LIST_VIRTUAL).await?;
        let state = lock(&self.state);
        let user = state.current_user()?;
        Ok(state
            .processes
            .iter()
            .filter(|process| process.owner_id == user.id)
            .filter(|process| process.status == ProcessStatus::Running)
            .cloned()
            .collect())
    }

    async fn start_virtual(
        &self,
        app: &str,
        metadata: Map<String, Value>,
    ) -> Result<VirtualProcess, GatewayError> {
        self.enter(OP_START_VIRTUAL).await?;
        let mut state = lock(&self.state);
        let user = state.current_user()?;
        let now = Utc::now();
        let process = VirtualProcess {
            id: state.mint_id("proc"),
            owner_id: user.id,
            app: app.to_string(),
            status: ProcessStatus::Running,
            cpu: 0.5,
            mem: 24.0,
            started_at: now,
            updated_at: now,
            metadata,
        };
        state.processes.push(process.clone());
        Ok(process)
    }

    async fn stop_virtual(&self, id: &str) -> Result<(), GatewayError> {
        self.enter(OP_STOP_VIRTUAL).await?;
        let mut state = lock(&self.state);
        let user = state.current_user()?;
        let process = state
            .processes
            .iter_mut()
            .find(|process| process.id == id && process.owner_id == user.id)
            .ok_or_else(|| GatewayError::NotFound("Process not found".to_string()))?;
        process.status = ProcessStatus::Stopped;
        process.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_virtual(&self, id: &str) -> Result<(), GatewayError> {
        self.enter(OP_DELETE_VIRTUAL).await?;
        let mut state = lock(&self.state);
        let user = state.current_user()?;
        let before = state.processes.len();
        state
            .processes
            .retain(|process| !(process.id == id && process.owner_id == user.id));
        if state.processes.len() == before {
            return Err(GatewayError::NotFound("Process not found".to_string()));
        }
        Ok(())
    }

    async fn delete_all_virtual(&self) -> Result<(), GatewayError> {
        self.enter(OP_DELETE_ALL_VIRTUAL).await?;
        let mut state = lock(&self.state);
        let user = state.current_user()?;
        state
            .processes
            .retain(|process| process.owner_id != user.id);
        Ok(())
    }

    async fn list_host(&self) -> Result<Vec<HostProcess>, GatewayError> {
        self.enter(OP_LIST_HOST).await?;
        let state = lock(&self.state);
        state.current_user()?;
        Ok(state.host.clone())
    }

    async fn host_metrics(&self) -> Result<SystemMetrics, GatewayError> {
        self.enter(OP_HOST_METRICS).await?;
        let state = lock(&self.state);
        state.current_user()?;
        Ok(state.metrics.clone().unwrap_or(SystemMetrics {
            cpu_percent: 0.0,
            memory_percent: 0.0,
            top_processes: Vec::new(),
        }))
    }

    async fn terminate_host(&self, pid: i64) -> Result<TerminateResult, GatewayError> {
        self.enter(OP_TERMINATE_HOST).await?;
        let mut state = lock(&self.state);
        let user = state.current_user()?;
        if !user.is_admin() {
            return Err(GatewayError::Forbidden("Admin role required".to_string()));
        }
        if pid <= 1 {
            return Err(GatewayError::Forbidden(format!(
                "Cannot terminate protected process {pid}"
            )));
        }
        let before = state.host.len();
        state.host.retain(|process| process.pid != pid);
        if state.host.len() == before {
            return Err(GatewayError::NotFound("Process not found".to_string()));
        }
        Ok(TerminateResult {
            pid,
            success: true,
            message: "Process terminated successfully".to_string(),
        })
    }
}
