use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

pub mod validators;
pub mod wire;

pub use validators::ValidationError;

pub const DEFAULT_WALLPAPER: &str = "/wallpapers/default.jpg";
pub const WINDOW_ID_KEY: &str = "window_id";

pub type WindowId = String;

/// Generates a fresh client-side window id.
pub fn new_window_id() -> WindowId {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Size {
    pub w: f64,
    pub h: f64,
}

/// A client-side application window. Serializes in the record API's
/// flat `window_id, app, x, y, w, h, ...` shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Window {
    #[serde(rename = "window_id")]
    pub id: WindowId,
    pub app: String,
    #[serde(flatten)]
    pub position: Position,
    #[serde(flatten)]
    pub size: Size,
    #[serde(default)]
    pub minimized: bool,
    #[serde(default)]
    pub maximized: bool,
    #[serde(default)]
    pub z: i64,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IconPosition {
    pub node_id: String,
    pub x: i64,
    pub y: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DesktopState {
    #[serde(default = "default_wallpaper")]
    pub wallpaper: String,
    #[serde(default)]
    pub icons: Vec<IconPosition>,
    #[serde(default)]
    pub windows: Vec<Window>,
    #[serde(default)]
    pub settings: Map<String, Value>,
}

impl Default for DesktopState {
    fn default() -> Self {
        Self {
            wallpaper: default_wallpaper(),
            icons: Vec::new(),
            windows: Vec::new(),
            settings: Map::new(),
        }
    }
}

impl DesktopState {
    pub fn prefs(&self) -> DesktopPrefs {
        DesktopPrefs {
            wallpaper: self.wallpaper.clone(),
            icons: self.icons.clone(),
            settings: self.settings.clone(),
        }
    }
}

/// The part of the desktop state that survives across sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct DesktopPrefs {
    pub wallpaper: String,
    pub icons: Vec<IconPosition>,
    pub settings: Map<String, Value>,
}

impl Default for DesktopPrefs {
    fn default() -> Self {
        DesktopState::default().prefs()
    }
}

impl DesktopPrefs {
    pub fn to_state(&self, windows: Vec<Window>) -> DesktopState {
        DesktopState {
            wallpaper: self.wallpaper.clone(),
            icons: self.icons.clone(),
            windows,
            settings: self.settings.clone(),
        }
    }
}

fn default_wallpaper() -> String {
    DEFAULT_WALLPAPER.to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Stopped,
    Suspended,
}

impl Default for ProcessStatus {
    fn default() -> Self {
        Self::Running
    }
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Running => "running",
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Suspended => "suspended",
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "running" => Ok(ProcessStatus::Running),
            "stopped" => Ok(ProcessStatus::Stopped),
            "suspended" => Ok(ProcessStatus::Suspended),
            other => Err(format!("Unknown process status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VirtualProcess {
    pub id: String,
    pub owner_id: String,
    pub app: String,
    #[serde(default)]
    pub status: ProcessStatus,
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub mem: f64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl VirtualProcess {
    /// The id of the window that started this record, if it was recorded.
    pub fn window_id(&self) -> Option<&str> {
        self.metadata.get(WINDOW_ID_KEY).and_then(Value::as_str)
    }
}

/// Metadata attached to a virtual process started for `window_id`.
pub fn window_metadata(window_id: &str) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert(
        WINDOW_ID_KEY.to_string(),
        Value::String(window_id.to_string()),
    );
    metadata
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostProcess {
    pub pid: i64,
    pub name: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub cpu_percent: f64,
    #[serde(default)]
    pub memory_percent: f64,
    #[serde(default = "default_host_status")]
    pub status: String,
    #[serde(default)]
    pub create_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cmdline: Option<String>,
    #[serde(default)]
    pub num_threads: i64,
}

fn default_host_status() -> String {
    "running".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    #[serde(default)]
    pub top_processes: Vec<HostProcess>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TerminateResult {
    pub pid: i64,
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Folder,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::File => "file",
            NodeKind::Folder => "folder",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FsNode {
    pub id: String,
    pub owner_id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub path: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateFolder {
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateFile {
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default = "default_mime_type")]
    pub mime_type: String,
}

impl CreateFile {
    pub fn new(name: impl Into<String>, parent_id: Option<String>) -> Self {
        Self {
            name: name.into(),
            parent_id,
            content: String::new(),
            mime_type: default_mime_type(),
        }
    }
}

fn default_mime_type() -> String {
    "text/plain".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct UpdateNode {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Token {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|role| role == "admin")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_uses_flat_record_shape() {
        let window = Window {
            id: "w-1".to_string(),
            app: "notepad".to_string(),
            position: Position { x: 10.0, y: 20.0 },
            size: Size { w: 400.0, h: 300.0 },
            minimized: false,
            maximized: true,
            z: 3,
            data: None,
        };
        let value = serde_json::to_value(&window).expect("serialize");
        assert_eq!(value["window_id"], "w-1");
        assert_eq!(value["x"], 10.0);
        assert_eq!(value["h"], 300.0);
        assert_eq!(value["maximized"], true);

        let parsed: Window = serde_json::from_value(value).expect("deserialize");
        assert_eq!(parsed, window);
    }

    #[test]
    fn desktop_state_fills_defaults() {
        let state: DesktopState = serde_json::from_str("{}").expect("parse");
        assert_eq!(state.wallpaper, DEFAULT_WALLPAPER);
        assert!(state.windows.is_empty());
        assert_eq!(state.prefs(), DesktopPrefs::default());
    }

    #[test]
    fn virtual_process_exposes_window_id() {
        let raw = r#"{
            "id": "p1",
            "owner_id": "u1",
            "app": "terminal",
            "status": "running",
            "cpu": 1.5,
            "mem": 20.0,
            "started_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z",
            "metadata": {"window_id": "w-9"}
        }"#;
        let process: VirtualProcess = serde_json::from_str(raw).expect("parse");
        assert_eq!(process.window_id(), Some("w-9"));
        assert_eq!(process.status, ProcessStatus::Running);

        let bare = VirtualProcess {
            metadata: Map::new(),
            ..process
        };
        assert_eq!(bare.window_id(), None);
    }

    #[test]
    fn process_status_parses_loosely() {
        assert_eq!(" Stopped ".parse::<ProcessStatus>(), Ok(ProcessStatus::Stopped));
        assert!("zombie".parse::<ProcessStatus>().is_err());
        assert_eq!(ProcessStatus::Suspended.to_string(), "suspended");
    }

    #[test]
    fn fs_node_kind_uses_type_field() {
        let raw = r#"{
            "id": "n1",
            "owner_id": "u1",
            "type": "folder",
            "name": "Documents",
            "parent_id": null,
            "path": "/Documents",
            "created_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z"
        }"#;
        let node: FsNode = serde_json::from_str(raw).expect("parse");
        assert_eq!(node.kind, NodeKind::Folder);
        assert_eq!(node.content, None);
    }

    #[test]
    fn admin_role_detection() {
        let user = User {
            id: "u1".to_string(),
            username: "admin".to_string(),
            roles: vec!["admin".to_string()],
            created_at: Utc::now(),
        };
        assert!(user.is_admin());
        let plain = User {
            roles: Vec::new(),
            ..user
        };
        assert!(!plain.is_admin());
    }
}
