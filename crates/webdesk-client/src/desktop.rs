//! Desktop controller: ties the window store, the user's prefs and the
//! session synchronizer to user actions.
//!
//! Window actions never wait on the network. They mutate the store, then
//! hand the resulting state to the synchronizer. Only sign-in, sign-out and
//! the file/host helpers await the gateway.
//!
//! An attached [`Channel`] is connected with the session token whenever a
//! session starts and dropped when it ends; its `vproc.events` frames close
//! windows whose processes were stopped elsewhere.

use crate::channel::{Channel, Subscription};
use crate::config::ClientConfig;
use crate::error::GatewayError;
use crate::gateway::RecordGateway;
use crate::store::{NewWindow, Viewport, WindowStore};
use crate::sync::{SessionFlush, SessionSynchronizer};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use webdesk_core::validators::{
    validate_app_name, validate_filename, validate_password, validate_username,
};
use webdesk_core::wire::{decode_payload, VprocEvent, TOPIC_VPROC_EVENTS};
use webdesk_core::{
    CreateFile, CreateFolder, Credentials, DesktopPrefs, DesktopState, FsNode, TerminateResult,
    UpdateNode, User, ValidationError, WindowId,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DesktopError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("no active session")]
    NotSignedIn,
}

impl DesktopError {
    pub fn is_auth(&self) -> bool {
        matches!(self, DesktopError::Gateway(err) if err.is_auth())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Logout,
    Shutdown,
    Restart,
}

impl SessionEnd {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEnd::Logout => "logout",
            SessionEnd::Shutdown => "shutdown",
            SessionEnd::Restart => "restart",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    SignedOut,
    Active,
    Ended(SessionEnd),
}

pub struct Desktop {
    gateway: Arc<dyn RecordGateway>,
    sync: SessionSynchronizer,
    store: WindowStore,
    prefs: DesktopPrefs,
    phase: SessionPhase,
    user: Option<User>,
    live: Option<LiveEvents>,
}

struct LiveEvents {
    channel: Channel,
    vproc: Subscription,
}

impl Desktop {
    pub fn new(gateway: Arc<dyn RecordGateway>, debounce: Duration, viewport: Viewport) -> Self {
        Self {
            sync: SessionSynchronizer::new(gateway.clone(), debounce),
            gateway,
            store: WindowStore::new(viewport),
            prefs: DesktopPrefs::default(),
            phase: SessionPhase::SignedOut,
            user: None,
            live: None,
        }
    }

    pub fn from_config(gateway: Arc<dyn RecordGateway>, config: &ClientConfig) -> Self {
        Self::new(gateway, config.save_debounce, Viewport::default())
    }

    pub fn store(&self) -> &WindowStore {
        &self.store
    }

    pub fn prefs(&self) -> &DesktopPrefs {
        &self.prefs
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn synchronizer(&self) -> &SessionSynchronizer {
        &self.sync
    }

    pub fn channel(&self) -> Option<&Channel> {
        self.live.as_ref().map(|live| &live.channel)
    }

    /// Routes the channel's `vproc.events` into this desktop. Connects right
    /// away when a session is already active.
    pub fn attach_channel(&mut self, channel: Channel) {
        if let Some(previous) = self.live.take() {
            previous.channel.unsubscribe(previous.vproc);
            previous.channel.disconnect();
        }
        let vproc = channel.subscribe(TOPIC_VPROC_EVENTS);
        self.live = Some(LiveEvents { channel, vproc });
        if self.is_active() {
            self.connect_channel();
        }
    }

    fn connect_channel(&self) {
        let Some(live) = &self.live else {
            return;
        };
        let Some(token) = self.gateway.token() else {
            return;
        };
        if let Err(err) = live.channel.connect(&token) {
            warn!(event = "desktop_channel_connect_failed", error = %err);
        }
    }

    fn disconnect_channel(&self) {
        if let Some(live) = &self.live {
            live.channel.disconnect();
        }
    }

    /// Applies every pushed process event received so far without waiting.
    /// Returns how many windows were closed.
    pub fn drain_events(&mut self) -> usize {
        let mut frames = Vec::new();
        if let Some(live) = self.live.as_mut() {
            while let Some(data) = live.vproc.try_recv() {
                frames.push(data);
            }
        }
        frames
            .iter()
            .filter(|data| self.apply_vproc_frame(data))
            .count()
    }

    /// Waits for the next pushed process event and applies it. `None` when no
    /// channel is attached.
    pub async fn next_event(&mut self) -> Option<bool> {
        let data = self.live.as_mut()?.vproc.recv().await?;
        Some(self.apply_vproc_frame(&data))
    }

    fn apply_vproc_frame(&mut self, data: &Value) -> bool {
        match decode_payload::<VprocEvent>(data) {
            Ok(event) => self.apply_vproc_event(&event),
            Err(err) => {
                warn!(event = "desktop_vproc_frame_dropped", error = %err);
                false
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.phase == SessionPhase::Active
    }

    /// The state a save would send right now.
    pub fn state(&self) -> DesktopState {
        self.prefs.to_state(self.store.windows().to_vec())
    }

    pub async fn login(&mut self, username: &str, password: &str) -> Result<&User, DesktopError> {
        let credentials = credentials(username, password)?;
        let result = self.gateway.login(&credentials).await;
        let token = result.map_err(|err| self.on_gateway_error(err))?;
        self.gateway.set_token(Some(token.access_token));
        self.begin_session().await
    }

    pub async fn register(
        &mut self,
        username: &str,
        password: &str,
    ) -> Result<&User, DesktopError> {
        let credentials = credentials(username, password)?;
        let result = self.gateway.register(&credentials).await;
        let token = result.map_err(|err| self.on_gateway_error(err))?;
        self.gateway.set_token(Some(token.access_token));
        self.begin_session().await
    }

    /// Starts a new session with the token the gateway already holds, e.g.
    /// after a restart.
    pub async fn resume(&mut self) -> Result<&User, DesktopError> {
        if !self.gateway.has_token() {
            return Err(DesktopError::NotSignedIn);
        }
        self.begin_session().await
    }

    async fn begin_session(&mut self) -> Result<&User, DesktopError> {
        let result = self.gateway.whoami().await;
        let user = result.map_err(|err| self.on_gateway_error(err))?;
        let result = self.sync.start_session().await;
        let prefs = result.map_err(|err| self.on_gateway_error(err))?;
        self.store.clear();
        self.prefs = prefs;
        self.phase = SessionPhase::Active;
        self.connect_channel();
        info!(event = "desktop_session_active", username = %user.username);
        Ok(self.user.insert(user))
    }

    fn on_gateway_error(&mut self, err: GatewayError) -> DesktopError {
        if err.is_auth() {
            warn!(event = "desktop_auth_lost", error = %err);
            self.sync.cancel_pending_save();
            self.disconnect_channel();
            self.gateway.set_token(None);
            self.store.clear();
            self.user = None;
            self.phase = SessionPhase::SignedOut;
        }
        DesktopError::Gateway(err)
    }

    fn persist(&self) {
        if self.is_active() {
            self.sync.schedule_save(self.state());
        }
    }

    fn after_change(&self, changed: bool) -> bool {
        if changed {
            self.persist();
        }
        changed
    }

    pub fn open_app(&mut self, app: &str) -> Result<WindowId, DesktopError> {
        self.open_window(NewWindow::new(app))
    }

    pub fn open_window(&mut self, request: NewWindow) -> Result<WindowId, DesktopError> {
        if !self.is_active() {
            return Err(DesktopError::NotSignedIn);
        }
        validate_app_name(&request.app)?;
        let id = request.id.clone();
        if !self.store.open(request) {
            return Ok(id);
        }
        if let Some(window) = self.store.get(&id) {
            self.sync.window_opened(window);
        }
        self.persist();
        Ok(id)
    }

    /// Closes the window locally right away; the matching process record is
    /// cleaned up in the background.
    pub fn close_window(&mut self, id: &str) -> bool {
        let Some(window) = self.store.get(id).cloned() else {
            return false;
        };
        self.store.close(id);
        if self.is_active() {
            self.sync.window_closing(&window);
        }
        self.after_change(true)
    }

    pub fn minimize(&mut self, id: &str) -> bool {
        let changed = self.store.minimize(id);
        self.after_change(changed)
    }

    pub fn maximize(&mut self, id: &str) -> bool {
        let changed = self.store.maximize(id);
        self.after_change(changed)
    }

    pub fn restore(&mut self, id: &str) -> bool {
        let changed = self.store.restore(id);
        self.after_change(changed)
    }

    pub fn focus(&mut self, id: &str) -> bool {
        let changed = self.store.focus(id);
        self.after_change(changed)
    }

    pub fn move_window(&mut self, id: &str, x: f64, y: f64) -> bool {
        let changed = self.store.move_to(id, x, y);
        self.after_change(changed)
    }

    pub fn resize_window(&mut self, id: &str, w: f64, h: f64) -> bool {
        let changed = self.store.resize(id, w, h);
        self.after_change(changed)
    }

    pub fn set_viewport(&mut self, width: f64, height: f64) -> bool {
        let changed = self.store.set_viewport(width, height);
        self.after_change(changed)
    }

    pub fn set_wallpaper(&mut self, wallpaper: &str) -> bool {
        if self.prefs.wallpaper == wallpaper {
            return false;
        }
        self.prefs.wallpaper = wallpaper.to_string();
        self.after_change(true)
    }

    pub fn set_setting(&mut self, key: &str, value: Value) -> bool {
        if self.prefs.settings.get(key) == Some(&value) {
            return false;
        }
        self.prefs.settings.insert(key.to_string(), value);
        self.after_change(true)
    }

    /// Applies a pushed `vproc.events` frame. A process stopped or deleted
    /// elsewhere closes its window here without another delete call.
    pub fn apply_vproc_event(&mut self, event: &VprocEvent) -> bool {
        let window_id = match event {
            VprocEvent::Stopped { process } => process.window_id(),
            VprocEvent::Deleted { window_id, .. } => window_id.as_deref(),
            VprocEvent::Started { .. } | VprocEvent::Cleared => None,
        };
        let Some(window_id) = window_id else {
            return false;
        };
        let changed = self.store.close(window_id);
        if changed {
            debug!(event = "desktop_window_closed_remotely", window_id = %window_id);
        }
        self.after_change(changed)
    }

    pub async fn logout(&mut self) -> Result<SessionFlush, DesktopError> {
        self.end(SessionEnd::Logout).await
    }

    pub async fn shutdown(&mut self) -> Result<SessionFlush, DesktopError> {
        self.end(SessionEnd::Shutdown).await
    }

    pub async fn restart(&mut self) -> Result<SessionFlush, DesktopError> {
        self.end(SessionEnd::Restart).await
    }

    /// Flushes the session before it ends. Restart keeps the token so the
    /// next session can `resume()`.
    async fn end(&mut self, kind: SessionEnd) -> Result<SessionFlush, DesktopError> {
        if !self.is_active() {
            return Err(DesktopError::NotSignedIn);
        }
        let flush = self.sync.end_session(self.state()).await;
        self.disconnect_channel();
        if kind != SessionEnd::Restart {
            self.gateway.set_token(None);
            self.user = None;
        }
        self.store.clear();
        self.phase = SessionPhase::Ended(kind);
        info!(event = "desktop_session_end", kind = kind.as_str(), saved = flush.saved);
        Ok(flush)
    }

    pub async fn create_folder(
        &mut self,
        name: &str,
        parent_id: Option<String>,
    ) -> Result<FsNode, DesktopError> {
        self.require_active()?;
        validate_filename(name)?;
        let request = CreateFolder {
            name: name.to_string(),
            parent_id,
        };
        let result = self.gateway.create_folder(&request).await;
        result.map_err(|err| self.on_gateway_error(err))
    }

    pub async fn create_file(
        &mut self,
        name: &str,
        parent_id: Option<String>,
        content: &str,
    ) -> Result<FsNode, DesktopError> {
        self.require_active()?;
        validate_filename(name)?;
        let mut request = CreateFile::new(name, parent_id);
        request.content = content.to_string();
        let result = self.gateway.create_file(&request).await;
        result.map_err(|err| self.on_gateway_error(err))
    }

    pub async fn rename_node(&mut self, id: &str, name: &str) -> Result<FsNode, DesktopError> {
        self.require_active()?;
        validate_filename(name)?;
        let update = UpdateNode {
            name: Some(name.to_string()),
            ..UpdateNode::default()
        };
        let result = self.gateway.update_node(id, &update).await;
        result.map_err(|err| self.on_gateway_error(err))
    }

    pub async fn terminate_host(&mut self, pid: i64) -> Result<TerminateResult, DesktopError> {
        self.require_active()?;
        let result = self.gateway.terminate_host(pid).await;
        result.map_err(|err| self.on_gateway_error(err))
    }

    fn require_active(&self) -> Result<(), DesktopError> {
        if self.is_active() {
            Ok(())
        } else {
            Err(DesktopError::NotSignedIn)
        }
    }
}

fn credentials(username: &str, password: &str) -> Result<Credentials, ValidationError> {
    validate_username(username)?;
    validate_password(password)?;
    Ok(Credentials {
        username: username.to_string(),
        password: password.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::memory::{
        OP_DELETE_ALL_VIRTUAL, OP_DELETE_VIRTUAL, OP_DESKTOP_STATE, OP_LOGIN,
        OP_SAVE_DESKTOP_STATE, OP_WHOAMI,
    };
    use crate::channel::{ChannelOptions, ChannelState, ChannelStatus, TungsteniteConnector};
    use crate::gateway::MemoryGateway;
    use serde_json::json;
    use tokio::time::{sleep, Instant};
    use url::Url;
    use webdesk_core::{window_metadata, Position, Size, Window};

    async fn signed_in() -> (Arc<MemoryGateway>, Desktop) {
        let gw = Arc::new(MemoryGateway::new());
        gw.add_account("alice", "secret1", &[]);
        let mut desktop = Desktop::new(gw.clone(), Duration::from_secs(2), Viewport::default());
        desktop.login("alice", "secret1").await.expect("login");
        (gw, desktop)
    }

    #[tokio::test]
    async fn login_restores_prefs_but_never_windows() {
        let gw = Arc::new(MemoryGateway::new());
        let token = gw.add_account("alice", "secret1", &[]);
        gw.set_token(Some(token.access_token));
        gw.seed_desktop(DesktopState {
            wallpaper: "/beach.jpg".to_string(),
            windows: vec![Window {
                id: "w-old".to_string(),
                app: "terminal".to_string(),
                position: Position { x: 0.0, y: 0.0 },
                size: Size { w: 400.0, h: 300.0 },
                minimized: false,
                maximized: false,
                z: 1,
                data: None,
            }],
            ..DesktopState::default()
        });
        gw.seed_virtual("terminal", window_metadata("w-old"));
        gw.set_token(None);

        let mut desktop = Desktop::new(gw.clone(), Duration::from_secs(2), Viewport::default());
        let user = desktop.login("alice", "secret1").await.expect("login");
        assert_eq!(user.username, "alice");
        assert_eq!(desktop.phase(), SessionPhase::Active);
        assert_eq!(desktop.prefs().wallpaper, "/beach.jpg");
        assert!(desktop.store().is_empty());
        assert!(gw.virtual_records().is_empty());
        assert_eq!(
            gw.calls(),
            vec![OP_LOGIN, OP_WHOAMI, OP_DELETE_ALL_VIRTUAL, OP_DESKTOP_STATE]
        );
    }

    #[tokio::test]
    async fn invalid_credentials_never_reach_the_gateway() {
        let gw = Arc::new(MemoryGateway::new());
        let mut desktop = Desktop::new(gw.clone(), Duration::from_secs(2), Viewport::default());
        let err = desktop.login("al", "secret1").await.expect_err("short name");
        assert!(matches!(err, DesktopError::Validation(_)));
        let err = desktop.register("alice", "123").await.expect_err("short pw");
        assert!(matches!(err, DesktopError::Validation(_)));
        assert!(gw.calls().is_empty());

        let err = desktop.login("alice", "secret1").await.expect_err("unknown");
        assert!(err.is_auth());
        assert_eq!(desktop.phase(), SessionPhase::SignedOut);
    }

    #[tokio::test]
    async fn auth_failure_during_session_start_signs_out() {
        let gw = Arc::new(MemoryGateway::new());
        gw.add_account("alice", "secret1", &[]);
        gw.fail(OP_DESKTOP_STATE, GatewayError::Auth("expired".to_string()));
        let mut desktop = Desktop::new(gw.clone(), Duration::from_secs(2), Viewport::default());
        assert!(desktop.login("alice", "secret1").await.expect_err("auth").is_auth());
        assert_eq!(desktop.phase(), SessionPhase::SignedOut);
        assert!(!gw.has_token());
    }

    #[tokio::test]
    async fn window_actions_require_a_session() {
        let gw = Arc::new(MemoryGateway::new());
        let mut desktop = Desktop::new(gw, Duration::from_secs(2), Viewport::default());
        assert_eq!(desktop.open_app("terminal"), Err(DesktopError::NotSignedIn));
        assert!(!desktop.close_window("missing"));
    }

    #[tokio::test]
    async fn opening_an_app_records_its_process() {
        let (gw, mut desktop) = signed_in().await;
        assert!(matches!(
            desktop.open_app("bad app!"),
            Err(DesktopError::Validation(_))
        ));
        let id = desktop.open_app("terminal").expect("open");
        assert_eq!(desktop.store().focused(), Some(id.as_str()));
        desktop.synchronizer().tasks().idle().await;

        let records = gw.virtual_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].window_id(), Some(id.as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn window_moves_are_saved_once_after_the_debounce() {
        let (gw, mut desktop) = signed_in().await;
        let id = desktop.open_app("notes").expect("open");
        let start = Instant::now();
        for x in [100.0, 200.0, 300.0] {
            assert!(desktop.move_window(&id, x, 120.0));
            sleep(Duration::from_millis(500)).await;
        }
        assert!(!desktop.move_window("missing", 1.0, 1.0));
        sleep(Duration::from_secs(3)).await;
        desktop.synchronizer().tasks().idle().await;

        let saves = gw.saves();
        assert_eq!(saves.len(), 1);
        assert!(saves[0].at - start >= Duration::from_millis(3000));
        assert_eq!(saves[0].state.windows.len(), 1);
        assert_eq!(saves[0].state.windows[0].position.x, 300.0);
    }

    #[tokio::test]
    async fn close_succeeds_even_when_the_delete_fails() {
        let (gw, mut desktop) = signed_in().await;
        let id = desktop.open_app("terminal").expect("open");
        desktop.synchronizer().tasks().idle().await;
        gw.fail(OP_DELETE_VIRTUAL, GatewayError::Transport("reset".to_string()));

        assert!(desktop.close_window(&id));
        assert!(desktop.store().is_empty());
        desktop.synchronizer().tasks().idle().await;
        assert_eq!(gw.call_count(OP_DELETE_VIRTUAL), 1);
        assert_eq!(gw.virtual_records().len(), 1);
    }

    #[tokio::test]
    async fn remote_stop_closes_the_window_without_a_delete() {
        let (gw, mut desktop) = signed_in().await;
        let id = desktop.open_app("terminal").expect("open");
        let other = desktop.open_app("notes").expect("open");
        desktop.synchronizer().tasks().idle().await;
        let process = gw
            .virtual_records()
            .into_iter()
            .find(|record| record.window_id() == Some(id.as_str()))
            .expect("record");

        assert!(desktop.apply_vproc_event(&VprocEvent::Stopped { process }));
        assert!(desktop.store().get(&id).is_none());
        assert!(!desktop.apply_vproc_event(&VprocEvent::Deleted {
            id: "p-x".to_string(),
            window_id: None,
        }));
        assert!(desktop.apply_vproc_event(&VprocEvent::Deleted {
            id: "p-y".to_string(),
            window_id: Some(other.clone()),
        }));
        desktop.synchronizer().tasks().idle().await;
        assert_eq!(gw.call_count(OP_DELETE_VIRTUAL), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn logout_flushes_state_and_clears_records() {
        let (gw, mut desktop) = signed_in().await;
        desktop.open_app("terminal").expect("open");
        assert!(desktop.set_wallpaper("/night.jpg"));
        assert!(!desktop.set_wallpaper("/night.jpg"));
        assert!(desktop.set_setting("theme", json!("dark")));
        desktop.synchronizer().tasks().idle().await;

        let flush = desktop.logout().await.expect("logout");
        assert!(flush.saved && flush.cleared);
        assert_eq!(desktop.phase(), SessionPhase::Ended(SessionEnd::Logout));
        assert!(desktop.store().is_empty());
        assert!(!gw.has_token());

        sleep(Duration::from_secs(5)).await;
        let saves = gw.saves();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].state.wallpaper, "/night.jpg");
        assert_eq!(saves[0].state.settings["theme"], "dark");
        assert!(gw.virtual_records().is_empty());
        assert_eq!(gw.call_count(OP_SAVE_DESKTOP_STATE), 1);
        assert_eq!(desktop.logout().await, Err(DesktopError::NotSignedIn));
    }

    #[tokio::test]
    async fn restart_keeps_the_token_for_resume() {
        let (gw, mut desktop) = signed_in().await;
        desktop.set_wallpaper("/sunset.jpg");
        desktop.restart().await.expect("restart");
        assert_eq!(desktop.phase(), SessionPhase::Ended(SessionEnd::Restart));
        assert!(gw.has_token());

        desktop.resume().await.expect("resume");
        assert!(desktop.is_active());
        assert_eq!(desktop.prefs().wallpaper, "/sunset.jpg");
    }

    #[tokio::test]
    async fn session_boundaries_connect_and_drop_the_channel() {
        let (gw, mut desktop) = signed_in().await;
        let channel = Channel::new(
            Url::parse("ws://127.0.0.1:9/ws").expect("url"),
            Arc::new(TungsteniteConnector),
            ChannelOptions::default(),
        );
        assert_eq!(desktop.drain_events(), 0);
        assert_eq!(desktop.next_event().await, None);

        desktop.attach_channel(channel.clone());
        assert_eq!(channel.state(), ChannelState::Connecting);
        assert_eq!(channel.topics(), vec![TOPIC_VPROC_EVENTS.to_string()]);

        desktop.logout().await.expect("logout");
        assert!(!gw.has_token());
        assert_eq!(*channel.status().borrow(), ChannelStatus::default());
        sleep(Duration::from_millis(1500)).await;
        assert_eq!(*channel.status().borrow(), ChannelStatus::default());
    }

    #[tokio::test]
    async fn file_helpers_validate_names_first() {
        let (gw, mut desktop) = signed_in().await;
        let err = desktop.create_folder("con", None).await.expect_err("reserved");
        assert!(matches!(err, DesktopError::Validation(_)));
        let err = desktop.create_file("a/b.txt", None, "").await.expect_err("slash");
        assert!(matches!(err, DesktopError::Validation(_)));

        let folder = desktop.create_folder("Projects", None).await.expect("folder");
        let file = desktop
            .create_file("todo.md", Some(folder.id.clone()), "- ship")
            .await
            .expect("file");
        assert_eq!(file.size, Some(6));
        let renamed = desktop.rename_node(&file.id, "done.md").await.expect("rename");
        assert_eq!(renamed.path, "/Projects/done.md");
        assert_eq!(gw.tree().await.expect("tree").len(), 2);
    }

    #[tokio::test]
    async fn terminate_is_forbidden_for_regular_users() {
        let (_gw, mut desktop) = signed_in().await;
        let err = desktop.terminate_host(4242).await.expect_err("forbidden");
        assert_eq!(
            err,
            DesktopError::Gateway(GatewayError::Forbidden("Admin role required".to_string()))
        );
        assert!(desktop.is_active());
    }
}
