//! Record Gateway: typed access to the record API.

pub mod memory;

use crate::error::GatewayError;
use crate::{lock, ClientConfig};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;
use url::Url;
use webdesk_core::{
    CreateFile, CreateFolder, Credentials, DesktopState, FsNode, HostProcess, SystemMetrics,
    TerminateResult, Token, UpdateNode, User, VirtualProcess,
};

pub use memory::MemoryGateway;

#[async_trait]
pub trait RecordGateway: Send + Sync {
    /// Sets the bearer token attached to every authenticated call.
    fn set_token(&self, token: Option<String>);
    fn token(&self) -> Option<String>;

    fn has_token(&self) -> bool {
        self.token().is_some()
    }

    async fn register(&self, credentials: &Credentials) -> Result<Token, GatewayError>;
    async fn login(&self, credentials: &Credentials) -> Result<Token, GatewayError>;
    async fn whoami(&self) -> Result<User, GatewayError>;

    async fn tree(&self) -> Result<Vec<FsNode>, GatewayError>;
    async fn create_folder(&self, request: &CreateFolder) -> Result<FsNode, GatewayError>;
    async fn create_file(&self, request: &CreateFile) -> Result<FsNode, GatewayError>;
    async fn node(&self, id: &str) -> Result<FsNode, GatewayError>;
    async fn update_node(&self, id: &str, update: &UpdateNode) -> Result<FsNode, GatewayError>;
    async fn delete_node(&self, id: &str) -> Result<(), GatewayError>;

    async fn desktop_state(&self) -> Result<DesktopState, GatewayError>;
    async fn save_desktop_state(&self, state: &DesktopState) -> Result<(), GatewayError>;

    async fn list_virtual(&self) -> Result<Vec<VirtualProcess>, GatewayError>;
    async fn start_virtual(
        &self,
        app: &str,
        metadata: Map<String, Value>,
    ) -> Result<VirtualProcess, GatewayError>;
    async fn stop_virtual(&self, id: &str) -> Result<(), GatewayError>;
    async fn delete_virtual(&self, id: &str) -> Result<(), GatewayError>;
    async fn delete_all_virtual(&self) -> Result<(), GatewayError>;

    async fn list_host(&self) -> Result<Vec<HostProcess>, GatewayError>;
    async fn host_metrics(&self) -> Result<SystemMetrics, GatewayError>;
    async fn terminate_host(&self, pid: i64) -> Result<TerminateResult, GatewayError>;
}

#[derive(Deserialize)]
struct NodeList {
    nodes: Vec<FsNode>,
}

#[derive(Deserialize)]
struct ProcessList<T> {
    processes: Vec<T>,
}

#[derive(Serialize)]
struct StartProcess<'a> {
    app: &'a str,
    metadata: Map<String, Value>,
}

/// reqwest-backed gateway against the HTTP record API.
pub struct HttpGateway {
    client: reqwest::Client,
    base: Url,
    token: Mutex<Option<String>>,
}

impl HttpGateway {
    pub fn new(base: Url, request_timeout: Option<Duration>) -> Result<Self, GatewayError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = request_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|err| GatewayError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            base: with_trailing_slash(base),
            token: Mutex::new(None),
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, GatewayError> {
        Self::new(config.api_url.clone(), config.request_timeout)
    }

    fn url(&self, path: &str) -> Result<Url, GatewayError> {
        self.base
            .join(path)
            .map_err(|err| GatewayError::Transport(format!("bad endpoint {path}: {err}")))
    }

    fn bearer(&self) -> Result<String, GatewayError> {
        lock(&self.token)
            .clone()
            .ok_or_else(|| GatewayError::Auth("missing token".to_string()))
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, GatewayError> {
        Ok(self.client.request(method, self.url(path)?))
    }

    fn authed(&self, method: Method, path: &str) -> Result<RequestBuilder, GatewayError> {
        let token = self.bearer()?;
        Ok(self.request(method, path)?.bearer_auth(token))
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response, GatewayError> {
        let response = request
            .send()
            .await
            .map_err(|err| GatewayError::Transport(err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = detail_message(&body)
            .or_else(|| status.canonical_reason().map(str::to_string))
            .unwrap_or_else(|| status.to_string());
        debug!(event = "gateway_error_status", status = status.as_u16(), message = %message);
        Err(GatewayError::from_status(status.as_u16(), message))
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, GatewayError> {
        self.execute(request)
            .await?
            .json::<T>()
            .await
            .map_err(|err| GatewayError::Decode(err.to_string()))
    }

    async fn empty(&self, request: RequestBuilder) -> Result<(), GatewayError> {
        self.execute(request).await.map(|_| ())
    }
}

fn with_trailing_slash(mut base: Url) -> Url {
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base
}

/// Pulls the message out of a `{"detail": ...}` error body.
fn detail_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    match value.get("detail")? {
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

#[async_trait]
impl RecordGateway for HttpGateway {
    fn set_token(&self, token: Option<String>) {
        *lock(&self.token) = token;
    }

    fn token(&self) -> Option<String> {
        lock(&self.token).clone()
    }

    async fn register(&self, credentials: &Credentials) -> Result<Token, GatewayError> {
        self.json(self.request(Method::POST, "auth/register")?.json(credentials))
            .await
    }

    async fn login(&self, credentials: &Credentials) -> Result<Token, GatewayError> {
        self.json(self.request(Method::POST, "auth/login")?.json(credentials))
            .await
    }

    async fn whoami(&self) -> Result<User, GatewayError> {
        self.json(self.authed(Method::GET, "auth/me")?).await
    }

    async fn tree(&self) -> Result<Vec<FsNode>, GatewayError> {
        let list: NodeList = self.json(self.authed(Method::GET, "files/tree")?).await?;
        Ok(list.nodes)
    }

    async fn create_folder(&self, request: &CreateFolder) -> Result<FsNode, GatewayError> {
        self.json(self.authed(Method::POST, "files/folder")?.json(request))
            .await
    }

    async fn create_file(&self, request: &CreateFile) -> Result<FsNode, GatewayError> {
        self.json(self.authed(Method::POST, "files/file")?.json(request))
            .await
    }

    async fn node(&self, id: &str) -> Result<FsNode, GatewayError> {
        self.json(self.authed(Method::GET, &format!("files/node/{id}"))?)
            .await
    }

    async fn update_node(&self, id: &str, update: &UpdateNode) -> Result<FsNode, GatewayError> {
        self.json(
            self.authed(Method::PATCH, &format!("files/node/{id}"))?
                .json(update),
        )
        .await
    }

    async fn delete_node(&self, id: &str) -> Result<(), GatewayError> {
        self.empty(self.authed(Method::DELETE, &format!("files/node/{id}"))?)
            .await
    }

    async fn desktop_state(&self) -> Result<DesktopState, GatewayError> {
        self.json(self.authed(Method::GET, "desktop/state")?).await
    }

    async fn save_desktop_state(&self, state: &DesktopState) -> Result<(), GatewayError> {
        self.empty(self.authed(Method::PUT, "desktop/state")?.json(state))
            .await
    }

    async fn list_virtual(&self) -> Result<Vec<VirtualProcess>, GatewayError> {
        let list: ProcessList<VirtualProcess> =
            self.json(self.authed(Method::GET, "vproc/list")?).await?;
        Ok(list.processes)
    }

    async fn start_virtual(
        &self,
        app: &str,
        metadata: Map<String, Value>,
    ) -> Result<VirtualProcess, GatewayError> {
        let body = StartProcess { app, metadata };
        self.json(self.authed(Method::POST, "vproc/start")?.json(&body))
            .await
    }

    async fn stop_virtual(&self, id: &str) -> Result<(), GatewayError> {
        self.empty(self.authed(Method::POST, &format!("vproc/stop/{id}"))?)
            .await
    }

    async fn delete_virtual(&self, id: &str) -> Result<(), GatewayError> {
        self.empty(self.authed(Method::DELETE, &format!("vproc/{id}"))?)
            .await
    }

    async fn delete_all_virtual(&self) -> Result<(), GatewayError> {
        self.empty(self.authed(Method::DELETE, "vproc/all")?).await
    }

    async fn list_host(&self) -> Result<Vec<HostProcess>, GatewayError> {
        let list: ProcessList<HostProcess> =
            self.json(self.authed(Method::GET, "hproc/list")?).await?;
        Ok(list.processes)
    }

    async fn host_metrics(&self) -> Result<SystemMetrics, GatewayError> {
        self.json(self.authed(Method::GET, "hproc/metrics")?).await
    }

    async fn terminate_host(&self, pid: i64) -> Result<TerminateResult, GatewayError> {
        self.json(self.authed(Method::POST, &format!("hproc/terminate/{pid}"))?)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway(base: &str) -> HttpGateway {
        HttpGateway::new(Url::parse(base).expect("url"), None).expect("gateway")
    }

    #[test]
    fn endpoints_resolve_under_base_path() {
        let gw = gateway("https://desk.example.com/api");
        assert_eq!(
            gw.url("vproc/all").expect("url").as_str(),
            "https://desk.example.com/api/vproc/all"
        );
        let root = gateway("http://127.0.0.1:8000");
        assert_eq!(
            root.url("files/node/abc").expect("url").as_str(),
            "http://127.0.0.1:8000/files/node/abc"
        );
    }

    #[test]
    fn detail_body_becomes_message() {
        assert_eq!(
            detail_message(r#"{"detail":"Username already registered"}"#),
            Some("Username already registered".to_string())
        );
        let structured = detail_message(r#"{"detail":[{"loc":["body","name"],"msg":"required"}]}"#)
            .expect("detail");
        assert!(structured.contains("required"));
        assert_eq!(detail_message("<html>bad gateway</html>"), None);
    }

    #[tokio::test]
    async fn calls_without_token_fail_as_auth_before_sending() {
        // Port 9 is never contacted: the missing token short-circuits.
        let gw = gateway("http://127.0.0.1:9");
        assert!(!gw.has_token());
        let err = gw.list_virtual().await.expect_err("no token");
        assert!(err.is_auth(), "{err:?}");
        gw.set_token(Some("abc".to_string()));
        assert!(gw.has_token());
    }

    #[tokio::test]
    async fn unreachable_api_is_a_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        let gw = gateway(&format!("http://{addr}"));
        gw.set_token(Some("abc".to_string()));
        let err = gw.host_metrics().await.expect_err("refused");
        assert!(matches!(err, GatewayError::Transport(_)), "{err:?}");
    }
}
