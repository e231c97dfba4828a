use crate::config::Globals;
use crate::error::{ConfigError, ScenarioError};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens connections to the system under test.
#[derive(Debug, Clone)]
pub struct RequestExecutor {
    base: Url,
}

impl RequestExecutor {
    pub fn new(globals: &Globals) -> Result<Self, ConfigError> {
        let protocol = if globals.use_ssl { "wss" } else { "ws" };
        let base = Url::parse(&format!(
            "{}://{}:{}/",
            protocol, globals.host, globals.port
        ))?;
        Ok(Self { base })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Resolves `path` against the target, e.g. `"/echo"` or `"app/key"`.
    pub fn url(&self, path: &str) -> Result<Url, ScenarioError> {
        self.base
            .join(path)
            .map_err(|e| ScenarioError::Connection {
                url: format!("{}{}", self.base, path),
                reason: e.to_string(),
            })
    }

    /// Connects a WebSocket to `path` and reports how long the handshake took.
    pub async fn websocket(&self, path: &str) -> Result<(WsStream, Duration), ScenarioError> {
        let url = self.url(path)?;
        debug!("Connecting to {}", url);

        let started = Instant::now();
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| ScenarioError::Connection {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        Ok((stream, started.elapsed()))
    }
}
