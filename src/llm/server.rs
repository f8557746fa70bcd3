//! Local inference-server subprocess management (vLLM).
//!
//! The server is a scoped resource: it is spawned during orchestrator
//! construction, owned exclusively by the orchestrator that started it, and
//! terminated by an explicit shutdown or by `Drop`, so the child process
//! cannot outlive its owner. Readiness is established by polling the
//! server's `/models` route rather than sleeping a fixed interval.

use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Configuration for the locally spawned inference server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server executable (resolved via PATH)
    pub binary: String,
    /// Model to serve
    pub model: String,
    /// Port the server listens on
    pub port: u16,
    /// Deadline for the readiness poll, in seconds
    pub startup_timeout_secs: u64,
    /// Interval between readiness probes, in milliseconds
    pub poll_interval_ms: u64,
}

impl ServerConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            binary: "vllm".to_string(),
            model: model.into(),
            port: 8000,
            startup_timeout_secs: 20,
            poll_interval_ms: 500,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_startup_timeout(mut self, secs: u64) -> Self {
        self.startup_timeout_secs = secs;
        self
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Base URL of the server's OpenAI-compatible API.
    pub fn base_url(&self) -> String {
        format!("http://localhost:{}/v1", self.port)
    }
}

/// Lifecycle state of an owned server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Running,
    Terminated,
}

/// Handle to a running inference-server subprocess.
pub struct InferenceServer {
    child: Child,
    pid: u32,
    model: String,
    base_url: String,
    state: ServerState,
}

impl InferenceServer {
    /// Spawn the server and block until it answers readiness probes.
    pub async fn start(config: &ServerConfig) -> Result<Self> {
        let binary = which::which(&config.binary).map_err(|e| {
            Error::server(format!(
                "inference server binary '{}' not found: {e}",
                config.binary
            ))
        })?;

        let mut cmd = Command::new(binary);
        cmd.arg("serve")
            .arg(&config.model)
            .arg("--port")
            .arg(config.port.to_string());
        // The server logs heavily; piped stdio with nobody draining it
        // would fill the pipe buffer and stall the child.
        cmd.stdout(Stdio::null()).stderr(Stdio::null());

        let mut child = cmd.spawn().map_err(|e| {
            Error::server(format!(
                "failed to spawn '{}' for model '{}': {e}",
                config.binary, config.model
            ))
        })?;
        let pid = child.id();
        let base_url = config.base_url();

        tracing::info!(model = %config.model, pid, "inference server starting");

        if let Err(err) = wait_until_ready(&mut child, &base_url, config).await {
            // Don't leak a half-started server
            let _ = child.kill();
            let _ = child.wait();
            return Err(err);
        }

        tracing::info!(model = %config.model, pid, "inference server ready");

        Ok(Self {
            child,
            pid,
            model: config.model.clone(),
            base_url,
            state: ServerState::Running,
        })
    }

    /// Process id of the server.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Model the server was started for.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Base URL of the server's API.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Check if the subprocess is still running.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Terminate the server process and reap it.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.state == ServerState::Terminated {
            return Ok(());
        }

        self.child.kill().map_err(|e| {
            Error::server(format!(
                "failed to terminate inference server (pid {}): {e}",
                self.pid
            ))
        })?;
        self.child.wait().map_err(|e| {
            Error::server(format!(
                "failed to reap inference server (pid {}): {e}",
                self.pid
            ))
        })?;

        self.state = ServerState::Terminated;
        tracing::info!(model = %self.model, pid = self.pid, "inference server terminated");
        Ok(())
    }
}

impl Drop for InferenceServer {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Poll the server's `/models` route until it responds or the startup
/// deadline passes. A child that exits mid-startup fails immediately.
async fn wait_until_ready(child: &mut Child, base_url: &str, config: &ServerConfig) -> Result<()> {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .unwrap_or_default();
    let models_url = format!("{base_url}/models");
    let deadline = Instant::now() + Duration::from_secs(config.startup_timeout_secs);

    loop {
        if let Ok(Some(status)) = child.try_wait() {
            return Err(Error::server(format!(
                "inference server exited during startup: {status}"
            )));
        }

        if let Ok(response) = http.get(&models_url).send().await {
            if response.status().is_success() {
                return Ok(());
            }
        }

        if Instant::now() >= deadline {
            return Err(Error::timeout(config.startup_timeout_secs * 1000));
        }

        tokio::time::sleep(Duration::from_millis(config.poll_interval_ms)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_defaults() {
        let config = ServerConfig::new("meta-llama/Llama-3.1-8B-Instruct");
        assert_eq!(config.binary, "vllm");
        assert_eq!(config.port, 8000);
        assert_eq!(config.startup_timeout_secs, 20);
        assert_eq!(config.base_url(), "http://localhost:8000/v1");
    }

    #[test]
    fn test_server_config_builders() {
        let config = ServerConfig::new("m")
            .with_binary("/opt/vllm/bin/vllm")
            .with_port(8801)
            .with_startup_timeout(120)
            .with_poll_interval(250);
        assert_eq!(config.base_url(), "http://localhost:8801/v1");
        assert_eq!(config.startup_timeout_secs, 120);
        assert_eq!(config.poll_interval_ms, 250);
    }

    #[tokio::test]
    async fn test_start_error_names_missing_binary() {
        let config = ServerConfig::new("some-model").with_binary("definitely-missing-vllm-binary");

        let err = match InferenceServer::start(&config).await {
            Ok(_) => panic!("start should fail when the binary is missing"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("definitely-missing-vllm-binary"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_readiness_poll_times_out_without_listener() {
        let config = ServerConfig::new("m")
            .with_port(59993)
            .with_startup_timeout(1)
            .with_poll_interval(50);

        let mut child = Command::new("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();

        let err = wait_until_ready(&mut child, &config.base_url(), &config)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { duration_ms: 1000 }));

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_readiness_poll_detects_exited_child() {
        let config = ServerConfig::new("m")
            .with_port(59994)
            .with_startup_timeout(5)
            .with_poll_interval(50);

        let mut child = Command::new("true")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();
        // Give the child time to exit before the first probe
        std::thread::sleep(Duration::from_millis(100));

        let err = wait_until_ready(&mut child, &config.base_url(), &config)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited during startup"));
    }

    #[tokio::test]
    #[ignore = "requires a vllm installation and a small model"]
    async fn test_server_lifecycle() {
        let config = ServerConfig::new("facebook/opt-125m").with_startup_timeout(300);

        let mut server = InferenceServer::start(&config).await.unwrap();
        assert!(server.is_alive());
        assert_eq!(server.state(), ServerState::Running);

        server.shutdown().unwrap();
        assert_eq!(server.state(), ServerState::Terminated);
        assert!(!server.is_alive());
    }
}
