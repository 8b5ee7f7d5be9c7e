//! Service handles for stage resources.
//!
//! * [`ExternalService`]: an instance someone else runs; acquiring and
//!   releasing it does nothing.
//! * [`ContainerService`]: a Docker container started for one stage call
//!   and force-removed afterwards. Driven through the `docker` CLI so no
//!   daemon client library is needed.

use crate::error::{BoxError, ServiceError};
use crate::pipeline::resource::ServiceHandle;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Polling interval while waiting for a container to answer.
const READY_POLL: Duration = Duration::from_millis(500);

/// A service managed outside this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalService {
    name: String,
    base_url: String,
}

impl ExternalService {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ServiceHandle for ExternalService {
    fn name(&self) -> &str {
        &self.name
    }

    fn base_url(&self) -> Option<String> {
        Some(self.base_url.clone())
    }

    async fn release(&mut self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// How to run a containerised service.
///
/// ```rust
/// use mobibot_pipeline::ServiceConfig;
/// use std::time::Duration;
///
/// let ollama = ServiceConfig::new("ollama", "ollama/ollama:latest", 11434)
///     .host_port(11434)
///     .gpu(true)
///     .volume("/srv/ollama", "/root/.ollama")
///     .ping_path("/api/tags")
///     .startup_timeout(Duration::from_secs(60));
/// assert_eq!(ollama.name, "ollama");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Resource name; also the key the address is published under.
    pub name: String,
    pub image: String,
    pub container_port: u16,
    /// Preferred host port. When busy (or `None`) Docker picks one.
    pub host_port: Option<u16>,
    /// Pass every GPU through (`--gpus=all`).
    pub gpu: bool,
    /// `(host path, container path)` bind mounts.
    pub volumes: Vec<(String, String)>,
    pub env: Vec<(String, String)>,
    /// HTTP path polled until the service answers. Without one, the
    /// service is given `grace_period` to come up.
    pub ping_path: Option<String>,
    pub startup_timeout: Duration,
    pub grace_period: Duration,
    /// Directory holding a `Dockerfile` to build `image` from when it is
    /// not present locally.
    pub build_context: Option<PathBuf>,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>, image: impl Into<String>, container_port: u16) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            container_port,
            host_port: None,
            gpu: false,
            volumes: Vec::new(),
            env: Vec::new(),
            ping_path: None,
            startup_timeout: Duration::from_secs(120),
            grace_period: Duration::from_secs(2),
            build_context: None,
        }
    }

    pub fn host_port(mut self, port: u16) -> Self {
        self.host_port = Some(port);
        self
    }

    pub fn gpu(mut self, gpu: bool) -> Self {
        self.gpu = gpu;
        self
    }

    pub fn volume(mut self, host: impl Into<String>, container: impl Into<String>) -> Self {
        self.volumes.push((host.into(), container.into()));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn ping_path(mut self, path: impl Into<String>) -> Self {
        self.ping_path = Some(path.into());
        self
    }

    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn build_context(mut self, dir: impl Into<PathBuf>) -> Self {
        self.build_context = Some(dir.into());
        self
    }

    /// A fresh container name, unique per `docker run` attempt.
    fn container_name(&self) -> String {
        let service: String = self
            .name
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '.' | '-' => c,
                _ => '-',
            })
            .collect();
        format!("mobibot-{service}-{}", Uuid::new_v4())
    }

    /// Arguments for `docker run`, publishing to `host_port` or to an
    /// ephemeral port when `None`.
    fn run_args(&self, container_name: &str, host_port: Option<u16>) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            container_name.to_string(),
            "-p".to_string(),
        ];
        args.push(match host_port {
            Some(host) => format!("{host}:{}", self.container_port),
            None => self.container_port.to_string(),
        });
        if self.gpu {
            args.push("--gpus=all".into());
        }
        for (host, container) in &self.volumes {
            args.push("-v".into());
            args.push(format!("{host}:{container}"));
        }
        for (key, value) in &self.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        args.push(self.image.clone());
        args
    }
}

/// A running container owned by one stage call.
#[derive(Debug)]
pub struct ContainerService {
    name: String,
    container_id: String,
    host_port: u16,
    released: bool,
}

impl ContainerService {
    /// Build the image if needed, start the container and wait until it
    /// is ready. The container is removed again if any step after `run`
    /// fails.
    pub async fn start(config: &ServiceConfig) -> Result<Self, ServiceError> {
        ensure_image(config).await?;

        let container_id = match run_container(config, config.host_port).await {
            Ok(id) => id,
            Err(e) if config.host_port.is_some() => {
                warn!("Service '{}': preferred port busy, using an ephemeral one: {}", config.name, e);
                run_container(config, None).await?
            }
            Err(e) => return Err(e),
        };
        debug!("Service '{}' container {} started", config.name, short_id(&container_id));

        let mut service = Self {
            name: config.name.clone(),
            container_id,
            host_port: 0,
            released: false,
        };
        match service.finish_startup(config).await {
            Ok(()) => {
                info!("Service '{}' ready on port {}", service.name, service.host_port);
                Ok(service)
            }
            Err(e) => {
                if let Err(rm) = service.remove().await {
                    warn!("Service '{}': cleanup after failed start: {}", service.name, rm);
                }
                Err(e)
            }
        }
    }

    async fn finish_startup(&mut self, config: &ServiceConfig) -> Result<(), ServiceError> {
        let mapping = docker(
            &self.name,
            vec![
                "port".into(),
                self.container_id.clone(),
                format!("{}/tcp", config.container_port),
            ],
        )
        .await?;
        self.host_port = parse_port_mapping(&mapping).ok_or(ServiceError::PortUnavailable {
            service: self.name.clone(),
            port: config.container_port,
        })?;

        match &config.ping_path {
            Some(path) => wait_ready(&self.name, &self.url(path), config.startup_timeout).await,
            None => {
                sleep(config.grace_period).await;
                Ok(())
            }
        }
    }

    pub fn host_port(&self) -> u16 {
        self.host_port
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    fn url(&self, path: &str) -> String {
        format!("http://localhost:{}{}", self.host_port, path)
    }

    async fn remove(&mut self) -> Result<(), ServiceError> {
        if self.released {
            return Ok(());
        }
        docker(
            &self.name,
            vec!["rm".into(), "-f".into(), self.container_id.clone()],
        )
        .await?;
        self.released = true;
        debug!("Service '{}' container {} removed", self.name, short_id(&self.container_id));
        Ok(())
    }
}

#[async_trait]
impl ServiceHandle for ContainerService {
    fn name(&self) -> &str {
        &self.name
    }

    fn base_url(&self) -> Option<String> {
        Some(self.url(""))
    }

    async fn release(&mut self) -> Result<(), BoxError> {
        self.remove().await.map_err(Into::into)
    }
}

/// `docker run` under a fresh name. A failed run can still leave the
/// container behind in `Created`, so it is force-removed by name.
async fn run_container(
    config: &ServiceConfig,
    host_port: Option<u16>,
) -> Result<String, ServiceError> {
    let name = config.container_name();
    match docker(&config.name, config.run_args(&name, host_port)).await {
        Ok(id) => Ok(id),
        Err(e) => {
            if let Err(rm) = docker(&config.name, vec!["rm".into(), "-f".into(), name]).await {
                debug!("Service '{}': nothing to clean up after failed run: {}", config.name, rm);
            }
            Err(e)
        }
    }
}

async fn ensure_image(config: &ServiceConfig) -> Result<(), ServiceError> {
    let inspect = vec!["image".into(), "inspect".into(), config.image.clone()];
    if docker(&config.name, inspect).await.is_ok() {
        return Ok(());
    }
    let Some(context) = &config.build_context else {
        // `docker run` pulls it.
        return Ok(());
    };
    info!("Building image {} from {}", config.image, context.display());
    let context = context.display().to_string();
    let dockerfile = format!("{context}/Dockerfile");
    let output = Command::new("docker")
        .args(["build", "-f", dockerfile.as_str(), "-t", config.image.as_str(), context.as_str()])
        .env("DOCKER_BUILDKIT", "1")
        .output()
        .await
        .map_err(|source| ServiceError::DockerUnavailable {
            service: config.name.clone(),
            source,
        })?;
    if !output.status.success() {
        return Err(ServiceError::CommandFailed {
            service: config.name.clone(),
            command: format!("docker build -t {} {}", config.image, context),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

/// Run `docker <args>` and return its trimmed stdout.
async fn docker(service: &str, args: Vec<String>) -> Result<String, ServiceError> {
    let output = Command::new("docker")
        .args(&args)
        .output()
        .await
        .map_err(|source| ServiceError::DockerUnavailable {
            service: service.to_string(),
            source,
        })?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(ServiceError::CommandFailed {
            service: service.to_string(),
            command: format!("docker {}", args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

async fn wait_ready(service: &str, url: &str, timeout: Duration) -> Result<(), ServiceError> {
    let not_ready = || ServiceError::NotReady {
        service: service.to_string(),
        url: url.to_string(),
        secs: timeout.as_secs(),
    };
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .map_err(|_| not_ready())?;
    let deadline = Instant::now() + timeout;
    loop {
        match client.get(url).send().await {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            Ok(resp) => debug!("Service '{}' answered {} while starting", service, resp.status()),
            Err(e) => debug!("Service '{}' not answering yet: {}", service, e),
        }
        if Instant::now() >= deadline {
            return Err(not_ready());
        }
        sleep(READY_POLL).await;
    }
}

/// Host port from `docker port` output such as `0.0.0.0:49153`.
fn parse_port_mapping(output: &str) -> Option<u16> {
    output
        .lines()
        .filter_map(|line| line.trim().rsplit_once(':'))
        .find_map(|(_, port)| port.parse().ok())
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
