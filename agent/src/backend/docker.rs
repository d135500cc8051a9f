//! Docker backend over the Engine API (local socket or named pipe).

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::models::{
    ContainerCreateBody, ContainerSummary, HostConfig, PortBinding, RestartPolicy,
    RestartPolicyNameEnum,
};
use bollard::query_parameters::{
    AttachContainerOptionsBuilder, CreateContainerOptionsBuilder, CreateImageOptionsBuilder,
    ListContainersOptionsBuilder, LogsOptionsBuilder, RemoveContainerOptionsBuilder,
    StartContainerOptions, StopContainerOptionsBuilder,
};
use bollard::Docker;
use futures_util::{Stream, StreamExt, TryStreamExt};
use perssh_protocol::{
    ContainerInfo, ContainerStatus, CreateEnvPayload, EnvironmentType, FEATURE_AIKAR_FLAGS,
};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::{Backend, BackendError, MANAGED_LABEL, TYPE_LABEL};

/// Length of the short container id shown in listings.
const SHORT_ID_LEN: usize = 12;

/// Seconds a container gets to exit before it is killed on stop.
const STOP_TIMEOUT_SECS: i32 = 10;

/// Concatenate log frames. Frames arrive in the order the instance wrote
/// them, whichever stream they came from.
async fn collect_output<S>(id: &str, frames: S) -> Result<String, BackendError>
where
    S: Stream<Item = Result<LogOutput, BollardError>>,
{
    let mut frames = std::pin::pin!(frames);
    let mut text = String::new();
    while let Some(frame) = frames.next().await {
        let frame = frame.map_err(|e| classify(Some(id), e))?;
        text.push_str(&String::from_utf8_lossy(&frame.into_bytes()));
    }
    Ok(text)
}

/// Map an Engine API error onto the backend error vocabulary.
fn classify(id: Option<&str>, error: BollardError) -> BackendError {
    match error {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => BackendError::NotFound(id.map(str::to_string).unwrap_or(message)),
        BollardError::DockerResponseServerError { message, .. } => {
            BackendError::CommandFailed(message)
        }
        BollardError::IOError { err } => BackendError::Io(err),
        other => BackendError::Unavailable(other.to_string()),
    }
}

fn into_info(summary: ContainerSummary) -> ContainerInfo {
    let id = summary
        .id
        .unwrap_or_default()
        .chars()
        .take(SHORT_ID_LEN)
        .collect();
    let name = summary
        .names
        .and_then(|names| names.into_iter().next())
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_default();
    let state = summary
        .state
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_default();

    ContainerInfo {
        id,
        name,
        image: summary.image.unwrap_or_default(),
        status: ContainerStatus::from_state(&state),
        created: summary.created.unwrap_or_default(),
        labels: summary.labels.unwrap_or_default().into_iter().collect(),
    }
}

/// Environment variables for a new instance: the caller's map plus the
/// variables the game-server image reads its configuration from.
pub fn container_env(payload: &CreateEnvPayload) -> BTreeMap<String, String> {
    let mut env = payload.env_vars.clone();

    if payload.kind == EnvironmentType::Minecraft {
        if let Some(mc) = &payload.minecraft {
            if mc.eula == Some(true) {
                env.insert("EULA".to_string(), "TRUE".to_string());
            }
            let mut set = |key: &str, value: &Option<String>| {
                if let Some(v) = value.as_deref().filter(|v| !v.is_empty()) {
                    env.insert(key.to_string(), v.to_string());
                }
            };
            set("TYPE", &mc.server_type);
            set("VERSION", &mc.version);
            set("MOTD", &mc.motd);
            set("MODPACK", &mc.modpack);
            if !mc.op_users.is_empty() {
                env.insert("OPS".to_string(), mc.op_users.join(","));
            }
            if !mc.plugins.is_empty() {
                env.insert("PLUGINS".to_string(), mc.plugins.join(","));
            }
            if mc.has_feature(FEATURE_AIKAR_FLAGS) {
                env.insert("USE_AIKAR_FLAGS".to_string(), "true".to_string());
            }
        }
    }

    env
}

/// `[ip:]host:container[/proto]` or `container[/proto]` → (`"80/tcp"`, binding).
fn parse_port_spec(spec: &str) -> Option<(String, PortBinding)> {
    let (ports, proto) = spec.split_once('/').unwrap_or((spec, "tcp"));
    let parts: Vec<&str> = ports.split(':').collect();
    let (host_ip, host_port, container) = match parts.as_slice() {
        [container] => (None, None, *container),
        [host, container] => (None, Some(*host), *container),
        [ip, host, container] => (Some(*ip), Some(*host), *container),
        _ => return None,
    };
    container.parse::<u16>().ok()?;
    if let Some(host) = host_port.filter(|h| !h.is_empty()) {
        host.parse::<u16>().ok()?;
    }
    Some((
        format!("{}/{}", container, proto),
        PortBinding {
            host_ip: host_ip.filter(|ip| !ip.is_empty()).map(str::to_string),
            host_port: host_port.filter(|h| !h.is_empty()).map(str::to_string),
        },
    ))
}

/// `"512m"`, `"2g"`, `"1048576"` → bytes.
fn parse_memory(limit: &str) -> Option<i64> {
    let limit = limit.trim().to_ascii_lowercase();
    let limit = limit.strip_suffix('b').unwrap_or(&limit);
    let (digits, unit) = match limit.char_indices().last()? {
        (i, c) if c.is_ascii_alphabetic() => (&limit[..i], c),
        _ => (limit, 'b'),
    };
    let multiplier: i64 = match unit {
        'b' => 1,
        'k' => 1 << 10,
        'm' => 1 << 20,
        'g' => 1 << 30,
        _ => return None,
    };
    digits.parse::<i64>().ok()?.checked_mul(multiplier)
}

/// Container definition for a creation request.
fn create_body(payload: &CreateEnvPayload) -> ContainerCreateBody {
    let env = container_env(payload)
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    let labels = HashMap::from([
        (MANAGED_LABEL.to_string(), "true".to_string()),
        (TYPE_LABEL.to_string(), payload.kind.to_string()),
    ]);

    let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
    for spec in &payload.ports {
        match parse_port_spec(spec) {
            Some((key, binding)) => port_bindings
                .entry(key)
                .or_insert_with(|| Some(Vec::new()))
                .get_or_insert_with(Vec::new)
                .push(binding),
            None => warn!("[docker] Ignoring invalid port spec {:?}", spec),
        }
    }

    let memory = payload.ram_limit.as_deref().and_then(|limit| {
        let bytes = parse_memory(limit);
        if bytes.is_none() {
            warn!("[docker] Ignoring invalid memory limit {:?}", limit);
        }
        bytes
    });

    ContainerCreateBody {
        image: Some(payload.image.clone()),
        env: Some(env),
        labels: Some(labels),
        open_stdin: Some(true),
        attach_stdin: Some(true),
        host_config: Some(HostConfig {
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            memory,
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            ..HostConfig::default()
        }),
        ..ContainerCreateBody::default()
    }
}

/// `nginx:1.25` → (`nginx`, `1.25`); a registry port is not a tag.
fn split_image(image: &str) -> (&str, &str) {
    match image.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => (name, tag),
        _ => (image, "latest"),
    }
}

pub struct DockerBackend {
    docker: Docker,
}

impl DockerBackend {
    /// Client for the local daemon. Nothing is contacted until the first call.
    pub fn connect() -> Result<Self, BackendError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        Ok(Self { docker })
    }

    /// Pull `image`. Failures are logged; `create` reports a missing image.
    async fn pull(&self, image: &str) {
        if self.docker.inspect_image(image).await.is_ok() {
            return;
        }
        let (from_image, tag) = split_image(image);
        let pulled = self
            .docker
            .create_image(
                Some(
                    CreateImageOptionsBuilder::new()
                        .from_image(from_image)
                        .tag(tag)
                        .build(),
                ),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await;
        match pulled {
            Ok(_) => debug!("[docker] Pulled {}", image),
            Err(e) => warn!("[docker] Pull of {} failed: {}", image, e),
        }
    }
}

#[async_trait]
impl Backend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn is_running(&self) -> bool {
        match self.docker.ping().await {
            Ok(_) => true,
            Err(e) => {
                debug!("[docker] Liveness ping failed: {}", e);
                false
            }
        }
    }

    async fn list(&self) -> Result<Vec<ContainerInfo>, BackendError> {
        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptionsBuilder::new().all(true).build()))
            .await
            .map_err(|e| classify(None, e))?;
        Ok(summaries.into_iter().map(into_info).collect())
    }

    async fn create(&self, payload: &CreateEnvPayload) -> Result<String, BackendError> {
        self.pull(&payload.image).await;

        let mut options = CreateContainerOptionsBuilder::new();
        if !payload.name.is_empty() {
            options = options.name(&payload.name);
        }
        let created = self
            .docker
            .create_container(Some(options.build()), create_body(payload))
            .await
            .map_err(|e| classify(None, e))?;
        for warning in &created.warnings {
            warn!("[docker] {}", warning);
        }
        Ok(created.id)
    }

    async fn start(&self, id: &str) -> Result<(), BackendError> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await
            .map_err(|e| classify(Some(id), e))
    }

    async fn stop(&self, id: &str) -> Result<(), BackendError> {
        self.docker
            .stop_container(
                id,
                Some(StopContainerOptionsBuilder::new().t(STOP_TIMEOUT_SECS).build()),
            )
            .await
            .map_err(|e| classify(Some(id), e))
    }

    async fn remove(&self, id: &str) -> Result<(), BackendError> {
        self.docker
            .remove_container(id, Some(RemoveContainerOptionsBuilder::new().force(true).build()))
            .await
            .map_err(|e| classify(Some(id), e))
    }

    async fn logs(&self, id: &str, tail: usize) -> Result<String, BackendError> {
        let tail = tail.to_string();
        let options = LogsOptionsBuilder::new()
            .stdout(true)
            .stderr(true)
            .tail(&tail)
            .build();

        collect_output(id, self.docker.logs(id, Some(options))).await
    }

    async fn send_input(&self, id: &str, data: &str) -> Result<(), BackendError> {
        let options = AttachContainerOptionsBuilder::new()
            .stream(true)
            .stdin(true)
            .build();
        let mut attached = self
            .docker
            .attach_container(id, Some(options))
            .await
            .map_err(|e| classify(Some(id), e))?;

        attached
            .input
            .write_all(format!("{}\n", data).as_bytes())
            .await?;
        attached.input.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perssh_protocol::MinecraftConfig;
    use serde_json::json;

    fn summary(value: serde_json::Value) -> ContainerSummary {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_summary_into_info() {
        let info = into_info(summary(json!({
            "Id": "0123456789abcdef0123",
            "Names": ["/survival"],
            "Image": "itzg/minecraft-server",
            "State": "running",
            "Created": 1709294400,
            "Labels": {
                "perssh.managed": "true",
                "perssh.type": "MINECRAFT",
                "traefik.http.routers.web.entrypoints": "web,websecure"
            }
        })));

        assert_eq!(info.id, "0123456789ab");
        assert_eq!(info.name, "survival");
        assert_eq!(info.status, ContainerStatus::Running);
        assert_eq!(info.created, 1709294400);
        assert_eq!(info.labels[TYPE_LABEL], "MINECRAFT");
        assert_eq!(
            info.labels["traefik.http.routers.web.entrypoints"],
            "web,websecure"
        );
    }

    #[test]
    fn test_sparse_summary() {
        let info = into_info(summary(json!({"Id": "abc"})));
        assert_eq!(info.id, "abc");
        assert_eq!(info.name, "");
        assert_eq!(info.status, ContainerStatus::Unknown);
        assert!(info.labels.is_empty());
    }

    #[test]
    fn test_minecraft_env_mapping() {
        let mut payload = CreateEnvPayload {
            kind: EnvironmentType::Minecraft,
            minecraft: Some(MinecraftConfig {
                op_users: vec!["alex".to_string(), "steve".to_string()],
                ..Default::default()
            }),
            ..Default::default()
        };
        payload.env_vars.insert("TZ".to_string(), "UTC".to_string());
        payload.apply_template_defaults();

        let env = container_env(&payload);
        assert_eq!(env["EULA"], "TRUE");
        assert_eq!(env["TYPE"], "VANILLA");
        assert_eq!(env["VERSION"], "latest");
        assert_eq!(env["OPS"], "alex,steve");
        assert_eq!(env["USE_AIKAR_FLAGS"], "true");
        assert_eq!(env["TZ"], "UTC");
        assert!(!env.contains_key("MODPACK"));
    }

    #[test]
    fn test_standard_env_untouched() {
        let mut payload = CreateEnvPayload::default();
        payload.env_vars.insert("A".to_string(), "1".to_string());
        let env = container_env(&payload);
        assert_eq!(env.len(), 1);
    }

    #[test]
    fn test_port_specs() {
        let (key, binding) = parse_port_spec("8080:80").unwrap();
        assert_eq!(key, "80/tcp");
        assert_eq!(binding.host_port.as_deref(), Some("8080"));
        assert_eq!(binding.host_ip, None);

        let (key, binding) = parse_port_spec("127.0.0.1:19132:19132/udp").unwrap();
        assert_eq!(key, "19132/udp");
        assert_eq!(binding.host_ip.as_deref(), Some("127.0.0.1"));

        let (key, binding) = parse_port_spec("25565").unwrap();
        assert_eq!(key, "25565/tcp");
        assert_eq!(binding.host_port, None);

        assert!(parse_port_spec("web:80").is_none());
        assert!(parse_port_spec("1:2:3:4").is_none());
    }

    #[test]
    fn test_memory_limits() {
        assert_eq!(parse_memory("512m"), Some(512 << 20));
        assert_eq!(parse_memory("2G"), Some(2 << 30));
        assert_eq!(parse_memory("2gb"), Some(2 << 30));
        assert_eq!(parse_memory("1048576"), Some(1048576));
        assert_eq!(parse_memory("lots"), None);
        assert_eq!(parse_memory(""), None);
    }

    #[test]
    fn test_create_body() {
        let payload = CreateEnvPayload {
            name: "web".to_string(),
            image: "nginx".to_string(),
            ports: vec!["8080:80".to_string(), "bogus:port".to_string()],
            ram_limit: Some("512m".to_string()),
            ..Default::default()
        };
        let body = create_body(&payload);
        assert_eq!(body.image.as_deref(), Some("nginx"));
        assert_eq!(body.open_stdin, Some(true));

        let labels = body.labels.unwrap();
        assert_eq!(labels[MANAGED_LABEL], "true");
        assert_eq!(labels[TYPE_LABEL], "STANDARD");

        let host = body.host_config.unwrap();
        assert_eq!(host.memory, Some(512 << 20));
        let bindings = host.port_bindings.unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(
            bindings["80/tcp"].as_ref().unwrap()[0].host_port.as_deref(),
            Some("8080")
        );
        assert_eq!(
            host.restart_policy.unwrap().name,
            Some(RestartPolicyNameEnum::UNLESS_STOPPED)
        );
    }

    #[test]
    fn test_split_image() {
        assert_eq!(split_image("nginx:1.25"), ("nginx", "1.25"));
        assert_eq!(split_image("itzg/minecraft-server"), ("itzg/minecraft-server", "latest"));
        assert_eq!(
            split_image("registry:5000/team/app"),
            ("registry:5000/team/app", "latest")
        );
    }

    #[tokio::test]
    async fn test_log_frames_keep_write_order() {
        let frames = futures_util::stream::iter(vec![
            Ok(LogOutput::StdOut { message: "starting\n".into() }),
            Ok(LogOutput::StdErr { message: "warn: low memory\n".into() }),
            Ok(LogOutput::StdOut { message: "ready\n".into() }),
        ]);
        let text = collect_output("abc", frames).await.unwrap();
        assert_eq!(text, "starting\nwarn: low memory\nready\n");
    }

    #[tokio::test]
    async fn test_log_stream_error_is_classified() {
        let frames = futures_util::stream::iter(vec![
            Ok(LogOutput::StdOut { message: "partial\n".into() }),
            Err(BollardError::DockerResponseServerError {
                status_code: 404,
                message: "No such container: abc".into(),
            }),
        ]);
        let err = collect_output("abc", frames).await.unwrap_err();
        assert!(matches!(err, BackendError::NotFound(id) if id == "abc"));
    }

    #[test]
    fn test_classify_errors() {
        let not_found = BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such container: abc".to_string(),
        };
        assert!(matches!(
            classify(Some("abc"), not_found),
            BackendError::NotFound(id) if id == "abc"
        ));

        let conflict = BollardError::DockerResponseServerError {
            status_code: 409,
            message: "container is not running".to_string(),
        };
        assert_eq!(
            classify(Some("abc"), conflict).to_string(),
            "container is not running"
        );
    }
}
