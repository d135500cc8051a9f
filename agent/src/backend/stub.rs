//! In-memory backend used when no container runtime is reachable.

use std::collections::{BTreeMap, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use perssh_protocol::{ContainerInfo, ContainerStatus, CreateEnvPayload};

use super::{Backend, BackendError, MANAGED_LABEL, TYPE_LABEL};

/// Output lines kept per instance.
const MAX_LOG_LINES: usize = 1000;

struct StubInstance {
    info: ContainerInfo,
    output: VecDeque<String>,
}

impl StubInstance {
    fn log(&mut self, line: String) {
        if self.output.len() == MAX_LOG_LINES {
            self.output.pop_front();
        }
        self.output.push_back(line);
    }
}

/// Synthetic backend: instances exist only in this process.
pub struct StubBackend {
    instances: Mutex<BTreeMap<String, StubInstance>>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            instances: Mutex::new(BTreeMap::new()),
        }
    }

    fn with_instance<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut StubInstance) -> T,
    ) -> Result<T, BackendError> {
        let mut instances = self.instances.lock();
        instances
            .get_mut(id)
            .map(f)
            .ok_or_else(|| BackendError::NotFound(id.to_string()))
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn is_running(&self) -> bool {
        true
    }

    async fn list(&self) -> Result<Vec<ContainerInfo>, BackendError> {
        Ok(self
            .instances
            .lock()
            .values()
            .map(|i| i.info.clone())
            .collect())
    }

    async fn create(&self, payload: &CreateEnvPayload) -> Result<String, BackendError> {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("mock-{}", &uuid[..12]);

        let mut labels = BTreeMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert(TYPE_LABEL.to_string(), payload.kind.to_string());

        let mut instance = StubInstance {
            info: ContainerInfo {
                id: id.clone(),
                name: payload.name.clone(),
                image: payload.image.clone(),
                status: ContainerStatus::Created,
                created: Utc::now().timestamp(),
                labels,
            },
            output: VecDeque::new(),
        };
        instance.log(format!("Created from {}", payload.image));

        self.instances.lock().insert(id.clone(), instance);
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), BackendError> {
        self.with_instance(id, |i| {
            i.info.status = ContainerStatus::Running;
            i.log("Started".to_string());
        })
    }

    async fn stop(&self, id: &str) -> Result<(), BackendError> {
        self.with_instance(id, |i| {
            i.info.status = ContainerStatus::Exited;
            i.log("Stopped".to_string());
        })
    }

    async fn remove(&self, id: &str) -> Result<(), BackendError> {
        self.instances
            .lock()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| BackendError::NotFound(id.to_string()))
    }

    async fn logs(&self, id: &str, tail: usize) -> Result<String, BackendError> {
        self.with_instance(id, |i| {
            let skip = i.output.len().saturating_sub(tail);
            let lines: Vec<&str> = i.output.iter().skip(skip).map(String::as_str).collect();
            format!("Mock Logs for {}\n{}", id, lines.join("\n"))
        })
    }

    async fn send_input(&self, id: &str, data: &str) -> Result<(), BackendError> {
        self.with_instance(id, |i| {
            if !i.info.status.is_running() {
                return Err(BackendError::CommandFailed(format!(
                    "container {} is not running",
                    id
                )));
            }
            i.log(format!("> {}", data));
            Ok(())
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perssh_protocol::EnvironmentType;

    fn payload(name: &str) -> CreateEnvPayload {
        CreateEnvPayload {
            name: name.to_string(),
            kind: EnvironmentType::Standard,
            image: "nginx:latest".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let backend = StubBackend::new();
        let id = backend.create(&payload("web")).await.unwrap();
        assert!(id.starts_with("mock-"));

        let list = backend.list().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].status, ContainerStatus::Created);
        assert_eq!(list[0].labels.get(TYPE_LABEL).map(String::as_str), Some("STANDARD"));

        backend.start(&id).await.unwrap();
        backend.send_input(&id, "hello").await.unwrap();
        let logs = backend.logs(&id, 10).await.unwrap();
        assert!(logs.contains("> hello"));

        backend.stop(&id).await.unwrap();
        assert_eq!(backend.list().await.unwrap()[0].status, ContainerStatus::Exited);
        assert!(backend.send_input(&id, "again").await.is_err());
    }

    #[tokio::test]
    async fn test_remove_twice_fails() {
        let backend = StubBackend::new();
        let id = backend.create(&payload("tmp")).await.unwrap();
        backend.remove(&id).await.unwrap();
        assert!(matches!(
            backend.remove(&id).await,
            Err(BackendError::NotFound(_))
        ));
        assert!(backend.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_logs_tail_window() {
        let backend = StubBackend::new();
        let id = backend.create(&payload("chatty")).await.unwrap();
        backend.start(&id).await.unwrap();
        for n in 0..20 {
            backend.send_input(&id, &format!("line {}", n)).await.unwrap();
        }
        let logs = backend.logs(&id, 3).await.unwrap();
        assert!(logs.contains("> line 19"));
        assert!(logs.contains("> line 17"));
        assert!(!logs.contains("> line 16"));
    }
}
