//! SSH transport: SFTP upload plus an exec channel running the agent.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle, KeyboardInteractiveAuthResponse};
use russh::keys::{load_secret_key, HashAlg, PrivateKeyWithHashAlg, PublicKey};
use russh::{ChannelMsg, Disconnect};
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::FileAttributes;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::{AgentReader, AgentTransport, AgentWriter, ConnectTarget};
use crate::error::SessionError;

/// Timeout for short helper commands (`--version`)
const EXEC_TIMEOUT: Duration = Duration::from_secs(5);

/// Keepalive on the SSH connection while the agent is idle
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Keyboard-interactive rounds before giving up
const MAX_KBI_ROUNDS: usize = 3;

/// Run `establishing` under the target's connect timeout.
async fn within_deadline<T>(
    target: &ConnectTarget,
    establishing: impl Future<Output = Result<T, SessionError>>,
) -> Result<T, SessionError> {
    tokio::time::timeout(target.timeout, establishing)
        .await
        .map_err(|_| {
            SessionError::Network(format!(
                "Timed out connecting to {} after {:.1}s",
                target.display(),
                target.timeout.as_secs_f64()
            ))
        })?
}

struct ClientHandler {
    host: String,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        // No known_hosts store; the fingerprint is logged so it can be checked by hand
        info!(
            "[ssh-transport] Host key for {}: {}",
            self.host,
            server_public_key.fingerprint(HashAlg::Sha256)
        );
        Ok(true)
    }
}

/// Agent on a remote host, reached over SSH.
pub struct SshTransport {
    remote_path: String,
    handle: Option<Handle<ClientHandler>>,
    reader: Option<AgentReader>,
    writer: Option<AgentWriter>,
}

impl SshTransport {
    /// `remote_path` is where the agent is uploaded and run from.
    pub fn new(remote_path: impl Into<String>) -> Self {
        Self {
            remote_path: remote_path.into(),
            handle: None,
            reader: None,
            writer: None,
        }
    }

    pub fn remote_path(&self) -> &str {
        &self.remote_path
    }

    fn handle(&self) -> Result<&Handle<ClientHandler>, SessionError> {
        self.handle.as_ref().ok_or(SessionError::Closed)
    }

    /// Run a command to completion and collect its stdout.
    async fn exec_capture(&mut self, command: &str) -> Result<(Option<u32>, String), SessionError> {
        let mut channel = self.handle()?.channel_open_session().await?;
        channel.exec(true, command).await?;

        let mut stdout = Vec::new();
        let mut status = None;
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
                Some(ChannelMsg::ExitStatus { exit_status }) => status = Some(exit_status),
                Some(ChannelMsg::Close) | None => break,
                _ => {}
            }
        }
        Ok((status, String::from_utf8_lossy(&stdout).into_owned()))
    }

    async fn upload(&mut self, local_binary: &Path) -> Result<(), SessionError> {
        let data = tokio::fs::read(local_binary).await.map_err(|e| {
            SessionError::Deploy(format!("Cannot read {}: {}", local_binary.display(), e))
        })?;
        info!(
            "[ssh-transport] Uploading {} ({} bytes) to {}",
            local_binary.display(),
            data.len(),
            self.remote_path
        );

        let channel = self.handle()?.channel_open_session().await?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| SessionError::Deploy(format!("SFTP subsystem not available: {}", e)))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SessionError::Deploy(format!("SFTP init failed: {}", e)))?;

        let result = async {
            let mut file = sftp
                .create(&self.remote_path)
                .await
                .map_err(|e| SessionError::Deploy(format!("Cannot create {}: {}", self.remote_path, e)))?;
            file.write_all(&data)
                .await
                .map_err(|e| SessionError::Deploy(format!("Write failed: {}", e)))?;
            file.shutdown()
                .await
                .map_err(|e| SessionError::Deploy(format!("Write failed: {}", e)))?;

            let attrs = FileAttributes {
                permissions: Some(0o755),
                ..Default::default()
            };
            sftp.set_metadata(&self.remote_path, attrs)
                .await
                .map_err(|e| SessionError::Deploy(format!("chmod failed: {}", e)))
        }
        .await;

        if let Err(e) = sftp.close().await {
            debug!("[ssh-transport] SFTP close: {}", e);
        }
        result
    }
}

#[async_trait]
impl AgentTransport for SshTransport {
    fn kind(&self) -> &'static str {
        "ssh"
    }

    async fn connect(&mut self, target: &ConnectTarget) -> Result<(), SessionError> {
        let config = Arc::new(client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            ..Default::default()
        });
        let handler = ClientHandler {
            host: target.host.clone(),
        };

        info!("[ssh-transport] Connecting to {}", target.display());
        // One deadline covers TCP connect, handshake and every auth round
        let handle = within_deadline(target, async {
            let mut handle = client::connect(config, (target.host.as_str(), target.port), handler)
                .await
                .map_err(|e| SessionError::Network(format!("{}: {}", target.display(), e)))?;
            authenticate(&mut handle, target).await?;
            Ok(handle)
        })
        .await?;

        info!("[ssh-transport] Authenticated as {}", target.user);
        self.handle = Some(handle);
        Ok(())
    }

    async fn installed_version(&mut self) -> Option<String> {
        let command = format!("{} --version", self.remote_path);
        match tokio::time::timeout(EXEC_TIMEOUT, self.exec_capture(&command)).await {
            Ok(Ok((Some(0), output))) => Some(output.trim().to_string()),
            Ok(Ok((status, _))) => {
                debug!("[ssh-transport] Version check exited with {:?}", status);
                None
            }
            Ok(Err(e)) => {
                debug!("[ssh-transport] Version check failed: {}", e);
                None
            }
            Err(_) => {
                debug!("[ssh-transport] Version check timed out");
                None
            }
        }
    }

    async fn deploy(&mut self, local_binary: &Path) -> Result<(), SessionError> {
        self.upload(local_binary).await
    }

    async fn start(&mut self) -> Result<(), SessionError> {
        let channel = self
            .handle()?
            .channel_open_session()
            .await
            .map_err(|e| SessionError::Spawn(format!("Channel open failed: {}", e)))?;
        channel
            .exec(true, self.remote_path.as_str())
            .await
            .map_err(|e| SessionError::Spawn(format!("Failed to exec agent: {}", e)))?;

        let (reader, writer) = tokio::io::split(channel.into_stream());
        self.reader = Some(Box::new(reader));
        self.writer = Some(Box::new(writer));
        info!("[ssh-transport] Agent started: {}", self.remote_path);
        Ok(())
    }

    fn take_write_end(&mut self) -> Option<AgentWriter> {
        self.writer.take()
    }

    fn take_read_end(&mut self) -> Option<AgentReader> {
        self.reader.take()
    }

    async fn close(&mut self) {
        self.reader = None;
        self.writer = None;
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle
                .disconnect(Disconnect::ByApplication, "session closed", "en")
                .await
            {
                debug!("[ssh-transport] Disconnect: {}", e);
            }
            info!("[ssh-transport] Disconnected");
        }
    }
}

/// Key first, then password, then keyboard-interactive answering every
/// prompt with the password.
async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    target: &ConnectTarget,
) -> Result<(), SessionError> {
    let user = target.user.as_str();
    let creds = &target.credentials;

    if let Some(path) = &creds.key_path {
        match load_secret_key(path, creds.key_passphrase.as_deref()) {
            Ok(key) => {
                let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
                let result = handle
                    .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
                    .await?;
                if result.success() {
                    return Ok(());
                }
                debug!("[ssh-transport] Key {} rejected", path.display());
            }
            Err(e) => warn!("[ssh-transport] Cannot load key {}: {}", path.display(), e),
        }
    }

    if let Some(password) = &creds.password {
        if handle.authenticate_password(user, password).await?.success() {
            return Ok(());
        }
        debug!("[ssh-transport] Password rejected, trying keyboard-interactive");

        let mut response = handle
            .authenticate_keyboard_interactive_start(user, None::<String>)
            .await?;
        for _ in 0..MAX_KBI_ROUNDS {
            match response {
                KeyboardInteractiveAuthResponse::Success => return Ok(()),
                KeyboardInteractiveAuthResponse::Failure { .. } => break,
                KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                    let answers = prompts.iter().map(|_| password.clone()).collect();
                    response = handle
                        .authenticate_keyboard_interactive_respond(answers)
                        .await?;
                }
            }
        }
    }

    Err(SessionError::Auth(format!(
        "All authentication methods rejected for {}",
        target.display()
    )))
}
