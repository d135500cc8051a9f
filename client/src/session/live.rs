use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::PollingConfig;
use crate::error::SessionError;
use crate::rpc::{self, ResponseStream, RpcSender};
use crate::scheduler::PollScheduler;
use crate::transport::{AgentDeployer, AgentReader, AgentTransport, AgentWriter, ConnectTarget};

/// Everything that exists while the agent is up.
pub struct LiveSession {
    transport: Option<Box<dyn AgentTransport>>,
    sender: RpcSender,
    responses: ResponseStream<AgentReader>,
    focus: watch::Sender<Option<String>>,
    scheduler: PollScheduler,
}

impl LiveSession {
    /// Wire the RPC loop and poll timers onto an agent's stdio.
    pub fn attach(
        transport: Option<Box<dyn AgentTransport>>,
        reader: AgentReader,
        writer: AgentWriter,
        polling: &PollingConfig,
    ) -> Self {
        let (sender, responses) = rpc::attach(reader, writer);
        let (focus, focus_rx) = watch::channel(None);
        let scheduler = PollScheduler::spawn(sender.clone(), polling, focus_rx);
        Self {
            transport,
            sender,
            responses,
            focus,
            scheduler,
        }
    }

    pub fn sender(&self) -> &RpcSender {
        &self.sender
    }

    pub fn responses(&mut self) -> &mut ResponseStream<AgentReader> {
        &mut self.responses
    }

    /// Point the log poller at an instance, or stop it with `None`.
    pub fn focus(&self, target: Option<String>) {
        self.focus.send_replace(target);
    }

    /// Stop polling and release the transport.
    pub async fn close(mut self) {
        self.scheduler.stop();
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
    }
}

/// Connect, deploy if needed, start the agent and attach to it. The
/// transport is closed again on any failure.
pub async fn establish(
    mut transport: Box<dyn AgentTransport>,
    target: &ConnectTarget,
    deployer: &AgentDeployer,
    polling: &PollingConfig,
) -> Result<LiveSession, SessionError> {
    let result = bring_up(transport.as_mut(), target, deployer).await;
    let (reader, writer) = match result {
        Ok(ends) => ends,
        Err(e) => {
            warn!("[session] Establishment failed: {}", e);
            transport.close().await;
            return Err(e);
        }
    };
    info!(
        "[session] Agent attached via {} transport to {}",
        transport.kind(),
        target.display()
    );
    Ok(LiveSession::attach(Some(transport), reader, writer, polling))
}

async fn bring_up(
    transport: &mut dyn AgentTransport,
    target: &ConnectTarget,
    deployer: &AgentDeployer,
) -> Result<(AgentReader, AgentWriter), SessionError> {
    transport.connect(target).await?;
    deployer.deploy_and_start(transport).await?;
    let reader = transport
        .take_read_end()
        .ok_or_else(|| SessionError::Spawn("Agent stdout unavailable".to_string()))?;
    let writer = transport
        .take_write_end()
        .ok_or_else(|| SessionError::Spawn("Agent stdin unavailable".to_string()))?;
    Ok((reader, writer))
}
