//! Poll Scheduler
//!
//! Three independent timers feed the RPC sender: telemetry, inventory and,
//! while an instance detail view is focused, log tail. Each tick queues one
//! request and goes back to sleep without waiting for the response. Separate
//! timers keep the cadences from drifting into lockstep.

use std::time::Duration;

use perssh_protocol::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::config::PollingConfig;
use crate::rpc::RpcSender;

/// Focused instance for log tailing; `None` pauses the log timer.
pub type FocusReceiver = watch::Receiver<Option<String>>;

/// Running poll timers. Dropping the scheduler stops them.
pub struct PollScheduler {
    tasks: Vec<JoinHandle<()>>,
}

impl PollScheduler {
    pub fn spawn(sender: RpcSender, cadence: &PollingConfig, focus: FocusReceiver) -> Self {
        let tasks = vec![
            tokio::spawn(fixed_poll(sender.clone(), cadence.telemetry(), || Command::GetTelemetry)),
            tokio::spawn(fixed_poll(sender.clone(), cadence.inventory(), || Command::ListContainers)),
            tokio::spawn(log_poll(sender, cadence.logs(), focus)),
        ];
        debug!(
            "[poll] Started: telemetry {:?}, inventory {:?}, logs {:?}",
            cadence.telemetry(),
            cadence.inventory(),
            cadence.logs()
        );
        Self { tasks }
    }

    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn fixed_poll(sender: RpcSender, period: Duration, make: impl Fn() -> Command) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if sender.send(make()).is_err() {
            break;
        }
    }
}

async fn log_poll(sender: RpcSender, period: Duration, mut focus: FocusReceiver) {
    loop {
        // Idle until a detail view opens
        let target = focus.borrow_and_update().clone();
        let Some(target) = target else {
            if focus.changed().await.is_err() {
                return;
            }
            continue;
        };

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if sender.send(Command::GetLogs(target.clone())).is_err() {
                        return;
                    }
                }
                changed = focus.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::attach;
    use futures_util::StreamExt;
    use perssh_protocol::{CommandType, JsonCodec, Request, RequestType};
    use tokio_util::codec::FramedRead;

    fn kind(req: &Request) -> CommandType {
        match req.kind {
            RequestType::Known(kind) => kind,
            RequestType::Unrecognized(ref s) => panic!("unexpected type {}", s),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_cadences() {
        let (client, agent) = tokio::io::duplex(64 * 1024);
        let (r, w) = tokio::io::split(client);
        let (sender, _responses) = attach(r, w);
        let (focus_tx, focus_rx) = watch::channel(None);

        let cadence = PollingConfig {
            telemetry_ms: 1000,
            inventory_ms: 6000,
            logs_ms: 250,
        };
        let _scheduler = PollScheduler::spawn(sender, &cadence, focus_rx);
        let mut requests = FramedRead::new(agent, JsonCodec::<Request>::new());

        // Up to the second inventory tick at t=6s
        let mut telemetry = 0;
        let mut inventory = 0;
        while inventory < 2 {
            let req = requests.next().await.unwrap().unwrap();
            match kind(&req) {
                CommandType::GetTelemetry => telemetry += 1,
                CommandType::ListContainers => inventory += 1,
                other => panic!("unexpected {} while unfocused", other),
            }
        }
        assert!(telemetry >= 6, "telemetry ticked {} times", telemetry);

        // Focusing an instance starts the log timer with its id
        focus_tx.send(Some("mock-1".to_string())).unwrap();
        loop {
            let req = requests.next().await.unwrap().unwrap();
            if kind(&req) == CommandType::GetLogs {
                assert_eq!(req.payload, Some(serde_json::json!("mock-1")));
                break;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_connection_closes() {
        let (client, agent) = tokio::io::duplex(1024);
        let (r, w) = tokio::io::split(client);
        let (sender, _responses) = attach(r, w);
        let observer = sender.clone();
        let (_focus_tx, focus_rx) = watch::channel(Some("x".to_string()));
        let _scheduler = PollScheduler::spawn(sender, &PollingConfig::default(), focus_rx);

        drop(agent);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(observer.is_closed());
        assert!(observer.send(Command::Ping).is_err());
    }
}
