//! Byte-stream front ends for the dispatcher.
//!
//! The deployed agent serves its own stdin/stdout. The TCP listener exists
//! for development, where one dispatcher runs per accepted connection over
//! a shared backend.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{info, warn};

use crate::dispatcher::{Dispatcher, SessionEnd};

/// Serve requests on the process's stdin/stdout until input closes.
pub async fn serve_stdio(dispatcher: &Dispatcher) -> SessionEnd {
    info!(
        "[agent-server] Serving on stdio with {} backend",
        dispatcher.backend().name()
    );
    dispatcher
        .serve(tokio::io::stdin(), tokio::io::stdout())
        .await
}

/// Bind `addr` and serve every accepted connection.
pub async fn serve_tcp(addr: impl ToSocketAddrs, dispatcher: Arc<Dispatcher>) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_listener(listener, dispatcher).await
}

/// Pause before accepting again after running out of descriptors or memory.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accept loop. Accept errors are logged and never end the listener.
pub async fn serve_listener(listener: TcpListener, dispatcher: Arc<Dispatcher>) -> io::Result<()> {
    info!("[agent-server] Listening on {}", listener.local_addr()?);
    accept_loop(|| listener.accept(), dispatcher).await;
    Ok(())
}

/// Per-connection failures need no pause; resource exhaustion does.
fn accept_backoff(error: &io::Error) -> Option<Duration> {
    match error.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock => None,
        _ => Some(ACCEPT_BACKOFF),
    }
}

async fn accept_loop<F, Fut>(mut accept: F, dispatcher: Arc<Dispatcher>)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<(TcpStream, SocketAddr)>>,
{
    loop {
        let (stream, peer) = match accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("[agent-server] Accept failed: {}", e);
                if let Some(pause) = accept_backoff(&e) {
                    tokio::time::sleep(pause).await;
                }
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            info!("[agent-server] Connection from {}", peer);
            let (reader, writer) = stream.into_split();
            match dispatcher.serve(reader, writer).await {
                SessionEnd::InputClosed => info!("[agent-server] {} disconnected", peer),
                end => warn!("[agent-server] {} dropped: {:?}", peer, end),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StubBackend;
    use crate::telemetry::SystemTelemetry;
    use futures_util::{SinkExt, StreamExt};
    use perssh_protocol::{Command, ContainerInfo, JsonCodec, Response};
    use tokio::net::TcpStream;
    use tokio_util::codec::Framed;

    #[tokio::test]
    async fn test_connections_share_backend() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(StubBackend::new()),
            Arc::new(SystemTelemetry::new()),
        ));
        tokio::spawn(serve_listener(listener, dispatcher));

        let payload = serde_json::from_value(serde_json::json!({"name": "shared"})).unwrap();
        let mut first = Framed::new(TcpStream::connect(addr).await.unwrap(), JsonCodec::<Response>::new());
        first
            .send(Command::CreateEnv(payload).into_request("c1").unwrap())
            .await
            .unwrap();
        let created = first.next().await.unwrap().unwrap();
        assert!(created.success);
        let cid: String = created.data_as().unwrap();

        let mut second = Framed::new(TcpStream::connect(addr).await.unwrap(), JsonCodec::<Response>::new());
        second
            .send(Command::ListContainers.into_request("l1").unwrap())
            .await
            .unwrap();
        let list = second.next().await.unwrap().unwrap();
        assert_eq!(list.id, "l1");
        let ids: Vec<String> = list
            .data_as::<Vec<ContainerInfo>>()
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec![cid]);
    }

    fn dispatcher() -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(
            Arc::new(StubBackend::new()),
            Arc::new(SystemTelemetry::new()),
        ))
    }

    #[tokio::test]
    async fn test_accept_errors_do_not_stop_listener() {
        let listener = Arc::new(TcpListener::bind("127.0.0.1:0").await.unwrap());
        let addr = listener.local_addr().unwrap();

        // The first two accepts fail: one transient, one out of descriptors
        let mut calls = 0u32;
        let accept = move || {
            calls += 1;
            let call = calls;
            let listener = listener.clone();
            async move {
                match call {
                    1 => Err(io::Error::from(io::ErrorKind::ConnectionAborted)),
                    2 => Err(io::Error::from_raw_os_error(24)),
                    _ => listener.accept().await,
                }
            }
        };
        tokio::spawn(accept_loop(accept, dispatcher()));

        let mut conn = Framed::new(TcpStream::connect(addr).await.unwrap(), JsonCodec::<Response>::new());
        conn.send(Command::Ping.into_request("1").unwrap()).await.unwrap();
        let pong = conn.next().await.unwrap().unwrap();
        assert_eq!(pong.id, "1");
        assert!(pong.success);
    }

    #[test]
    fn test_accept_backoff() {
        assert_eq!(accept_backoff(&io::Error::from(io::ErrorKind::ConnectionAborted)), None);
        assert_eq!(accept_backoff(&io::Error::from_raw_os_error(24)), Some(ACCEPT_BACKOFF));
    }
}
