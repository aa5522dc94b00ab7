//! One-shot callback listener for a single in-flight remote test.

use std::sync::Arc;
use std::time::Duration;

use probekit_core::wire::read_frame;
use probekit_core::{ExamError, ExamResult, TestEvent, TestListener};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

async fn relay(socket: TcpListener, listener: Arc<dyn TestListener>) -> ExamResult<Option<TestEvent>> {
    let (mut stream, peer) = socket.accept().await?;
    debug!(peer = %peer, "test notifier connected");
    while let Some(event) = read_frame::<_, TestEvent>(&mut stream).await? {
        event.dispatch(listener.as_ref());
        if event.is_terminal() {
            return Ok(Some(event));
        }
    }
    Ok(None)
}

/// Accepts one notifier connection, relays its events to a [`TestListener`]
/// and finishes with the terminal event.
pub struct TestListenerTask {
    port: u16,
    handle: JoinHandle<ExamResult<Option<TestEvent>>>,
}

impl TestListenerTask {
    /// Bind on the local host before the test is requested, so the
    /// notifier always finds the socket open.
    pub async fn spawn(port: u16, listener: Arc<dyn TestListener>) -> ExamResult<Self> {
        let socket = TcpListener::bind(("127.0.0.1", port)).await?;
        let port = socket.local_addr()?.port();
        debug!(port, "test listener bound");
        let handle = tokio::spawn(relay(socket, listener));
        Ok(Self { port, handle })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the terminal event. The task is aborted if `timeout`
    /// elapses first.
    pub async fn join(self, timeout: Duration) -> ExamResult<TestEvent> {
        let mut handle = self.handle;
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(Ok(Some(event)))) => Ok(event),
            Ok(Ok(Ok(None))) => Err(ExamError::container(
                "test listener connection closed before the test finished",
            )),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(join)) => Err(ExamError::container_caused_by("test listener task failed", join)),
            Err(_) => {
                warn!(port = self.port, "no test outcome received, aborting listener");
                handle.abort();
                Err(ExamError::timeout("test outcome", timeout))
            }
        }
    }

    pub fn abort(self) {
        self.handle.abort();
    }
}
