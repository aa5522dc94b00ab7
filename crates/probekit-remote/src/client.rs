//! Client side of the runtime RPC: a [`RemoteFramework`] proxies the runtime
//! control surface of a forked host.

use std::time::Duration;

use async_trait::async_trait;
use probekit_core::framework::{
    BundleId, BundleInfo, BundleState, Framework, FrameworkError, FrameworkEvent, FrameworkResult,
    FrameworkState, ServiceReference,
};
use probekit_core::wire::{read_frame, write_frame};
use probekit_core::ServiceFilter;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use crate::error::{RemoteError, RemoteResult};
use crate::protocol::{encode_content, Call, Request, Response};

struct Connection {
    stream: TcpStream,
    next_id: u64,
}

const EVENT_CAPACITY: usize = 16;

/// Handle to a runtime living in another process.
///
/// Calls are serialised over one connection; dropping the handle closes it,
/// which tells the host to shut down. Events are not streamed from the
/// host: subscribers see the level changes and stops this handle observed.
pub struct RemoteFramework {
    addr: String,
    connection: Mutex<Connection>,
    events: broadcast::Sender<FrameworkEvent>,
}

fn millis(timeout: Duration) -> u64 {
    timeout.as_millis() as u64
}

impl RemoteFramework {
    pub async fn connect(addr: &str) -> RemoteResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| RemoteError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        stream.set_nodelay(true)?;
        debug!(addr, "connected to runtime host");
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            addr: addr.to_string(),
            connection: Mutex::new(Connection { stream, next_id: 0 }),
            events,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn exchange(&self, call: Call) -> RemoteResult<Result<Value, FrameworkError>> {
        let name = call.name();
        let mut connection = self.connection.lock().await;
        connection.next_id += 1;
        let id = connection.next_id;
        write_frame(&mut connection.stream, &Request { id, call }).await?;
        let response: Response = read_frame(&mut connection.stream)
            .await?
            .ok_or_else(|| RemoteError::Closed {
                call: name.to_string(),
            })?;
        if response.id != id {
            return Err(RemoteError::Protocol(format!(
                "response {} does not answer request {id} ({name})",
                response.id
            )));
        }
        Ok(response.result)
    }

    /// Perform `call`; transport failures become [`FrameworkError::Transport`].
    async fn call<T: DeserializeOwned>(&self, call: Call) -> FrameworkResult<T> {
        let name = call.name();
        let value = self.exchange(call).await??;
        serde_json::from_value(value).map_err(|e| FrameworkError::Transport {
            message: format!("bad {name} result: {e}"),
        })
    }

    fn publish(&self, event: FrameworkEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl Framework for RemoteFramework {
    async fn init(&self) -> FrameworkResult<()> {
        self.call(Call::Init).await
    }

    async fn start(&self) -> FrameworkResult<()> {
        self.call(Call::Start).await
    }

    async fn stop(&self) -> FrameworkResult<()> {
        self.call(Call::Stop).await
    }

    async fn wait_for_stop(&self, timeout: Duration) -> FrameworkResult<FrameworkEvent> {
        let event: FrameworkEvent = self
            .call(Call::WaitForStop {
                timeout_ms: millis(timeout),
            })
            .await?;
        if event == FrameworkEvent::Stopped {
            self.publish(FrameworkEvent::Stopped);
        }
        Ok(event)
    }

    async fn state(&self) -> FrameworkResult<FrameworkState> {
        self.call(Call::State).await
    }

    /// Ship `content` to the host, or let the host dereference `location`
    /// itself when there is none.
    async fn install_bundle(&self, location: &str, content: Option<Vec<u8>>) -> FrameworkResult<BundleId> {
        self.call(Call::InstallBundle {
            location: location.to_string(),
            content: encode_content(content),
        })
        .await
    }

    async fn update_bundle(&self, id: BundleId, content: Option<Vec<u8>>) -> FrameworkResult<()> {
        self.call(Call::UpdateBundle {
            id,
            content: encode_content(content),
        })
        .await
    }

    async fn start_bundle(&self, id: BundleId) -> FrameworkResult<()> {
        self.call(Call::StartBundle { id }).await
    }

    async fn uninstall_bundle(&self, id: BundleId) -> FrameworkResult<()> {
        self.call(Call::UninstallBundle { id }).await
    }

    async fn bundle_state(&self, id: BundleId) -> FrameworkResult<BundleState> {
        self.call(Call::BundleState { id }).await
    }

    async fn bundle_info(&self, id: BundleId) -> FrameworkResult<BundleInfo> {
        self.call(Call::BundleInfo { id }).await
    }

    async fn bundles(&self) -> FrameworkResult<Vec<BundleInfo>> {
        self.call(Call::Bundles).await
    }

    async fn set_bundle_start_level(&self, id: BundleId, level: u32) -> FrameworkResult<()> {
        self.call(Call::SetBundleStartLevel { id, level }).await
    }

    async fn set_start_level(&self, level: u32) -> FrameworkResult<()> {
        self.call(Call::SetStartLevel { level }).await
    }

    async fn start_level(&self) -> FrameworkResult<u32> {
        self.call(Call::StartLevel).await
    }

    /// Waits on the host side, in one round trip.
    async fn set_start_level_and_wait(&self, level: u32, timeout: Duration) -> FrameworkResult<bool> {
        let reached: bool = self
            .call(Call::SetStartLevelAndWait {
                level,
                timeout_ms: millis(timeout),
            })
            .await?;
        if reached {
            self.publish(FrameworkEvent::StartLevelChanged { level });
        }
        Ok(reached)
    }

    fn subscribe(&self) -> broadcast::Receiver<FrameworkEvent> {
        self.events.subscribe()
    }

    async fn find_services(
        &self,
        filter: &ServiceFilter,
        timeout: Duration,
    ) -> FrameworkResult<Vec<ServiceReference>> {
        self.call(Call::FindServices {
            filter: filter.to_string(),
            timeout_ms: millis(timeout),
        })
        .await
    }

    /// A failure raised by the service itself comes back as the original
    /// error, not a transport wrapper.
    async fn invoke_service(
        &self,
        service: &ServiceReference,
        method: &str,
        args: Vec<Value>,
    ) -> FrameworkResult<Value> {
        self.call(Call::InvokeService {
            service: service.clone(),
            method: method.to_string(),
            args,
        })
        .await
    }
}
