//! Server side of the runtime RPC: exposes any [`Framework`] over framed TCP.

use std::sync::Arc;
use std::time::Duration;

use probekit_core::framework::{Framework, FrameworkError, FrameworkResult};
use probekit_core::wire::{read_frame, write_frame};
use probekit_core::ServiceFilter;
use serde::Serialize;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::error::RemoteResult;
use crate::protocol::{decode_content, Call, Request, Response};

fn to_value<T: Serialize>(value: T) -> FrameworkResult<Value> {
    serde_json::to_value(value).map_err(|e| FrameworkError::Transport {
        message: e.to_string(),
    })
}

fn timeout(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

/// Run one call against `framework`.
pub async fn dispatch(framework: &dyn Framework, call: Call) -> FrameworkResult<Value> {
    match call {
        Call::Init => to_value(framework.init().await?),
        Call::Start => to_value(framework.start().await?),
        Call::Stop => to_value(framework.stop().await?),
        Call::WaitForStop { timeout_ms } => to_value(framework.wait_for_stop(timeout(timeout_ms)).await?),
        Call::State => to_value(framework.state().await?),
        Call::InstallBundle { location, content } => {
            let content = decode_content(content)?;
            to_value(framework.install_bundle(&location, content).await?)
        }
        Call::UpdateBundle { id, content } => {
            let content = decode_content(content)?;
            to_value(framework.update_bundle(id, content).await?)
        }
        Call::StartBundle { id } => to_value(framework.start_bundle(id).await?),
        Call::UninstallBundle { id } => to_value(framework.uninstall_bundle(id).await?),
        Call::BundleState { id } => to_value(framework.bundle_state(id).await?),
        Call::BundleInfo { id } => to_value(framework.bundle_info(id).await?),
        Call::Bundles => to_value(framework.bundles().await?),
        Call::SetBundleStartLevel { id, level } => to_value(framework.set_bundle_start_level(id, level).await?),
        Call::SetStartLevel { level } => to_value(framework.set_start_level(level).await?),
        Call::StartLevel => to_value(framework.start_level().await?),
        Call::SetStartLevelAndWait { level, timeout_ms } => {
            to_value(framework.set_start_level_and_wait(level, timeout(timeout_ms)).await?)
        }
        Call::FindServices { filter, timeout_ms } => {
            let filter: ServiceFilter = filter.parse().map_err(|e: probekit_core::ExamError| {
                FrameworkError::InvalidArguments {
                    method: "find_services".to_string(),
                    reason: e.to_string(),
                }
            })?;
            to_value(framework.find_services(&filter, timeout(timeout_ms)).await?)
        }
        Call::InvokeService { service, method, args } => {
            framework.invoke_service(&service, &method, args).await
        }
    }
}

/// Serves one runtime to RPC clients.
pub struct FrameworkServer {
    framework: Arc<dyn Framework>,
}

impl FrameworkServer {
    pub fn new(framework: Arc<dyn Framework>) -> Self {
        Self { framework }
    }

    /// Answer requests on `stream` until the peer closes it.
    pub async fn serve_connection(&self, mut stream: TcpStream) -> RemoteResult<()> {
        stream.set_nodelay(true)?;
        while let Some(request) = read_frame::<_, Request>(&mut stream).await? {
            let name = request.call.name();
            let result = dispatch(self.framework.as_ref(), request.call).await;
            if let Err(e) = &result {
                debug!(call = name, error = %e, "call failed");
            }
            write_frame(
                &mut stream,
                &Response {
                    id: request.id,
                    result,
                },
            )
            .await?;
        }
        debug!("client closed the connection");
        Ok(())
    }

    /// Accept clients forever, one task per connection.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> RemoteResult<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            info!(peer = %peer, "runtime client connected");
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.serve_connection(stream).await {
                    warn!(peer = %peer, error = %e, "runtime connection failed");
                }
            });
        }
    }
}
