//! Remote Scheduler Boundary
//!
//! Connecting a session involves a remote scheduling service that asks
//! the peer device to prepare its side of the collaboration. The service
//! is reached over the process's IPC substrate and consumed here through
//! [`SchedulerClient`]. Each call is a synchronous request/response;
//! callers wrap them in a timeout so a dead scheduler fails the call
//! instead of hanging it.

use async_trait::async_trait;

use crate::errors::Result;
use crate::session::{ConnectOption, SessionKey};

/// Request/response interface of the remote scheduling service.
#[async_trait]
pub trait SchedulerClient: Send + Sync {
    /// Ask the scheduler to start a collaboration with the peer.
    async fn collab_mission(
        &self,
        session_id: i32,
        server_socket_name: &str,
        key: &SessionKey,
        options: &ConnectOption,
        token: &str,
    ) -> Result<()>;

    /// Report the sink side's channel-preparation outcome.
    async fn notify_prepare_result(
        &self,
        token: &str,
        success: bool,
        session_id: i32,
        server_socket_name: &str,
    ) -> Result<()>;

    /// Tell the scheduler the collaboration is over.
    async fn notify_close_collab_session(&self, token: &str) -> Result<()>;

    /// Report why an inbound collaboration request was rejected.
    async fn notify_reject_reason(&self, token: &str, reason: &str) -> Result<()>;

    /// Query the peer's protocol version.
    async fn get_peer_version(
        &self,
        session_id: i32,
        peer_device_id: &str,
        token: &str,
    ) -> Result<i32>;
}
