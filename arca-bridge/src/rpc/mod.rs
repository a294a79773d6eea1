//! Typed clients for the in-guest services.
//!
//! Every client dials through [`dial_with_backoff`], so transient failures
//! during guest boot are absorbed here and never re-implemented by
//! callers. A response with `success = false` becomes
//! [`ArcaError::Remote`] carrying the guest's error string.

mod firewall;
mod fs;
mod netcfg;
mod overlayfs;
mod router;
mod tap;

pub use firewall::FirewallClient;
pub use fs::FilesystemClient;
pub use netcfg::NetworkConfigClient;
pub use overlayfs::OverlayFsClient;
pub use router::RouterClient;
pub use tap::{TapAttachArgs, TapForwarderClient};

use crate::vmm::{VmHandle, VsockStream};
use arca_shared::codec;
use arca_shared::{ArcaError, ArcaResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

/// Dial attempts before giving up on a guest service.
pub const DIAL_ATTEMPTS: u32 = 10;

/// First retry delay; doubles per attempt.
pub const DIAL_BASE_DELAY: Duration = Duration::from_millis(50);

/// Retry delay ceiling.
pub const DIAL_MAX_DELAY: Duration = Duration::from_secs(3);

/// Dial a guest vsock port with capped exponential backoff.
pub async fn dial_with_backoff(
    vm: &Arc<dyn VmHandle>,
    port: u32,
) -> ArcaResult<Box<dyn VsockStream>> {
    let mut delay = DIAL_BASE_DELAY;
    let mut last_err = String::new();

    for attempt in 1..=DIAL_ATTEMPTS {
        match vm.connect_vsock(port).await {
            Ok(stream) => {
                if attempt > 1 {
                    tracing::debug!(port, attempt, "vsock dial succeeded after retries");
                }
                return Ok(stream);
            }
            Err(e) => {
                tracing::trace!(port, attempt, error = %e, "vsock dial failed");
                last_err = e.to_string();
                if attempt < DIAL_ATTEMPTS {
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(DIAL_MAX_DELAY);
                }
            }
        }
    }

    Err(ArcaError::Remote(format!(
        "vsock port {port} unreachable after {DIAL_ATTEMPTS} attempts: {last_err}"
    )))
}

/// One request/response round trip on a fresh connection.
pub(crate) async fn call<Req, Resp>(
    vm: &Arc<dyn VmHandle>,
    port: u32,
    request: &Req,
) -> ArcaResult<Resp>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let mut stream = dial_with_backoff(vm, port).await?;
    codec::write_frame(&mut stream, request).await?;
    codec::read_frame(&mut stream).await
}

/// Convert an envelope into a result.
pub(crate) fn check_envelope(success: bool, error: Option<String>, what: &str) -> ArcaResult<()> {
    if success {
        Ok(())
    } else {
        Err(ArcaError::Remote(format!(
            "{what} failed: {}",
            error.unwrap_or_else(|| "unspecified guest error".into())
        )))
    }
}
