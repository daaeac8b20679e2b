use tonic::transport::{Channel, Endpoint};

pub use crate::supervisor::status_service_client::StatusServiceClient;
pub use crate::supervisor::terminal_service_client::TerminalServiceClient;

/// Plaintext HTTP/2 channel to the supervisor. Nothing is dialed until the
/// first call, and the channel reconnects on its own after failures.
pub fn lazy_channel(addr: &str) -> Result<Channel, tonic::transport::Error> {
    let uri = if addr.contains("://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    };
    Ok(Endpoint::from_shared(uri)?.connect_lazy())
}
