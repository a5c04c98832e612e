use std::path::Path;
use std::time::Duration;

use tokio::time::Instant;

use crate::RuntimeError;

/// Poll for a Unix domain socket to exist and accept a connection, matching the
/// "stat + connect every 100ms" convention modules are expected to come up under.
pub(crate) async fn wait_for_socket(path: &Path, timeout: Duration) -> Result<(), RuntimeError> {
    let deadline = Instant::now() + timeout;
    loop {
        if tokio::net::UnixStream::connect(path).await.is_ok() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(RuntimeError::SocketTimeout(path.to_path_buf()));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
