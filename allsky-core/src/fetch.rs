//! Remote image acquisition over SFTP with bounded retries.
//!
//! The camera host is a small embedded board that drops connections
//! regularly, so transient transport failures are expected and retried.
//! Authentication failures are not retried: the credentials will not fix
//! themselves, and hammering the host risks a lockout.
//!
//! The remote file is buffered fully in memory and then staged to disk
//! with an atomic rename, so a failed transfer leaves the previous local
//! image intact.

use std::{
    io::{Read, Write},
    net::TcpStream,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use log::{debug, warn};
use ssh2::Session;
use tempfile::NamedTempFile;
use thiserror::Error;

use allsky_utils::{config::MonitorSettings, timing_guard};

#[derive(Debug, Error)]
pub enum FetchError {
    /// A failure worth retrying: connection refused, handshake dropped,
    /// read interrupted mid-transfer.
    #[error("transient transfer failure: {0}")]
    Transient(#[source] anyhow::Error),
    /// Credentials rejected. Never retried.
    #[error("authentication failed for {username}@{host}")]
    AuthFailed { host: String, username: String },
    /// All retry attempts consumed.
    #[error("transfer failed after {attempts} attempts")]
    Exhausted {
        attempts: u32,
        #[source]
        last: anyhow::Error,
    },
    /// Non-transient local or protocol failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One transfer attempt against a remote image source.
///
/// Implementations perform a single attempt; [`fetch_with_retry`] owns the
/// retry loop so tests can drive the policy with stub sources.
pub trait ImageSource: Send {
    /// Fetch `remote_path` into `local_path`, replacing any previous file
    /// atomically on success.
    fn fetch(&self, remote_path: &Path, local_path: &Path) -> Result<(), FetchError>;
}

/// Parameters for one retried transfer.
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    pub remote_path: &'a Path,
    pub local_path: &'a Path,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl<'a> FetchRequest<'a> {
    pub fn from_settings(settings: &'a MonitorSettings) -> Self {
        Self {
            remote_path: Path::new(&settings.remote_image_path),
            local_path: &settings.local_image_path,
            max_retries: settings.max_retries,
            retry_delay: settings.retry_delay(),
        }
    }
}

/// Drive a source through up to `max_retries` attempts.
///
/// Transient failures sleep `retry_delay` and retry; authentication and
/// other failures abort immediately. When every attempt fails transiently
/// the result is [`FetchError::Exhausted`] carrying the final cause.
pub fn fetch_with_retry(source: &dyn ImageSource, request: &FetchRequest<'_>) -> Result<(), FetchError> {
    let _guard = timing_guard("allsky_core::fetch", log::Level::Debug);
    let attempts = request.max_retries.max(1);

    for attempt in 1..=attempts {
        debug!(
            "fetching {} (attempt {}/{})",
            request.remote_path.display(),
            attempt,
            attempts
        );
        match source.fetch(request.remote_path, request.local_path) {
            Ok(()) => {
                debug!(
                    "fetched {} -> {}",
                    request.remote_path.display(),
                    request.local_path.display()
                );
                return Ok(());
            }
            Err(FetchError::Transient(cause)) if attempt < attempts => {
                warn!(
                    "transfer attempt {}/{} failed ({cause:#}); retrying in {:?}",
                    attempt, attempts, request.retry_delay
                );
                thread::sleep(request.retry_delay);
            }
            Err(FetchError::Transient(cause)) => {
                return Err(FetchError::Exhausted {
                    attempts,
                    last: cause,
                });
            }
            Err(other) => return Err(other),
        }
    }

    // attempts >= 1, so the loop always returns.
    Err(FetchError::Other(anyhow::anyhow!(
        "retry loop exited without a result"
    )))
}

/// SFTP transport for the allsky camera host.
#[derive(Debug, Clone)]
pub struct SftpSource {
    host: String,
    port: u16,
    username: String,
    password: String,
}

impl SftpSource {
    pub fn new(host: String, port: u16, username: String, password: String) -> Self {
        Self {
            host,
            port,
            username,
            password,
        }
    }

    pub fn from_settings(settings: &MonitorSettings) -> Self {
        Self::new(
            settings.host.clone(),
            settings.port,
            settings.username.clone(),
            settings.password.clone(),
        )
    }

    fn connect(&self) -> Result<Session, FetchError> {
        let address = format!("{}:{}", self.host, self.port);
        let stream = TcpStream::connect(&address).map_err(|e| classify_io_error(e, &address))?;

        let mut session = Session::new()
            .map_err(|e| FetchError::Other(anyhow::anyhow!("failed to create SSH session: {e}")))?;
        session.set_tcp_stream(stream);
        session.handshake().map_err(|e| {
            FetchError::Transient(anyhow::anyhow!("SSH handshake with {address} failed: {e}"))
        })?;

        session
            .userauth_password(&self.username, &self.password)
            .map_err(|e| classify_auth_error(e, &self.host, &self.username))?;
        if !session.authenticated() {
            return Err(FetchError::AuthFailed {
                host: self.host.clone(),
                username: self.username.clone(),
            });
        }
        Ok(session)
    }
}

impl ImageSource for SftpSource {
    fn fetch(&self, remote_path: &Path, local_path: &Path) -> Result<(), FetchError> {
        let session = self.connect()?;
        let sftp = session
            .sftp()
            .map_err(|e| FetchError::Other(anyhow::anyhow!("failed to open SFTP channel: {e}")))?;

        let mut remote = sftp.open(remote_path).map_err(|e| {
            FetchError::Other(anyhow::anyhow!(
                "failed to open remote file {}: {e}",
                remote_path.display()
            ))
        })?;

        // Buffer the full image before touching the local file, so a dropped
        // connection mid-read cannot corrupt it.
        let mut buffer = Vec::new();
        remote.read_to_end(&mut buffer).map_err(|e| {
            FetchError::Transient(anyhow::anyhow!(
                "read of remote file {} failed: {e}",
                remote_path.display()
            ))
        })?;

        write_local_atomic(local_path, &buffer)?;
        Ok(())
    }
}

fn write_local_atomic(local_path: &Path, data: &[u8]) -> Result<(), FetchError> {
    let parent = match local_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent).map_err(|e| {
        FetchError::Other(anyhow::anyhow!(
            "failed to create image directory {}: {e}",
            parent.display()
        ))
    })?;

    let mut staged = NamedTempFile::new_in(&parent).map_err(|e| {
        FetchError::Other(anyhow::anyhow!(
            "failed to create staging file in {}: {e}",
            parent.display()
        ))
    })?;
    staged
        .write_all(data)
        .and_then(|()| staged.flush())
        .map_err(|e| FetchError::Other(anyhow::anyhow!("failed to stage fetched image: {e}")))?;
    staged.persist(local_path).map_err(|e| {
        FetchError::Other(anyhow::anyhow!(
            "failed to publish fetched image {}: {e}",
            local_path.display()
        ))
    })?;
    Ok(())
}

// libssh2's LIBSSH2_ERROR_AUTHENTICATION_FAILED.
const AUTH_FAILED_CODE: i32 = -18;

/// Only a rejected credential is non-retriable; a connection dropped during
/// the auth exchange is a transient transport failure like any other.
fn classify_auth_error(error: ssh2::Error, host: &str, username: &str) -> FetchError {
    match error.code() {
        ssh2::ErrorCode::Session(AUTH_FAILED_CODE) => FetchError::AuthFailed {
            host: host.to_string(),
            username: username.to_string(),
        },
        _ => FetchError::Transient(anyhow::anyhow!(
            "SSH authentication exchange with {host} failed: {error}"
        )),
    }
}

fn classify_io_error(error: std::io::Error, address: &str) -> FetchError {
    use std::io::ErrorKind;
    let cause = anyhow::anyhow!("connection to {address} failed: {error}");
    match error.kind() {
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::TimedOut
        | ErrorKind::NotConnected
        | ErrorKind::HostUnreachable
        | ErrorKind::NetworkUnreachable => FetchError::Transient(cause),
        _ => FetchError::Other(cause),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FailingSource {
        attempts: AtomicU32,
        error: fn() -> FetchError,
    }

    impl FailingSource {
        fn transient() -> Self {
            Self {
                attempts: AtomicU32::new(0),
                error: || FetchError::Transient(anyhow::anyhow!("connection reset")),
            }
        }

        fn auth() -> Self {
            Self {
                attempts: AtomicU32::new(0),
                error: || FetchError::AuthFailed {
                    host: "camera.local".to_string(),
                    username: "pi".to_string(),
                },
            }
        }
    }

    impl ImageSource for FailingSource {
        fn fetch(&self, _remote: &Path, _local: &Path) -> Result<(), FetchError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err((self.error)())
        }
    }

    struct FlakySource {
        attempts: AtomicU32,
        succeed_on: u32,
    }

    impl ImageSource for FlakySource {
        fn fetch(&self, _remote: &Path, local: &Path) -> Result<(), FetchError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt < self.succeed_on {
                return Err(FetchError::Transient(anyhow::anyhow!("timed out")));
            }
            std::fs::write(local, b"image bytes").map_err(|e| FetchError::Other(e.into()))?;
            Ok(())
        }
    }

    fn request<'a>(local: &'a Path, max_retries: u32) -> FetchRequest<'a> {
        FetchRequest {
            remote_path: Path::new("/home/pi/allsky/images/latest.jpg"),
            local_path: local,
            max_retries,
            retry_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn transient_failures_consume_all_attempts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let local = dir.path().join("latest.jpg");
        let source = FailingSource::transient();

        let err = fetch_with_retry(&source, &request(&local, 3)).expect_err("should exhaust");
        assert!(matches!(err, FetchError::Exhausted { attempts: 3, .. }));
        assert_eq!(source.attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn auth_failure_aborts_on_first_attempt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let local = dir.path().join("latest.jpg");
        let source = FailingSource::auth();

        let err = fetch_with_retry(&source, &request(&local, 3)).expect_err("should abort");
        assert!(matches!(err, FetchError::AuthFailed { .. }));
        assert_eq!(source.attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn recovers_within_retry_budget() {
        let dir = tempfile::tempdir().expect("tempdir");
        let local = dir.path().join("latest.jpg");
        let source = FlakySource {
            attempts: AtomicU32::new(0),
            succeed_on: 3,
        };

        fetch_with_retry(&source, &request(&local, 3)).expect("third attempt succeeds");
        assert_eq!(source.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(std::fs::read(&local).expect("local image"), b"image bytes");
    }

    #[test]
    fn zero_retries_still_attempts_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let local = dir.path().join("latest.jpg");
        let source = FailingSource::transient();

        let err = fetch_with_retry(&source, &request(&local, 0)).expect_err("should fail");
        assert!(matches!(err, FetchError::Exhausted { attempts: 1, .. }));
        assert_eq!(source.attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rejected_credentials_map_to_auth_failed() {
        let error = ssh2::Error::new(
            ssh2::ErrorCode::Session(AUTH_FAILED_CODE),
            "authentication failed",
        );
        let classified = classify_auth_error(error, "camera.local", "pi");
        assert!(matches!(classified, FetchError::AuthFailed { .. }));
    }

    #[test]
    fn dropped_connection_during_auth_is_transient() {
        // LIBSSH2_ERROR_SOCKET_DISCONNECT
        let error = ssh2::Error::new(ssh2::ErrorCode::Session(-13), "socket disconnect");
        let classified = classify_auth_error(error, "camera.local", "pi");
        assert!(matches!(classified, FetchError::Transient(_)));
    }

    #[test]
    fn atomic_local_write_replaces_previous_image() {
        let dir = tempfile::tempdir().expect("tempdir");
        let local = dir.path().join("latest.jpg");
        std::fs::write(&local, b"old frame").expect("seed");

        write_local_atomic(&local, b"new frame").expect("replace");
        assert_eq!(std::fs::read(&local).expect("read"), b"new frame");
    }
}
