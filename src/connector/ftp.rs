//! FTP/SFTP target adapter
//!
//! Uploads each payload as a uniquely named JSON file
//! (`payload_<UTC timestamp with microseconds>.json`, 2-space indentation)
//! into the configured remote directory. The directory is created
//! advisorily: "already exists" and permission errors during the probe are
//! ignored. Both clients are blocking, so every session operation runs on
//! the blocking thread pool.

use crate::error::{Error, Result};
use crate::model::JsonMap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ssh2::Session;
use std::io::{Cursor, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;
use suppaftp::FtpStream;
use tracing::debug;

use super::TargetConnector;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// FTP/SFTP target configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtpTargetConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Remote directory payload files are written into
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub use_sftp: bool,
}

fn default_port() -> u16 {
    21
}

fn default_path() -> String {
    "/".to_string()
}

impl FtpTargetConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::invalid_config("host", "host cannot be empty"));
        }
        if self.port == 0 {
            return Err(Error::invalid_config("port", "port must be between 1 and 65535"));
        }
        if self.username.is_empty() {
            return Err(Error::invalid_config("username", "username cannot be empty"));
        }
        Ok(())
    }
}

/// An established file-transfer session
enum FtpSession {
    Plain(FtpStream),
    Secure(Session),
}

/// Connector for FTP/SFTP file transfer
pub struct FtpConnector {
    config: FtpTargetConfig,
    session: Option<FtpSession>,
}

impl std::fmt::Debug for FtpConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpConnector")
            .field("config", &self.config)
            .field("connected", &self.session.is_some())
            .finish()
    }
}

impl FtpConnector {
    pub fn new(config: FtpTargetConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            session: None,
        })
    }

    /// Timestamped remote file name for one payload
    fn payload_filename() -> String {
        format!(
            "payload_{}.json",
            chrono::Utc::now().format("%Y%m%d_%H%M%S_%6f")
        )
    }

    fn remote_path(dir: &str, filename: &str) -> String {
        if dir.is_empty() || dir == "/" {
            format!("/{}", filename)
        } else {
            format!("{}/{}", dir.trim_end_matches('/'), filename)
        }
    }

    fn dial(config: &FtpTargetConfig) -> Result<FtpSession> {
        let addr = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|e| Error::connection_with_source("failed to resolve host", e))?
            .next()
            .ok_or_else(|| Error::connection("host resolved to no addresses"))?;

        if config.use_sftp {
            let tcp = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
                .map_err(|e| Error::connection_with_source("SFTP TCP connect failed", e))?;
            let mut session = Session::new()
                .map_err(|e| Error::connection_with_source("failed to create SSH session", e))?;
            session.set_tcp_stream(tcp);
            session
                .handshake()
                .map_err(|e| Error::connection_with_source("SSH handshake failed", e))?;
            session
                .userauth_password(&config.username, &config.password)
                .map_err(|e| Error::connection_with_source("SFTP authentication failed", e))?;
            Ok(FtpSession::Secure(session))
        } else {
            let mut ftp = FtpStream::connect_timeout(addr, CONNECT_TIMEOUT)
                .map_err(|e| Error::connection_with_source("FTP connect failed", e))?;
            ftp.login(&config.username, &config.password)
                .map_err(|e| Error::connection_with_source("FTP login failed", e))?;
            Ok(FtpSession::Plain(ftp))
        }
    }

    fn upload(session: &mut FtpSession, dir: &str, remote_path: &str, bytes: &[u8]) -> Result<()> {
        match session {
            FtpSession::Plain(ftp) => {
                // Advisory directory creation
                let _ = ftp.mkdir(dir);
                ftp.put_file(remote_path, &mut Cursor::new(bytes))
                    .map_err(|e| Error::send_with_source("FTP upload failed", e))?;
            }
            FtpSession::Secure(session) => {
                let sftp = session
                    .sftp()
                    .map_err(|e| Error::send_with_source("failed to open SFTP channel", e))?;
                let _ = sftp.mkdir(Path::new(dir), 0o755);
                let mut remote = sftp
                    .create(Path::new(remote_path))
                    .map_err(|e| Error::send_with_source("failed to create remote file", e))?;
                remote
                    .write_all(bytes)
                    .map_err(|e| Error::send_with_source("SFTP write failed", e))?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TargetConnector for FtpConnector {
    fn kind(&self) -> &'static str {
        "ftp"
    }

    async fn connect(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }

        let config = self.config.clone();
        let session = tokio::task::spawn_blocking(move || Self::dial(&config))
            .await
            .map_err(Error::internal)??;

        debug!(
            "{} session established with {}:{}",
            if self.config.use_sftp { "SFTP" } else { "FTP" },
            self.config.host,
            self.config.port
        );
        self.session = Some(session);
        Ok(())
    }

    async fn send(&mut self, payload: &JsonMap) -> Result<()> {
        let mut session = self
            .session
            .take()
            .ok_or_else(|| Error::connection("file-transfer session is not connected"))?;

        let bytes = serde_json::to_vec_pretty(&Value::Object(payload.clone()))?;
        let dir = self.config.path.clone();
        let remote_path = Self::remote_path(&dir, &Self::payload_filename());

        let (session, result) = tokio::task::spawn_blocking(move || {
            let result = Self::upload(&mut session, &dir, &remote_path, &bytes);
            (session, result)
        })
        .await
        .map_err(Error::internal)?;

        match result {
            Ok(()) => {
                self.session = Some(session);
                Ok(())
            }
            Err(e) => {
                // Drop the session so the next tick dials a fresh one
                Err(e)
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = tokio::task::spawn_blocking(move || match session {
                FtpSession::Plain(mut ftp) => {
                    let _ = ftp.quit();
                }
                FtpSession::Secure(session) => {
                    let _ = session.disconnect(None, "shutting down", None);
                }
            })
            .await;
        }
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> FtpTargetConfig {
        FtpTargetConfig {
            host: "files.local".to_string(),
            port: 21,
            username: "uploader".to_string(),
            password: "secret".to_string(),
            path: "/ingest".to_string(),
            use_sftp: false,
        }
    }

    #[test]
    fn test_validate_requires_host_and_username() {
        let mut c = config();
        c.host = String::new();
        assert!(c.validate().is_err());

        let mut c = config();
        c.username = String::new();
        assert!(c.validate().is_err());

        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_payload_filename_format() {
        let name = FtpConnector::payload_filename();
        assert!(name.starts_with("payload_"));
        assert!(name.ends_with(".json"));
        // payload_YYYYMMDD_HHMMSS_ffffff.json
        let stem = name
            .strip_prefix("payload_")
            .unwrap()
            .strip_suffix(".json")
            .unwrap();
        let parts: Vec<_> = stem.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 8);
        assert_eq!(parts[1].len(), 6);
        assert_eq!(parts[2].len(), 6);
    }

    #[test]
    fn test_remote_path_join() {
        assert_eq!(
            FtpConnector::remote_path("/ingest", "payload_x.json"),
            "/ingest/payload_x.json"
        );
        assert_eq!(
            FtpConnector::remote_path("/ingest/", "payload_x.json"),
            "/ingest/payload_x.json"
        );
        assert_eq!(
            FtpConnector::remote_path("/", "payload_x.json"),
            "/payload_x.json"
        );
    }

    #[tokio::test]
    async fn test_send_without_session_is_connection_error() {
        let mut connector = FtpConnector::new(config()).unwrap();
        let err = connector.send(&JsonMap::new()).await.unwrap_err();
        assert!(err.is_connection_error());
    }
}
