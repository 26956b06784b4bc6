//! SSH implementation of the remote control channel

use super::{
    parent_dir, shell_quote, ChannelError, CommandOutput, RemoteConnector, RemoteSession,
    RemoteTarget, MISSING_FILE_EXIT_CODE,
};
use crate::models::Credentials;
use async_trait::async_trait;
use russh::client;
use russh_keys::key::PublicKey;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// How unknown server host keys are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostKeyPolicy {
    /// Accept any host key
    #[default]
    AcceptAll,
    /// Only accept keys present in the user's known_hosts
    KnownHosts,
}

struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match self.policy {
            HostKeyPolicy::AcceptAll => Ok(true),
            HostKeyPolicy::KnownHosts => {
                match russh_keys::check_known_hosts(&self.host, self.port, server_public_key) {
                    Ok(known) => Ok(known),
                    Err(e) => {
                        warn!(host = %self.host, error = %e, "Host key verification failed");
                        Ok(false)
                    }
                }
            }
        }
    }
}

/// Opens SSH sessions with russh
#[derive(Debug, Clone, Default)]
pub struct SshConnector {
    policy: HostKeyPolicy,
}

impl SshConnector {
    pub fn new(policy: HostKeyPolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl RemoteConnector for SshConnector {
    async fn connect(
        &self,
        target: &RemoteTarget,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, ChannelError> {
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(timeout),
            ..Default::default()
        });

        let stream = match tokio::time::timeout(
            timeout,
            TcpStream::connect((target.host.as_str(), target.port)),
        )
        .await
        {
            Err(_) => return Err(ChannelError::Timeout(timeout)),
            Ok(Err(e)) => {
                return Err(ChannelError::Unreachable(format!(
                    "{}: {}",
                    target.address(),
                    e
                )))
            }
            Ok(Ok(stream)) => stream,
        };

        let handler = ClientHandler {
            host: target.host.clone(),
            port: target.port,
            policy: self.policy,
        };

        let mut handle = tokio::time::timeout(timeout, client::connect_stream(config, stream, handler))
            .await
            .map_err(|_| ChannelError::Timeout(timeout))?
            .map_err(|e| ChannelError::Protocol(format!("{}: {}", target.address(), e)))?;

        let authenticated = tokio::time::timeout(timeout, authenticate(&mut handle, target))
            .await
            .map_err(|_| ChannelError::Timeout(timeout))??;

        if !authenticated {
            return Err(ChannelError::Auth(format!(
                "authentication rejected for user '{}' on {}",
                target.username,
                target.address()
            )));
        }

        debug!(address = %target.address(), "SSH session established");

        Ok(Box::new(SshSession {
            handle,
            host: target.host.clone(),
            timeout,
        }))
    }
}

async fn authenticate(
    handle: &mut client::Handle<ClientHandler>,
    target: &RemoteTarget,
) -> Result<bool, ChannelError> {
    match &target.credentials {
        Credentials::Password(password) => handle
            .authenticate_password(target.username.as_str(), password.as_str())
            .await
            .map_err(|e| ChannelError::Auth(e.to_string())),
        Credentials::PrivateKey(path) => {
            let key = load_private_key(path).await?;
            handle
                .authenticate_publickey(target.username.as_str(), Arc::new(key))
                .await
                .map_err(|e| ChannelError::Auth(e.to_string()))
        }
    }
}

async fn load_private_key(path: &Path) -> Result<russh_keys::key::KeyPair, ChannelError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ChannelError::Auth(format!("failed to read key {:?}: {}", path, e)))?;

    russh_keys::decode_secret_key(&content, None)
        .map_err(|e| ChannelError::Auth(format!("failed to decode key {:?}: {}", path, e)))
}

/// Raw channel result before text decoding
struct RawOutput {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: Option<u32>,
}

/// Active SSH session
pub struct SshSession {
    handle: client::Handle<ClientHandler>,
    host: String,
    timeout: Duration,
}

impl SshSession {
    async fn exec_raw(&self, command: &str, stdin: Option<&[u8]>) -> Result<RawOutput, ChannelError> {
        tokio::time::timeout(self.timeout, self.exec_inner(command, stdin))
            .await
            .map_err(|_| ChannelError::Timeout(self.timeout))?
    }

    async fn exec_inner(&self, command: &str, stdin: Option<&[u8]>) -> Result<RawOutput, ChannelError> {
        let protocol = |e: russh::Error| ChannelError::Protocol(e.to_string());

        let mut channel = self.handle.channel_open_session().await.map_err(protocol)?;
        channel.exec(true, command).await.map_err(protocol)?;

        if let Some(bytes) = stdin {
            channel.data(bytes).await.map_err(protocol)?;
            channel.eof().await.map_err(protocol)?;
        }

        let mut output = RawOutput {
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: None,
        };

        loop {
            match channel.wait().await {
                Some(russh::ChannelMsg::Data { data }) => {
                    output.stdout.extend_from_slice(&data);
                }
                Some(russh::ChannelMsg::ExtendedData { data, ext }) => {
                    if ext == 1 {
                        output.stderr.extend_from_slice(&data);
                    }
                }
                Some(russh::ChannelMsg::ExitStatus { exit_status }) => {
                    output.exit_code = Some(exit_status);
                }
                Some(russh::ChannelMsg::Close) | None => break,
                _ => {}
            }
        }

        Ok(output)
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn run(&self, command: &str) -> Result<CommandOutput, ChannelError> {
        let raw = self.exec_raw(command, None).await?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&raw.stdout).to_string(),
            stderr: String::from_utf8_lossy(&raw.stderr).to_string(),
            exit_code: raw.exit_code,
        })
    }

    async fn put_file(&self, bytes: &[u8], remote_path: &str) -> Result<(), ChannelError> {
        let write = format!("cat > {}", shell_quote(remote_path));
        let command = match parent_dir(remote_path) {
            Some(dir) => format!("mkdir -p {} && {}", shell_quote(dir), write),
            None => write,
        };

        let raw = self.exec_raw(&command, Some(bytes)).await?;
        if raw.exit_code == Some(0) {
            debug!(host = %self.host, path = %remote_path, size = bytes.len(), "Uploaded file");
            Ok(())
        } else {
            Err(ChannelError::Command(format!(
                "upload to {} failed: {}",
                remote_path,
                String::from_utf8_lossy(&raw.stderr).trim()
            )))
        }
    }

    async fn get_file(&self, remote_path: &str) -> Result<Vec<u8>, ChannelError> {
        let quoted = shell_quote(remote_path);
        let command = format!(
            "if [ -f {path} ]; then cat {path}; else exit {code}; fi",
            path = quoted,
            code = MISSING_FILE_EXIT_CODE
        );

        let raw = self.exec_raw(&command, None).await?;
        match raw.exit_code {
            Some(0) => Ok(raw.stdout),
            Some(MISSING_FILE_EXIT_CODE) => Err(ChannelError::NotFound(remote_path.to_string())),
            _ => Err(ChannelError::Command(format!(
                "download of {} failed: {}",
                remote_path,
                String::from_utf8_lossy(&raw.stderr).trim()
            ))),
        }
    }

    async fn close(self: Box<Self>) -> Result<(), ChannelError> {
        self.handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
            .map_err(|e| ChannelError::Protocol(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_connect_refused_is_unreachable() {
        // Bind then drop to get a local port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let target = RemoteTarget {
            host: "127.0.0.1".into(),
            port,
            username: "locust".into(),
            credentials: Credentials::Password("pw".into()),
        };

        let result = SshConnector::default()
            .connect(&target, Duration::from_secs(2))
            .await;

        assert!(matches!(result, Err(ChannelError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_missing_private_key_is_auth_error() {
        let err = load_private_key(&PathBuf::from("/nonexistent/id_ed25519"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ChannelError::Auth(_)));
    }

    #[test]
    fn test_default_policy_accepts_all() {
        assert_eq!(HostKeyPolicy::default(), HostKeyPolicy::AcceptAll);
    }
}
