//! Scripted in-process channel for tests
//!
//! Each host gets a [`HostScript`] describing how connects behave and what
//! commands answer. Uploaded files and executed commands are recorded so tests
//! can assert on them.

use super::{ChannelError, CommandOutput, RemoteConnector, RemoteSession, RemoteTarget};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Behaviour of one scripted host
#[derive(Debug, Clone, Default)]
pub struct HostScript {
    connect_error: Option<ChannelError>,
    responses: Vec<(String, Result<CommandOutput, ChannelError>)>,
    put_error: Option<ChannelError>,
    files: Vec<(String, Vec<u8>)>,
}

impl HostScript {
    /// Host that answers the heartbeat echo and nothing else
    pub fn healthy() -> Self {
        Self::default().respond("echo 'heartbeat'", "heartbeat\n")
    }

    /// Host whose connects always fail
    pub fn refusing(error: ChannelError) -> Self {
        Self {
            connect_error: Some(error),
            ..Default::default()
        }
    }

    /// Answer commands starting with `prefix` with a successful stdout
    pub fn respond(self, prefix: impl Into<String>, stdout: impl Into<String>) -> Self {
        self.respond_with(prefix, Ok(CommandOutput::ok(stdout)))
    }

    pub fn respond_with(
        mut self,
        prefix: impl Into<String>,
        result: Result<CommandOutput, ChannelError>,
    ) -> Self {
        self.responses.push((prefix.into(), result));
        self
    }

    /// Pre-seed a remote file
    pub fn file(mut self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.files.push((path.into(), bytes.into()));
        self
    }

    pub fn failing_uploads(mut self, error: ChannelError) -> Self {
        self.put_error = Some(error);
        self
    }
}

struct HostState {
    script: HostScript,
    files: DashMap<String, Vec<u8>>,
    commands: Mutex<Vec<String>>,
    connects: AtomicUsize,
}

impl HostState {
    fn new(script: HostScript) -> Self {
        let files = DashMap::new();
        for (path, bytes) in &script.files {
            files.insert(path.clone(), bytes.clone());
        }
        Self {
            script,
            files,
            commands: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
        }
    }
}

/// Connector serving scripted hosts. Unknown hosts are unreachable.
#[derive(Default, Clone)]
pub struct ScriptedConnector {
    hosts: Arc<DashMap<String, Arc<HostState>>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(self, host: impl Into<String>, script: HostScript) -> Self {
        self.set_host(host, script);
        self
    }

    /// Replace a host's script, dropping its recorded state
    pub fn set_host(&self, host: impl Into<String>, script: HostScript) {
        self.hosts.insert(host.into(), Arc::new(HostState::new(script)));
    }

    /// Place a file on a host after construction
    pub fn put_remote_file(&self, host: &str, path: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        if let Some(state) = self.hosts.get(host) {
            state.files.insert(path.into(), bytes.into());
        }
    }

    pub fn commands(&self, host: &str) -> Vec<String> {
        self.hosts
            .get(host)
            .and_then(|state| state.commands.lock().ok().map(|c| c.clone()))
            .unwrap_or_default()
    }

    pub fn remote_file(&self, host: &str, path: &str) -> Option<Vec<u8>> {
        self.hosts
            .get(host)
            .and_then(|state| state.files.get(path).map(|f| f.clone()))
    }

    pub fn connect_count(&self, host: &str) -> usize {
        self.hosts
            .get(host)
            .map(|state| state.connects.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

#[async_trait]
impl RemoteConnector for ScriptedConnector {
    async fn connect(
        &self,
        target: &RemoteTarget,
        _timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, ChannelError> {
        let state = self
            .hosts
            .get(&target.host)
            .map(|s| s.clone())
            .ok_or_else(|| ChannelError::Unreachable(target.address()))?;

        state.connects.fetch_add(1, Ordering::SeqCst);

        if let Some(err) = &state.script.connect_error {
            return Err(err.clone());
        }

        Ok(Box::new(ScriptedSession { state }))
    }
}

struct ScriptedSession {
    state: Arc<HostState>,
}

#[async_trait]
impl RemoteSession for ScriptedSession {
    async fn run(&self, command: &str) -> Result<CommandOutput, ChannelError> {
        if let Ok(mut commands) = self.state.commands.lock() {
            commands.push(command.to_string());
        }

        self.state
            .script
            .responses
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, result)| result.clone())
            .unwrap_or_else(|| Ok(CommandOutput::ok("")))
    }

    async fn put_file(&self, bytes: &[u8], remote_path: &str) -> Result<(), ChannelError> {
        if let Some(err) = &self.state.script.put_error {
            return Err(err.clone());
        }
        self.state
            .files
            .insert(remote_path.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get_file(&self, remote_path: &str) -> Result<Vec<u8>, ChannelError> {
        self.state
            .files
            .get(remote_path)
            .map(|f| f.clone())
            .ok_or_else(|| ChannelError::NotFound(remote_path.to_string()))
    }

    async fn close(self: Box<Self>) -> Result<(), ChannelError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Credentials;

    fn target(host: &str) -> RemoteTarget {
        RemoteTarget {
            host: host.into(),
            port: 22,
            username: "locust".into(),
            credentials: Credentials::Password("pw".into()),
        }
    }

    #[tokio::test]
    async fn test_scripted_host_records_commands_and_files() {
        let connector = ScriptedConnector::new().with_host("h1", HostScript::healthy());
        let session = connector
            .connect(&target("h1"), Duration::from_secs(1))
            .await
            .unwrap();

        let out = session.run("echo 'heartbeat'").await.unwrap();
        assert_eq!(out.stdout.trim(), "heartbeat");

        session.put_file(b"print(1)", "/tmp/x.py").await.unwrap();
        assert_eq!(session.get_file("/tmp/x.py").await.unwrap(), b"print(1)");
        assert!(matches!(
            session.get_file("/tmp/missing").await,
            Err(ChannelError::NotFound(_))
        ));
        session.close().await.unwrap();

        assert_eq!(connector.commands("h1"), vec!["echo 'heartbeat'".to_string()]);
        assert_eq!(connector.connect_count("h1"), 1);
        assert_eq!(connector.remote_file("h1", "/tmp/x.py"), Some(b"print(1)".to_vec()));
    }

    #[tokio::test]
    async fn test_unknown_and_refusing_hosts() {
        let connector = ScriptedConnector::new()
            .with_host("bad", HostScript::refusing(ChannelError::Auth("denied".into())));

        assert!(matches!(
            connector.connect(&target("nowhere"), Duration::from_secs(1)).await,
            Err(ChannelError::Unreachable(_))
        ));
        assert!(matches!(
            connector.connect(&target("bad"), Duration::from_secs(1)).await,
            Err(ChannelError::Auth(_))
        ));
    }
}
