//! Exec sessions shared by the JSON-RPC tunnel and the legacy attach socket.
//!
//! Sessions are addressed only by `SessionId`; both connection paths resolve
//! them through the same `SessionRegistry`.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use mexec_events::{Bus, Event};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const OUTPUT_CHANNEL_CAPACITY: usize = 1024;
const INPUT_CHANNEL_CAPACITY: usize = 64;
const READ_CHUNK: usize = 4096;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub(crate) struct SessionId(String);

impl SessionId {
    fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct ExecRequest {
    pub cmd: Vec<String>,
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub(crate) enum SessionStatus {
    Pending,
    Running { pid: Option<u32> },
    Exited { code: Option<i32> },
    Failed { detail: String },
}

impl SessionStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, SessionStatus::Exited { .. } | SessionStatus::Failed { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ExecError {
    #[error("command must not be empty")]
    EmptyCommand,
    #[error("terminal size must be non-zero")]
    InvalidSize,
    #[error("failed to start process: {0}")]
    Spawn(String),
    #[error("session input is closed")]
    InputClosed,
}

pub(crate) struct ExecSession {
    id: SessionId,
    request: ExecRequest,
    status: RwLock<SessionStatus>,
    size: RwLock<(u16, u16)>,
    output: broadcast::Sender<String>,
    history: Mutex<VecDeque<String>>,
    replay_limit: usize,
    input_tx: mpsc::Sender<String>,
    input_rx: Mutex<Option<mpsc::Receiver<String>>>,
    done: CancellationToken,
}

impl ExecSession {
    fn new(request: ExecRequest, replay_limit: usize) -> Self {
        let (output, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        let (input_tx, input_rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);
        Self {
            id: SessionId::generate(),
            size: RwLock::new((request.cols, request.rows)),
            request,
            status: RwLock::new(SessionStatus::Pending),
            output,
            history: Mutex::new(VecDeque::new()),
            replay_limit,
            input_tx,
            input_rx: Mutex::new(Some(input_rx)),
            done: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn request(&self) -> &ExecRequest {
        &self.request
    }

    pub fn status(&self) -> SessionStatus {
        self.status.read().clone()
    }

    pub fn size(&self) -> (u16, u16) {
        *self.size.read()
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), ExecError> {
        if cols == 0 || rows == 0 {
            return Err(ExecError::InvalidSize);
        }
        *self.size.write() = (cols, rows);
        Ok(())
    }

    fn set_status(&self, status: SessionStatus) {
        let finished = status.is_finished();
        *self.status.write() = status;
        if finished {
            self.done.cancel();
        }
    }

    /// Resolves once the process has exited or failed.
    pub async fn finished(&self) {
        self.done.cancelled().await
    }

    pub fn push_output(&self, chunk: String) {
        let mut history = self.history.lock();
        if self.replay_limit > 0 {
            if history.len() == self.replay_limit {
                history.pop_front();
            }
            history.push_back(chunk.clone());
        }
        // no live readers is fine; history still holds the chunk
        let _ = self.output.send(chunk);
    }

    /// Buffered output plus a receiver for everything after it.
    pub fn attach_output(&self) -> (Vec<String>, broadcast::Receiver<String>) {
        let history = self.history.lock();
        (history.iter().cloned().collect(), self.output.subscribe())
    }

    pub async fn send_input(&self, text: String) -> Result<(), ExecError> {
        if self.status().is_finished() {
            return Err(ExecError::InputClosed);
        }
        self.input_tx
            .send(text)
            .await
            .map_err(|_| ExecError::InputClosed)
    }

    fn take_input(&self) -> Option<mpsc::Receiver<String>> {
        self.input_rx.lock().take()
    }
}

pub(crate) struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<ExecSession>>>,
    replay_limit: usize,
}

impl SessionRegistry {
    pub fn new(replay_limit: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            replay_limit,
        }
    }

    pub fn create(&self, request: ExecRequest) -> Result<Arc<ExecSession>, ExecError> {
        if request.cmd.first().map_or(true, |program| program.trim().is_empty()) {
            return Err(ExecError::EmptyCommand);
        }
        if request.cols == 0 || request.rows == 0 {
            return Err(ExecError::InvalidSize);
        }
        let session = Arc::new(ExecSession::new(request, self.replay_limit));
        self.sessions
            .write()
            .insert(session.id().clone(), session.clone());
        debug!(session = %session.id(), "exec session registered");
        Ok(session)
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<ExecSession>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }
}

/// Starts the process behind a registered session.
#[async_trait]
pub(crate) trait ExecBackend: Send + Sync {
    async fn start(&self, session: Arc<ExecSession>) -> Result<(), ExecError>;
}

/// Runs the command as a plain child process with piped stdio and reports
/// lifecycle events on the bus.
pub(crate) struct ProcessBackend {
    bus: Bus,
}

impl ProcessBackend {
    pub fn new(bus: Bus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl ExecBackend for ProcessBackend {
    async fn start(&self, session: Arc<ExecSession>) -> Result<(), ExecError> {
        let request = session.request();
        let Some((program, args)) = request.cmd.split_first() else {
            return Err(ExecError::EmptyCommand);
        };
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = request.cwd.as_deref() {
            command.current_dir(cwd);
        }
        if request.tty {
            debug!(session = %session.id(), "tty requested; running without a pty");
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                let detail = err.to_string();
                warn!(session = %session.id(), %program, %detail, "failed to spawn exec process");
                session.set_status(SessionStatus::Failed {
                    detail: detail.clone(),
                });
                self.bus
                    .publish(Event::exec_error(session.id().as_str(), &detail));
                return Err(ExecError::Spawn(detail));
            }
        };

        let pid = child.id();
        session.set_status(SessionStatus::Running { pid });
        info!(session = %session.id(), ?pid, %program, "exec process started");

        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump_output(session.clone(), stdout)));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump_output(session.clone(), stderr)));
        }
        if let (Some(mut stdin), Some(mut input)) = (child.stdin.take(), session.take_input()) {
            let id = session.id().clone();
            tokio::spawn(async move {
                while let Some(text) = input.recv().await {
                    if let Err(err) = stdin.write_all(text.as_bytes()).await {
                        debug!(session = %id, %err, "stdin closed");
                        break;
                    }
                }
            });
        }

        let bus = self.bus.clone();
        tokio::spawn(async move {
            let waited = child.wait().await;
            // flush remaining output before announcing the exit
            for pump in pumps {
                let _ = pump.await;
            }
            match waited {
                Ok(status) => {
                    let code = status.code();
                    info!(session = %session.id(), ?code, "exec process exited");
                    session.set_status(SessionStatus::Exited { code });
                    bus.publish(Event::exec_exit(session.id().as_str(), code));
                }
                Err(err) => {
                    let detail = err.to_string();
                    warn!(session = %session.id(), %detail, "failed to wait for exec process");
                    session.set_status(SessionStatus::Failed {
                        detail: detail.clone(),
                    });
                    bus.publish(Event::exec_error(session.id().as_str(), &detail));
                }
            }
        });
        Ok(())
    }
}

async fn pump_output<R>(session: Arc<ExecSession>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => session.push_output(String::from_utf8_lossy(&buf[..n]).into_owned()),
            Err(err) => {
                debug!(session = %session.id(), %err, "output stream ended");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mexec_events::EventKind;
    use std::time::Duration;
    use tokio::time::timeout;

    fn request(cmd: &[&str]) -> ExecRequest {
        ExecRequest {
            cmd: cmd.iter().map(|s| s.to_string()).collect(),
            tty: false,
            cwd: None,
            cols: 80,
            rows: 24,
        }
    }

    #[test]
    fn registry_rejects_empty_commands_and_sizes() {
        let registry = SessionRegistry::new(8);
        assert!(matches!(
            registry.create(request(&[])),
            Err(ExecError::EmptyCommand)
        ));
        let mut zero = request(&["true"]);
        zero.cols = 0;
        assert!(matches!(registry.create(zero), Err(ExecError::InvalidSize)));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn sessions_are_found_by_id() {
        let registry = SessionRegistry::new(8);
        let session = registry.create(request(&["true"])).unwrap();
        let found = registry.get(session.id()).unwrap();
        assert!(Arc::ptr_eq(&found, &session));
        assert!(registry.get(&SessionId::from("missing")).is_none());
        assert_eq!(session.status(), SessionStatus::Pending);
    }

    #[test]
    fn resize_validates_and_records() {
        let registry = SessionRegistry::new(8);
        let session = registry.create(request(&["true"])).unwrap();
        session.resize(120, 40).unwrap();
        assert_eq!(session.size(), (120, 40));
        assert!(matches!(session.resize(0, 10), Err(ExecError::InvalidSize)));
        assert_eq!(session.size(), (120, 40));
    }

    #[test]
    fn replay_buffer_is_bounded() {
        let registry = SessionRegistry::new(2);
        let session = registry.create(request(&["true"])).unwrap();
        for chunk in ["a", "b", "c"] {
            session.push_output(chunk.into());
        }
        let (replay, _rx) = session.attach_output();
        assert_eq!(replay, vec!["b".to_string(), "c".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_exit_is_published_with_code() {
        let bus = Bus::new();
        let mut sub = bus.subscribe(&EventKind::ALL);
        let registry = SessionRegistry::new(16);
        let session = registry
            .create(request(&["sh", "-c", "echo out; exit 3"]))
            .unwrap();
        ProcessBackend::new(bus.clone())
            .start(session.clone())
            .await
            .unwrap();

        let ev = timeout(Duration::from_secs(5), sub.recv()).await.unwrap().unwrap();
        assert_eq!(ev.kind, EventKind::ExecExit);
        assert_eq!(ev.payload["id"], session.id().as_str());
        assert_eq!(ev.payload["code"], 3);
        assert_eq!(session.status(), SessionStatus::Exited { code: Some(3) });
        let (replay, _) = session.attach_output();
        assert_eq!(replay.concat(), "out\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn input_reaches_the_process() {
        let bus = Bus::new();
        let registry = SessionRegistry::new(16);
        let session = registry
            .create(request(&["sh", "-c", "read line; echo got:$line"]))
            .unwrap();
        ProcessBackend::new(bus).start(session.clone()).await.unwrap();
        session.send_input("hello\n".into()).await.unwrap();
        timeout(Duration::from_secs(5), session.finished()).await.unwrap();
        let (replay, _) = session.attach_output();
        assert_eq!(replay.concat(), "got:hello\n");
        assert!(matches!(
            session.send_input("late\n".into()).await,
            Err(ExecError::InputClosed)
        ));
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let bus = Bus::new();
        let mut sub = bus.subscribe(&EventKind::ALL);
        let registry = SessionRegistry::new(16);
        let session = registry
            .create(request(&["/definitely/not/a/binary"]))
            .unwrap();
        let err = ProcessBackend::new(bus.clone())
            .start(session.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Spawn(_)));
        assert!(matches!(session.status(), SessionStatus::Failed { .. }));
        let ev = timeout(Duration::from_secs(1), sub.recv()).await.unwrap().unwrap();
        assert_eq!(ev.kind, EventKind::ExecError);
        assert_eq!(ev.payload["id"], session.id().as_str());
    }
}
