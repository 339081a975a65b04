//! Distributing handler work across child processes.
//!
//! The parallel dispatcher hashes each message's channel onto one of N
//! children, so all messages of a channel land in the same process.
//! Children own their handlers, their archive records, and their caches;
//! the parent routes messages over the child's stdin/stdout as
//! line-delimited JSON, batching up to `pending_limit` requests before
//! demanding a synchronous response carrying accumulated acks (and a
//! possible error).
//!
//! A child that cannot decode a request reports the last message id it
//! decoded successfully, letting the parent name the offending message.

use std::cell::RefCell;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::rc::Rc;

use dwc_core::{Channel, Message};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::dispatch::{DispatchSink, Dispatcher, HandlerError, Source, SourceRef};

// ---------------------------------------------------------------------------
// Wire protocol
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub enum ChildRequest {
    Message {
        msgid: u64,
        channel: Channel,
        message: Message,
        ttl: i64,
    },
    SyncResponse,
    Flush,
    Terminate,
    Exit,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct ChildResponse {
    pub acks: Vec<u64>,
    pub error: Option<ChildFailure>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChildFailure {
    pub detail: String,
    /// Set when the child failed to decode a request: the last message
    /// id it did decode (the offender is most likely the next one).
    pub last_seen_msgid: Option<u64>,
}

// ---------------------------------------------------------------------------
// Parent side
// ---------------------------------------------------------------------------

/// How to launch a handler worker.
#[derive(Debug, Clone)]
pub struct ChildSpawnConfig {
    pub exe: PathBuf,
    pub config: Option<PathBuf>,
    pub server: String,
    pub output_dir: PathBuf,
}

struct ChildConnector {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    pending_limit: usize,
    pending_count: usize,
    messages: HashMap<u64, (Channel, Message, SourceRef)>,
    message_id: u64,
}

impl ChildConnector {
    fn spawn(spawn: &ChildSpawnConfig, index: usize, pending_limit: usize) -> std::io::Result<ChildConnector> {
        let mut cmd = Command::new(&spawn.exe);
        cmd.arg("handler-worker")
            .arg("--server")
            .arg(&spawn.server)
            .arg("--output-dir")
            .arg(&spawn.output_dir)
            .arg("--index")
            .arg(index.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped());
        if let Some(config) = &spawn.config {
            cmd.arg("--password-file").arg(config);
        }
        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        Ok(ChildConnector {
            child,
            stdin: BufWriter::new(stdin),
            stdout: BufReader::new(stdout),
            pending_limit,
            pending_count: pending_limit,
            messages: HashMap::new(),
            message_id: 0,
        })
    }

    fn send_message(
        &mut self,
        channel: Channel,
        message: Message,
        source: SourceRef,
        ttl: i64,
    ) -> Result<(), HandlerError> {
        if ttl <= 0 {
            self.async_message(channel, message, source, ttl)?;
            self.sync_response()
        } else {
            source.borrow_mut().nack_message(&channel, &message)?;
            self.async_message(channel, message, source, ttl)
        }
    }

    fn async_message(
        &mut self,
        channel: Channel,
        message: Message,
        source: SourceRef,
        ttl: i64,
    ) -> Result<(), HandlerError> {
        self.message_id += 1;
        let msgid = self.message_id;
        let request = ChildRequest::Message {
            msgid,
            channel,
            message: message.clone(),
            ttl,
        };
        self.messages.insert(msgid, (channel, message, source));
        self.async_request(&request)
    }

    fn async_request(&mut self, request: &ChildRequest) -> Result<(), HandlerError> {
        if self.pending_count == 0 {
            self.sync_response()?;
        }
        let line = serde_json::to_string(request)
            .map_err(|e| HandlerError::Fatal(format!("cannot encode request: {e}")))?;
        writeln!(self.stdin, "{line}")?;
        self.pending_count -= 1;
        Ok(())
    }

    /// Demand a synchronous response and apply the acknowledgements it
    /// carries.
    fn sync_response(&mut self) -> Result<(), HandlerError> {
        let line = serde_json::to_string(&ChildRequest::SyncResponse)
            .map_err(|e| HandlerError::Fatal(format!("cannot encode request: {e}")))?;
        writeln!(self.stdin, "{line}")?;
        self.stdin.flush()?;

        let mut response_line = String::new();
        let n = self
            .stdout
            .read_line(&mut response_line)
            .map_err(|e| HandlerError::Fatal(format!("worker pipe read failed: {e}")))?;
        if n == 0 {
            return Err(HandlerError::Fatal("handler worker closed its pipe".into()));
        }
        let response: ChildResponse = serde_json::from_str(&response_line)
            .map_err(|e| HandlerError::Fatal(format!("unreadable worker response: {e}")))?;

        for ackid in response.acks {
            match self.messages.remove(&ackid) {
                Some((channel, message, source)) => {
                    source.borrow_mut().ack_message(&channel, &message)?;
                }
                None => warn!("ack for an unknown message id {ackid}"),
            }
        }
        if let Some(failure) = response.error {
            let detail = match failure.last_seen_msgid {
                Some(last) => match self.messages.get(&(last + 1)) {
                    Some((channel, message, _)) => format!(
                        "failed to transfer a message; pending channel={channel:?}, \
                         message kind={:?}: {}",
                        message.kind(),
                        failure.detail
                    ),
                    None => failure.detail,
                },
                None => failure.detail,
            };
            return Err(HandlerError::Fatal(detail));
        }
        self.pending_count = self.pending_limit;
        Ok(())
    }

    fn flush_begin(&mut self) -> Result<(), HandlerError> {
        self.async_request(&ChildRequest::Flush)
    }

    fn flush_end(&mut self) -> Result<(), HandlerError> {
        self.sync_response()
    }

    fn terminate(&mut self) -> Result<(), HandlerError> {
        self.async_request(&ChildRequest::Terminate)
    }

    fn close(mut self) -> Result<(), HandlerError> {
        if self.pending_count != self.pending_limit {
            if let Err(e) = self.sync_response() {
                warn!("unhandled error in handler worker: {e}");
            }
        }
        let line = serde_json::to_string(&ChildRequest::Exit)
            .map_err(|e| HandlerError::Fatal(format!("cannot encode request: {e}")))?;
        writeln!(self.stdin, "{line}")?;
        self.stdin.flush()?;
        drop(self.stdin);
        let status = self.child.wait()?;
        if !status.success() {
            return Err(HandlerError::Fatal(format!(
                "handler worker exited with {status}"
            )));
        }
        Ok(())
    }
}

/// Routes messages to N handler worker processes by channel hash.
pub struct ParallelDispatcher {
    n_children: usize,
    pending_limit: usize,
    spawn: ChildSpawnConfig,
    children: Option<Vec<ChildConnector>>,
}

impl ParallelDispatcher {
    pub fn new(n_children: usize, pending_limit: usize, spawn: ChildSpawnConfig) -> ParallelDispatcher {
        ParallelDispatcher {
            n_children: n_children.max(1),
            pending_limit: pending_limit.max(1),
            spawn,
            children: None,
        }
    }

    fn start(&mut self) -> Result<&mut Vec<ChildConnector>, HandlerError> {
        if self.children.is_none() {
            let mut children = Vec::with_capacity(self.n_children);
            for i in 0..self.n_children {
                children.push(ChildConnector::spawn(&self.spawn, i, self.pending_limit)?);
            }
            self.children = Some(children);
        }
        Ok(self.children.as_mut().expect("just started"))
    }

    /// Stop all workers and wait for them to exit. Flush first.
    pub fn shutdown(&mut self) -> Result<(), HandlerError> {
        let Some(children) = self.children.take() else {
            return Ok(());
        };
        let mut first_error = None;
        for child in children {
            if let Err(e) = child.close() {
                warn!("{e}");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl DispatchSink for ParallelDispatcher {
    fn send_message(
        &mut self,
        channel: Channel,
        msg: Message,
        source: SourceRef,
        ttl: i64,
    ) -> Result<(), HandlerError> {
        let n = self.n_children;
        let children = self.start()?;
        let mut hasher = DefaultHasher::new();
        channel.hash(&mut hasher);
        let k = (hasher.finish() as usize) % n;
        children[k].send_message(channel, msg, source, ttl)
    }

    fn flush(&mut self) -> Result<(), HandlerError> {
        let children = self.start()?;
        for child in children.iter_mut() {
            child.flush_begin()?;
        }
        for child in children.iter_mut() {
            child.flush_end()?;
        }
        Ok(())
    }

    fn terminate(&mut self) -> Result<(), HandlerError> {
        let children = self.start()?;
        for child in children.iter_mut() {
            child.terminate()?;
        }
        for child in children.iter_mut() {
            child.sync_response()?;
        }
        Ok(())
    }
}

impl Drop for ParallelDispatcher {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("shutting down handler workers: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Child side
// ---------------------------------------------------------------------------

/// The child's upstream stand-in: collects message ids as the local
/// dispatcher acknowledges them, for the next sync response.
#[derive(Default)]
pub struct ChildAckSource {
    ids: HashMap<(Channel, Message), u64>,
    acks: Vec<u64>,
}

impl ChildAckSource {
    fn register(&mut self, channel: Channel, message: Message, msgid: u64) {
        self.ids.insert((channel, message), msgid);
    }

    fn take_acks(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.acks)
    }
}

impl Source for ChildAckSource {
    fn ack_message(&mut self, channel: &Channel, msg: &Message) -> Result<(), HandlerError> {
        match self.ids.remove(&(*channel, msg.clone())) {
            Some(msgid) => self.acks.push(msgid),
            None => warn!("ack for an unknown message"),
        }
        Ok(())
    }

    fn nack_message(&mut self, _channel: &Channel, _msg: &Message) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Run a handler worker's main loop over stdin/stdout. Returns when the
/// parent says exit or closes the pipe.
pub fn child_main(mut dispatcher: Dispatcher) -> Result<(), HandlerError> {
    let ack_source = Rc::new(RefCell::new(ChildAckSource::default()));
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut last_msgid: u64 = 0;
    let mut failure: Option<ChildFailure> = None;

    for line in stdin.lock().lines() {
        let line = line?;
        let request = serde_json::from_str::<ChildRequest>(&line);
        match request {
            Ok(ChildRequest::Exit) => return Ok(()),
            Ok(ChildRequest::SyncResponse) => {
                let response = ChildResponse {
                    acks: ack_source.borrow_mut().take_acks(),
                    error: failure.take(),
                };
                let mut out = stdout.lock();
                let encoded = serde_json::to_string(&response)
                    .map_err(|e| HandlerError::Fatal(format!("cannot encode response: {e}")))?;
                writeln!(out, "{encoded}")?;
                out.flush()?;
            }
            _ if failure.is_some() => {
                // After a failure, only sync/exit matter; everything
                // else drains unprocessed.
            }
            Ok(ChildRequest::Message {
                msgid,
                channel,
                message,
                ttl,
            }) => {
                last_msgid = msgid;
                ack_source
                    .borrow_mut()
                    .register(channel, message.clone(), msgid);
                let source: SourceRef = Rc::clone(&ack_source) as SourceRef;
                if let Err(e) = dispatcher.send_message(channel, message, source, ttl) {
                    failure = Some(ChildFailure {
                        detail: e.to_string(),
                        last_seen_msgid: None,
                    });
                }
            }
            Ok(ChildRequest::Flush) => {
                if let Err(e) = dispatcher.flush() {
                    failure = Some(ChildFailure {
                        detail: e.to_string(),
                        last_seen_msgid: None,
                    });
                }
            }
            Ok(ChildRequest::Terminate) => {
                if let Err(e) = dispatcher.terminate() {
                    failure = Some(ChildFailure {
                        detail: e.to_string(),
                        last_seen_msgid: None,
                    });
                }
            }
            Err(e) => {
                failure = Some(ChildFailure {
                    detail: format!("cannot decode request: {e}"),
                    last_seen_msgid: Some(last_msgid),
                });
            }
        }
    }
    Ok(())
}
