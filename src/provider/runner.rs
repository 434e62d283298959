use crate::provider::activity::describe_tool;
use crate::provider::invocation::WorkerInvocation;
use crate::provider::stream::{parse_line, ContentBlock, StreamEvent, StreamLine};
use crate::provider::types::{WorkerError, NO_RESPONSE_SENTINEL, TIMEOUT_MARKER};
use crate::runtime::START_HANDOFF_ENV;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

const READ_POLL: Duration = Duration::from_millis(25);
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(500);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}

/// State shared between the thread driving a run and the threads that may
/// interrupt it. Text is only appended while the run is not cancelled, so a
/// snapshot taken by [`RunControl::cancel`] is exactly what the operator saw.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    cancelled: Arc<AtomicBool>,
    partial: Arc<Mutex<String>>,
    child: Arc<Mutex<Option<Child>>>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        let mut partial = lock(&self.partial);
        partial.clear();
        self.cancelled.store(false, Ordering::SeqCst);
    }

    pub fn clear_partial(&self) {
        lock(&self.partial).clear();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Marks the run cancelled, returns the text accumulated so far and kills
    /// the live child, if any.
    pub fn cancel(&self) -> String {
        let snapshot = {
            let partial = lock(&self.partial);
            self.cancelled.store(true, Ordering::SeqCst);
            partial.clone()
        };
        self.kill();
        snapshot
    }

    pub fn partial_snapshot(&self) -> String {
        lock(&self.partial).clone()
    }

    /// Returns `true` when a live child was signalled.
    pub fn kill(&self) -> bool {
        match lock(&self.child).as_mut() {
            Some(child) => child.kill().is_ok(),
            None => false,
        }
    }

    pub fn has_child(&self) -> bool {
        lock(&self.child).is_some()
    }

    fn append(&self, text: &str) {
        let mut partial = lock(&self.partial);
        if self.cancelled.load(Ordering::SeqCst) || text.is_empty() {
            return;
        }
        if !partial.is_empty() {
            partial.push('\n');
        }
        partial.push_str(text);
    }

    fn try_wait(&self) -> Result<Option<ExitStatus>, WorkerError> {
        match lock(&self.child).as_mut() {
            Some(child) => child.try_wait().map_err(|source| WorkerError::Io {
                context: "polling worker status".to_string(),
                source,
            }),
            None => Ok(None),
        }
    }

    fn wait(&self) -> Result<Option<ExitStatus>, WorkerError> {
        match lock(&self.child).as_mut() {
            Some(child) => child.wait().map(Some).map_err(|source| WorkerError::Io {
                context: "waiting for worker exit".to_string(),
                source,
            }),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub reply: String,
    pub session_id: Option<String>,
    pub timed_out: bool,
}

#[derive(Debug, Default)]
struct StreamAccumulator {
    session_id: Option<String>,
    result_text: Option<String>,
    result_is_error: bool,
    result_subtype: Option<String>,
}

impl StreamAccumulator {
    fn handle_line(
        &mut self,
        line: &str,
        control: &RunControl,
        on_activity: &mut dyn FnMut(String),
    ) {
        let Some(parsed) = parse_line(line) else {
            return;
        };
        let event = match parsed {
            StreamLine::Raw(raw) => {
                control.append(&raw);
                return;
            }
            StreamLine::Event(event) => event,
        };

        match event {
            StreamEvent::System { session_id, .. } => {
                if session_id.is_some() {
                    self.session_id = session_id;
                }
            }
            StreamEvent::Assistant { message } => {
                for block in message.content {
                    match block {
                        ContentBlock::Text { text } => control.append(&text),
                        ContentBlock::ToolUse { name, input } => {
                            if !control.is_cancelled() {
                                on_activity(describe_tool(&name, &input));
                            }
                        }
                        ContentBlock::Other => {}
                    }
                }
            }
            StreamEvent::Result {
                subtype,
                result,
                session_id,
                is_error,
            } => {
                if session_id.is_some() {
                    self.session_id = session_id;
                }
                self.result_text = result;
                self.result_is_error = is_error;
                self.result_subtype = subtype;
            }
            StreamEvent::User { .. } | StreamEvent::Unknown => {}
        }
    }

    fn drain(
        &mut self,
        lines: &Receiver<String>,
        control: &RunControl,
        on_activity: &mut dyn FnMut(String),
    ) {
        while let Ok(line) = lines.recv_timeout(EXIT_DRAIN_GRACE) {
            self.handle_line(&line, control, on_activity);
        }
    }
}

/// Runs one worker process to completion, timeout or cancellation.
///
/// `on_spawn` receives the child pid as soon as the process exists;
/// `on_activity` receives a description of every tool call.
pub fn run_worker(
    invocation: &WorkerInvocation,
    request: &str,
    timeout: Duration,
    control: &RunControl,
    on_spawn: &mut dyn FnMut(u32),
    on_activity: &mut dyn FnMut(String),
) -> Result<RunOutcome, WorkerError> {
    let mut command = Command::new(&invocation.binary);
    command
        .current_dir(&invocation.cwd)
        .args(&invocation.args)
        .env_remove(START_HANDOFF_ENV)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(WorkerError::MissingBinary {
                binary: invocation.binary.clone(),
            })
        }
        Err(source) => {
            return Err(WorkerError::Spawn {
                binary: invocation.binary.clone(),
                source,
            })
        }
    };

    let pid = child.id();
    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    *lock(&control.child) = Some(child);
    if control.is_cancelled() {
        control.kill();
    }
    on_spawn(pid);

    let request = request.to_string();
    thread::spawn(move || {
        if let Some(mut stdin) = stdin {
            let _ = stdin.write_all(request.as_bytes());
        }
    });

    let (line_tx, line_rx) = mpsc::channel::<String>();
    if let Some(stdout) = stdout {
        thread::spawn(move || {
            for_each_line(stdout, |line| line_tx.send(line).is_ok());
        });
    } else {
        drop(line_tx);
    }

    let stderr_buf = Arc::new(Mutex::new(String::new()));
    let stderr_reader = stderr.map(|stderr| {
        let buf = Arc::clone(&stderr_buf);
        thread::spawn(move || {
            for_each_line(stderr, |line| {
                let mut buf = lock(&buf);
                buf.push_str(&line);
                buf.push('\n');
                true
            });
        })
    });

    let mut stream = StreamAccumulator::default();
    let deadline = Instant::now() + timeout;
    let mut stdout_open = true;
    let mut timed_out = false;
    let status = loop {
        if stdout_open {
            match line_rx.recv_timeout(READ_POLL) {
                Ok(line) => stream.handle_line(&line, control, on_activity),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => stdout_open = false,
            }
        } else {
            thread::sleep(READ_POLL);
        }

        if let Some(status) = control.try_wait()? {
            stream.drain(&line_rx, control, on_activity);
            break Some(status);
        }

        if Instant::now() >= deadline {
            timed_out = true;
            control.kill();
            let status = control.wait()?;
            stream.drain(&line_rx, control, on_activity);
            break status;
        }
    };
    lock(&control.child).take();

    if let Some(handle) = stderr_reader {
        let waited = Instant::now();
        while !handle.is_finished() && waited.elapsed() < EXIT_DRAIN_GRACE {
            thread::sleep(Duration::from_millis(10));
        }
    }
    let stderr = lock(&stderr_buf).trim().to_string();

    if control.is_cancelled() {
        return Err(WorkerError::Interrupted);
    }

    let partial = control.partial_snapshot();
    if timed_out {
        if partial.trim().is_empty() {
            return Err(WorkerError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        return Ok(RunOutcome {
            reply: format!("{partial}{TIMEOUT_MARKER}"),
            session_id: stream.session_id,
            timed_out: true,
        });
    }

    resolve_reply(partial.trim(), &stream, status, stderr).map(|reply| RunOutcome {
        reply,
        session_id: stream.session_id.clone(),
        timed_out: false,
    })
}

/// Feeds every newline-terminated line to `sink` until EOF, a read error or
/// `sink` returning `false`. Invalid UTF-8 is replaced rather than ending the
/// stream, so the pipe keeps draining and the worker never sees SIGPIPE.
fn for_each_line(source: impl Read, mut sink: impl FnMut(String) -> bool) {
    let mut reader = BufReader::new(source);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
        }
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        if !sink(String::from_utf8_lossy(&buf).into_owned()) {
            break;
        }
    }
}

fn resolve_reply(
    text: &str,
    stream: &StreamAccumulator,
    status: Option<ExitStatus>,
    stderr: String,
) -> Result<String, WorkerError> {
    if !text.is_empty() {
        return Ok(text.to_string());
    }

    let result_text = stream
        .result_text
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if !stream.result_is_error {
        if let Some(result) = result_text {
            return Ok(result.to_string());
        }
    }

    let success = status.map(|s| s.success()).unwrap_or(false);
    if !success {
        let stderr = if stderr.is_empty() {
            result_text.unwrap_or_default().to_string()
        } else {
            stderr
        };
        return Err(WorkerError::NonZeroExit {
            exit_code: status.and_then(|s| s.code()).unwrap_or(-1),
            stderr,
        });
    }

    if stream.result_is_error {
        let message = result_text
            .map(str::to_string)
            .or_else(|| stream.result_subtype.clone())
            .unwrap_or_else(|| "unknown error".to_string());
        return Err(WorkerError::Reported(message));
    }

    Ok(NO_RESPONSE_SENTINEL.to_string())
}
