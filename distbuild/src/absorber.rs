//! The Absorber role: accepts preprocessed compile requests on a listening
//! socket, queues them for a fixed pool of compile workers, and answers
//! `Overloaded` immediately rather than blocking when the queue is full.

use std::io::Write;
use std::process::Stdio;
use std::sync::Arc;

use bytes::Bytes;
use distbuild_core::event_loop::ConnectionHandle;
use distbuild_core::locked_queue::LockedQueue;
use distbuild_core::metrics::MetricsTable;
use distbuild_core::worker_pool::WorkerPool;
use distbuild_proto::canon::Command;
use distbuild_proto::message::Message;
use tracing::{error, warn};

use crate::config::Settings;
use crate::daemon_role::{DaemonRoleHandler, MetricId, PeerId};
use crate::network_service::send_message;

/// One queued compile job: the request plus where to send the answer.
struct Task {
    command: Command,
    source: Bytes,
    reply: ConnectionHandle,
}

pub struct Absorber {
    settings: Arc<Settings>,
    metrics: Arc<MetricsTable>,
    queue: Arc<LockedQueue<Task>>,
    pool: Option<WorkerPool<Task>>,
}

impl Absorber {
    #[must_use]
    pub fn new(settings: Arc<Settings>, metrics: Arc<MetricsTable>) -> Self {
        let capacity = settings.absorber.threads.saturating_mul(4).max(4);
        Self {
            settings,
            metrics,
            queue: Arc::new(LockedQueue::new(capacity)),
            pool: None,
        }
    }
}

/// Drained and answered directly from `Drop` rather than via `WorkerPool`,
/// so a task that never started compiling gets `Shutting` immediately
/// instead of running to completion during shutdown like an in-flight one.
impl Drop for Absorber {
    fn drop(&mut self) {
        for task in self.queue.close_and_drain() {
            send_message(&task.reply, &Message::Shutting);
        }
        if let Some(pool) = self.pool.take() {
            pool.shutdown();
        }
    }
}

impl DaemonRoleHandler for Absorber {
    fn initialize(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let settings = self.settings.clone();
        let metrics = self.metrics.clone();
        let pool = WorkerPool::new(self.queue.clone(), self.settings.absorber.threads, move |task: Task, _shutting_down| {
            run_task(&settings, &metrics, task);
        });
        self.pool = Some(pool);
        Ok(())
    }

    fn handle_message(&mut self, _peer: PeerId, message: Message, reply: &ConnectionHandle) {
        match message {
            Message::Execute { command, source, .. } => {
                let task = Task {
                    command,
                    source,
                    reply: reply.clone(),
                };
                if self.queue.try_push(task).is_err() {
                    self.metrics.inc(MetricId::RemoteOverloaded.name());
                    send_message(reply, &Message::Overloaded);
                }
            }
            Message::Ping => send_message(reply, &Message::Pong),
            _ => {}
        }
    }
}

/// Runs one compile on a worker thread and replies on the Connection the
/// request arrived on.
///
/// The Emitter's remote-dispatch path is responsible for shaping
/// `command.args` so the compiler reads its translation unit from stdin
/// (e.g. `-x c++-cpp-output -`) — the Absorber never sees the client's
/// original source tree layout, only the preprocessed bytes and an output
/// file name relative to an ephemeral working directory it creates here.
fn run_task(settings: &Settings, metrics: &MetricsTable, task: Task) {
    match compile(settings, &task.command, &task.source) {
        Ok((object, stderr, exit_code)) => {
            metrics.inc(MetricId::LocalCompiles.name());
            send_message(
                &task.reply,
                &Message::Result {
                    object: Some(Bytes::from(object)),
                    stderr: Bytes::from(stderr),
                    exit_code,
                },
            );
        }
        Err(err) => {
            error!(%err, "compile worker failed to run the compiler");
            send_message(
                &task.reply,
                &Message::Result {
                    object: None,
                    stderr: Bytes::from(err.to_string().into_bytes()),
                    exit_code: -1,
                },
            );
        }
    }
}

fn compile(settings: &Settings, command: &Command, source: &Bytes) -> std::io::Result<(Vec<u8>, Vec<u8>, i32)> {
    let workdir = tempfile::Builder::new()
        .prefix(&format!("clangd-{}-", std::process::id()))
        .tempdir()?;

    let mut child = std::process::Command::new(&settings.clang_path)
        .args(&command.args)
        .current_dir(workdir.path())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    child
        .stdin
        .take()
        .expect("stdin was requested as piped")
        .write_all(source)?;

    let output = child.wait_with_output()?;
    let object_name = command.output.as_deref().unwrap_or("a.o");
    let object = std::fs::read(workdir.path().join(object_name)).unwrap_or_default();
    if object.is_empty() && output.status.success() {
        warn!(object_name, "compiler exited 0 but produced no object file");
    }

    Ok((object, output.stderr, output.status.code().unwrap_or(-1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use distbuild_core::event_loop::LoopCommand;
    use distbuild_proto::canon::{Action, FlagBuckets};

    fn noop_command() -> Command {
        Command {
            action: Action::Compile,
            executable: "clang++".into(),
            cwd: "/".into(),
            args: vec![],
            env: vec![],
            inputs: vec![],
            output: None,
            language: None,
            flags: FlagBuckets::default(),
        }
    }

    fn recording_reply() -> (ConnectionHandle, flume::Receiver<LoopCommand>) {
        let (tx, rx) = flume::unbounded();
        (
            ConnectionHandle {
                token: mio::Token(0),
                commands: tx,
            },
            rx,
        )
    }

    /// A task still sitting in the queue when the Absorber is dropped must
    /// be answered with `Shutting` directly, rather than being popped and
    /// run to completion by a worker during shutdown.
    #[test]
    fn drop_answers_queued_task_with_shutting() {
        let settings = Arc::new(Settings::load(None).unwrap());
        let metrics = Arc::new(MetricsTable::new());
        let absorber = Absorber::new(settings, metrics);
        // No `initialize()` call: no worker pool is running, so nothing
        // ever pops this task off the queue except the `Drop` impl itself.
        let (reply, rx) = recording_reply();
        absorber.queue.push(Task {
            command: noop_command(),
            source: Bytes::new(),
            reply,
        });

        drop(absorber);

        let command = rx.try_recv().expect("Drop should have sent a reply");
        let LoopCommand::Send(_, frame) = command else {
            panic!("expected a Send command");
        };
        assert!(matches!(Message::decode(&frame).unwrap(), Message::Shutting));
    }
}
