use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use std::{process::Stdio, time::Duration};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    process::{Child, ChildStdin, ChildStdout, Command},
    task::JoinHandle,
};

const STDERR_TAIL_BYTES: usize = 16 * 1024;
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("pipeline stage `{which}` exited with status {code:?}: {stderr_tail}")]
    Failed {
        which: String,
        code: Option<i32>,
        stderr_tail: String,
    },
    #[error("pipeline i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A `btrfs send` process and the user's `pipe_through` chain behind it,
/// exposed as a single read-side byte stream. The started pipeline owns every
/// child and guarantees each one is reaped on all exit paths.
pub struct SendPipeline {
    stages: Vec<(String, Command)>,
}

impl SendPipeline {
    pub fn new(send: Command, pipe_through: &[Vec<String>]) -> Self {
        let mut stages = vec![("send".to_string(), send)];
        for argv in pipe_through.iter().filter(|argv| !argv.is_empty()) {
            let mut command = Command::new(&argv[0]);
            command.args(&argv[1..]);
            stages.push((argv[0].clone(), command));
        }
        Self { stages }
    }

    pub fn start(self) -> Result<StartedPipeline, PipelineError> {
        let mut children: Vec<(String, Child)> = Vec::new();
        let mut pumps = Vec::new();
        let mut stderr_tails = Vec::new();
        let mut upstream: Option<ChildStdout> = None;

        for (index, (label, mut command)) in self.stages.into_iter().enumerate() {
            if index > 0 {
                command.stdin(Stdio::piped());
            }
            command.stdout(Stdio::piped());
            command.stderr(Stdio::piped());
            command.kill_on_drop(true);
            let mut child = command.spawn()?;

            if let Some(from) = upstream.take() {
                let to = child.stdin.take().expect("stage stdin is piped");
                pumps.push(spawn_pump(from, to));
            }
            let stderr = child.stderr.take().expect("stage stderr is piped");
            stderr_tails.push(spawn_stderr_tail(stderr));
            upstream = Some(child.stdout.take().expect("stage stdout is piped"));
            children.push((label, child));
        }

        Ok(StartedPipeline {
            children,
            pumps,
            stderr_tails,
            reader: upstream,
        })
    }
}

pub struct StartedPipeline {
    children: Vec<(String, Child)>,
    pumps: Vec<JoinHandle<std::io::Result<()>>>,
    stderr_tails: Vec<JoinHandle<String>>,
    reader: Option<ChildStdout>,
}

impl StartedPipeline {
    /// The read side of the final stage. Taken exactly once.
    pub fn reader(&mut self) -> ChildStdout {
        self.reader.take().expect("pipeline reader is taken once")
    }

    /// Waits for every child. The first stage (in pipeline order) that exited
    /// nonzero fails the operation with its captured stderr tail.
    pub async fn wait(self) -> Result<(), PipelineError> {
        let Self {
            children,
            pumps,
            stderr_tails,
            reader,
        } = self;
        drop(reader);

        let mut failure: Option<PipelineError> = None;
        for ((which, mut child), tail) in children.into_iter().zip(stderr_tails) {
            let status = child.wait().await?;
            let stderr_tail = tail.await.unwrap_or_default();
            if !status.success() && failure.is_none() {
                failure = Some(PipelineError::Failed {
                    which,
                    code: status.code(),
                    stderr_tail,
                });
            }
        }
        for pump in pumps {
            if let Ok(Err(error)) = pump.await {
                if failure.is_none() {
                    failure = Some(PipelineError::Io(error));
                }
            }
        }

        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// SIGTERM to every child, a short drain, SIGKILL for whatever is left.
    pub async fn terminate(mut self) {
        for (_, child) in &self.children {
            if let Some(pid) = child.id() {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }

        let drain = async {
            for (_, child) in self.children.iter_mut() {
                let _ = child.wait().await;
            }
        };
        if tokio::time::timeout(TERMINATE_GRACE, drain).await.is_err() {
            for (_, child) in self.children.iter_mut() {
                let _ = child.start_kill();
            }
            for (_, child) in self.children.iter_mut() {
                let _ = child.wait().await;
            }
        }

        for pump in self.pumps {
            pump.abort();
        }
        for tail in self.stderr_tails {
            tail.abort();
        }
    }
}

fn spawn_pump(mut from: ChildStdout, mut to: ChildStdin) -> JoinHandle<std::io::Result<()>> {
    tokio::spawn(async move {
        tokio::io::copy(&mut from, &mut to).await?;
        to.shutdown().await?;
        Ok(())
    })
}

fn spawn_stderr_tail(mut stderr: tokio::process::ChildStderr) -> JoinHandle<String> {
    tokio::spawn(async move {
        let mut tail: Vec<u8> = Vec::new();
        let mut buffer = [0u8; 4096];
        loop {
            match stderr.read(&mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    tail.extend_from_slice(&buffer[..n]);
                    if tail.len() > STDERR_TAIL_BYTES {
                        let cut = tail.len() - STDERR_TAIL_BYTES;
                        tail.drain(..cut);
                    }
                }
            }
        }
        String::from_utf8_lossy(&tail).into_owned()
    })
}
