//! Control socket between `cadence run` and the other subcommands.
//!
//! A running daemon is the only writer of its store. `add`, `remove`, `list`
//! and `get` reach it as JSON lines over a Unix socket next to the store;
//! only when no daemon is listening are they applied to the store directly.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use cadence_core::config::StoreConfig;
use cadence_core::Node;
use cadence_scheduler::{Job, JobSummary, SchedulerError, TaskScheduler};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

/// Socket owned by the daemon serving `store`.
pub fn socket_path(store: &StoreConfig) -> PathBuf {
    PathBuf::from(format!("{}.sock", store.path.trim_end_matches('/')))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ControlRequest {
    /// `job` is the stored document form, as produced by `Job::to_node`.
    Add { job: Node },
    Remove { name: String },
    List,
    Get { name: String },
}

impl ControlRequest {
    fn mutates(&self) -> bool {
        matches!(self, ControlRequest::Add { .. } | ControlRequest::Remove { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Failure {
    Exists,
    NotFound,
    Invalid,
    Storage,
}

impl Failure {
    fn of(err: &SchedulerError) -> Self {
        match err {
            SchedulerError::JobExists { .. } => Failure::Exists,
            SchedulerError::JobNotFound { .. } => Failure::NotFound,
            SchedulerError::InvalidArgument(_) | SchedulerError::MalformedJob { .. } => {
                Failure::Invalid
            }
            _ => Failure::Storage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    Added { job: JobSummary },
    Removed { name: String },
    Jobs { jobs: Vec<JobSummary> },
    Job { node: Node },
    Error { failure: Failure, msg: String },
}

/// Apply `request` to `scheduler`.
pub async fn handle(scheduler: &TaskScheduler, request: &ControlRequest) -> ControlResponse {
    let result = match request {
        ControlRequest::Add { job } => match Job::from_node(job) {
            Ok(job) => scheduler
                .add(job)
                .await
                .map(|job| ControlResponse::Added { job }),
            Err(e) => Err(e),
        },
        ControlRequest::Remove { name } => scheduler
            .remove(name)
            .await
            .map(|()| ControlResponse::Removed { name: name.clone() }),
        ControlRequest::List => Ok(ControlResponse::Jobs {
            jobs: scheduler.list().await,
        }),
        ControlRequest::Get { name } => scheduler
            .get(name)
            .await
            .map(|node| ControlResponse::Job { node })
            .ok_or_else(|| SchedulerError::JobNotFound { name: name.clone() }),
    };

    result.unwrap_or_else(|e| ControlResponse::Error {
        failure: Failure::of(&e),
        msg: e.to_string(),
    })
}

/// Claim the control socket. Fails if another daemon is answering on it;
/// a socket file left behind by a daemon that died is replaced.
pub async fn bind(path: &Path) -> anyhow::Result<UnixListener> {
    if UnixStream::connect(path).await.is_ok() {
        bail!(
            "another cadence daemon is already serving {}",
            path.display()
        );
    }
    let _ = std::fs::remove_file(path);
    UnixListener::bind(path)
        .with_context(|| format!("failed to bind control socket {}", path.display()))
}

/// Accept control connections until the task is aborted.
pub async fn serve(listener: UnixListener, scheduler: Arc<TaskScheduler>) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(s) => s,
            Err(e) => {
                warn!("control socket accept error: {e}");
                continue;
            }
        };

        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, &scheduler).await {
                debug!("control connection dropped: {e}");
            }
        });
    }
}

async fn serve_connection(stream: UnixStream, scheduler: &TaskScheduler) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let response = match serde_json::from_str::<ControlRequest>(&line) {
            Ok(request) => {
                debug!(?request, "control request");
                handle(scheduler, &request).await
            }
            Err(e) => ControlResponse::Error {
                failure: Failure::Invalid,
                msg: format!("bad request: {e}"),
            },
        };
        let mut out = serde_json::to_string(&response)?;
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
    }
    Ok(())
}

/// Send `request` to the daemon behind `path`. `None` when no daemon is
/// listening.
pub async fn send(path: &Path, request: &ControlRequest) -> anyhow::Result<Option<ControlResponse>> {
    let stream = match UnixStream::connect(path).await {
        Ok(s) => s,
        Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused) => {
            return Ok(None);
        }
        Err(e) => {
            return Err(e).with_context(|| format!("failed to reach daemon at {}", path.display()))
        }
    };

    let (reader, mut writer) = stream.into_split();
    let mut line = serde_json::to_string(request)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;

    let mut lines = BufReader::new(reader).lines();
    let reply = lines
        .next_line()
        .await?
        .context("daemon closed the control connection")?;
    let response = serde_json::from_str(&reply).context("malformed control response")?;
    Ok(Some(response))
}

/// Route `request` to the daemon owning the store, or apply it through
/// `scheduler` when none is running.
pub async fn dispatch(
    socket: &Path,
    scheduler: &TaskScheduler,
    request: ControlRequest,
) -> anyhow::Result<ControlResponse> {
    if let Some(response) = send(socket, &request).await? {
        debug!("request handled by running daemon");
        return Ok(response);
    }

    scheduler.load().await?;
    let local = handle(scheduler, &request).await;
    if !request.mutates() || matches!(local, ControlResponse::Error { .. }) {
        return Ok(local);
    }

    // A daemon binds its socket before reading the store. If one answers
    // now, it may have read the store before this write and would drop it.
    match send(socket, &request).await? {
        None
        | Some(ControlResponse::Error {
            failure: Failure::Exists | Failure::NotFound,
            ..
        }) => Ok(local),
        Some(response) => {
            info!("change forwarded to a daemon that started meanwhile");
            Ok(response)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ShellExecutor, SHELL_NODE};
    use cadence_core::config::ShellConfig;
    use cadence_scheduler::{FileJobStore, IntervalUnit, JobStore, SchedulerEvent, SCRIPT_NODE};
    use std::time::Duration;
    use tempfile::tempdir;

    fn job(name: &str, unit: IntervalUnit, count: i64) -> Job {
        let script = Node::new(SCRIPT_NODE).with_children([Node::new(SHELL_NODE).with_value("true")]);
        Job::every(name, None, script, unit, count).unwrap()
    }

    fn scheduler(store: &Path) -> TaskScheduler {
        TaskScheduler::new(
            Arc::new(FileJobStore::new(store)),
            Arc::new(ShellExecutor::new(&ShellConfig::default())),
        )
    }

    /// What `cadence run` does: claim the socket, load, then serve.
    async fn daemon(store: &Path, socket: &Path) -> Arc<TaskScheduler> {
        let listener = bind(socket).await.unwrap();
        let scheduler = Arc::new(scheduler(store));
        scheduler.start().await.unwrap();
        tokio::spawn(serve(listener, Arc::clone(&scheduler)));
        scheduler
    }

    async fn stored_names(store: &Path) -> Vec<String> {
        let mut names: Vec<_> = FileJobStore::new(store)
            .read_all()
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.name)
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn without_daemon_changes_go_to_the_store() {
        let dir = tempdir().unwrap();
        let store = dir.path().join("jobs.json");
        let socket = dir.path().join("jobs.json.sock");
        let cli = scheduler(&store);

        let add = ControlRequest::Add {
            job: job("nightly", IntervalUnit::Days, 1).to_node(),
        };
        let response = dispatch(&socket, &cli, add.clone()).await.unwrap();
        assert!(matches!(response, ControlResponse::Added { ref job } if job.name == "nightly"));
        assert_eq!(stored_names(&store).await, ["nightly"]);

        let again = dispatch(&socket, &cli, add).await.unwrap();
        assert!(matches!(again, ControlResponse::Error { failure: Failure::Exists, .. }));

        let missing = ControlRequest::Remove { name: "ghost".into() };
        let response = dispatch(&socket, &cli, missing).await.unwrap();
        assert!(matches!(response, ControlResponse::Error { failure: Failure::NotFound, .. }));
    }

    #[tokio::test]
    async fn running_daemon_keeps_jobs_added_by_the_cli() {
        let dir = tempdir().unwrap();
        let store = dir.path().join("jobs.json");
        let socket = dir.path().join("jobs.json.sock");

        let seed = scheduler(&store);
        seed.add(job("tick", IntervalUnit::Seconds, 1)).await.unwrap();
        drop(seed);

        let running = daemon(&store, &socket).await;
        let cli = scheduler(&store);
        let add = ControlRequest::Add {
            job: job("nightly", IntervalUnit::Days, 1).to_node(),
        };
        let response = dispatch(&socket, &cli, add).await.unwrap();
        assert!(matches!(response, ControlResponse::Added { .. }), "{response:?}");

        // the daemon rewrites the whole set after each run
        let mut events = running.subscribe();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(SchedulerEvent::JobCompleted { .. }) = events.recv().await {
                    break;
                }
            }
        })
        .await
        .expect("tick never ran");

        assert_eq!(stored_names(&store).await, ["nightly", "tick"]);
        let listed = dispatch(&socket, &cli, ControlRequest::List).await.unwrap();
        let ControlResponse::Jobs { jobs } = listed else {
            panic!("unexpected response {listed:?}");
        };
        assert_eq!(jobs.len(), 2);

        running.stop().await;
    }

    #[tokio::test]
    async fn remove_and_get_through_daemon() {
        let dir = tempdir().unwrap();
        let store = dir.path().join("jobs.json");
        let socket = dir.path().join("jobs.json.sock");
        let running = daemon(&store, &socket).await;
        running.add(job("hourly", IntervalUnit::Hours, 1)).await.unwrap();
        let cli = scheduler(&store);

        let got = dispatch(&socket, &cli, ControlRequest::Get { name: "hourly".into() })
            .await
            .unwrap();
        assert!(matches!(got, ControlResponse::Job { ref node } if node.name == "hourly"));

        let removed = dispatch(&socket, &cli, ControlRequest::Remove { name: "hourly".into() })
            .await
            .unwrap();
        assert_eq!(removed, ControlResponse::Removed { name: "hourly".into() });
        assert!(running.list().await.is_empty());
        assert!(stored_names(&store).await.is_empty());

        running.stop().await;
    }

    #[tokio::test]
    async fn second_daemon_is_refused() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("jobs.json.sock");

        let _first = bind(&socket).await.unwrap();
        assert!(bind(&socket).await.is_err());
    }

    #[tokio::test]
    async fn stale_socket_is_replaced() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("jobs.json.sock");

        drop(bind(&socket).await.unwrap());
        assert!(socket.exists());
        assert!(send(&socket, &ControlRequest::List).await.unwrap().is_none());
        assert!(bind(&socket).await.is_ok());
    }

    #[tokio::test]
    async fn garbage_request_gets_an_error_line() {
        let dir = tempdir().unwrap();
        let store = dir.path().join("jobs.json");
        let socket = dir.path().join("jobs.json.sock");
        let running = daemon(&store, &socket).await;

        let stream = UnixStream::connect(&socket).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        writer.write_all(b"not json\n").await.unwrap();
        let line = BufReader::new(reader).lines().next_line().await.unwrap().unwrap();
        let response: ControlResponse = serde_json::from_str(&line).unwrap();
        assert!(matches!(response, ControlResponse::Error { failure: Failure::Invalid, .. }));

        running.stop().await;
    }

    #[test]
    fn socket_sits_next_to_the_store() {
        let config = StoreConfig {
            path: "/var/lib/cadence/jobs/".into(),
            ..StoreConfig::default()
        };
        assert_eq!(socket_path(&config), PathBuf::from("/var/lib/cadence/jobs.sock"));
    }
}
