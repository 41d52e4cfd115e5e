//! Sandboxed processor.
//!
//! The user function runs on a dedicated executor thread with its own
//! runtime. Jobs and results cross the boundary as JSON messages, so the
//! worker only ever sees a `ProcessError` variant, never the function's own
//! error values.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::domain::ProcessError;
use crate::ports::{JobContext, Processor};

const EXECUTOR_EXITED: &str = "sandbox executor exited";

/// Result message sent back by the executor.
///
/// `{"kind": "unrecoverable", "message": "..."}` is how the unrecoverable
/// marker survives the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WireReply {
    Completed { value: serde_json::Value },
    Unrecoverable { message: String },
    Failed { message: String },
    Panicked { message: String },
}

impl From<Result<serde_json::Value, ProcessError>> for WireReply {
    fn from(result: Result<serde_json::Value, ProcessError>) -> Self {
        match result {
            Ok(value) => WireReply::Completed { value },
            Err(ProcessError::Unrecoverable(message)) => WireReply::Unrecoverable { message },
            Err(ProcessError::Failed(message)) => WireReply::Failed { message },
            Err(ProcessError::Panicked(message)) => WireReply::Panicked { message },
        }
    }
}

impl WireReply {
    fn into_result(self) -> Result<serde_json::Value, ProcessError> {
        match self {
            WireReply::Completed { value } => Ok(value),
            WireReply::Unrecoverable { message } => Err(ProcessError::Unrecoverable(message)),
            WireReply::Failed { message } => Err(ProcessError::Failed(message)),
            WireReply::Panicked { message } => Err(ProcessError::Panicked(message)),
        }
    }
}

struct Request {
    job: String,
    reply: oneshot::Sender<String>,
}

/// Processor that forwards every job to an isolated executor thread.
///
/// Dropping the last handle closes the channel and the executor thread exits.
#[derive(Clone)]
pub struct Sandboxed {
    tx: mpsc::UnboundedSender<Request>,
}

impl Sandboxed {
    /// Start the executor thread for `processor`.
    pub fn spawn<P>(processor: P) -> std::io::Result<Self>
    where
        P: Processor + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Request>();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let processor: Arc<dyn Processor> = Arc::new(processor);

        std::thread::Builder::new()
            .name("spindle-sandbox".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    while let Some(request) = rx.recv().await {
                        tokio::spawn(serve(Arc::clone(&processor), request));
                    }
                    tracing::debug!("sandbox executor stopping");
                });
            })?;

        Ok(Self { tx })
    }
}

/// Run one job inside the executor and answer with a wire message.
///
/// If the caller drops its end first (the worker aborted the attempt), the
/// job is cancelled here too and nothing is sent back.
async fn serve(processor: Arc<dyn Processor>, request: Request) {
    let Request { job, mut reply } = request;

    let job = match serde_json::from_str::<JobContext>(&job) {
        Ok(job) => job,
        Err(err) => {
            let _ = reply.send(encode(&WireReply::Failed {
                message: format!("malformed job message: {err}"),
            }));
            return;
        }
    };
    let job_id = job.job_id;

    let mut task = tokio::spawn(async move { processor.process(job).await });
    let joined = tokio::select! {
        joined = &mut task => joined,
        _ = reply.closed() => {
            task.abort();
            let _ = task.await;
            tracing::debug!(%job_id, "caller went away, sandboxed attempt cancelled");
            return;
        }
    };

    let message = match joined {
        Ok(result) => WireReply::from(result),
        Err(err) if err.is_panic() => WireReply::from(Err(ProcessError::from_panic(err.into_panic()))),
        Err(_) => WireReply::Panicked {
            message: EXECUTOR_EXITED.to_string(),
        },
    };
    let _ = reply.send(encode(&message));
}

fn encode(reply: &WireReply) -> String {
    serde_json::to_string(reply).unwrap_or_else(|err| {
        serde_json::json!({ "kind": "failed", "message": err.to_string() }).to_string()
    })
}

#[async_trait]
impl Processor for Sandboxed {
    async fn process(&self, job: JobContext) -> Result<serde_json::Value, ProcessError> {
        let job = serde_json::to_string(&job)
            .map_err(|err| ProcessError::failed(format!("job is not serializable: {err}")))?;

        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request { job, reply })
            .map_err(|_| ProcessError::Panicked(EXECUTOR_EXITED.to_string()))?;

        let reply = rx
            .await
            .map_err(|_| ProcessError::Panicked(EXECUTOR_EXITED.to_string()))?;

        serde_json::from_str::<WireReply>(&reply)
            .map_err(|err| ProcessError::failed(format!("malformed sandbox reply: {err}")))?
            .into_result()
    }
}
