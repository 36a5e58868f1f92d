// nc_doc_loader/src/retry.rs
// Fixed-delay retry loop shared by every store write.

use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::future::retry_notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::error::{IngestorError, Result};

/// How often and how patiently a failed write is attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq,)]
pub struct RetrySettings {
    /// Retries after the first attempt; `max_retries + 1` attempts in total.
    pub max_retries: u32,
    pub delay:       Duration,
}

/// Constant delay between attempts, giving up once the retry budget is spent
/// or the pipeline is cancelled.
#[derive(Debug, Clone,)]
pub struct FixedDelayBackoff {
    settings: RetrySettings,
    retries:  u32,
    cancel:   CancellationToken,
}

impl FixedDelayBackoff {
    pub fn new(settings: RetrySettings, cancel: CancellationToken,) -> Self {
        Self {
            settings,
            retries: 0,
            cancel,
        }
    }
}

impl Backoff for FixedDelayBackoff {
    fn reset(&mut self,) {
        self.retries = 0;
    }

    fn next_backoff(&mut self,) -> Option<Duration,> {
        if self.cancel.is_cancelled() || self.retries >= self.settings.max_retries {
            return None;
        }
        self.retries += 1;
        Some(self.settings.delay,)
    }
}

/// Value produced by a retried operation and the attempts it took.
#[derive(Debug, Clone, PartialEq,)]
pub struct Attempted<T,> {
    pub value:    T,
    pub attempts: u32,
}

/// Runs `operation` until it succeeds, fails permanently, exhausts the retry
/// budget or observes cancellation.
///
/// Returns `Ok(None)` when cancellation was observed before the first attempt.
/// Exhaustion, and cancellation with a failure pending, become
/// [`IngestorError::WriteFailed`] carrying the last cause.
pub async fn execute_with_retry<F, Fut, T,>(
    settings: RetrySettings,
    cancel: &CancellationToken,
    operation: F,
) -> Result<Option<Attempted<T,>,>,>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T,>,>,
{
    if cancel.is_cancelled() {
        return Ok(None,);
    }

    let attempts = AtomicU32::new(0,);
    let last_failure: Mutex<Option<String,>,> = Mutex::new(None,);
    let backoff = FixedDelayBackoff::new(settings, cancel.clone(),);

    let (attempts_ref, last_failure_ref, operation_ref,) = (&attempts, &last_failure, &operation,);
    let result = retry_notify(
        backoff,
        move || async move {
            if attempts_ref.load(Ordering::SeqCst,) > 0 && cancel.is_cancelled() {
                return Err(permanent_error(IngestorError::Cancelled,),);
            }
            attempts_ref.fetch_add(1, Ordering::SeqCst,);
            operation_ref().await.map_err(|err| {
                if let Ok(mut last,) = last_failure_ref.lock() {
                    *last = Some(err.to_string(),);
                }
                wrap_error(err,)
            },)
        },
        |err: IngestorError, delay: Duration| {
            warn!("Write attempt failed: {}. Retrying in {}s", err, delay.as_secs());
        },
    )
    .await;

    let attempts = attempts.load(Ordering::SeqCst,);
    match result {
        Ok(value,) => Ok(Some(Attempted { value, attempts, },),),
        Err(IngestorError::Cancelled,) => {
            let cause = last_failure
                .into_inner()
                .ok()
                .flatten()
                .unwrap_or_else(|| "cancelled".to_string(),);
            error!("Cancelled while retrying after {} attempt(s): {}", attempts, cause);
            Err(IngestorError::WriteFailed { attempts, cause, },)
        },
        Err(err,) if err.is_transient() => {
            if cancel.is_cancelled() {
                error!("Cancelled while retrying after {} attempt(s): {}", attempts, err);
            } else {
                error!("Giving up after {} attempt(s): {}", attempts, err);
            }
            Err(IngestorError::WriteFailed {
                attempts,
                cause: err.to_string(),
            },)
        },
        Err(err,) => Err(err,),
    }
}

pub fn transient_error(err: IngestorError,) -> backoff::Error<IngestorError,> {
    backoff::Error::transient(err,)
}

pub fn permanent_error(err: IngestorError,) -> backoff::Error<IngestorError,> {
    backoff::Error::permanent(err,)
}

pub fn wrap_error(err: IngestorError,) -> backoff::Error<IngestorError,> {
    if err.is_transient() {
        transient_error(err,)
    } else {
        permanent_error(err,)
    }
}
