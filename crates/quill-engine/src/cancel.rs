use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use crate::error::{GenerationError, GenerationResult};

pub(crate) const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Shared stop flag handed to generation calls.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub(crate) fn tripped(cancel: Option<&CancelToken>) -> bool {
        cancel.map(CancelToken::is_cancelled).unwrap_or(false)
    }

    /// Trips the token after `delay` from a detached timer thread.
    pub fn cancel_after(&self, delay: Duration) {
        let token = self.clone();
        let spawned = thread::Builder::new()
            .name("quill-cancel-timer".to_string())
            .spawn(move || {
                thread::sleep(delay);
                token.cancel();
            });
        if let Err(err) = spawned {
            log::warn!("cancel timer thread spawn failed: {err}");
        }
    }
}

/// Runs a blocking call on a helper thread so the caller can stop waiting
/// as soon as `cancel` trips. Without a token the call runs inline.
///
/// The call must watch the same token and give up at its next checkpoint;
/// its late result is discarded.
pub(crate) fn run_cancellable<T, F>(
    cancel: Option<&CancelToken>,
    label: &str,
    call: F,
) -> GenerationResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    let Some(cancel) = cancel else {
        return call().map_err(GenerationError::Transport);
    };
    if cancel.is_cancelled() {
        return Err(GenerationError::Cancelled);
    }

    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name(format!("quill-{label}"))
        .spawn(move || {
            let _ = tx.send(call());
        })
        .map_err(|err| anyhow::anyhow!("{label} thread spawn failed: {err}"))?;

    loop {
        match rx.recv_timeout(CANCEL_POLL_INTERVAL) {
            Ok(result) => {
                if cancel.is_cancelled() {
                    return Err(GenerationError::Cancelled);
                }
                return result.map_err(GenerationError::Transport);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if cancel.is_cancelled() {
                    log::debug!("{label} cancelled while in flight");
                    return Err(GenerationError::Cancelled);
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(GenerationError::Transport(anyhow::anyhow!(
                    "{label} worker exited without a result"
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn inline_call_without_token() {
        let result = run_cancellable(None, "inline", || Ok(7));
        assert_eq!(result.ok(), Some(7));
    }

    #[test]
    fn pre_cancelled_token_skips_the_call() {
        let token = CancelToken::new();
        token.cancel();
        let result: GenerationResult<u8> =
            run_cancellable(Some(&token), "skipped", || anyhow::bail!("should not run"));
        assert!(matches!(result, Err(GenerationError::Cancelled)));
    }

    #[test]
    fn cancel_stops_waiting_on_slow_call() {
        let token = CancelToken::new();
        token.cancel_after(Duration::from_millis(30));
        let started = Instant::now();
        let result = run_cancellable(Some(&token), "slow", || {
            thread::sleep(Duration::from_secs(5));
            Ok("late")
        });
        assert!(matches!(result, Err(GenerationError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn call_errors_surface_as_transport() {
        let token = CancelToken::new();
        let result: GenerationResult<()> =
            run_cancellable(Some(&token), "failing", || anyhow::bail!("connection reset"));
        match result {
            Err(GenerationError::Transport(err)) => assert_eq!(err.to_string(), "connection reset"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
