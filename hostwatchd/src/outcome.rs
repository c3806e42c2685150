//! Per-iteration outcome of the long-running loops.

use tokio::task::JoinError;

/// What a loop should do after one iteration.
#[derive(Debug)]
pub enum Step<E> {
    Continue,
    /// The loop ends normally without taking further work.
    Finished,
    /// Logged by the loop, which keeps running.
    Recoverable(E),
    /// Logged by the loop, which then terminates.
    Fatal(E),
}

/// Best-effort text for a task that panicked or was aborted.
pub fn fault_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn panic_payload_is_extracted() {
        let err = tokio::spawn(async { panic!("boom") }).await.unwrap_err();
        assert_eq!(fault_message(err), "boom");

        let err = tokio::spawn(async { panic!("code {}", 7) }).await.unwrap_err();
        assert_eq!(fault_message(err), "code 7");
    }
}
