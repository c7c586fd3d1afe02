/*!
 * Utility functions and helpers for GreenNet.
 */
use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Run a future with a timeout
///
/// # Returns
///
/// The result of the future, or [`Error::Timeout`] if `duration` elapses first
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(format!(
            "Operation timed out after {} ms",
            duration.as_millis()
        ))),
    }
}

/// Spawn a background task and log how it ended
///
/// # Arguments
///
/// * `name` - A name for the task (for logging)
/// * `fut` - The future to run
pub fn spawn_and_log<F, T, E>(name: &str, fut: F) -> tokio::task::JoinHandle<()>
where
    F: Future<Output = std::result::Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let task_name = name.to_string();
    tokio::spawn(async move {
        match fut.await {
            Ok(_) => {
                debug!("Task '{}' completed successfully", task_name);
            }
            Err(e) => {
                warn!("Task '{}' failed: {}", task_name, e);
            }
        }
    })
}

/// Join a topic root and relative segments with `/`, skipping empty parts
pub fn join_topic<'a, I>(parts: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    parts
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout() {
        let ok = with_timeout(Duration::from_millis(10), async { Ok(1) }).await;
        assert_eq!(ok.unwrap(), 1);

        let slow = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;
        assert!(matches!(slow, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_spawn_and_log_completes() {
        let handle = spawn_and_log("ok", async { Ok::<_, Error>(42) });
        tokio_test::assert_ok!(handle.await);

        let handle = spawn_and_log("failing", async { Err::<(), _>(Error::other("boom")) });
        tokio_test::assert_ok!(handle.await);
    }

    #[test]
    fn test_join_topic() {
        assert_eq!(join_topic(["EnOcean", "EAG", "get", "devices"]), "EnOcean/EAG/get/devices");
        assert_eq!(join_topic(["EnOcean", "", "uptime"]), "EnOcean/uptime");
    }
}
