/*!
 * Small helpers shared by probes, drivers and the scanner.
 */
use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;

use crate::error::{Error, Result};

/// Run a fallible future, failing with `Error::Timeout` naming `what` when
/// it does not finish within `duration`
pub async fn with_timeout<F, T, E>(duration: Duration, what: &str, future: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: Into<Error>,
{
    match timeout(duration, future).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(Error::timeout(format!("{} timed out after {} ms", what, duration.as_millis()))),
    }
}

/// Render bytes as space separated upper-case hex, used for frame tracing
pub fn hex_dump(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test(tokio::test)]
    async fn test_with_timeout_success() {
        let result = with_timeout(Duration::from_secs(1), "answer", async { Ok::<_, Error>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[test_log::test(tokio::test)]
    async fn test_with_timeout_converts_errors() {
        let result: Result<()> = with_timeout(Duration::from_secs(1), "open", async {
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"))
        })
        .await;
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test_log::test(tokio::test)]
    async fn test_with_timeout_failure() {
        let result = with_timeout(Duration::from_millis(10), "connect to 10.0.0.1:102", async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, Error>(42)
        })
        .await;
        match result {
            Err(Error::Timeout(message)) => assert_eq!(message, "connect to 10.0.0.1:102 timed out after 10 ms"),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_hex_dump() {
        assert_eq!(hex_dump(&[0x03, 0x00, 0xD0]), "03 00 D0");
        assert_eq!(hex_dump(&[]), "");
    }
}
