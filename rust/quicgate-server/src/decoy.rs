//! Anti-probe responder
//!
//! An immediate disconnect, a fixed error byte or a constant delay are all
//! fingerprints an active prober can key on. Failed credentials instead
//! get a 2-5 second jittered wait and one of several canned HTTP error
//! pages, the same shape a misconfigured web server would produce.

use rand::Rng;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const MIN_DELAY_MS: u64 = 2000;
const MAX_DELAY_MS: u64 = 5000;
const LINGER: Duration = Duration::from_millis(100);

const RESPONSES: [&str; 4] = [
    "HTTP/1.1 400 Bad Request\r\nContent-Type: text/html\r\n\r\n<html><body><h1>400 Bad Request</h1></body></html>",
    "HTTP/1.1 404 Not Found\r\nContent-Type: text/html\r\n\r\n<html><body><h1>404 Not Found</h1></body></html>",
    "HTTP/1.1 500 Internal Server Error\r\nContent-Type: text/html\r\n\r\n<html><body><h1>500 Internal Server Error</h1></body></html>",
    "HTTP/1.1 503 Service Unavailable\r\nContent-Type: text/html\r\n\r\n<html><body><h1>503 Service Unavailable</h1></body></html>",
];

/// Choose a jittered delay and a decoy page.
fn pick(rng: &mut impl Rng) -> (Duration, &'static str) {
    let delay = Duration::from_millis(rng.gen_range(MIN_DELAY_MS..MAX_DELAY_MS));
    let body = RESPONSES[rng.gen_range(0..RESPONSES.len())];
    (delay, body)
}

/// Play the decoy on a stream whose credentials failed: wait, emit the
/// page, linger briefly, and let the caller close the stream. The sleeps
/// observe cancellation so `stop()` during a probe unwinds promptly.
pub async fn respond<W>(writer: &mut W, cancel: &CancellationToken)
where
    W: AsyncWrite + Unpin,
{
    let (delay, body) = pick(&mut rand::thread_rng());
    debug!("decoy scheduled in {:?}", delay);

    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(delay) => {}
    }

    if writer.write_all(body.as_bytes()).await.is_err() {
        return;
    }
    let _ = writer.flush().await;

    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(LINGER) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn delays_stay_in_range() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let (delay, _) = pick(&mut rng);
            assert!(delay >= Duration::from_millis(MIN_DELAY_MS));
            assert!(delay < Duration::from_millis(MAX_DELAY_MS));
        }
    }

    #[test]
    fn responses_look_like_http_errors() {
        for response in RESPONSES {
            assert!(response.starts_with("HTTP/1.1 "));
            let code = &response[9..12];
            assert!(matches!(code, "400" | "404" | "500" | "503"));
            assert!(response.contains("\r\n\r\n<html>"));
        }
    }

    #[test]
    fn picks_vary_in_both_dimensions() {
        let mut rng = rand::thread_rng();
        let mut delays = HashSet::new();
        let mut bodies = HashSet::new();
        for _ in 0..40 {
            let (delay, body) = pick(&mut rng);
            delays.insert(delay.as_millis());
            bodies.insert(body.as_ptr());
        }
        assert!(delays.len() > 1, "delay must appear jittered");
        assert!(bodies.len() > 1, "status line must vary");
    }

    #[tokio::test(start_paused = true)]
    async fn respond_waits_at_least_two_seconds() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let cancel = CancellationToken::new();

        let start = tokio::time::Instant::now();
        tokio::spawn(async move {
            respond(&mut server, &cancel).await;
        });

        let mut buf = vec![0u8; 1024];
        let n = tokio::io::AsyncReadExt::read(&mut client, &mut buf).await.unwrap();
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(6));
        let response = std::str::from_utf8(&buf[..n]).unwrap();
        assert!(response.starts_with("HTTP/1.1 "));
    }

    #[tokio::test(start_paused = true)]
    async fn respond_unwinds_on_cancellation() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let cancel = CancellationToken::new();
        cancel.cancel();

        respond(&mut server, &cancel).await;
        drop(server);

        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut client, &mut buf).await.unwrap();
        assert!(buf.is_empty(), "cancelled decoy must not write");
    }
}
