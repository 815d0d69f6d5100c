//! TCP line listener.
//!
//! Accepts plaintext connections and feeds each newline-terminated record to
//! a [`MetricsMatcher`]. Each connection gets its own thread. Accept and
//! reads use short timeouts so the loops notice shutdown promptly.

use std::io::{self, BufRead, BufReader};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{spawn_error, TripwireResult};
use crate::shutdown::ShutdownSignal;

use super::matcher::MetricsMatcher;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const READ_TIMEOUT: Duration = Duration::from_millis(200);
/// Longest accepted record, newline excluded. Longer ones are skipped up to
/// the next newline.
const MAX_RECORD_LEN: usize = 4096;

/// A running listener.
#[derive(Debug)]
pub struct MetricsListener {
    local_addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl MetricsListener {
    /// Binds `addr` and starts accepting.
    ///
    /// # Errors
    ///
    /// Bind failures and thread spawn failures.
    pub fn bind(
        addr: &str,
        matcher: MetricsMatcher,
        shutdown: ShutdownSignal,
    ) -> TripwireResult<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "metrics listener started");

        let name = "tripwire-listener";
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || accept_loop(&listener, &matcher, &shutdown))
            .map_err(|e| spawn_error(name, &e))?;

        Ok(Self { local_addr, handle })
    }

    /// Bound address (useful with port 0).
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for the accept loop and every connection thread to exit.
    pub fn join(self) {
        if self.handle.join().is_err() {
            tracing::error!("metrics listener thread panicked");
        }
    }
}

fn accept_loop(listener: &TcpListener, matcher: &MetricsMatcher, shutdown: &ShutdownSignal) {
    let mut connections: Vec<JoinHandle<()>> = Vec::new();
    while !shutdown.is_triggered() {
        match listener.accept() {
            Ok((stream, peer)) => {
                let matcher = matcher.clone();
                let shutdown = shutdown.clone();
                let spawned = thread::Builder::new()
                    .name(format!("tripwire-conn-{peer}"))
                    .spawn(move || {
                        if let Err(e) = serve_connection(stream, &matcher, &shutdown) {
                            tracing::debug!(%peer, error = %e, "connection closed with error");
                        }
                    });
                match spawned {
                    Ok(handle) => connections.push(handle),
                    Err(e) => tracing::error!(%peer, error = %e, "failed to spawn connection thread"),
                }
                connections.retain(|h| !h.is_finished());
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let _ = shutdown.wait_timeout(POLL_INTERVAL);
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                let _ = shutdown.wait_timeout(POLL_INTERVAL);
            }
        }
    }
    for handle in connections {
        let _ = handle.join();
    }
    tracing::info!("metrics listener stopped");
}

fn serve_connection(
    stream: TcpStream,
    matcher: &MetricsMatcher,
    shutdown: &ShutdownSignal,
) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::with_capacity(256);
    let mut discarding = false;

    loop {
        let chunk = match reader.fill_buf() {
            Ok(chunk) => chunk,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                if shutdown.is_triggered() {
                    return Ok(());
                }
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if chunk.is_empty() {
            if !discarding {
                flush_line(&buf, matcher);
            }
            return Ok(());
        }

        let (take, complete) = match chunk.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (chunk.len(), false),
        };
        if !discarding {
            let content = buf.len() + take - usize::from(complete);
            if content > MAX_RECORD_LEN {
                discarding = true;
                buf.clear();
                matcher.reject_oversized(MAX_RECORD_LEN);
            } else {
                buf.extend_from_slice(&chunk[..take]);
            }
        }
        reader.consume(take);

        if complete {
            if !discarding {
                flush_line(&buf, matcher);
            }
            buf.clear();
            discarding = false;
        }
    }
}

fn flush_line(buf: &[u8], matcher: &MetricsMatcher) {
    let line = String::from_utf8_lossy(buf);
    if line.trim().is_empty() {
        return;
    }
    // Rejections are counted by the matcher.
    let _ = matcher.ingest(&line);
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;
    use std::sync::Arc;

    use crossbeam_channel::bounded;

    use crate::metrics::PipelineMetrics;

    #[test]
    fn lines_reach_the_matcher() {
        let metrics = PipelineMetrics::new();
        let shutdown = ShutdownSignal::new();
        let (tx, rx) = bounded(16);
        let matcher = MetricsMatcher::new(tx, Arc::clone(&metrics), shutdown.clone());
        let listener = MetricsListener::bind("127.0.0.1:0", matcher, shutdown.clone()).unwrap();

        let mut client = TcpStream::connect(listener.local_addr()).unwrap();
        client
            .write_all(b"a.b 1 1000\nnot a metric\r\na.c 2 1000")
            .unwrap();
        drop(client);

        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first.name, "a.b");
        assert_eq!(second.name, "a.c");

        shutdown.trigger();
        listener.join();
        assert_eq!(metrics.filter.malformed.get(), 1);
    }

    #[test]
    fn oversized_record_is_skipped_to_next_newline() {
        let metrics = PipelineMetrics::new();
        let shutdown = ShutdownSignal::new();
        let (tx, rx) = bounded(16);
        let matcher = MetricsMatcher::new(tx, Arc::clone(&metrics), shutdown.clone());
        let listener = MetricsListener::bind("127.0.0.1:0", matcher, shutdown.clone()).unwrap();

        let mut client = TcpStream::connect(listener.local_addr()).unwrap();
        let junk = vec![b'x'; 3 * MAX_RECORD_LEN];
        client.write_all(&junk).unwrap();
        client.write_all(b" 1 1000\na.b 1 1000\n").unwrap();
        drop(client);

        let accepted = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(accepted.name, "a.b");
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        shutdown.trigger();
        listener.join();
        assert_eq!(metrics.filter.malformed.get(), 1);
    }
}
