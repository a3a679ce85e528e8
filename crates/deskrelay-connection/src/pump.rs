//! Bidirectional byte pump with stall detection
//!
//! A [`RelayPump`] owns a matched pair of streams and copies bytes A→B and B→A concurrently.
//! When either direction ends (EOF, I/O error or stall) the other one is torn down too, both
//! streams are shut down and dropped, and the pump reports to its caller.

use crate::stall::{StallTracker, DEFAULT_BUSY_THRESHOLD, DEFAULT_RETRY_BACKOFF};
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default copy buffer size per direction (1MB)
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

/// Default idle time after which a direction counts as stalled
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Pump tuning
#[derive(Debug, Clone)]
pub struct PumpConfig {
    pub buffer_size: usize,
    pub stall_timeout: Duration,
    pub busy_threshold: Duration,
    pub retry_backoff: Duration,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            busy_threshold: DEFAULT_BUSY_THRESHOLD,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    AToB,
    BToA,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::AToB => write!(f, "a->b"),
            Direction::BToA => write!(f, "b->a"),
        }
    }
}

/// Why a pump finished without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    /// The reading side of this direction closed
    Eof(Direction),
    /// The external cancellation token fired
    Cancelled,
}

/// Outcome of a completed pump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PumpReport {
    pub a_to_b: u64,
    pub b_to_a: u64,
    pub end: PumpEnd,
}

#[derive(Debug, Error)]
pub enum PumpError {
    #[error("{direction} stalled: no data for {idle:?}")]
    Stalled { direction: Direction, idle: Duration },

    #[error("{direction} failed: {source}")]
    Io {
        direction: Direction,
        #[source]
        source: io::Error,
    },
}

enum DirectionEnd {
    Eof,
    Stalled(Duration),
    Failed(io::Error),
    Cancelled,
}

struct DirectionOutcome {
    direction: Direction,
    bytes: u64,
    end: DirectionEnd,
}

/// Copies bytes between two established streams until one side ends
#[derive(Debug, Clone)]
pub struct RelayPump {
    config: PumpConfig,
    labels: (String, String),
}

impl RelayPump {
    pub fn new(config: PumpConfig) -> Self {
        Self {
            config,
            labels: ("a".to_string(), "b".to_string()),
        }
    }

    /// Names used for the two sides in log output
    pub fn with_labels(mut self, a: impl Into<String>, b: impl Into<String>) -> Self {
        self.labels = (a.into(), b.into());
        self
    }

    pub fn config(&self) -> &PumpConfig {
        &self.config
    }

    /// Pump until EOF, error, stall or cancellation
    ///
    /// Both streams are shut down and dropped before this returns, whatever the outcome.
    pub async fn run<A, B>(
        &self,
        a: A,
        b: B,
        cancel: &CancellationToken,
    ) -> Result<PumpReport, PumpError>
    where
        A: AsyncRead + AsyncWrite + Unpin + Send,
        B: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (mut a_read, mut a_write) = tokio::io::split(a);
        let (mut b_read, mut b_write) = tokio::io::split(b);

        // Fires on external cancellation or when either direction ends
        let teardown = cancel.child_token();

        debug!(a = %self.labels.0, b = %self.labels.1, "Pump started");

        let (forward, backward) = tokio::join!(
            copy_direction(
                Direction::AToB,
                &mut a_read,
                &mut b_write,
                &self.config,
                &teardown
            ),
            copy_direction(
                Direction::BToA,
                &mut b_read,
                &mut a_write,
                &self.config,
                &teardown
            ),
        );

        let _ = a_write.shutdown().await;
        let _ = b_write.shutdown().await;

        let a_to_b = forward.bytes;
        let b_to_a = backward.bytes;

        // The direction that ended first is the one that did not end by teardown
        let forward_torn = matches!(forward.end, DirectionEnd::Cancelled);
        let backward_torn = matches!(backward.end, DirectionEnd::Cancelled);
        let cause = match (forward_torn, backward_torn) {
            (true, true) => None,
            (true, false) => Some(backward),
            _ => Some(forward),
        };

        match cause {
            None => {
                info!(
                    a = %self.labels.0,
                    b = %self.labels.1,
                    bytes_a_to_b = a_to_b,
                    bytes_b_to_a = b_to_a,
                    "Pump cancelled"
                );
                Ok(PumpReport {
                    a_to_b,
                    b_to_a,
                    end: PumpEnd::Cancelled,
                })
            }
            Some(DirectionOutcome {
                direction, end, ..
            }) => match end {
                DirectionEnd::Eof | DirectionEnd::Cancelled => {
                    info!(
                        a = %self.labels.0,
                        b = %self.labels.1,
                        %direction,
                        bytes_a_to_b = a_to_b,
                        bytes_b_to_a = b_to_a,
                        "Pump completed"
                    );
                    Ok(PumpReport {
                        a_to_b,
                        b_to_a,
                        end: PumpEnd::Eof(direction),
                    })
                }
                DirectionEnd::Stalled(idle) => {
                    warn!(
                        a = %self.labels.0,
                        b = %self.labels.1,
                        %direction,
                        bytes_a_to_b = a_to_b,
                        bytes_b_to_a = b_to_a,
                        "Pump stalled after {:?}",
                        idle
                    );
                    Err(PumpError::Stalled { direction, idle })
                }
                DirectionEnd::Failed(source) => {
                    warn!(
                        a = %self.labels.0,
                        b = %self.labels.1,
                        %direction,
                        bytes_a_to_b = a_to_b,
                        bytes_b_to_a = b_to_a,
                        "Pump failed: {}",
                        source
                    );
                    Err(PumpError::Io { direction, source })
                }
            },
        }
    }
}

fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}

async fn copy_direction<R, W>(
    direction: Direction,
    reader: &mut R,
    writer: &mut W,
    config: &PumpConfig,
    teardown: &CancellationToken,
) -> DirectionOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; config.buffer_size.max(1)];
    let mut tracker = StallTracker::new(config.busy_threshold, config.retry_backoff);
    let mut bytes = 0u64;

    let end = loop {
        let remaining = tracker.remaining(config.stall_timeout);
        if remaining.is_zero() {
            break DirectionEnd::Stalled(tracker.idle());
        }

        let read = tokio::select! {
            biased;
            _ = teardown.cancelled() => break DirectionEnd::Cancelled,
            read = tokio::time::timeout(remaining, reader.read(&mut buffer)) => read,
        };

        match read {
            Err(_) => break DirectionEnd::Stalled(tracker.idle()),
            Ok(Ok(0)) => break DirectionEnd::Eof,
            Ok(Ok(n)) => {
                let write = async {
                    writer.write_all(&buffer[..n]).await?;
                    writer.flush().await
                };
                let written = tokio::select! {
                    biased;
                    _ = teardown.cancelled() => break DirectionEnd::Cancelled,
                    written = tokio::time::timeout(config.stall_timeout, write) => written,
                };
                match written {
                    Ok(Ok(())) => {
                        bytes += n as u64;
                        tracker.success();
                    }
                    Ok(Err(e)) => break DirectionEnd::Failed(e),
                    Err(_) => break DirectionEnd::Stalled(tracker.idle()),
                }
            }
            Ok(Err(e)) if is_transient(&e) => {
                let delay = tracker.retry_delay();
                if !delay.is_zero() {
                    tokio::select! {
                        biased;
                        _ = teardown.cancelled() => break DirectionEnd::Cancelled,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
            Ok(Err(e)) => break DirectionEnd::Failed(e),
        }
    };

    teardown.cancel();
    debug!(%direction, bytes, "Direction finished");

    DirectionOutcome {
        direction,
        bytes,
        end,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn fast_config() -> PumpConfig {
        PumpConfig {
            buffer_size: 1024,
            stall_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_eof_ends_pump() {
        let (a_side, mut a_peer) = tokio::io::duplex(4096);
        let (b_side, mut b_peer) = tokio::io::duplex(4096);
        let cancel = CancellationToken::new();
        let pump = RelayPump::new(PumpConfig::default());

        let handle = tokio::spawn(async move { pump.run(a_side, b_side, &cancel).await });

        a_peer.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        b_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        a_peer.shutdown().await.unwrap();
        drop(a_peer);

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.a_to_b, 5);
        assert_eq!(report.end, PumpEnd::Eof(Direction::AToB));

        // The other side was torn down as well
        let mut rest = Vec::new();
        b_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_stall_tears_down_both_directions() {
        let (a_side, mut a_peer) = tokio::io::duplex(4096);
        let (b_side, mut b_peer) = tokio::io::duplex(4096);
        let cancel = CancellationToken::new();
        let pump = RelayPump::new(fast_config());

        let started = Instant::now();
        let result = pump.run(a_side, b_side, &cancel).await;

        assert!(matches!(result, Err(PumpError::Stalled { .. })));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(started.elapsed() < Duration::from_secs(2));

        let mut buf = Vec::new();
        assert_eq!(a_peer.read_to_end(&mut buf).await.unwrap(), 0);
        assert_eq!(b_peer.read_to_end(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_is_prompt() {
        let (a_side, _a_peer) = tokio::io::duplex(4096);
        let (b_side, _b_peer) = tokio::io::duplex(4096);
        let cancel = CancellationToken::new();
        let pump = RelayPump::new(PumpConfig {
            stall_timeout: Duration::from_secs(60),
            ..Default::default()
        });

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let report = pump.run(a_side, b_side, &cancel).await.unwrap();
        assert_eq!(report.end, PumpEnd::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_broken_writer_reports_io_error() {
        let (a_side, mut a_peer) = tokio::io::duplex(4096);
        let (b_side, b_peer) = tokio::io::duplex(4096);
        drop(b_peer);
        let cancel = CancellationToken::new();
        let pump = RelayPump::new(fast_config());

        a_peer.write_all(b"data").await.unwrap();
        let result = pump.run(a_side, b_side, &cancel).await;

        // Either the write to B fails or B's reader sees EOF first
        match result {
            Err(PumpError::Io { .. }) => {}
            Ok(report) => assert_eq!(report.end, PumpEnd::Eof(Direction::BToA)),
            Err(other) => panic!("unexpected pump error: {}", other),
        }
    }
}
