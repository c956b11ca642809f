//! In-process transport.
//!
//! Two [`MemoryTransport`] ends form a duplex pipe. Dropping one end makes
//! reads and writes on the other fail with [`TransportError::Closed`], which
//! is how tests simulate a pulled cable.

use super::transport::{Connector, PortTarget, Transport, TransportError};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One end of an in-memory duplex pipe.
pub struct MemoryTransport {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    read_timeout: Duration,
    name: String,
}

/// Create a connected pair of transports.
pub fn pipe(read_timeout: Duration) -> (MemoryTransport, MemoryTransport) {
    let (a_tx, b_rx) = unbounded();
    let (b_tx, a_rx) = unbounded();

    let a = MemoryTransport {
        tx: a_tx,
        rx: a_rx,
        pending: Vec::new(),
        read_timeout,
        name: "memory:a".to_string(),
    };
    let b = MemoryTransport {
        tx: b_tx,
        rx: b_rx,
        pending: Vec::new(),
        read_timeout,
        name: "memory:b".to_string(),
    };
    (a, b)
}

impl MemoryTransport {
    /// Read everything currently available and split it into lines.
    ///
    /// Convenience for tests driving the far end of a session.
    pub fn read_lines(&mut self) -> Result<Vec<String>, TransportError> {
        let mut bytes = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            let n = self.read(&mut buf)?;
            if n == 0 {
                break;
            }
            bytes.extend_from_slice(&buf[..n]);
        }

        Ok(String::from_utf8_lossy(&bytes)
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

impl Transport for MemoryTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if self.pending.is_empty() {
            match self.rx.recv_timeout(self.read_timeout) {
                Ok(chunk) => self.pending = chunk,
                Err(RecvTimeoutError::Timeout) => return Ok(0),
                Err(RecvTimeoutError::Disconnected) => return Err(TransportError::Closed),
            }
        }

        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.tx
            .send(bytes.to_vec())
            .map_err(|_| TransportError::Closed)
    }

    fn set_reset_line(&mut self, _asserted: bool) -> Result<bool, TransportError> {
        Ok(false)
    }

    fn discard_input(&mut self) -> Result<(), TransportError> {
        self.pending.clear();
        loop {
            match self.rx.try_recv() {
                Ok(_) => continue,
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => return Err(TransportError::Closed),
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Hands out queued memory transports, one per connection attempt.
///
/// Attempts with an empty queue fail like an unplugged device.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    queue: Arc<Mutex<VecDeque<MemoryTransport>>>,
    attempts: Arc<AtomicUsize>,
}

impl MemoryConnector {
    /// Create a connector with nothing attached.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a transport for the next connection attempt.
    pub fn attach(&self, transport: MemoryTransport) {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(transport);
    }

    /// Number of `open` calls so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for MemoryConnector {
    fn open(&mut self, target: &PortTarget) -> Result<Box<dyn Transport>, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let next = self
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();

        match next {
            Some(mut transport) => {
                transport.name = target.path.clone();
                Ok(Box::new(transport))
            }
            None => Err(TransportError::Open {
                port: target.path.clone(),
                message: "no device attached".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_is_duplex() {
        let (mut a, mut b) = pipe(Duration::ZERO);
        a.write_all(b"PING\n").unwrap();
        b.write_all(b"MSG:hi\n").unwrap();
        assert_eq!(b.read_lines().unwrap(), vec!["PING".to_string()]);
        assert_eq!(a.read_lines().unwrap(), vec!["MSG:hi".to_string()]);
    }

    #[test]
    fn test_partial_reads_keep_remainder() {
        let (mut a, mut b) = pipe(Duration::ZERO);
        a.write_all(b"abcdef").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(b.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(b.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(b.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_dropped_end_closes_pipe() {
        let (mut a, b) = pipe(Duration::ZERO);
        drop(b);
        let mut buf = [0u8; 4];
        assert_eq!(a.read(&mut buf), Err(TransportError::Closed));
        assert_eq!(a.write_all(b"x"), Err(TransportError::Closed));
    }

    #[test]
    fn test_connector_fails_when_empty() {
        let mut connector = MemoryConnector::new();
        let target = PortTarget::new("memory://test", 115_200);
        assert!(connector.open(&target).is_err());

        let (a, _b) = pipe(Duration::ZERO);
        connector.attach(a);
        let transport = connector.open(&target).unwrap();
        assert_eq!(transport.name(), "memory://test");
        assert_eq!(connector.attempts(), 2);
    }
}
