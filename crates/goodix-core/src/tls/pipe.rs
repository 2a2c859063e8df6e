//! In-memory byte pipe between the primary context and the TLS worker.
//!
//! The TLS stack reads and writes a `PipeEnd` as if it were a socket.
//! Incoming bytes arrive as whole chunks over a channel; everything the
//! stack writes is forwarded as [`PipeSignal::Data`]. When the reader has
//! consumed every chunk it was given and needs more, it announces
//! [`PipeSignal::Drained`] before blocking, which tells the other side that
//! the stack has finished reacting to its input.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};

/// What a pipe end reports to its peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipeSignal {
    /// Bytes written by the local stack.
    Data(Vec<u8>),
    /// All `consumed` chunks received so far are used up; the reader is
    /// about to block.
    Drained { consumed: usize },
}

/// One end of the pipe. `E` is the event type the peer listens for.
pub struct PipeEnd<E> {
    incoming: Receiver<Vec<u8>>,
    outgoing: Sender<E>,
    buffer: VecDeque<u8>,
    received: usize,
}

impl<E: From<PipeSignal>> PipeEnd<E> {
    pub fn new(incoming: Receiver<Vec<u8>>, outgoing: Sender<E>) -> Self {
        Self {
            incoming,
            outgoing,
            buffer: VecDeque::new(),
            received: 0,
        }
    }

    /// Chunks received so far.
    pub fn received(&self) -> usize {
        self.received
    }

    fn accept_chunk(&mut self, chunk: Vec<u8>) {
        self.received += 1;
        self.buffer.extend(chunk);
    }
}

impl<E: From<PipeSignal>> Read for PipeEnd<E> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        while self.buffer.is_empty() {
            match self.incoming.try_recv() {
                Ok(chunk) => self.accept_chunk(chunk),
                Err(TryRecvError::Disconnected) => return Ok(0),
                Err(TryRecvError::Empty) => {
                    // The peer may already be gone; reading still blocks on
                    // `incoming` until it closes.
                    let _ = self.outgoing.send(E::from(PipeSignal::Drained {
                        consumed: self.received,
                    }));
                    match self.incoming.recv() {
                        Ok(chunk) => self.accept_chunk(chunk),
                        Err(_) => return Ok(0),
                    }
                }
            }
        }

        let n = buf.len().min(self.buffer.len());
        for (slot, byte) in buf.iter_mut().zip(self.buffer.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl<E: From<PipeSignal>> Write for PipeEnd<E> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.outgoing
            .send(E::from(PipeSignal::Data(buf.to_vec())))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe peer closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<E> fmt::Debug for PipeEnd<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeEnd")
            .field("buffered", &self.buffer.len())
            .field("received", &self.received)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_write_forwards_data() {
        let (_in_tx, in_rx) = mpsc::channel();
        let (out_tx, out_rx) = mpsc::channel::<PipeSignal>();
        let mut pipe = PipeEnd::new(in_rx, out_tx);

        pipe.write_all(b"hello").unwrap();
        assert_eq!(out_rx.recv().unwrap(), PipeSignal::Data(b"hello".to_vec()));
    }

    #[test]
    fn test_read_spans_chunks() {
        let (in_tx, in_rx) = mpsc::channel();
        let (out_tx, _out_rx) = mpsc::channel::<PipeSignal>();
        let mut pipe = PipeEnd::new(in_rx, out_tx);

        in_tx.send(b"ab".to_vec()).unwrap();
        in_tx.send(b"cde".to_vec()).unwrap();

        let mut buf = [0u8; 5];
        pipe.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"abcde");
        assert_eq!(pipe.received(), 2);
    }

    #[test]
    fn test_drained_then_eof() {
        let (in_tx, in_rx) = mpsc::channel();
        let (out_tx, out_rx) = mpsc::channel::<PipeSignal>();
        let mut pipe = PipeEnd::new(in_rx, out_tx);

        in_tx.send(vec![1]).unwrap();
        let reader = std::thread::spawn(move || {
            let mut buf = [0u8; 4];
            let first = pipe.read(&mut buf).unwrap();
            let second = pipe.read(&mut buf).unwrap();
            (first, second)
        });

        assert_eq!(
            out_rx.recv().unwrap(),
            PipeSignal::Drained { consumed: 1 }
        );
        drop(in_tx);
        assert_eq!(reader.join().unwrap(), (1, 0));
    }
}
