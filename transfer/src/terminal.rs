//! Communication terminals: byte sources and sinks.
//!
//! Both ends run against the same repeating reference text. The source
//! fills payload buffers from a rolling index into the text; the sink
//! verifies arriving payloads against the same index and fails the session
//! on any mismatch or on bytes past the configured total.

use std::io::Write;

use crate::fifo::Fifo;
use crate::session::LoopControl;

/// The repeating reference text.
pub const TXBUF: &[u8] =
    b"If this message was received in error then please print it out and shred it.";

/// Repetitions of the reference text in a full run.
pub const DEFAULT_REPEATS: usize = 10_000;

/// Either personality's terminal.
pub enum Terminal {
    Source(Source),
    Sink(Sink),
}

impl Terminal {
    /// Swap buffers between the session queues: consume from `ready`,
    /// produce or verify, return them on `completed`.
    pub fn trade(&mut self, ready: &mut Fifo, completed: &mut Fifo) -> LoopControl {
        match self {
            Terminal::Source(s) => s.trade(ready, completed),
            Terminal::Sink(s) => s.trade(ready, completed),
        }
    }

    /// Whether the configured byte total has been reached.
    pub fn eof(&self) -> bool {
        match self {
            Terminal::Source(s) => s.eof,
            Terminal::Sink(s) => s.eof,
        }
    }
}

fn echo(payload: &[u8]) {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let _ = out.write_all(payload);
    let _ = out.flush();
}

/// Produces the reference stream into empty payload buffers.
pub struct Source {
    pub eof: bool,
    idx: usize,
    entirelen: usize,
    echo: bool,
}

impl Source {
    pub fn new(repeats: usize, echo: bool) -> Self {
        Self {
            eof: false,
            idx: 0,
            entirelen: TXBUF.len() * repeats,
            echo,
        }
    }

    fn trade(&mut self, ready: &mut Fifo, completed: &mut Fifo) -> LoopControl {
        if self.eof {
            return LoopControl::End;
        }

        while ready.peek().is_some() && !completed.is_full() {
            if self.idx == self.entirelen {
                self.eof = true;
                return LoopControl::End;
            }

            let h = ready.peek_mut().expect("peeked buffer vanished");
            let nused = (self.entirelen - self.idx).min(h.hdr().nallocated);
            h.hdr_mut().nused = nused;

            let b = h.as_bytes_mut().expect("payload queue held a non-payload buffer");
            let mut ofs = 0;
            while ofs < nused {
                let txbuf_ofs = (self.idx + ofs) % TXBUF.len();
                let len = (nused - ofs).min(TXBUF.len() - txbuf_ofs);
                b.payload_mut()[ofs..ofs + len]
                    .copy_from_slice(&TXBUF[txbuf_ofs..txbuf_ofs + len]);
                ofs += len;
            }
            if self.echo {
                echo(&b.payload()[..nused]);
            }

            let h = ready.get().expect("peeked buffer vanished");
            completed.put(h).ok().expect("completed queue overflow");
            self.idx += nused;
        }

        if self.idx != self.entirelen {
            return LoopControl::Continue;
        }
        self.eof = true;
        LoopControl::End
    }
}

/// Verifies the reference stream out of filled payload buffers.
pub struct Sink {
    pub eof: bool,
    idx: usize,
    entirelen: usize,
    echo: bool,
}

impl Sink {
    pub fn new(repeats: usize, echo: bool) -> Self {
        Self {
            eof: false,
            idx: 0,
            entirelen: TXBUF.len() * repeats,
            echo,
        }
    }

    fn trade(&mut self, ready: &mut Fifo, completed: &mut Fifo) -> LoopControl {
        if self.eof && !ready.is_empty() {
            tracing::debug!(target: "payload", "bytes arrived past sink EOF");
            return LoopControl::Error;
        }

        while ready.peek().is_some() && !completed.is_full() {
            let h = ready.peek().expect("peeked buffer vanished");
            let nused = h.hdr().nused;

            if nused + self.idx > self.entirelen {
                tracing::debug!(target: "payload", "unexpected received payload");
                return LoopControl::Error;
            }

            let b = h.as_bytes().expect("payload queue held a non-payload buffer");
            let mut ofs = 0;
            while ofs < nused {
                let txbuf_ofs = (self.idx + ofs) % TXBUF.len();
                let len = (nused - ofs).min(TXBUF.len() - txbuf_ofs);
                if self.echo {
                    echo(&b.payload()[ofs..ofs + len]);
                }
                if b.payload()[ofs..ofs + len] != TXBUF[txbuf_ofs..txbuf_ofs + len] {
                    tracing::debug!(target: "payload", "unexpected received payload");
                    return LoopControl::Error;
                }
                ofs += len;
            }

            let h = ready.get().expect("peeked buffer vanished");
            completed.put(h).ok().expect("completed queue overflow");
            self.idx += nused;
        }

        if self.idx != self.entirelen {
            return LoopControl::Continue;
        }
        self.eof = true;
        LoopControl::End
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{next_payload_len, Buf};

    fn payload_fifo(nbufs: usize) -> Fifo {
        let mut f = Fifo::new(64);
        let mut len = 0;
        for _ in 0..nbufs {
            len = next_payload_len(len);
            f.put(Buf::alloc_bytes(len)).unwrap();
        }
        f
    }

    #[test]
    fn test_source_to_sink_roundtrip() {
        let mut source = Source::new(3, false);
        let mut sink = Sink::new(3, false);
        let mut empties = payload_fifo(8);
        let mut filled = Fifo::new(64);

        let mut spins = 0;
        loop {
            let sctl = source.trade(&mut empties, &mut filled);
            assert!(!matches!(sctl, LoopControl::Error));
            let kctl = sink.trade(&mut filled, &mut empties);
            assert!(!matches!(kctl, LoopControl::Error));
            if source.eof && sink.eof {
                break;
            }
            spins += 1;
            assert!(spins < 1000, "terminals never reached EOF");
        }
        assert!(filled.is_empty());
    }

    #[test]
    fn test_sink_rejects_corruption() {
        let mut source = Source::new(1, false);
        let mut sink = Sink::new(1, false);
        let mut empties = payload_fifo(4);
        let mut filled = Fifo::new(64);

        source.trade(&mut empties, &mut filled);
        let h = filled.peek_mut().unwrap();
        h.as_bytes_mut().unwrap().payload_mut()[0] ^= 0xff;

        assert!(matches!(
            sink.trade(&mut filled, &mut empties),
            LoopControl::Error
        ));
    }

    #[test]
    fn test_sink_rejects_overrun() {
        let mut source = Source::new(2, false);
        let mut sink = Sink::new(1, false); // expects fewer bytes
        let mut empties = payload_fifo(8);
        let mut filled = Fifo::new(64);

        let mut failed = false;
        for _ in 0..100 {
            source.trade(&mut empties, &mut filled);
            if matches!(sink.trade(&mut filled, &mut empties), LoopControl::Error) {
                failed = true;
                break;
            }
        }
        assert!(failed, "sink accepted more bytes than configured");
    }

    #[test]
    fn test_source_partial_final_buffer() {
        // One repeat (78 bytes) through 37-byte buffers: 37 + 37 + 4.
        let mut source = Source::new(1, false);
        let mut empties = Fifo::new(64);
        for _ in 0..3 {
            empties.put(Buf::alloc_bytes(37)).unwrap();
        }
        let mut filled = Fifo::new(64);

        source.trade(&mut empties, &mut filled);
        assert!(source.eof);

        let mut used = Vec::new();
        while let Some(h) = filled.get() {
            used.push(h.hdr().nused);
        }
        assert_eq!(used, vec![37, 37, 4]);
    }
}
