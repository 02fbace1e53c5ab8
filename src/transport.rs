//! Byte-oriented bridge between the TLS engine and the socket's buffers
//! Replaces a custom OpenSSL `BIO`: the
//! read side drains the encrypted input buffer, the write side appends
//! ciphertext into the per-write memory pool. Neither side performs a
//! syscall or blocks; "no data" is reported as `WouldBlock` so the caller
//! (the TLS state driver) can turn it into a read-subscribe.

use std::io::{self, Read, Write};

use crate::buffer::InputBuffer;
use crate::pool::{MemoryPool, PoolRange};

/// Ordered sequence of ciphertext chunks produced by the TLS engine during
/// one write/handshake step, backed by a `MemoryPool`.
#[derive(Debug, Default)]
pub struct CiphertextOutput {
    pool: MemoryPool,
    chunks: Vec<PoolRange>,
}

impl CiphertextOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn push(&mut self, data: &[u8]) {
        let range = self.pool.alloc(data);
        self.chunks.push(range);
    }

    /// Byte slices in order, suitable for a scatter-gather write.
    pub fn as_slices(&self) -> Vec<&[u8]> {
        self.chunks.iter().map(|r| self.pool.slice(*r)).collect()
    }

    /// Releases all pending chunks and clears the backing pool. Called once
    /// a flush (write or handshake step) has fully drained to the
    /// transport.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.pool.clear();
    }
}

/// The TLS engine's I/O surface for one socket. `read` drains
/// `encrypted_in`; `write` appends into `ciphertext_out`.
pub struct TransportAdapter<'a> {
    pub encrypted_in: &'a mut InputBuffer,
    pub ciphertext_out: &'a mut CiphertextOutput,
}

impl<'a> TransportAdapter<'a> {
    pub fn new(encrypted_in: &'a mut InputBuffer, ciphertext_out: &'a mut CiphertextOutput) -> Self {
        Self { encrypted_in, ciphertext_out }
    }
}

impl Read for TransportAdapter<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.encrypted_in.is_empty() {
            // "retry read later" — there is simply nothing buffered yet.
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(self.encrypted_in.size());
        buf[..n].copy_from_slice(&self.encrypted_in.as_slice()[..n]);
        self.encrypted_in.consume(n);
        Ok(n)
    }
}

impl Write for TransportAdapter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ciphertext_out.push(buf);
        Ok(buf.len())
    }

    /// A no-op, since nothing is
    /// buffered beyond what `write` already staged in the pool.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_signals_would_block_on_empty_input() {
        let mut encrypted = InputBuffer::new();
        let mut out = CiphertextOutput::new();
        let mut adapter = TransportAdapter::new(&mut encrypted, &mut out);
        let mut buf = [0u8; 16];
        let err = adapter.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn read_drains_encrypted_input_in_order() {
        let mut encrypted = InputBuffer::new();
        let slot = encrypted.reserve(5);
        slot[..5].copy_from_slice(b"abcde");
        encrypted.commit(5);
        let mut out = CiphertextOutput::new();
        let mut adapter = TransportAdapter::new(&mut encrypted, &mut out);

        let mut buf = [0u8; 3];
        let n = adapter.read(&mut buf).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf[..3], b"abc");

        let mut buf = [0u8; 16];
        let n = adapter.read(&mut buf).unwrap();
        assert_eq!(n, 2);
        assert_eq!(&buf[..2], b"de");
    }

    #[test]
    fn write_appends_to_ciphertext_sequence() {
        let mut encrypted = InputBuffer::new();
        let mut out = CiphertextOutput::new();
        {
            let mut adapter = TransportAdapter::new(&mut encrypted, &mut out);
            adapter.write_all(b"record-one").unwrap();
            adapter.write_all(b"record-two").unwrap();
        }
        assert_eq!(out.as_slices(), vec![b"record-one".as_slice(), b"record-two".as_slice()]);
        out.clear();
        assert!(out.is_empty());
    }
}
