use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::tftp::FileMode;

const CR: u8 = b'\r';
const LF: u8 = b'\n';
const NUL: u8 = 0x00;

/// Converts host bytes to their netascii form: a bare CR goes out as CR NUL and a LF as CR LF.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 16);
    for &b in data {
        match b {
            CR => out.extend_from_slice(&[CR, NUL]),
            LF => out.extend_from_slice(&[CR, LF]),
            _ => out.push(b),
        }
    }
    out
}

/// Reverses [`encode`]. A CR can end one DATA block and have its partner open the next, so the
/// decoder remembers a trailing CR between calls.
#[derive(Debug, Default)]
pub struct Decoder {
    pending_cr: bool,
}

impl Decoder {
    pub fn new() -> Decoder {
        Decoder::default()
    }

    pub fn decode(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len());
        for &b in data {
            if self.pending_cr {
                self.pending_cr = false;
                match b {
                    LF => out.push(LF),
                    NUL => out.push(CR),
                    CR => {
                        out.push(CR);
                        self.pending_cr = true;
                    }
                    other => out.extend_from_slice(&[CR, other]),
                }
            } else if b == CR {
                self.pending_cr = true;
            } else {
                out.push(b);
            }
        }
        out
    }

    /// Whatever is still held back once the transfer is over.
    pub fn finish(&mut self) -> Vec<u8> {
        if std::mem::take(&mut self.pending_cr) {
            vec![CR]
        } else {
            Vec::new()
        }
    }
}

/// Cuts a byte source into DATA payloads, already in wire form for the transfer mode.
///
/// A block shorter than the requested size is only ever returned once the source is exhausted.
pub struct ModeReader {
    inner: Box<dyn AsyncRead + Unpin + Send>,
    mode: FileMode,
    pending: Vec<u8>,
    eof: bool,
}

impl ModeReader {
    pub fn new<R>(inner: R, mode: FileMode) -> ModeReader
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        ModeReader { inner: Box::new(inner), mode, pending: Vec::new(), eof: false }
    }

    pub async fn read_block(&mut self, size: usize) -> io::Result<Vec<u8>> {
        let mut chunk = vec![0; size.max(512)];
        while self.pending.len() < size && !self.eof {
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                self.eof = true;
                break;
            }
            match self.mode {
                FileMode::Octet => self.pending.extend_from_slice(&chunk[..n]),
                FileMode::NetAscii => self.pending.extend_from_slice(&encode(&chunk[..n])),
            }
        }
        let take = size.min(self.pending.len());
        Ok(self.pending.drain(..take).collect())
    }
}

impl fmt::Debug for ModeReader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ModeReader")
            .field("mode", &self.mode)
            .field("pending", &self.pending.len())
            .field("eof", &self.eof)
            .finish()
    }
}

/// Writes received DATA payloads to a byte sink, translating netascii back to host form.
pub struct ModeWriter {
    inner: Box<dyn AsyncWrite + Unpin + Send>,
    decoder: Option<Decoder>,
}

impl ModeWriter {
    pub fn new<W>(inner: W, mode: FileMode) -> ModeWriter
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let decoder = match mode {
            FileMode::Octet => None,
            FileMode::NetAscii => Some(Decoder::new()),
        };
        ModeWriter { inner: Box::new(inner), decoder }
    }

    pub async fn write_block(&mut self, data: &[u8]) -> io::Result<()> {
        match self.decoder.as_mut() {
            Some(decoder) => {
                let decoded = decoder.decode(data);
                self.inner.write_all(&decoded).await
            }
            None => self.inner.write_all(data).await,
        }
    }

    /// Flushes a held-back CR and the underlying sink.
    pub async fn finish(&mut self) -> io::Result<()> {
        if let Some(decoder) = self.decoder.as_mut() {
            let rest = decoder.finish();
            self.inner.write_all(&rest).await?;
        }
        self.inner.flush().await
    }
}

impl fmt::Debug for ModeWriter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ModeWriter").field("netascii", &self.decoder.is_some()).finish()
    }
}
