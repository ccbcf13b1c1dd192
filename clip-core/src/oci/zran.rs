use std::io::{self, Read};

use flate2::{Decompress, FlushDecompress, Status};

use crate::container::storage::{Checkpoint, GzipIndex, WINDOW_SIZE};
use crate::error::{ClipError, Result};

const IN_BUF_SIZE: usize = 64 * 1024;

/// Raw-deflate pump shared by the checkpointing decoder and the resume
/// reader.
struct InflateState {
    inflate: Decompress,
    in_buf: Box<[u8]>,
    in_pos: usize,
    in_end: usize,
    src_eof: bool,
    done: bool,
}

impl InflateState {
    fn new(inflate: Decompress) -> Self {
        Self {
            inflate,
            in_buf: vec![0u8; IN_BUF_SIZE].into_boxed_slice(),
            in_pos: 0,
            in_end: 0,
            src_eof: false,
            done: false,
        }
    }

    fn read_into<R: Read>(&mut self, src: &mut R, out: &mut [u8]) -> io::Result<usize> {
        if self.done || out.is_empty() {
            return Ok(0);
        }
        loop {
            if self.in_pos == self.in_end && !self.src_eof {
                let n = src.read(&mut self.in_buf)?;
                self.in_pos = 0;
                self.in_end = n;
                self.src_eof = n == 0;
            }

            let before_in = self.inflate.total_in();
            let before_out = self.inflate.total_out();
            let status = self
                .inflate
                .decompress(
                    &self.in_buf[self.in_pos..self.in_end],
                    out,
                    FlushDecompress::None,
                )
                .map_err(io::Error::other)?;
            let consumed = (self.inflate.total_in() - before_in) as usize;
            let produced = (self.inflate.total_out() - before_out) as usize;
            self.in_pos += consumed;

            if matches!(status, Status::StreamEnd) {
                self.done = true;
            }
            if produced > 0 || self.done {
                return Ok(produced);
            }
            if consumed == 0 && self.src_eof {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            if consumed == 0 && self.in_pos < self.in_end {
                return Err(io::Error::other("inflate stalled without progress"));
            }
        }
    }
}

/// Parses the gzip member header, returning its length in bytes.
fn parse_gzip_header<R: Read>(src: &mut R) -> io::Result<u64> {
    let mut fixed = [0u8; 10];
    src.read_exact(&mut fixed)?;
    if fixed[0] != 0x1f || fixed[1] != 0x8b || fixed[2] != 8 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "not a gzip/deflate stream",
        ));
    }
    let flags = fixed[3];
    let mut len = 10u64;

    if flags & 0x04 != 0 {
        // FEXTRA
        let mut xlen = [0u8; 2];
        src.read_exact(&mut xlen)?;
        let extra = u16::from_le_bytes(xlen) as u64;
        io::copy(&mut src.take(extra), &mut io::sink())?;
        len += 2 + extra;
    }
    for flag in [0x08u8, 0x10] {
        // FNAME, FCOMMENT: NUL-terminated
        if flags & flag != 0 {
            let mut byte = [0u8; 1];
            loop {
                src.read_exact(&mut byte)?;
                len += 1;
                if byte[0] == 0 {
                    break;
                }
            }
        }
    }
    if flags & 0x02 != 0 {
        // FHCRC
        let mut crc = [0u8; 2];
        src.read_exact(&mut crc)?;
        len += 2;
    }
    Ok(len)
}

/// Gzip decoder that captures `(compressed_offset, uncompressed_offset,
/// window)` checkpoints each time the uncompressed position crosses an
/// interval boundary.
///
/// Compressed offsets are byte-granular; a captured point is only usable
/// for resume when the deflate stream happens to be byte-aligned there,
/// so consumers fall back to full decompression when a resume fails.
pub struct CheckpointingDecoder<R: Read> {
    src: R,
    state: InflateState,
    header_len: u64,
    interval: u64,
    next_checkpoint: u64,
    window: Vec<u8>,
    checkpoints: Vec<Checkpoint>,
}

impl<R: Read> CheckpointingDecoder<R> {
    /// `interval` is the uncompressed byte distance between checkpoints.
    pub fn new(mut src: R, interval: u64) -> Result<Self> {
        if interval == 0 {
            return Err(ClipError::Invariant(
                "checkpoint interval must be non-zero".into(),
            ));
        }
        let header_len = parse_gzip_header(&mut src)
            .map_err(|e| ClipError::Decompress(format!("gzip header: {e}")))?;
        Ok(Self {
            src,
            state: InflateState::new(Decompress::new(false)),
            header_len,
            interval,
            next_checkpoint: interval,
            window: Vec::with_capacity(WINDOW_SIZE),
            checkpoints: Vec::new(),
        })
    }

    pub fn into_index(self) -> GzipIndex {
        GzipIndex {
            checkpoints: self.checkpoints,
        }
    }

    fn push_window(&mut self, bytes: &[u8]) {
        if bytes.len() >= WINDOW_SIZE {
            self.window.clear();
            self.window.extend_from_slice(&bytes[bytes.len() - WINDOW_SIZE..]);
        } else {
            let overflow = (self.window.len() + bytes.len()).saturating_sub(WINDOW_SIZE);
            self.window.drain(..overflow);
            self.window.extend_from_slice(bytes);
        }
    }

    fn maybe_checkpoint(&mut self) {
        let u_off = self.state.inflate.total_out();
        if u_off < self.next_checkpoint || self.state.done {
            return;
        }
        self.checkpoints.push(Checkpoint {
            compressed_offset: self.header_len + self.state.inflate.total_in(),
            uncompressed_offset: u_off,
            window: Some(self.window.clone()),
        });
        while self.next_checkpoint <= u_off {
            self.next_checkpoint += self.interval;
        }
    }
}

impl<R: Read> Read for CheckpointingDecoder<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let n = self.state.read_into(&mut self.src, out)?;
        if n > 0 {
            let produced = &out[..n];
            self.push_window(produced);
            self.maybe_checkpoint();
        }
        Ok(n)
    }
}

/// Reader resuming a gzip stream at a previously captured checkpoint.
///
/// `src` must be the compressed stream from its beginning; the compressed
/// prefix up to the checkpoint is discarded, the deflate state is
/// re-seeded from the checkpoint window, and reads produce the
/// uncompressed bytes from `checkpoint.uncompressed_offset` on.
pub struct ResumedDecoder<R: Read> {
    src: R,
    state: InflateState,
}

impl<R: Read> ResumedDecoder<R> {
    pub fn new(mut src: R, checkpoint: &Checkpoint) -> Result<Self> {
        let window = checkpoint.window.as_deref().ok_or_else(|| {
            ClipError::Decompress("checkpoint has no window state".into())
        })?;

        io::copy(
            &mut (&mut src).take(checkpoint.compressed_offset),
            &mut io::sink(),
        )?;

        let mut inflate = Decompress::new(false);
        inflate
            .set_dictionary(window)
            .map_err(|e| ClipError::Decompress(format!("restore window: {e}")))?;
        Ok(Self {
            src,
            state: InflateState::new(inflate),
        })
    }
}

impl<R: Read> Read for ResumedDecoder<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        self.state.read_into(&mut self.src, out)
    }
}
