//! Request bodies.
//!
//! Small bodies stay in memory. Once a body grows past the configured
//! threshold it is moved to an anonymous temporary file, so large uploads
//! never sit in RAM.

use bytes::{Bytes, BytesMut};
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

/// The fully received body of a request.
#[derive(Debug, Default)]
pub enum Body {
    #[default]
    Empty,
    Memory(Bytes),
    /// Spooled to an unlinked temporary file.
    Spooled { file: File, len: u64 },
}

impl Body {
    pub fn len(&self) -> u64 {
        match self {
            Body::Empty => 0,
            Body::Memory(bytes) => bytes.len() as u64,
            Body::Spooled { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Opens a reader positioned at the start of the body.
    pub fn reader(&self) -> io::Result<Box<dyn Read + Send + '_>> {
        match self {
            Body::Empty => Ok(Box::new(io::empty())),
            Body::Memory(bytes) => Ok(Box::new(Cursor::new(&bytes[..]))),
            Body::Spooled { file, len } => {
                let mut file = file;
                file.seek(SeekFrom::Start(0))?;
                Ok(Box::new(file.take(*len)))
            }
        }
    }

    /// Reads the whole body into memory.
    pub fn to_bytes(&self) -> io::Result<Bytes> {
        match self {
            Body::Empty => Ok(Bytes::new()),
            Body::Memory(bytes) => Ok(bytes.clone()),
            Body::Spooled { len, .. } => {
                let mut data = Vec::with_capacity(*len as usize);
                self.reader()?.read_to_end(&mut data)?;
                Ok(data.into())
            }
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        if bytes.is_empty() {
            Body::Empty
        } else {
            Body::Memory(bytes)
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(data: Vec<u8>) -> Self {
        Bytes::from(data).into()
    }
}

impl From<&'static str> for Body {
    fn from(data: &'static str) -> Self {
        Bytes::from_static(data.as_bytes()).into()
    }
}

/// Accumulates decoded body bytes while a request is being parsed.
#[derive(Debug)]
pub(crate) struct BodySink {
    threshold: usize,
    memory: BytesMut,
    file: Option<File>,
    len: u64,
}

impl BodySink {
    pub(crate) fn new(threshold: usize) -> Self {
        Self {
            threshold,
            memory: BytesMut::new(),
            file: None,
            len: 0,
        }
    }

    pub(crate) fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if self.file.is_none() && self.memory.len() + data.len() > self.threshold {
            let mut file = tempfile::tempfile()?;
            file.write_all(&self.memory)?;
            self.memory = BytesMut::new();
            self.file = Some(file);
        }
        match self.file.as_mut() {
            Some(file) => file.write_all(data)?,
            None => self.memory.extend_from_slice(data),
        }
        self.len += data.len() as u64;
        Ok(())
    }

    /// The last `n` bytes written, if at least `n` bytes are held.
    pub(crate) fn tail(&mut self, n: usize) -> io::Result<Option<Vec<u8>>> {
        if self.len < n as u64 {
            return Ok(None);
        }
        match self.file.as_mut() {
            None => Ok(Some(self.memory[self.memory.len() - n..].to_vec())),
            Some(file) => {
                let mut tail = vec![0; n];
                file.seek(SeekFrom::End(-(n as i64)))?;
                file.read_exact(&mut tail)?;
                file.seek(SeekFrom::End(0))?;
                Ok(Some(tail))
            }
        }
    }

    /// Drops the last `n` bytes written.
    pub(crate) fn truncate(&mut self, n: u64) -> io::Result<()> {
        let len = self.len.saturating_sub(n);
        match self.file.as_mut() {
            None => self.memory.truncate(len as usize),
            Some(file) => {
                file.set_len(len)?;
                file.seek(SeekFrom::End(0))?;
            }
        }
        self.len = len;
        Ok(())
    }

    pub(crate) fn len(&self) -> u64 {
        self.len
    }

    pub(crate) fn finish(self) -> io::Result<Body> {
        match self.file {
            Some(mut file) => {
                file.flush()?;
                Ok(Body::Spooled {
                    file,
                    len: self.len,
                })
            }
            None => Ok(self.memory.freeze().into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_bodies_stay_in_memory() {
        let mut sink = BodySink::new(16);
        sink.write(b"hello").unwrap();
        let body = sink.finish().unwrap();
        assert!(matches!(body, Body::Memory(_)));
        assert_eq!(body.to_bytes().unwrap(), Bytes::from_static(b"hello"));
    }

    #[test]
    fn large_bodies_spill_to_disk() {
        let mut sink = BodySink::new(4);
        sink.write(b"abc").unwrap();
        sink.write(b"defgh").unwrap();
        let body = sink.finish().unwrap();
        assert!(matches!(body, Body::Spooled { len: 8, .. }));

        let mut data = String::new();
        body.reader().unwrap().read_to_string(&mut data).unwrap();
        assert_eq!(data, "abcdefgh");
        // a second reader starts from the beginning again
        assert_eq!(body.to_bytes().unwrap().len(), 8);
    }

    #[test]
    fn tail_and_truncate_work_on_both_backings() {
        for threshold in [64, 2] {
            let mut sink = BodySink::new(threshold);
            sink.write(b"data\r\n0").unwrap();
            assert_eq!(sink.tail(3).unwrap().as_deref(), Some(&b"\r\n0"[..]));
            sink.truncate(3).unwrap();
            sink.write(b"!").unwrap();
            assert_eq!(sink.finish().unwrap().to_bytes().unwrap(), Bytes::from_static(b"data!"));
        }
    }

    #[test]
    fn empty_sink_yields_empty_body() {
        let body = BodySink::new(8).finish().unwrap();
        assert!(matches!(body, Body::Empty));
        assert!(body.is_empty());
    }
}
