use std::{fmt, io::Read};

/// How a [`NotifyingStream`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamClose {
    pub bytes_read: u64,
    /// True when the reader reported end of stream before closing.
    pub reached_eof: bool,
}

pub type CloseListener = Box<dyn FnOnce(StreamClose) + Send>;

/// Reader that runs a one-shot listener when it is closed or dropped.
///
/// The wrapped reader is released before the listener runs, so the listener
/// may delete the file backing it.
pub struct NotifyingStream {
    inner: Option<Box<dyn Read + Send>>,
    listener: Option<CloseListener>,
    bytes_read: u64,
    reached_eof: bool,
}

impl NotifyingStream {
    pub fn new(inner: impl Read + Send + 'static) -> Self {
        Self {
            inner: Some(Box::new(inner)),
            listener: None,
            bytes_read: 0,
            reached_eof: false,
        }
    }

    pub fn with_close_listener(
        inner: impl Read + Send + 'static,
        listener: impl FnOnce(StreamClose) + Send + 'static,
    ) -> Self {
        let mut stream = Self::new(inner);
        stream.listener = Some(Box::new(listener));
        stream
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    /// Release the reader and notify the listener.
    pub fn close(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.inner.take().is_none() {
            return;
        }
        if let Some(listener) = self.listener.take() {
            listener(StreamClose {
                bytes_read: self.bytes_read,
                reached_eof: self.reached_eof,
            });
        }
    }
}

impl Read for NotifyingStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let Some(inner) = self.inner.as_mut() else {
            return Ok(0);
        };
        let read = inner.read(buf)?;
        if read == 0 && !buf.is_empty() {
            self.reached_eof = true;
        }
        self.bytes_read += read as u64;
        Ok(read)
    }
}

impl Drop for NotifyingStream {
    fn drop(&mut self) {
        self.finish();
    }
}

impl fmt::Debug for NotifyingStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifyingStream")
            .field("bytes_read", &self.bytes_read)
            .field("reached_eof", &self.reached_eof)
            .field("closed", &self.is_closed())
            .finish()
    }
}
