//! Bridges `tracing` output into the stats gate's log ring buffer.

use std::io::Write;
use std::sync::Arc;

use tracing_subscriber::fmt::MakeWriter;

use haven_rpc::stats::LogBuffer;

/// A `MakeWriter` that appends every formatted line to a [`LogBuffer`].
#[derive(Clone)]
pub struct BufferMakeWriter {
    buffer: Arc<LogBuffer>,
}

impl BufferMakeWriter {
    pub fn new(buffer: Arc<LogBuffer>) -> Self {
        Self { buffer }
    }
}

impl<'a> MakeWriter<'a> for BufferMakeWriter {
    type Writer = BufferWriter;

    fn make_writer(&'a self) -> Self::Writer {
        BufferWriter {
            buffer: self.buffer.clone(),
            pending: Vec::new(),
        }
    }
}

/// Accumulates bytes and pushes complete lines into the ring buffer.
pub struct BufferWriter {
    buffer: Arc<LogBuffer>,
    pending: Vec<u8>,
}

impl Write for BufferWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.pending.extend_from_slice(buf);
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            self.buffer.push(text);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for BufferWriter {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            let text = String::from_utf8_lossy(&self.pending).into_owned();
            self.buffer.push(text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_reach_buffer() {
        let buffer = Arc::new(LogBuffer::new(10));
        let make = BufferMakeWriter::new(buffer.clone());
        let mut writer = make.make_writer();
        writer.write_all(b"first line\nsecond ").expect("write");
        writer.write_all(b"half\n").expect("write");
        drop(writer);
        assert_eq!(buffer.snapshot(), vec!["first line", "second half"]);
    }

    #[test]
    fn test_partial_line_flushed_on_drop() {
        let buffer = Arc::new(LogBuffer::new(10));
        let make = BufferMakeWriter::new(buffer.clone());
        let mut writer = make.make_writer();
        writer.write_all(b"no newline").expect("write");
        drop(writer);
        assert_eq!(buffer.snapshot(), vec!["no newline"]);
    }
}
