//! Typed message channel pairing a control stream with a data stream.
//!
//! A [`Client`] sends one [`StartArg`], then any number of data chunks, then
//! a zero-length chunk as end of stream, and finally waits for a [`Res`].
//! A [`Worker`] is the receiving side. Both ride on the same byte stream;
//! the frame tag keeps control and data apart.

use crate::config::types::{Result, XprocError};
use crate::wire::frame::{self, Frame, Tag};
use crate::wire::net::Stream;
use crate::wire::types::{Res, SlaveArg, SlaveRes, StartArg};
use std::io::{self, ErrorKind, Read, Write};

const COPY_CHUNK: usize = 32 * 1024;

pub struct Client<R, W> {
    reader: R,
    writer: W,
}

impl Client<Stream, Stream> {
    pub fn over(stream: Stream) -> Result<Self> {
        let reader = stream.try_clone()?;
        Ok(Self::new(reader, stream))
    }
}

impl<R: Read, W: Write> Client<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    pub fn send_arg(&mut self, arg: &StartArg) -> Result<()> {
        frame::send(&mut self.writer, Tag::Start, arg)
    }

    /// Send one data chunk. An empty chunk ends the stream.
    pub fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        frame::send_data(&mut self.writer, chunk)
    }

    pub fn finish(&mut self) -> Result<()> {
        self.write_chunk(&[])
    }

    /// Copy everything `source` yields onto the data channel. Does not end the stream.
    pub fn read_from<S: Read>(&mut self, source: &mut S) -> Result<u64> {
        let mut buf = vec![0u8; COPY_CHUNK];
        let mut total = 0u64;
        loop {
            let n = match source.read(&mut buf) {
                Ok(0) => return Ok(total),
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            self.write_chunk(&buf[..n])?;
            total += n as u64;
        }
    }

    pub fn recv_resp(&mut self) -> Result<Res> {
        match frame::read_frame(&mut self.reader)? {
            Some(Frame::Resp(res)) => Ok(res),
            Some(other) => Err(XprocError::Transport(format!(
                "expected resp frame, got {}",
                other.name()
            ))),
            None => Err(XprocError::Transport(
                "connection closed before a response arrived".to_string(),
            )),
        }
    }

    /// Member-side registration handshake.
    pub fn register(&mut self, arg: &SlaveArg) -> Result<SlaveRes> {
        frame::send(&mut self.writer, Tag::Register, arg)?;
        match frame::read_frame(&mut self.reader)? {
            Some(Frame::Registered(res)) => Ok(res),
            Some(other) => Err(XprocError::Transport(format!(
                "expected registered frame, got {}",
                other.name()
            ))),
            None => Err(XprocError::Transport(
                "parent closed during registration".to_string(),
            )),
        }
    }

    pub fn into_parts(self) -> (R, W) {
        (self.reader, self.writer)
    }
}

pub struct Worker<R, W> {
    reader: R,
    writer: W,
    armed: bool,
    eof: bool,
    pending: Vec<u8>,
    pos: usize,
}

impl<R: Read, W: Write> Worker<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            armed: false,
            eof: false,
            pending: Vec::new(),
            pos: 0,
        }
    }

    /// For callers that already consumed the start frame themselves.
    pub fn after_arg(reader: R, writer: W) -> Self {
        let mut worker = Self::new(reader, writer);
        worker.armed = true;
        worker
    }

    /// Next start request, or `None` if the peer closed between jobs.
    pub fn next_arg(&mut self) -> Result<Option<StartArg>> {
        match frame::read_frame(&mut self.reader)? {
            Some(Frame::Start(arg)) => {
                self.armed = true;
                self.eof = false;
                self.pending.clear();
                self.pos = 0;
                Ok(Some(*arg))
            }
            Some(other) => Err(XprocError::Transport(format!(
                "expected start frame, got {}",
                other.name()
            ))),
            None => Ok(None),
        }
    }

    pub fn recv_arg(&mut self) -> Result<StartArg> {
        self.next_arg()?.ok_or_else(|| {
            XprocError::Transport("connection closed before a start request".to_string())
        })
    }

    /// Next data chunk; `None` once the zero-length terminator has been seen.
    pub fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if !self.armed {
            return Err(XprocError::Transport(
                "data requested before the start request was read".to_string(),
            ));
        }
        if self.eof {
            return Ok(None);
        }
        match frame::read_frame(&mut self.reader)? {
            Some(Frame::Data(bytes)) if bytes.is_empty() => {
                self.eof = true;
                Ok(None)
            }
            Some(Frame::Data(bytes)) => Ok(Some(bytes)),
            Some(other) => Err(XprocError::Transport(format!(
                "expected data frame, got {}",
                other.name()
            ))),
            None => Err(XprocError::Transport(
                "data stream ended without a terminator".to_string(),
            )),
        }
    }

    /// Copy the rest of the data stream into `sink`.
    pub fn write_to<S: Write>(&mut self, sink: &mut S) -> Result<u64> {
        let mut total = 0u64;
        if self.pos < self.pending.len() {
            sink.write_all(&self.pending[self.pos..])?;
            total += (self.pending.len() - self.pos) as u64;
            self.pending.clear();
            self.pos = 0;
        }
        while let Some(chunk) = self.next_chunk()? {
            sink.write_all(&chunk)?;
            total += chunk.len() as u64;
        }
        Ok(total)
    }

    /// Read and discard whatever remains of the data stream.
    pub fn drain(&mut self) -> Result<u64> {
        self.write_to(&mut io::sink())
    }

    pub fn send_resp(&mut self, res: &Res) -> Result<()> {
        frame::send(&mut self.writer, Tag::Resp, res)
    }
}

impl<R: Read, W: Write> Read for Worker<R, W> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos >= self.pending.len() {
            match self.next_chunk() {
                Ok(Some(chunk)) => {
                    self.pending = chunk;
                    self.pos = 0;
                }
                Ok(None) => return Ok(0),
                Err(XprocError::Io(e)) => return Err(e),
                Err(e) => return Err(io::Error::new(ErrorKind::InvalidData, e.to_string())),
            }
        }
        let n = buf.len().min(self.pending.len() - self.pos);
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::types::{Acmd, EntryKind};
    use std::io::Cursor;

    fn start_arg() -> StartArg {
        StartArg {
            run_id: "t".into(),
            nodes: vec![1, 2],
            peers: vec![],
            local_bin: false,
            program: "/bin/true".into(),
            args: vec!["true".into()],
            env: vec![],
            lfam: "unix".into(),
            lserver: "/tmp/t.sock".into(),
            uid: 0,
            gid: 0,
            cmds: vec![Acmd {
                name: "true".into(),
                fullpath: "/bin/true".into(),
                local: false,
                kind: EntryKind::Regular { mode: 0o755, size: 5 },
                file: None,
            }],
            total_file_bytes: 5,
        }
    }

    #[test]
    fn worker_sees_arg_then_bytes_then_eof() {
        let mut wire = Vec::new();
        {
            let mut client = Client::new(io::empty(), &mut wire);
            client.send_arg(&start_arg()).unwrap();
            client.read_from(&mut Cursor::new(b"hello".to_vec())).unwrap();
            client.write_chunk(b"!").unwrap();
            client.finish().unwrap();
        }

        let mut worker = Worker::new(Cursor::new(wire), io::sink());
        let arg = worker.recv_arg().unwrap();
        assert_eq!(arg.nodes, vec![1, 2]);
        assert_eq!(arg.cmds.len(), 1);

        let mut body = Vec::new();
        worker.read_to_end(&mut body).unwrap();
        assert_eq!(body, b"hello!");
        assert!(worker.next_chunk().unwrap().is_none());
    }

    #[test]
    fn data_before_arg_is_refused() {
        let mut wire = Vec::new();
        frame::send_data(&mut wire, b"x").unwrap();
        let mut worker = Worker::new(Cursor::new(wire), io::sink());
        assert!(matches!(
            worker.next_chunk(),
            Err(XprocError::Transport(_))
        ));
    }

    #[test]
    fn missing_terminator_is_a_transport_error() {
        let mut wire = Vec::new();
        frame::send_data(&mut wire, b"partial").unwrap();
        let mut worker = Worker::after_arg(Cursor::new(wire), io::sink());
        assert_eq!(worker.next_chunk().unwrap().unwrap(), b"partial");
        assert!(worker.next_chunk().is_err());
    }

    #[test]
    fn partial_reads_do_not_lose_bytes() {
        let mut wire = Vec::new();
        frame::send_data(&mut wire, b"abcdef").unwrap();
        frame::send_data(&mut wire, b"").unwrap();
        let mut worker = Worker::after_arg(Cursor::new(wire), io::sink());
        let mut head = [0u8; 2];
        worker.read_exact(&mut head).unwrap();
        assert_eq!(&head, b"ab");
        let mut rest = Vec::new();
        assert_eq!(worker.write_to(&mut rest).unwrap(), 4);
        assert_eq!(rest, b"cdef");
    }

    #[test]
    fn client_reads_the_response() {
        let mut wire = Vec::new();
        Worker::new(io::empty(), &mut wire)
            .send_resp(&Res::started(3, 77))
            .unwrap();
        let mut client = Client::new(Cursor::new(wire), io::sink());
        let res = client.recv_resp().unwrap();
        assert_eq!(res.pid, Some(77));
        assert!(client.recv_resp().is_err());
    }
}
