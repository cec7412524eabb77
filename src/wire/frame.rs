//! Length-prefixed frames.
//!
//! Every frame is `tag: u8`, `len: u32` (big endian), then `len` payload
//! bytes. Control frames carry JSON; `Data` frames carry raw bytes and a
//! zero-length `Data` frame marks the end of a data stream.

use crate::config::types::{to_transport_error, Result, XprocError};
use crate::wire::types::{Res, SetDebugLevel, SlaveArg, SlaveRes, StartArg};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{ErrorKind, Read, Write};

pub const MAX_FRAME_LEN: usize = 64 << 20;

const HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    Register = 1,
    Registered = 2,
    Start = 3,
    Data = 4,
    Resp = 5,
    DebugLevel = 6,
    Ack = 7,
}

impl TryFrom<u8> for Tag {
    type Error = XprocError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            1 => Tag::Register,
            2 => Tag::Registered,
            3 => Tag::Start,
            4 => Tag::Data,
            5 => Tag::Resp,
            6 => Tag::DebugLevel,
            7 => Tag::Ack,
            other => {
                return Err(XprocError::Transport(format!("unknown frame tag {}", other)))
            }
        })
    }
}

#[derive(Debug)]
pub enum Frame {
    Register(SlaveArg),
    Registered(SlaveRes),
    Start(Box<StartArg>),
    Data(Vec<u8>),
    Resp(Res),
    DebugLevel(SetDebugLevel),
    Ack,
}

impl Frame {
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Register(_) => "register",
            Frame::Registered(_) => "registered",
            Frame::Start(_) => "start",
            Frame::Data(_) => "data",
            Frame::Resp(_) => "resp",
            Frame::DebugLevel(_) => "debug-level",
            Frame::Ack => "ack",
        }
    }
}

fn header(tag: Tag, len: usize) -> Result<[u8; HEADER_LEN]> {
    if len > MAX_FRAME_LEN {
        return Err(XprocError::Transport(format!(
            "frame of {} bytes exceeds limit of {}",
            len, MAX_FRAME_LEN
        )));
    }
    let mut out = [0u8; HEADER_LEN];
    out[0] = tag as u8;
    out[1..].copy_from_slice(&(len as u32).to_be_bytes());
    Ok(out)
}

pub fn write_raw<W: Write>(writer: &mut W, tag: Tag, payload: &[u8]) -> Result<()> {
    let head = header(tag, payload.len())?;
    writer
        .write_all(&head)
        .and_then(|_| writer.write_all(payload))
        .and_then(|_| writer.flush())
        .map_err(|e| to_transport_error("write frame", e))
}

/// Write a JSON control frame.
pub fn send<W: Write, T: Serialize>(writer: &mut W, tag: Tag, value: &T) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    write_raw(writer, tag, &payload)
}

pub fn send_data<W: Write>(writer: &mut W, chunk: &[u8]) -> Result<()> {
    write_raw(writer, Tag::Data, chunk)
}

pub fn send_ack<W: Write>(writer: &mut W) -> Result<()> {
    write_raw(writer, Tag::Ack, &[])
}

fn decode<T: DeserializeOwned>(tag: Tag, payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload)
        .map_err(|e| XprocError::Parse(format!("{:?} frame: {}", tag, e)))
}

/// Read the next frame. `Ok(None)` means the peer closed cleanly between frames.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Frame>> {
    let mut head = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        match reader.read(&mut head[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(XprocError::Transport(
                    "connection closed inside a frame header".to_string(),
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(to_transport_error("read frame", e)),
        }
    }

    let tag = Tag::try_from(head[0])?;
    let len = u32::from_be_bytes([head[1], head[2], head[3], head[4]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(XprocError::Transport(format!(
            "frame of {} bytes exceeds limit of {}",
            len, MAX_FRAME_LEN
        )));
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .map_err(|e| to_transport_error("read frame payload", e))?;

    let frame = match tag {
        Tag::Register => Frame::Register(decode(tag, &payload)?),
        Tag::Registered => Frame::Registered(decode(tag, &payload)?),
        Tag::Start => Frame::Start(Box::new(decode(tag, &payload)?)),
        Tag::Data => Frame::Data(payload),
        Tag::Resp => Frame::Resp(decode(tag, &payload)?),
        Tag::DebugLevel => Frame::DebugLevel(decode(tag, &payload)?),
        Tag::Ack => Frame::Ack,
    };
    Ok(Some(frame))
}
