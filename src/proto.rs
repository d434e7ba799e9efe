//! Framed binary protocol carried over each worker's stdout.
//!
//! Every frame is `{ size: usize, type: usize }` in native byte order
//! (`size` includes the header), followed by a type-specific body: scalars
//! as native-endian raw bytes, byte strings and arrays length-prefixed,
//! structs field by field in declaration order. The message type list is
//! append-only.

use pretty_hex::pretty_hex;

use crate::chunks::Offset;

pub const WORD: usize = std::mem::size_of::<usize>();
pub const HEADER_LEN: usize = 2 * WORD;

/// Upper bound on a sane frame; anything larger means the stream is
/// corrupt (the longest real frames carry one ≤4 KiB path).
const MAX_FRAME: usize = 1 << 20;

#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("truncated message body")]
    Truncated,
    #[error("unknown message type {0}")]
    UnknownType(usize),
    #[error("bad frame size {size}:\n{dump}")]
    BadFrame { size: usize, dump: String },
    #[error("{extra} trailing bytes after message type {type_}:\n{dump}")]
    TrailingBytes {
        extra: usize,
        type_: usize,
        dump: String,
    },
}

pub struct WireCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireCursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        WireCursor { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtoError> {
        if self.data.len() - self.pos < n {
            return Err(ProtoError::Truncated);
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

pub trait Wire: Sized {
    fn put(&self, out: &mut Vec<u8>);
    fn get(cur: &mut WireCursor) -> Result<Self, ProtoError>;
}

macro_rules! wire_scalar {
    ($($t:ty),*) => {
        $(impl Wire for $t {
            fn put(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_ne_bytes());
            }
            fn get(cur: &mut WireCursor) -> Result<Self, ProtoError> {
                let bytes = cur.take(std::mem::size_of::<$t>())?;
                Ok(<$t>::from_ne_bytes(bytes.try_into().unwrap()))
            }
        })*
    };
}

wire_scalar!(u16, u32, u64, i32, i64, usize);

impl Wire for u8 {
    fn put(&self, out: &mut Vec<u8>) {
        out.push(*self);
    }
    fn get(cur: &mut WireCursor) -> Result<Self, ProtoError> {
        Ok(cur.take(1)?[0])
    }
}

impl Wire for bool {
    fn put(&self, out: &mut Vec<u8>) {
        out.push(*self as u8);
    }
    fn get(cur: &mut WireCursor) -> Result<Self, ProtoError> {
        Ok(cur.take(1)?[0] != 0)
    }
}

impl Wire for [u8; 16] {
    fn put(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }
    fn get(cur: &mut WireCursor) -> Result<Self, ProtoError> {
        Ok(cur.take(16)?.try_into().unwrap())
    }
}

impl<T: Wire> Wire for Vec<T> {
    fn put(&self, out: &mut Vec<u8>) {
        self.len().put(out);
        for item in self {
            item.put(out);
        }
    }
    fn get(cur: &mut WireCursor) -> Result<Self, ProtoError> {
        let len = usize::get(cur)?;
        // Guard against absurd prefixes before allocating.
        if len > MAX_FRAME {
            return Err(ProtoError::Truncated);
        }
        let mut items = Vec::with_capacity(len);
        for _ in 0..len {
            items.push(T::get(cur)?);
        }
        Ok(items)
    }
}

impl Wire for Offset {
    fn put(&self, out: &mut Vec<u8>) {
        self.logical.put(out);
        self.dev_id.put(out);
        self.physical.put(out);
    }
    fn get(cur: &mut WireCursor) -> Result<Self, ProtoError> {
        Ok(Offset {
            logical: u64::get(cur)?,
            dev_id: u64::get(cur)?,
            physical: u64::get(cur)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMsg {
    pub devid: u64,
    pub total_bytes: u64,
    pub path: Vec<u8>,
}

impl Wire for DeviceMsg {
    fn put(&self, out: &mut Vec<u8>) {
        self.devid.put(out);
        self.total_bytes.put(out);
        self.path.put(out);
    }
    fn get(cur: &mut WireCursor) -> Result<Self, ProtoError> {
        Ok(DeviceMsg {
            devid: u64::get(cur)?,
            total_bytes: u64::get(cur)?,
            path: Wire::get(cur)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartMsg {
    pub total_size: u64,
    pub fsid: [u8; 16],
    pub devices: Vec<DeviceMsg>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRootMsg {
    pub root_id: u64,
    pub parent_root_id: u64,
    /// Path of the subvolume below its parent root (may contain `/`).
    pub name: Vec<u8>,
    pub generation: u64,
    pub otime_sec: u64,
    pub readonly: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultStartMsg {
    pub chunk_flags: u64,
    pub offset: Offset,
    pub sample_index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultInodeStartMsg {
    pub root_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultInodeErrorMsg {
    pub errno: i32,
    pub msg: Vec<u8>,
    pub path: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultMsg {
    pub path: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultErrorMsg {
    pub errno: i32,
    pub msg: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultEndMsg {
    pub duration_hnsecs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalErrorMsg {
    pub msg: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Start(StartMsg),
    NewRoot(NewRootMsg),
    ResultStart(ResultStartMsg),
    ResultIgnoringOffset,
    ResultInodeStart(ResultInodeStartMsg),
    ResultInodeError(ResultInodeErrorMsg),
    ResultInodeEnd,
    Result(ResultMsg),
    ResultError(ResultErrorMsg),
    ResultEnd(ResultEndMsg),
    FatalError(FatalErrorMsg),
}

impl Message {
    pub fn type_index(&self) -> usize {
        match self {
            Message::Start(_) => 0,
            Message::NewRoot(_) => 1,
            Message::ResultStart(_) => 2,
            Message::ResultIgnoringOffset => 3,
            Message::ResultInodeStart(_) => 4,
            Message::ResultInodeError(_) => 5,
            Message::ResultInodeEnd => 6,
            Message::Result(_) => 7,
            Message::ResultError(_) => 8,
            Message::ResultEnd(_) => 9,
            Message::FatalError(_) => 10,
        }
    }

    fn put_body(&self, out: &mut Vec<u8>) {
        match self {
            Message::Start(m) => {
                m.total_size.put(out);
                m.fsid.put(out);
                m.devices.put(out);
            }
            Message::NewRoot(m) => {
                m.root_id.put(out);
                m.parent_root_id.put(out);
                m.name.put(out);
                m.generation.put(out);
                m.otime_sec.put(out);
                m.readonly.put(out);
            }
            Message::ResultStart(m) => {
                m.chunk_flags.put(out);
                m.offset.put(out);
                m.sample_index.put(out);
            }
            Message::ResultIgnoringOffset => {}
            Message::ResultInodeStart(m) => {
                m.root_id.put(out);
            }
            Message::ResultInodeError(m) => {
                m.errno.put(out);
                m.msg.put(out);
                m.path.put(out);
            }
            Message::ResultInodeEnd => {}
            Message::Result(m) => {
                m.path.put(out);
            }
            Message::ResultError(m) => {
                m.errno.put(out);
                m.msg.put(out);
            }
            Message::ResultEnd(m) => {
                m.duration_hnsecs.put(out);
            }
            Message::FatalError(m) => {
                m.msg.put(out);
            }
        }
    }

    fn get_body(type_: usize, body: &[u8]) -> Result<Message, ProtoError> {
        let mut cur = WireCursor::new(body);
        let msg = match type_ {
            0 => Message::Start(StartMsg {
                total_size: Wire::get(&mut cur)?,
                fsid: Wire::get(&mut cur)?,
                devices: Wire::get(&mut cur)?,
            }),
            1 => Message::NewRoot(NewRootMsg {
                root_id: Wire::get(&mut cur)?,
                parent_root_id: Wire::get(&mut cur)?,
                name: Wire::get(&mut cur)?,
                generation: Wire::get(&mut cur)?,
                otime_sec: Wire::get(&mut cur)?,
                readonly: Wire::get(&mut cur)?,
            }),
            2 => Message::ResultStart(ResultStartMsg {
                chunk_flags: Wire::get(&mut cur)?,
                offset: Wire::get(&mut cur)?,
                sample_index: Wire::get(&mut cur)?,
            }),
            3 => Message::ResultIgnoringOffset,
            4 => Message::ResultInodeStart(ResultInodeStartMsg {
                root_id: Wire::get(&mut cur)?,
            }),
            5 => Message::ResultInodeError(ResultInodeErrorMsg {
                errno: Wire::get(&mut cur)?,
                msg: Wire::get(&mut cur)?,
                path: Wire::get(&mut cur)?,
            }),
            6 => Message::ResultInodeEnd,
            7 => Message::Result(ResultMsg {
                path: Wire::get(&mut cur)?,
            }),
            8 => Message::ResultError(ResultErrorMsg {
                errno: Wire::get(&mut cur)?,
                msg: Wire::get(&mut cur)?,
            }),
            9 => Message::ResultEnd(ResultEndMsg {
                duration_hnsecs: Wire::get(&mut cur)?,
            }),
            10 => Message::FatalError(FatalErrorMsg {
                msg: Wire::get(&mut cur)?,
            }),
            other => return Err(ProtoError::UnknownType(other)),
        };
        if cur.remaining() != 0 {
            return Err(ProtoError::TrailingBytes {
                extra: cur.remaining(),
                type_,
                dump: pretty_hex(&body),
            });
        }
        Ok(msg)
    }
}

/// Serialize one frame: header plus body.
pub fn encode(msg: &Message) -> Vec<u8> {
    let mut out = vec![0u8; HEADER_LEN];
    msg.put_body(&mut out);
    let size = out.len();
    out[..WORD].copy_from_slice(&size.to_ne_bytes());
    out[WORD..HEADER_LEN].copy_from_slice(&msg.type_index().to_ne_bytes());
    out
}

/// Sending side: frames written to any `Write` (a worker's stdout).
pub struct MessageWriter<W: std::io::Write> {
    inner: W,
}

impl<W: std::io::Write> MessageWriter<W> {
    pub fn new(inner: W) -> Self {
        MessageWriter { inner }
    }

    pub fn send(&mut self, msg: &Message) -> std::io::Result<()> {
        self.inner.write_all(&encode(msg))
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Incremental frame parser. Bytes go in via [`StreamParser::feed`];
/// complete messages come out of [`StreamParser::next`]. Partial frames
/// are kept, never destructively consumed.
pub struct StreamParser {
    buf: Vec<u8>,
    start: usize,
}

impl StreamParser {
    pub fn new() -> Self {
        StreamParser {
            buf: Vec::new(),
            start: 0,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        // Reclaim consumed space before growing.
        if self.start > 0 && (self.start == self.buf.len() || self.start >= 1 << 16) {
            self.buf.drain(..self.start);
            self.start = 0;
        }
        self.buf.extend_from_slice(data);
    }

    fn available(&self) -> usize {
        self.buf.len() - self.start
    }

    /// Bytes to read before the next `next()` call can make progress.
    /// Callers size their reads with this.
    pub fn needed(&self) -> usize {
        let avail = self.available();
        if avail < HEADER_LEN {
            return HEADER_LEN - avail;
        }
        let size = self.peek_size();
        if size > avail {
            size - avail
        } else {
            0
        }
    }

    /// True when a partial frame sits in the buffer (EOF now would be a
    /// protocol violation).
    pub fn has_partial(&self) -> bool {
        self.available() > 0
    }

    fn peek_size(&self) -> usize {
        usize::from_ne_bytes(self.buf[self.start..self.start + WORD].try_into().unwrap())
    }

    pub fn next(&mut self) -> Result<Option<Message>, ProtoError> {
        if self.available() < HEADER_LEN {
            return Ok(None);
        }
        let size = self.peek_size();
        if size < HEADER_LEN || size > MAX_FRAME {
            return Err(ProtoError::BadFrame {
                size,
                dump: pretty_hex(
                    &&self.buf[self.start..(self.start + 64).min(self.buf.len())],
                ),
            });
        }
        if self.available() < size {
            return Ok(None);
        }
        let type_ = usize::from_ne_bytes(
            self.buf[self.start + WORD..self.start + HEADER_LEN]
                .try_into()
                .unwrap(),
        );
        let body = &self.buf[self.start + HEADER_LEN..self.start + size];
        let msg = Message::get_body(type_, body)?;
        self.start += size;
        Ok(Some(msg))
    }
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::Start(StartMsg {
                total_size: 1 << 40,
                fsid: [7; 16],
                devices: vec![DeviceMsg {
                    devid: 1,
                    total_bytes: 1 << 40,
                    path: b"/dev/sda1".to_vec(),
                }],
            }),
            Message::NewRoot(NewRootMsg {
                root_id: 256,
                parent_root_id: 5,
                name: b"@root".to_vec(),
                generation: 1234,
                otime_sec: 1600000000,
                readonly: false,
            }),
            Message::ResultStart(ResultStartMsg {
                chunk_flags: 1,
                offset: Offset {
                    logical: 123456,
                    dev_id: u64::MAX,
                    physical: u64::MAX,
                },
                sample_index: 42,
            }),
            Message::ResultIgnoringOffset,
            Message::ResultInodeStart(ResultInodeStartMsg { root_id: 256 }),
            Message::ResultInodeError(ResultInodeErrorMsg {
                errno: 2,
                msg: b"ino_paths".to_vec(),
                path: b"some/file".to_vec(),
            }),
            Message::ResultInodeEnd,
            Message::Result(ResultMsg {
                path: b"etc/passwd".to_vec(),
            }),
            Message::ResultError(ResultErrorMsg {
                errno: 5,
                msg: b"logical_ino".to_vec(),
            }),
            Message::ResultEnd(ResultEndMsg {
                duration_hnsecs: 1500,
            }),
            Message::FatalError(FatalErrorMsg {
                msg: b"cannot happen".to_vec(),
            }),
        ]
    }

    #[test]
    fn encode_decode_all_kinds() {
        let mut parser = StreamParser::new();
        let msgs = sample_messages();
        for msg in &msgs {
            parser.feed(&encode(msg));
        }
        let mut decoded = Vec::new();
        while let Some(msg) = parser.next().unwrap() {
            decoded.push(msg);
        }
        assert_eq!(decoded, msgs);
        assert!(!parser.has_partial());
    }

    #[test]
    fn type_indices_are_stable() {
        let indices: Vec<usize> = sample_messages().iter().map(|m| m.type_index()).collect();
        assert_eq!(indices, (0..=10).collect::<Vec<_>>());
    }

    #[test]
    fn needed_tracks_header_then_body() {
        let mut parser = StreamParser::new();
        assert_eq!(parser.needed(), HEADER_LEN);
        let frame = encode(&Message::Result(ResultMsg {
            path: b"a/b".to_vec(),
        }));
        parser.feed(&frame[..HEADER_LEN - 1]);
        assert_eq!(parser.needed(), 1);
        assert!(parser.next().unwrap().is_none());
        parser.feed(&frame[HEADER_LEN - 1..HEADER_LEN]);
        assert_eq!(parser.needed(), frame.len() - HEADER_LEN);
        parser.feed(&frame[HEADER_LEN..]);
        assert_eq!(parser.needed(), 0);
        assert!(parser.next().unwrap().is_some());
    }

    #[test]
    fn bad_size_is_rejected() {
        let mut parser = StreamParser::new();
        let mut frame = encode(&Message::ResultInodeEnd);
        frame[..WORD].copy_from_slice(&(3usize).to_ne_bytes());
        parser.feed(&frame);
        assert!(matches!(parser.next(), Err(ProtoError::BadFrame { .. })));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut parser = StreamParser::new();
        let mut frame = encode(&Message::ResultInodeEnd);
        frame[WORD..HEADER_LEN].copy_from_slice(&(999usize).to_ne_bytes());
        parser.feed(&frame);
        assert!(matches!(parser.next(), Err(ProtoError::UnknownType(999))));
    }
}
