//! Wire types shared with the request-dispatch layer.
//!
//! The dispatcher owns the network framing and hands each request to a
//! storage component through [`Handler::command`]. Request payloads are
//! framed as an [`IoAttr`] followed by the object bytes; every multi-byte
//! integer on the wire is big-endian and is normalized here on entry and
//! re-encoded on reply.

use std::fmt;
use std::fs::File;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;
use crate::{errdata, Error};

/// Length of an object identifier in bytes.
pub const ID_SIZE: usize = 20;

/// Wire length of [`Cmd`].
pub const CMD_SIZE: usize = ID_SIZE + 8 + 8 + 4 + 8;

/// Wire length of [`Attr`].
pub const ATTR_SIZE: usize = 8 + 4 + 8;

/// Wire length of [`IoAttr`].
pub const IO_ATTR_SIZE: usize = ID_SIZE * 2 + 8 + 8 + 8 + 4;

/// Route the operation to the history stream instead of the data stream.
pub const IO_FLAGS_HISTORY: u64 = 1 << 0;
/// The payload is metadata; cleared when a synthetic history entry is built.
pub const IO_FLAGS_META: u64 = 1 << 1;
/// Append to the object's existing history block rather than replacing it.
pub const IO_FLAGS_APPEND: u64 = 1 << 2;
/// Suppress the synthetic history entry that normally follows a data write.
pub const IO_FLAGS_NO_HISTORY_UPDATE: u64 = 1 << 3;

/// Seed folded into object-id hashes.
const HASH_SEED: u64 = 0x883eaf5a;

/// Fixed-length opaque object identifier. Equality is byte-wise; the id
/// carries no structure the storage core interprets.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ObjectId([u8; ID_SIZE]);

impl ObjectId {
    pub const fn new(bytes: [u8; ID_SIZE]) -> Self {
        ObjectId(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != ID_SIZE {
            return errdata!("object id must be {} bytes, got {}", ID_SIZE, bytes.len());
        }
        let mut id = [0u8; ID_SIZE];
        id.copy_from_slice(bytes);
        Ok(ObjectId(id))
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    /// Folds the id's leading u64 words with XOR against the seed constant.
    /// The trailing bytes that do not fill a word are ignored.
    pub fn fold(&self) -> u64 {
        let mut hash = HASH_SEED;
        for chunk in self.0.chunks_exact(8) {
            hash ^= u64::from_le_bytes(chunk.try_into().unwrap());
        }
        hash
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self)
    }
}

impl std::hash::Hash for ObjectId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u64(self.fold());
    }
}

/// Command codes understood by the storage components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CmdKind {
    Write = 1,
    Read = 2,
    List = 3,
    Stat = 4,
    Del = 5,
}

impl TryFrom<u32> for CmdKind {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            1 => Ok(CmdKind::Write),
            2 => Ok(CmdKind::Read),
            3 => Ok(CmdKind::List),
            4 => Ok(CmdKind::Stat),
            5 => Ok(CmdKind::Del),
            other => errdata!("unknown command code: {}", other),
        }
    }
}

/// Per-request command header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cmd {
    pub id: ObjectId,
    pub flags: u64,
    pub trans: u64,
    pub status: i32,
    pub size: u64,
}

impl Cmd {
    pub fn new(id: ObjectId) -> Self {
        Cmd {
            id,
            flags: 0,
            trans: 0,
            status: 0,
            size: 0,
        }
    }

    pub fn encode(&self) -> [u8; CMD_SIZE] {
        let mut buf = [0u8; CMD_SIZE];
        buf[0..ID_SIZE].copy_from_slice(self.id.as_bytes());
        let mut w = &mut buf[ID_SIZE..];
        w.write_u64::<BigEndian>(self.flags).unwrap();
        w.write_u64::<BigEndian>(self.trans).unwrap();
        w.write_i32::<BigEndian>(self.status).unwrap();
        w.write_u64::<BigEndian>(self.size).unwrap();
        buf
    }

    pub fn decode(buf: &[u8; CMD_SIZE]) -> Result<Self> {
        let id = ObjectId::from_slice(&buf[0..ID_SIZE])?;
        let mut r = &buf[ID_SIZE..];
        let flags = r.read_u64::<BigEndian>()?;
        let trans = r.read_u64::<BigEndian>()?;
        let status = r.read_i32::<BigEndian>()?;
        let size = r.read_u64::<BigEndian>()?;
        Ok(Cmd {
            id,
            flags,
            trans,
            status,
            size,
        })
    }
}

/// Attribute header carried between the command header and the data frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attr {
    pub size: u64,
    pub cmd: CmdKind,
    pub flags: u64,
}

impl Attr {
    pub fn new(cmd: CmdKind, size: u64) -> Self {
        Attr {
            size,
            cmd,
            flags: 0,
        }
    }

    pub fn encode(&self) -> [u8; ATTR_SIZE] {
        let mut buf = [0u8; ATTR_SIZE];
        let mut w = &mut buf[..];
        w.write_u64::<BigEndian>(self.size).unwrap();
        w.write_u32::<BigEndian>(self.cmd as u32).unwrap();
        w.write_u64::<BigEndian>(self.flags).unwrap();
        buf
    }

    pub fn decode(buf: &[u8; ATTR_SIZE]) -> Result<Self> {
        let mut r = &buf[..];
        let size = r.read_u64::<BigEndian>()?;
        let cmd = CmdKind::try_from(r.read_u32::<BigEndian>()?)?;
        let flags = r.read_u64::<BigEndian>()?;
        Ok(Attr { size, cmd, flags })
    }
}

/// IO attributes framing every WRITE and READ payload.
///
/// `origin` addresses the stored object; `id` is the requester-side identity
/// the reply is routed back to. `kind` is an opaque payload type tag the core
/// passes through untouched.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IoAttr {
    pub origin: ObjectId,
    pub id: ObjectId,
    pub offset: u64,
    pub size: u64,
    pub flags: u64,
    pub kind: u32,
}

impl IoAttr {
    pub fn new(origin: ObjectId, size: u64) -> Self {
        IoAttr {
            origin,
            id: origin,
            offset: 0,
            size,
            flags: 0,
            kind: 0,
        }
    }

    pub fn encode(&self) -> [u8; IO_ATTR_SIZE] {
        let mut buf = [0u8; IO_ATTR_SIZE];
        buf[0..ID_SIZE].copy_from_slice(self.origin.as_bytes());
        buf[ID_SIZE..ID_SIZE * 2].copy_from_slice(self.id.as_bytes());
        let mut w = &mut buf[ID_SIZE * 2..];
        w.write_u64::<BigEndian>(self.offset).unwrap();
        w.write_u64::<BigEndian>(self.size).unwrap();
        w.write_u64::<BigEndian>(self.flags).unwrap();
        w.write_u32::<BigEndian>(self.kind).unwrap();
        buf
    }

    pub fn decode(buf: &[u8; IO_ATTR_SIZE]) -> Result<Self> {
        let origin = ObjectId::from_slice(&buf[0..ID_SIZE])?;
        let id = ObjectId::from_slice(&buf[ID_SIZE..ID_SIZE * 2])?;
        let mut r = &buf[ID_SIZE * 2..];
        let offset = r.read_u64::<BigEndian>()?;
        let size = r.read_u64::<BigEndian>()?;
        let flags = r.read_u64::<BigEndian>()?;
        let kind = r.read_u32::<BigEndian>()?;
        Ok(IoAttr {
            origin,
            id,
            offset,
            size,
            flags,
            kind,
        })
    }

    /// Splits a request data frame into its normalized IO attributes and the
    /// trailing payload.
    pub fn split(data: &[u8]) -> Result<(IoAttr, &[u8])> {
        if data.len() < IO_ATTR_SIZE {
            return errdata!(
                "data frame too short for io attributes: {} < {}",
                data.len(),
                IO_ATTR_SIZE
            );
        }
        let io = IoAttr::decode(data[..IO_ATTR_SIZE].try_into().unwrap())?;
        Ok((io, &data[IO_ATTR_SIZE..]))
    }
}

impl TryFrom<&[u8]> for IoAttr {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < IO_ATTR_SIZE {
            return errdata!("io attributes need {} bytes", IO_ATTR_SIZE);
        }
        IoAttr::decode(bytes[..IO_ATTR_SIZE].try_into().unwrap())
    }
}

/// Reply handed back to the dispatcher.
#[derive(Debug)]
pub enum Reply {
    /// Acknowledgement with no payload (writes, deletes).
    Ack,
    /// Fully rendered reply: headers re-encoded to wire byte order with the
    /// payload bytes inlined.
    Inline(Vec<u8>),
    /// Zero-copy descriptor: the rendered headers plus a byte range of the
    /// stream file for the dispatcher to transmit via sendfile.
    Sendfile {
        header: Vec<u8>,
        file: File,
        offset: u64,
        size: u64,
    },
}

impl Reply {
    /// Renders the reply headers for a read of `size` payload bytes.
    fn read_header(cmd: &Cmd, attr: &Attr, io: &IoAttr, size: u64) -> Vec<u8> {
        let reply_cmd = Cmd {
            id: io.origin,
            flags: 0,
            trans: cmd.trans,
            status: 0,
            size: (ATTR_SIZE + IO_ATTR_SIZE) as u64 + size,
        };
        let reply_attr = Attr {
            size: IO_ATTR_SIZE as u64 + size,
            cmd: CmdKind::Read,
            flags: attr.flags,
        };
        let reply_io = IoAttr {
            origin: io.origin,
            id: io.id,
            offset: io.offset,
            size,
            flags: io.flags,
            kind: io.kind,
        };

        let mut header = Vec::with_capacity(CMD_SIZE + ATTR_SIZE + IO_ATTR_SIZE);
        header.extend_from_slice(&reply_cmd.encode());
        header.extend_from_slice(&reply_attr.encode());
        header.extend_from_slice(&reply_io.encode());
        header
    }

    /// Builds an inline read reply carrying `payload`.
    pub fn inline(cmd: &Cmd, attr: &Attr, io: &IoAttr, payload: &[u8]) -> Reply {
        let mut frame = Self::read_header(cmd, attr, io, payload.len() as u64);
        frame.extend_from_slice(payload);
        Reply::Inline(frame)
    }

    /// Builds a sendfile read reply for `size` bytes at `offset` in `file`.
    pub fn sendfile(cmd: &Cmd, attr: &Attr, io: &IoAttr, file: File, offset: u64, size: u64) -> Reply {
        Reply::Sendfile {
            header: Self::read_header(cmd, attr, io, size),
            file,
            offset,
            size,
        }
    }
}

/// Uniform command interface fronted by both storage components. The
/// dispatcher selects a component per request and forwards the command;
/// components never call one another.
pub trait Handler: Send + Sync {
    fn command(&self, cmd: &Cmd, attr: &Attr, data: &[u8]) -> Result<Reply>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_id(fill: u8) -> ObjectId {
        ObjectId::new([fill; ID_SIZE])
    }

    #[test]
    fn test_object_id_from_slice() {
        let id = ObjectId::from_slice(&[0xaa; ID_SIZE]).expect("Failed to build id");
        assert_eq!(id.as_bytes(), &[0xaa; ID_SIZE]);

        let err = ObjectId::from_slice(&[0xaa; 4]);
        assert!(matches!(err, Err(Error::InvalidData(_))));
    }

    #[test]
    fn test_object_id_fold_is_stable() {
        let a = sample_id(0x11);
        let b = sample_id(0x11);
        assert_eq!(a.fold(), b.fold());
        assert_ne!(a.fold(), sample_id(0x12).fold());
    }

    #[test]
    fn test_object_id_fold_ignores_tail() {
        // Only the two leading u64 words participate in the fold.
        let mut bytes = [0u8; ID_SIZE];
        bytes[16] = 0xff;
        assert_eq!(ObjectId::new(bytes).fold(), ObjectId::new([0u8; ID_SIZE]).fold());
    }

    #[test]
    fn test_cmd_roundtrip() {
        let cmd = Cmd {
            id: sample_id(0x42),
            flags: 7,
            trans: 99,
            status: -2,
            size: 4096,
        };
        let encoded = cmd.encode();
        assert_eq!(encoded.len(), CMD_SIZE);
        let decoded = Cmd::decode(&encoded).expect("Failed to decode Cmd");
        assert_eq!(cmd, decoded);
    }

    #[test]
    fn test_attr_roundtrip() {
        let attr = Attr {
            size: 128,
            cmd: CmdKind::Write,
            flags: 3,
        };
        let decoded = Attr::decode(&attr.encode()).expect("Failed to decode Attr");
        assert_eq!(attr, decoded);
    }

    #[test]
    fn test_attr_rejects_unknown_command() {
        let mut buf = Attr::new(CmdKind::Read, 0).encode();
        // Corrupt the command code.
        buf[8..12].copy_from_slice(&999u32.to_be_bytes());
        assert!(matches!(Attr::decode(&buf), Err(Error::InvalidData(_))));
    }

    #[test]
    fn test_io_attr_roundtrip() {
        let io = IoAttr {
            origin: sample_id(0xaa),
            id: sample_id(0xbb),
            offset: 10,
            size: 20,
            flags: IO_FLAGS_HISTORY | IO_FLAGS_APPEND,
            kind: 5,
        };
        let decoded = IoAttr::decode(&io.encode()).expect("Failed to decode IoAttr");
        assert_eq!(io, decoded);
    }

    #[test]
    fn test_io_attr_split() {
        let io = IoAttr::new(sample_id(0xcc), 5);
        let mut frame = io.encode().to_vec();
        frame.extend_from_slice(b"hello");

        let (decoded, payload) = IoAttr::split(&frame).expect("Failed to split frame");
        assert_eq!(decoded, io);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn test_io_attr_split_short_frame() {
        let frame = vec![0u8; IO_ATTR_SIZE - 1];
        assert!(matches!(IoAttr::split(&frame), Err(Error::InvalidData(_))));
    }

    #[test]
    fn test_inline_reply_frame_layout() {
        let io = IoAttr::new(sample_id(0x01), 0);
        let cmd = Cmd::new(sample_id(0x01));
        let attr = Attr::new(CmdKind::Read, 64);

        let reply = Reply::inline(&cmd, &attr, &io, b"data");
        let frame = match reply {
            Reply::Inline(frame) => frame,
            other => panic!("Expected inline reply, got {:?}", other),
        };
        assert_eq!(frame.len(), CMD_SIZE + ATTR_SIZE + IO_ATTR_SIZE + 4);

        let reply_cmd = Cmd::decode(frame[..CMD_SIZE].try_into().unwrap())
            .expect("Failed to decode reply cmd");
        assert_eq!(reply_cmd.size, (ATTR_SIZE + IO_ATTR_SIZE + 4) as u64);
        assert_eq!(&frame[frame.len() - 4..], b"data");
    }
}
