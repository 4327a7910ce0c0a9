//! Identifiers and value types shared by the recall state machines

use rand::thread_rng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{RecallError, Result};

/// NFSv4 client ID (64-bit opaque)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Server-side export identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExportId(pub u16);

impl std::fmt::Display for ExportId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The "other" part of a stateid: the stable key a granted state is looked
/// up by. Never changes for the life of the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateOther(pub [u8; 12]);

impl StateOther {
    /// Random, practically unique key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 12];
        thread_rng().fill_bytes(&mut bytes);
        StateOther(bytes)
    }

    pub fn as_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl std::fmt::Display for StateOther {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_hex())
    }
}

/// A full NFSv4 stateid: sequence number plus the stable key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateId {
    pub seqid: u32,
    pub other: StateOther,
}

impl std::fmt::Display for StateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}]", self.seqid, self.other)
    }
}

/// Maximum size of an NFSv4 file handle on the wire
pub const NFS4_FHSIZE: usize = 128;

/// Bytes the wire handle spends on its header (version + export id)
const FH_HEADER_LEN: usize = 3;

/// Wire handle version written into every encoded handle
const FH_VERSION: u8 = 0x43;

/// Opaque back-end handle of a file object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileHandle(pub Vec<u8>);

impl FileHandle {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        FileHandle(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Wraps the back-end handle into the NFSv4 handle a client knows the
    /// file by. Fails when the result would not fit in `NFS4_FHSIZE`.
    pub fn to_nfs4(&self, export: ExportId) -> Result<Nfs4FileHandle> {
        if self.0.len() + FH_HEADER_LEN > NFS4_FHSIZE {
            return Err(RecallError::OutOfMemory {
                reason: format!(
                    "file handle of {} bytes does not fit in an NFSv4 handle",
                    self.0.len()
                ),
            });
        }
        let mut out = Vec::with_capacity(self.0.len() + FH_HEADER_LEN);
        out.push(FH_VERSION);
        out.extend_from_slice(&export.0.to_be_bytes());
        out.extend_from_slice(&self.0);
        Ok(Nfs4FileHandle(out))
    }
}

/// Encoded NFSv4 file handle carried in callback compounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nfs4FileHandle(pub Vec<u8>);

impl Nfs4FileHandle {
    /// Export the handle was minted for.
    pub fn export(&self) -> Option<ExportId> {
        if self.0.len() < FH_HEADER_LEN || self.0[0] != FH_VERSION {
            return None;
        }
        Some(ExportId(u16::from_be_bytes([self.0[1], self.0[2]])))
    }
}

/// pNFS layout type (RFC 5661 layouttype4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum LayoutType {
    /// Files layout (traditional NFS data server)
    Files = 1,
    /// Object layout
    Objects = 2,
    /// Block/volume layout
    Block = 3,
    /// Flexible files layout
    FlexFiles = 4,
}

/// pNFS I/O mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum IoMode {
    /// Read-only access
    Read = 1,
    /// Read-write access
    ReadWrite = 2,
    /// Any access mode
    Any = 3,
}

impl IoMode {
    /// True when both modes share at least one access bit.
    pub fn intersects(self, other: IoMode) -> bool {
        (self as u32) & (other as u32) != 0
    }
}

/// Length value meaning "to the end of the file"
pub const NFS4_UINT64_MAX: u64 = u64::MAX;

/// A layout segment: byte range plus I/O mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub offset: u64,
    pub length: u64,
    pub iomode: IoMode,
}

impl Segment {
    pub fn new(offset: u64, length: u64, iomode: IoMode) -> Self {
        Segment {
            offset,
            length,
            iomode,
        }
    }

    /// Whole file, any I/O mode.
    pub fn whole_file() -> Self {
        Segment::new(0, NFS4_UINT64_MAX, IoMode::Any)
    }

    /// Exclusive end of the range, `None` for a segment running to EOF.
    pub fn end(&self) -> Option<u64> {
        if self.length == NFS4_UINT64_MAX {
            None
        } else {
            Some(self.offset.saturating_add(self.length))
        }
    }

    /// Rejects empty segments and ranges whose end would wrap past 2^64.
    pub fn validate(&self) -> Result<()> {
        if self.length == 0 {
            return Err(RecallError::invalid("segment length is zero"));
        }
        if self.length != NFS4_UINT64_MAX && self.offset.checked_add(self.length).is_none() {
            return Err(RecallError::invalid(format!(
                "segment offset {} + length {} overflows",
                self.offset, self.length
            )));
        }
        Ok(())
    }

    /// Half-open range overlap that also requires compatible I/O modes.
    pub fn overlaps(&self, other: &Segment) -> bool {
        if !self.iomode.intersects(other.iomode) {
            return false;
        }
        if self.length == 0 || other.length == 0 {
            return false;
        }
        let (first, second) = if self.offset <= other.offset {
            (self, other)
        } else {
            (other, self)
        };
        match first.end() {
            None => true,
            Some(end) => end > second.offset,
        }
    }
}

/// Which clients a layout recall is aimed at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ClientFilter {
    /// Every client holding a matching layout
    #[default]
    All,
    /// Only this client
    Exactly(ClientId),
    /// Every client except this one
    AllBut(ClientId),
}

impl ClientFilter {
    pub fn matches(&self, client: ClientId) -> bool {
        match self {
            ClientFilter::All => true,
            ClientFilter::Exactly(c) => *c == client,
            ClientFilter::AllBut(c) => *c != client,
        }
    }
}

/// Why a layout is being handed back to the storage layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReturnCircumstance {
    /// The client gave it back, or said it had nothing to give
    Client,
    /// The server took it away
    Revoke,
}

/// Opaque token a storage back-end attaches to a layout recall
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RecallCookie(pub u64);

/// pNFS device id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub [u8; 16]);

impl DeviceId {
    /// Device id built from the owning export and a per-export device number.
    pub fn new(export: ExportId, devid: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..2].copy_from_slice(&export.0.to_be_bytes());
        bytes[8..16].copy_from_slice(&devid.to_be_bytes());
        DeviceId(bytes)
    }
}

/// notify_deviceid_type4
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum NotifyDeviceType {
    /// The device's addressing changed
    Change = 1,
    /// The device is gone
    Delete = 2,
}
