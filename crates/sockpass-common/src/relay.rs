use std::{
    os::fd::OwnedFd,
    sync::atomic::{Ordering, fence},
};

use bytemuck::{bytes_of, pod_read_unaligned};
use memmap2::{Mmap, MmapMut, MmapOptions};
use psx_shm::{Shm, UnlinkOnDrop};
use rustix::{fs::fstat, io::dup, shm::OFlags};
use snafu::ResultExt;
use tracing::debug;

use crate::protocol_common::{
    CorruptRelaySnafu, CreateSnafu, R_MODE, RW_MODE, RelayHeader, Result,
    round_up_page,
};

const HDR_SIZE: usize = size_of::<RelayHeader>();

/// Largest descriptor one relay holds.
pub const MAX_DESCRIPTOR_LEN: usize = 512;

enum Segment {
    // the creator unlinks the name when it goes away
    Created(UnlinkOnDrop),
    Opened(Shm),
}

impl Segment {
    fn shm(&self) -> &Shm {
        match self {
            Segment::Created(owned) => &owned.shm,
            Segment::Opened(shm) => shm,
        }
    }
}

/// Named shared memory segment carrying exactly one protocol descriptor
/// from the parent to the child.
pub struct Relay {
    segment: Segment,
    name: String,
    len: usize,
}

impl Relay {
    /// Create the segment, at least one page long. Fails if the name is taken.
    pub fn create(name: &str) -> Result<Self> {
        let len = round_up_page((HDR_SIZE + MAX_DESCRIPTOR_LEN) as u64) as usize;

        let mut shm = Shm::open(
            name,
            OFlags::RDWR | OFlags::CREATE | OFlags::EXCL,
            RW_MODE,
        )
        .context(CreateSnafu {
            op: "shm_open",
            name,
        })?;
        shm.set_size(len).context(CreateSnafu {
            op: "ftruncate",
            name,
        })?;
        debug!(name, len, "created relay");

        Ok(Self {
            segment: Segment::Created(UnlinkOnDrop { shm }),
            name: name.to_string(),
            len,
        })
    }

    /// Open a segment created by another process. Never creates.
    pub fn open(name: &str) -> Result<Self> {
        let shm = Shm::open(name, OFlags::RDONLY, R_MODE).context(CreateSnafu {
            op: "shm_open",
            name,
        })?;
        let len = fstat(shm.as_fd())
            .map(|st| st.st_size as usize)
            .map_err(std::io::Error::from)
            .context(CreateSnafu { op: "fstat", name })?;
        debug!(name, len, "opened relay");

        Ok(Self {
            segment: Segment::Opened(shm),
            name: name.to_string(),
            len,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn dup_file(&self) -> Result<std::fs::File> {
        let dup_fd: OwnedFd = dup(self.segment.shm().as_fd())
            .map_err(std::io::Error::from)
            .context(CreateSnafu {
                op: "dup",
                name: &self.name,
            })?;
        Ok(std::fs::File::from(dup_fd))
    }

    /// Map the segment writable. Only the creator can do this.
    pub fn map_mut(&self) -> Result<RelayWriter> {
        let file = self.dup_file()?;
        let map = unsafe { MmapOptions::new().len(self.len).map_mut(&file) }
            .context(CreateSnafu {
                op: "mmap",
                name: &self.name,
            })?;
        Ok(RelayWriter {
            map,
            name: self.name.clone(),
        })
    }

    /// Map the segment read only.
    pub fn map(&self) -> Result<RelayReader> {
        let file = self.dup_file()?;
        let map = unsafe { MmapOptions::new().len(self.len).map(&file) }
            .context(CreateSnafu {
                op: "mmap",
                name: &self.name,
            })?;
        Ok(RelayReader {
            map,
            name: self.name.clone(),
        })
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("name", &self.name)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

pub struct RelayWriter {
    map: MmapMut,
    name: String,
}

impl RelayWriter {
    /// Store `descriptor` at the start of the relay. The bytes go in first
    /// and the header last, so a header that validates implies a complete
    /// descriptor.
    pub fn publish(&mut self, descriptor: &[u8]) -> Result<()> {
        snafu::ensure!(
            descriptor.len() <= MAX_DESCRIPTOR_LEN
                && HDR_SIZE + descriptor.len() <= self.map.len(),
            CorruptRelaySnafu {
                name: &self.name,
                reason: format!(
                    "descriptor of {} bytes does not fit",
                    descriptor.len()
                ),
            }
        );

        self.map[HDR_SIZE..HDR_SIZE + descriptor.len()]
            .copy_from_slice(descriptor);
        fence(Ordering::Release);

        let hdr = RelayHeader::new(descriptor.len() as u32);
        self.map[..HDR_SIZE].copy_from_slice(bytes_of(&hdr));
        fence(Ordering::Release);

        debug!(name = %self.name, len = descriptor.len(), "published descriptor");
        Ok(())
    }
}

pub struct RelayReader {
    map: Mmap,
    name: String,
}

impl RelayReader {
    /// Copy the descriptor out, refusing anything that was not fully
    /// published.
    pub fn read_descriptor(&self) -> Result<Vec<u8>> {
        fence(Ordering::Acquire);
        let bytes: &[u8] = &self.map;
        snafu::ensure!(
            bytes.len() >= HDR_SIZE,
            CorruptRelaySnafu {
                name: &self.name,
                reason: "segment smaller than header",
            }
        );

        let hdr: RelayHeader = pod_read_unaligned(&bytes[..HDR_SIZE]);
        if hdr.magic != RelayHeader::MAGIC {
            return CorruptRelaySnafu {
                name: &self.name,
                reason: "no descriptor published",
            }
            .fail();
        }
        if hdr.version != RelayHeader::VERSION {
            return CorruptRelaySnafu {
                name: &self.name,
                reason: format!("unsupported version {}", hdr.version),
            }
            .fail();
        }

        let end = HDR_SIZE + hdr.descriptor_len as usize;
        snafu::ensure!(
            hdr.descriptor_len as usize <= MAX_DESCRIPTOR_LEN && end <= bytes.len(),
            CorruptRelaySnafu {
                name: &self.name,
                reason: format!("bad descriptor length {}", hdr.descriptor_len),
            }
        );

        Ok(bytes[HDR_SIZE..end].to_vec())
    }
}
