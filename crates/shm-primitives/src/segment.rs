//! Named shared-memory segments.
//!
//! A [`Segment`] is a POSIX shared-memory object mapped read/write into this
//! process. The creating handle owns the name and unlinks it on drop; handles
//! obtained through [`Segment::open`] only unmap.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::io::AsRawFd;
use std::ptr::NonNull;

use crate::sync::AtomicU32;

#[cfg(target_vendor = "apple")]
const SHM_MODE: libc::c_uint = 0o600;
#[cfg(not(target_vendor = "apple"))]
const SHM_MODE: libc::mode_t = 0o600;

/// A mapped, named shared-memory object.
pub struct Segment {
    name: String,
    base: NonNull<u8>,
    len: usize,
    owner: bool,
}

// SAFETY: the mapping stays valid until drop and all cross-thread access to
// its contents goes through atomics or protocol-level turn taking.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Create a new zero-filled segment of `len` bytes.
    ///
    /// Fails with [`io::ErrorKind::AlreadyExists`] if the name is taken.
    pub fn create(name: &str, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "segment length must be non-zero",
            ));
        }
        let c_name = os_name(name)?;
        // SAFETY: `c_name` is a valid NUL-terminated string.
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                SHM_MODE,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `fd` was just returned by shm_open and is owned by nobody else.
        let file = File::from(unsafe { OwnedFd::from_raw_fd(fd) });

        let mapped = file
            .set_len(len as u64)
            .and_then(|()| map(&file, len));
        match mapped {
            Ok(base) => {
                tracing::trace!(name, len, "created shm segment");
                Ok(Self {
                    name: name.to_owned(),
                    base,
                    len,
                    owner: true,
                })
            }
            Err(e) => {
                // SAFETY: `c_name` is a valid NUL-terminated string.
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
                Err(e)
            }
        }
    }

    /// Open an existing segment, adopting whatever size its creator gave it.
    ///
    /// A segment whose creator has not sized it yet reports
    /// [`io::ErrorKind::WouldBlock`].
    pub fn open(name: &str) -> io::Result<Self> {
        let c_name = os_name(name)?;
        // SAFETY: `c_name` is a valid NUL-terminated string.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, SHM_MODE) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `fd` was just returned by shm_open and is owned by nobody else.
        let file = File::from(unsafe { OwnedFd::from_raw_fd(fd) });

        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("shm segment {name} is not initialized yet"),
            ));
        }
        let base = map(&file, len)?;
        tracing::trace!(name, len, "opened shm segment");
        Ok(Self {
            name: name.to_owned(),
            base,
            len,
            owner: false,
        })
    }

    /// Unlink a leftover object by name. Returns `false` if nothing was there.
    pub fn remove(name: &str) -> io::Result<bool> {
        let c_name = os_name(name)?;
        // SAFETY: `c_name` is a valid NUL-terminated string.
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::NotFound {
            Ok(false)
        } else {
            Err(err)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether this handle created the object (and will unlink it).
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// The 32-bit atomic word at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the word is misaligned or out of bounds.
    pub fn word(&self, offset: usize) -> &AtomicU32 {
        assert!(offset % 4 == 0, "misaligned shm word at {offset}");
        assert!(offset + 4 <= self.len, "shm word at {offset} out of bounds");
        // SAFETY: in bounds and 4-byte aligned (the mapping is page aligned).
        // The memory lives as long as `self`.
        unsafe { &*(self.base.as_ptr().add(offset) as *const AtomicU32) }
    }

    /// Copy `bytes` into the mapping at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds.
    pub fn write_at(&self, offset: usize, bytes: &[u8]) {
        assert!(
            offset + bytes.len() <= self.len,
            "shm write of {} bytes at {offset} out of bounds",
            bytes.len()
        );
        // SAFETY: the destination range is inside the mapping and cannot
        // overlap a Rust-owned slice.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.base.as_ptr().add(offset),
                bytes.len(),
            );
        }
    }

    /// Copy `out.len()` bytes from the mapping at `offset` into `out`.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds.
    pub fn read_at(&self, offset: usize, out: &mut [u8]) {
        assert!(
            offset + out.len() <= self.len,
            "shm read of {} bytes at {offset} out of bounds",
            out.len()
        );
        // SAFETY: the source range is inside the mapping and cannot overlap
        // a Rust-owned slice.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.base.as_ptr().add(offset),
                out.as_mut_ptr(),
                out.len(),
            );
        }
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.name)
            .field("len", &self.len)
            .field("owner", &self.owner)
            .finish()
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // SAFETY: base and len were valid when mapped and are unmapped once.
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len);
        }
        if self.owner {
            if let Ok(c_name) = os_name(&self.name) {
                // SAFETY: `c_name` is a valid NUL-terminated string.
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
            }
            tracing::trace!(name = %self.name, "unlinked shm segment");
        }
    }
}

/// Object names are flat: a leading slash is added and no other is allowed.
fn os_name(name: &str) -> io::Result<CString> {
    if name.is_empty() || name.contains('/') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid shm object name {name:?}"),
        ));
    }
    CString::new(format!("/{name}")).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("shm object name {name:?} contains NUL"),
        )
    })
}

fn map(file: &File, len: usize) -> io::Result<NonNull<u8>> {
    // SAFETY: mapping a shared-memory fd we own; the kernel validates the rest.
    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };
    if base == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(base as *mut u8).ok_or_else(|| io::Error::other("mmap returned null"))
}
