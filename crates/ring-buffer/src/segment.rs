//! POSIX Shared Memory Segment
//!
//! Thin wrapper around `shm_open`, `ftruncate` and `mmap`. The mapping is
//! released on drop; the name is only removed by an explicit `unlink`.

use std::ffi::CString;
use std::io;
use std::ptr;

use crate::{Result, RingError};

/// Mapped shared memory segment
pub(crate) struct ShmSegment {
    ptr: *mut u8,
    size: usize,
    name: String,
}

// SAFETY: the mapping is process-shared memory; all concurrent access to it
// goes through the atomics of the control block.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

/// Outcome of [`ShmSegment::create_or_open`]
pub(crate) enum Opened {
    /// This call created the segment; it is zeroed and `size` bytes long
    Created(ShmSegment),
    /// The segment already existed; mapped at its current size
    Attached(ShmSegment),
}

impl ShmSegment {
    /// Create the segment exclusively, or map it if it already exists
    ///
    /// `O_CREAT | O_EXCL` makes exactly one caller the creator.
    pub(crate) fn create_or_open(name: &str, size: usize) -> Result<Opened> {
        validate_name(name)?;
        let c_name = CString::new(name).map_err(|_| RingError::InvalidName(name.to_string()))?;

        // SAFETY: c_name is a valid NUL-terminated string; the return value
        // is checked below.
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600,
            )
        };

        if fd >= 0 {
            // SAFETY: fd is a freshly opened shared memory descriptor
            if unsafe { libc::ftruncate(fd, size as libc::off_t) } < 0 {
                let err = io::Error::last_os_error();
                // SAFETY: fd is valid and not used afterwards
                unsafe { libc::close(fd) };
                return Err(RingError::Segment(err));
            }
            let segment = Self::map(fd, size, name)?;
            // SAFETY: the mapping is writable and exactly `size` bytes long
            unsafe { ptr::write_bytes(segment.ptr, 0, size) };
            return Ok(Opened::Created(segment));
        }

        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::AlreadyExists {
            return Err(RingError::Segment(err));
        }

        // SAFETY: as above, without O_CREAT the mode is ignored
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(RingError::Segment(io::Error::last_os_error()));
        }

        // SAFETY: stat is plain data, fstat fills it on success
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        // SAFETY: fd is valid and stat points to writable memory
        if unsafe { libc::fstat(fd, &mut stat) } < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is valid and not used afterwards
            unsafe { libc::close(fd) };
            return Err(RingError::Segment(err));
        }

        // A creator that has not reached ftruncate yet leaves a zero-sized
        // object behind
        let existing = stat.st_size.max(0) as usize;
        if existing == 0 {
            // SAFETY: fd is valid and not used afterwards
            unsafe { libc::close(fd) };
            return Err(RingError::NotInitialized(name.to_string()));
        }

        Ok(Opened::Attached(Self::map(fd, existing, name)?))
    }

    /// Map `size` bytes of `fd` and close the descriptor
    fn map(fd: libc::c_int, size: usize, name: &str) -> Result<Self> {
        // SAFETY: null hint lets the kernel choose the address; fd is a valid
        // shared memory descriptor of at least `size` bytes. MAP_FAILED is
        // checked below.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        let err = io::Error::last_os_error();

        // SAFETY: the mapping, if any, keeps its own reference to the object
        unsafe { libc::close(fd) };

        if ptr == libc::MAP_FAILED {
            return Err(RingError::Segment(err));
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            size,
            name: name.to_string(),
        })
    }

    /// Remove the segment name; mappings stay valid until dropped
    ///
    /// A missing segment is not an error.
    pub(crate) fn unlink(name: &str) -> Result<()> {
        validate_name(name)?;
        let c_name = CString::new(name).map_err(|_| RingError::InvalidName(name.to_string()))?;

        // SAFETY: c_name is a valid NUL-terminated string
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(RingError::Segment(err));
            }
        }
        Ok(())
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        // SAFETY: ptr/size come from the successful mmap in `map` and are
        // unmapped exactly once
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
    }
}

/// Leading `/`, no other `/`, at most 255 characters
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if !name.starts_with('/') {
        return Err(RingError::InvalidName(format!("must start with '/': {name}")));
    }
    if name.len() < 2 || name[1..].contains('/') {
        return Err(RingError::InvalidName(format!(
            "must be '/' followed by a non-empty name without '/': {name}"
        )));
    }
    if name.len() > 255 {
        return Err(RingError::InvalidName(format!("longer than 255 characters: {name}")));
    }
    Ok(())
}
