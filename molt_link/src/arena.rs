//! Fixed-size mmap-backed arena for diverted string constants.
//!
//! String constants assigned here survive independently of the module's
//! data segment: unloading the code does not invalidate in-flight string
//! references. The arena is released explicitly via `unload_strings`, or
//! on drop if the caller never did.

use std::io;
use std::ptr;

/// A private anonymous read-write mapping with a bump cursor.
pub struct StringArena {
    ptr: *mut u8,
    size: usize,
    index: usize,
    mapped: bool,
}

// The raw pointer is owned exclusively by the arena.
unsafe impl Send for StringArena {}

impl StringArena {
    pub fn new(size: usize) -> io::Result<StringArena> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(StringArena {
            ptr: ptr as *mut u8,
            size,
            index: 0,
            mapped: true,
        })
    }

    /// Base address of the mapping.
    pub fn base(&self) -> usize {
        self.ptr as usize
    }

    pub fn capacity(&self) -> usize {
        self.size
    }

    pub fn used(&self) -> usize {
        self.index
    }

    /// Copy `bytes` into the arena, returning their arena-relative offset,
    /// or `None` when the container is full.
    pub fn write(&mut self, bytes: &[u8]) -> Option<usize> {
        if self.index + bytes.len() > self.size {
            return None;
        }
        let at = self.index;
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(at), bytes.len());
        }
        self.index += bytes.len();
        Some(at)
    }

    /// Release the mapping. Safe to call once; later calls fail.
    pub fn unmap(&mut self) -> io::Result<()> {
        if !self.mapped {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "string arena already unmapped",
            ));
        }
        self.mapped = false;
        let rc = unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.size) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for StringArena {
    fn drop(&mut self) {
        if self.mapped {
            let _ = self.unmap();
        }
    }
}
