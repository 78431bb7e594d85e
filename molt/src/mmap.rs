//! Anonymous mappings for the code and data regions.
//!
//! On x86-64 Linux both regions are placed in the low 4 GiB (`MAP_32BIT`)
//! so most references reach their targets without trampolines; the
//! engines handle the rest.

use std::io;
use std::ptr::{self, NonNull};

use crate::Error;

pub const PAGE_SIZE: usize = 4096;

pub fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

fn mmap_prot(size: usize, prot: libc::c_int) -> Result<NonNull<u8>, Error> {
    #[allow(unused_mut)]
    let mut flags = libc::MAP_PRIVATE | libc::MAP_ANON;
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    {
        flags |= libc::MAP_32BIT;
    }
    let p = unsafe { libc::mmap(ptr::null_mut(), size, prot, flags, -1, 0) };
    if p == libc::MAP_FAILED {
        return Err(Error::Allocation {
            size,
            source: io::Error::last_os_error(),
        });
    }
    Ok(NonNull::new(p as *mut u8).expect("mmap returned null"))
}

/// Map a readable, writable, executable region for code.
pub(crate) fn mmap_code(size: usize) -> Result<NonNull<u8>, Error> {
    mmap_prot(size, libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC)
}

/// Map a readable, writable region for data.
pub(crate) fn mmap_data(size: usize) -> Result<NonNull<u8>, Error> {
    mmap_prot(size, libc::PROT_READ | libc::PROT_WRITE)
}

pub(crate) fn munmap(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
    let rc = unsafe { libc::munmap(ptr.as_ptr() as *mut libc::c_void, size) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
