//! The loaded unit's memory regions.

use std::io;
use std::ptr::NonNull;

use molt_link::Linker;

use crate::mmap::{align_up, mmap_code, mmap_data, munmap, PAGE_SIZE};
use crate::Error;

/// One executable region for code plus one writable region holding the
/// data kinds back to back: data | noptrdata | bss | noptrbss.
///
/// Regions are sized to twice their content (page-aligned) so relocation
/// may append trampolines at the code tail without ever moving bytes;
/// `code_off` is the growing tail cursor.
pub struct Segment {
    code: NonNull<u8>,
    data: NonNull<u8>,
    pub code_max: usize,
    pub data_max: usize,
    pub code_len: usize,
    pub data_len: usize,
    pub noptrdata_len: usize,
    pub bss_len: usize,
    pub noptrbss_len: usize,
    pub code_off: usize,
    released: bool,
}

// Owned exclusively; never shared between modules.
unsafe impl Send for Segment {}

impl Segment {
    /// Map both regions and copy the linked bytes in.
    pub(crate) fn allocate(linker: &Linker) -> Result<Segment, Error> {
        let code_len = linker.code().len();
        let data_len = linker.data().len();
        let noptrdata_len = linker.noptrdata().len();
        let bss_len = linker.bss().len();
        let noptrbss_len = linker.noptrbss().len();
        let sum_data = data_len + noptrdata_len + bss_len + noptrbss_len;

        let code_max = align_up(code_len.max(1) * 2, PAGE_SIZE);
        let data_max = align_up(sum_data.max(1) * 2, PAGE_SIZE);

        let code = mmap_code(code_max)?;
        let data = match mmap_data(data_max) {
            Ok(d) => d,
            Err(e) => {
                let _ = munmap(code, code_max);
                return Err(e);
            }
        };

        let mut seg = Segment {
            code,
            data,
            code_max,
            data_max,
            code_len,
            data_len,
            noptrdata_len,
            bss_len,
            noptrbss_len,
            code_off: code_len,
            released: false,
        };
        seg.copy_in(linker);
        Ok(seg)
    }

    fn copy_in(&mut self, linker: &Linker) {
        let (code, data) = self.regions_mut();
        code[..linker.code().len()].copy_from_slice(linker.code());
        let mut off = 0;
        for part in [
            linker.data(),
            linker.noptrdata(),
            linker.bss(),
            linker.noptrbss(),
        ] {
            data[off..off + part.len()].copy_from_slice(part);
            off += part.len();
        }
    }

    pub fn code_base(&self) -> usize {
        self.code.as_ptr() as usize
    }

    pub fn data_base(&self) -> usize {
        self.data.as_ptr() as usize
    }

    /// Both regions as mutable slices (they never alias).
    pub(crate) fn regions_mut(&mut self) -> (&mut [u8], &mut [u8]) {
        unsafe {
            (
                std::slice::from_raw_parts_mut(self.code.as_ptr(), self.code_max),
                std::slice::from_raw_parts_mut(self.data.as_ptr(), self.data_max),
            )
        }
    }

    /// Unmap both regions. Both are attempted even if the first fails.
    pub(crate) fn release(&mut self) -> io::Result<()> {
        if self.released {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "segment already released",
            ));
        }
        self.released = true;
        let r1 = munmap(self.code, self.code_max);
        let r2 = munmap(self.data, self.data_max);
        r1.and(r2)
    }
}
