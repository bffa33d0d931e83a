//! User pointer validation and copying.
//!
//! Syscalls run on the calling process's address space (the kernel half
//! is shared), so validated user pointers are directly addressable. A
//! pointer is valid when it lies entirely in the user half and the
//! process's mapping tree grants the access; everything else is
//! `EFAULT` before any dereference.

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;

use orion_syscall::{Errno, PATH_MAX};

use crate::addr::VirtAddr;

fn validate(addr: usize, len: usize, write: bool) -> Result<(), Errno> {
    if len == 0 {
        return Ok(());
    }
    let end = addr.checked_add(len).ok_or(Errno::EFAULT)?;
    let start_va = VirtAddr::new_truncate(addr as u64);
    if !start_va.is_user() || !VirtAddr::new_truncate(end as u64 - 1).is_user() {
        return Err(Errno::EFAULT);
    }
    let proc = crate::sched::current_process().ok_or(Errno::EFAULT)?;
    let space = proc.space().ok_or(Errno::EFAULT)?;
    if !space.validate_range(start_va, len as u64, write) {
        return Err(Errno::EFAULT);
    }
    Ok(())
}

/// Copies `len` bytes in from user memory.
pub fn copy_in(addr: usize, len: usize) -> Result<Vec<u8>, Errno> {
    validate(addr, len, false)?;
    let mut buf = alloc::vec![0u8; len];
    // SAFETY: The range was validated against the current user mappings
    // and the user half is mapped while this process runs.
    unsafe {
        core::ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), len);
    }
    Ok(buf)
}

/// Copies bytes out to user memory.
pub fn copy_out(addr: usize, data: &[u8]) -> Result<(), Errno> {
    validate(addr, data.len(), true)?;
    // SAFETY: See copy_in; additionally the mapping grants write access.
    unsafe {
        core::ptr::copy_nonoverlapping(data.as_ptr(), addr as *mut u8, data.len());
    }
    Ok(())
}

/// Copies a typed value out to user memory.
pub fn copy_out_val<T: Copy>(addr: usize, value: &T) -> Result<(), Errno> {
    let bytes = unsafe {
        // SAFETY: T: Copy with a stable layout; we expose its bytes only.
        core::slice::from_raw_parts(core::ptr::from_ref(value).cast::<u8>(), size_of::<T>())
    };
    copy_out(addr, bytes)
}

/// Copies a typed value in from user memory.
pub fn copy_in_val<T: Copy>(addr: usize) -> Result<T, Errno> {
    let bytes = copy_in(addr, size_of::<T>())?;
    // SAFETY: The buffer holds size_of::<T>() validated bytes; T: Copy.
    Ok(unsafe { core::ptr::read_unaligned(bytes.as_ptr().cast::<T>()) })
}

/// Reads a NUL-terminated user string, bounded by `PATH_MAX`.
pub fn read_cstring(addr: usize) -> Result<String, Errno> {
    let mut out = Vec::new();
    let mut cursor = addr;
    loop {
        if out.len() >= PATH_MAX {
            return Err(Errno::ENAMETOOLONG);
        }
        // Page-at-a-time: validate the smallest span we can make progress
        // on without over-reading past the terminator's page.
        let page_end = (cursor | (crate::addr::PAGE_SIZE as usize - 1)) + 1;
        let chunk_len = (page_end - cursor).min(PATH_MAX - out.len());
        let chunk = copy_in(cursor, chunk_len)?;
        match chunk.iter().position(|&b| b == 0) {
            Some(nul) => {
                out.extend_from_slice(&chunk[..nul]);
                return String::from_utf8(out).map_err(|_| Errno::EILSEQ);
            }
            None => {
                out.extend_from_slice(&chunk);
                cursor += chunk_len;
            }
        }
    }
}

/// Reads a NULL-terminated array of user string pointers (argv/envp).
pub fn read_cstring_array(addr: usize, max: usize) -> Result<Vec<String>, Errno> {
    let mut out = Vec::new();
    if addr == 0 {
        return Ok(out);
    }
    for i in 0..max {
        let slot = addr + i * size_of::<usize>();
        let ptr: usize = copy_in_val(slot)?;
        if ptr == 0 {
            return Ok(out);
        }
        out.push(read_cstring(ptr)?);
    }
    Err(Errno::E2BIG)
}
