//! Executable memory for emitted measurement functions.
//!
//! Wraps a block of JIT-assembled machine code in an mmap'd region and hands
//! it out as a callable function pointer. Each function is owned by exactly
//! one measurement and unmapped as soon as that measurement finishes.

use crate::types::BenchError;

/// Signature of an emitted measurement function.
///
/// ```text
/// fn(n_iter: u32, out: *mut u64)
/// ```
///
/// Runs the unrolled loop `n_iter` times between serialised RDTSC reads and
/// writes the cycle delta through `out`.
pub type BenchFn = unsafe extern "C" fn(u32, *mut u64);

/// A JIT-compiled measurement function.
pub struct CompiledFn {
    code: ExecutableBuffer,
}

impl CompiledFn {
    pub fn from_code(code_bytes: &[u8]) -> Result<Self, BenchError> {
        if code_bytes.is_empty() {
            return Err(BenchError::Exec("empty code buffer".into()));
        }
        let code = ExecutableBuffer::new(code_bytes)?;
        Ok(CompiledFn { code })
    }

    /// Get the entry point function pointer.
    ///
    /// # Safety
    /// The buffer must hold a complete function with the `BenchFn` ABI.
    #[inline]
    pub unsafe fn entry(&self) -> BenchFn {
        std::mem::transmute(self.code.ptr)
    }

    pub fn code_size(&self) -> usize {
        self.code.len
    }
}

/// An executable memory buffer backed by mmap.
struct ExecutableBuffer {
    ptr: *mut u8,
    len: usize,
}

impl ExecutableBuffer {
    /// Allocate an executable region and copy code into it.
    fn new(code: &[u8]) -> Result<Self, BenchError> {
        let page_size = page_size();
        let len = (code.len() + page_size - 1) & !(page_size - 1);

        // SAFETY: anonymous private mapping, no fd; result checked below.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(BenchError::Exec("mmap failed for code buffer".into()));
        }
        let ptr = ptr as *mut u8;

        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
        }

        // Flip to read+execute once the bytes are in place.
        let ret = unsafe { libc::mprotect(ptr as *mut _, len, libc::PROT_READ | libc::PROT_EXEC) };
        if ret != 0 {
            unsafe {
                libc::munmap(ptr as *mut _, len);
            }
            return Err(BenchError::Exec("mprotect failed for code buffer".into()));
        }

        Ok(ExecutableBuffer { ptr, len })
    }
}

impl Drop for ExecutableBuffer {
    fn drop(&mut self) {
        if !self.ptr.is_null() && self.len > 0 {
            unsafe {
                libc::munmap(self.ptr as *mut _, self.len);
            }
        }
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
