//! Mapped buffer pools.
//!
//! A pool maps a passed file descriptor and hands out buffer slices after
//! strict bounds validation. The mapping only ever grows; a resize arriving
//! while buffers still reference the mapping is deferred and applied when
//! the last reference drops, so no live buffer ever observes its bytes
//! moving.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::PoolError;

struct Mapping {
    base: *mut u8,
    len: usize,
}

// SAFETY: access to the mapped bytes is serialized by the pool's state lock.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    fn new(fd: RawFd, len: usize) -> Result<Mapping, PoolError> {
        // SAFETY: mapping a shared file; the kernel validates fd and length.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        Ok(Mapping { base: base as *mut u8, len })
    }

    fn grow(&mut self, new_len: usize) -> Result<(), PoolError> {
        // SAFETY: base/len describe a live mapping created above; MAYMOVE
        // lets the kernel relocate it.
        let moved = unsafe {
            libc::mremap(self.base as *mut libc::c_void, self.len, new_len, libc::MREMAP_MAYMOVE)
        };
        if moved == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        self.base = moved as *mut u8;
        self.len = new_len;
        Ok(())
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: base and len were valid when created.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

struct PoolState {
    mapping: Mapping,
    size: usize,
    /// Grow target postponed while buffers reference the mapping.
    pending: Option<usize>,
    /// Number of live buffer slices over this mapping.
    external_refs: usize,
}

struct PoolInner {
    fd: OwnedFd,
    state: Mutex<PoolState>,
}

/// A mapped shared-memory pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Map `size` bytes of the file behind `fd`. The pool owns the fd.
    pub fn new(fd: OwnedFd, size: i32) -> Result<Pool, PoolError> {
        if size <= 0 {
            return Err(PoolError::InvalidSize(size));
        }
        let size = size as usize;
        let mapping = Mapping::new(fd.as_raw_fd(), size)?;
        trace!(size, "pool mapped");
        Ok(Pool {
            inner: Arc::new(PoolInner {
                fd,
                state: Mutex::new(PoolState { mapping, size, pending: None, external_refs: 0 }),
            }),
        })
    }

    /// A pool backed by a fresh anonymous memory file, for the side that
    /// creates the storage.
    pub fn with_memfd(size: i32) -> Result<Pool, PoolError> {
        if size <= 0 {
            return Err(PoolError::InvalidSize(size));
        }
        // SAFETY: memfd_create with a static name; the fd is fresh and ours.
        let fd = unsafe { libc::memfd_create(c"weft-pool".as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        // SAFETY: plain ftruncate on a descriptor we own.
        if unsafe { libc::ftruncate(fd.as_raw_fd(), libc::off_t::from(size)) } < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Pool::new(fd, size)
    }

    /// The backing descriptor, for sending across a connection.
    pub fn fd(&self) -> RawFd {
        self.inner.fd.as_raw_fd()
    }

    pub fn size(&self) -> usize {
        self.inner.state.lock().size
    }

    /// Grow the backing file and the mapping. Creator-side counterpart of
    /// [`resize`](Pool::resize).
    pub fn grow(&self, new_size: i32) -> Result<(), PoolError> {
        {
            let state = self.inner.state.lock();
            if (new_size as i64) < state.size as i64 {
                return Err(PoolError::Shrink { current: state.size, requested: new_size });
            }
        }
        // SAFETY: plain ftruncate on a descriptor we own.
        if unsafe { libc::ftruncate(self.inner.fd.as_raw_fd(), libc::off_t::from(new_size)) } < 0 {
            return Err(io::Error::last_os_error().into());
        }
        self.resize(new_size)
    }

    /// Grow the mapping to `new_size` bytes. Shrinking is an error. While
    /// buffers reference the mapping the remap is deferred; it applies when
    /// the last buffer drops.
    pub fn resize(&self, new_size: i32) -> Result<(), PoolError> {
        let mut state = self.inner.state.lock();
        if (new_size as i64) < state.size as i64 {
            return Err(PoolError::Shrink { current: state.size, requested: new_size });
        }
        let target = new_size as usize;
        if state.external_refs > 0 {
            let pending = state.pending.map_or(target, |p| p.max(target));
            state.pending = Some(pending);
            debug!(target, refs = state.external_refs, "resize deferred");
            return Ok(());
        }
        state.mapping.grow(target)?;
        state.size = target;
        trace!(size = target, "pool resized");
        Ok(())
    }

    /// Validate and slice a buffer out of the pool. The returned buffer
    /// holds a reference that defers resizes until it drops.
    pub fn create_buffer(
        &self,
        offset: i32,
        width: i32,
        height: i32,
        stride: i32,
    ) -> Result<PoolBuffer, PoolError> {
        let mut state = self.inner.state.lock();
        let (start, len) = validate(state.size, offset, width, height, stride)?;
        state.external_refs += 1;
        trace!(offset, width, height, stride, refs = state.external_refs, "buffer created");
        Ok(PoolBuffer { inner: self.inner.clone(), offset: start, len })
    }

    /// Run `f` over the whole mapped region.
    pub fn with_data<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let state = self.inner.state.lock();
        // SAFETY: base/size describe the live mapping; the state lock keeps
        // it from moving or unmapping for the duration.
        let data = unsafe { std::slice::from_raw_parts_mut(state.mapping.base, state.size) };
        f(data)
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Pool")
            .field("size", &state.size)
            .field("external_refs", &state.external_refs)
            .field("pending", &state.pending)
            .finish()
    }
}

fn validate(
    pool_size: usize,
    offset: i32,
    width: i32,
    height: i32,
    stride: i32,
) -> Result<(usize, usize), PoolError> {
    if offset < 0 || width <= 0 || height <= 0 || stride < width {
        return Err(PoolError::BadGeometry { offset, width, height, stride });
    }
    if i32::MAX / stride <= height {
        return Err(PoolError::BadGeometry { offset, width, height, stride });
    }
    let len = stride as usize * height as usize;
    let start = offset as usize;
    if len > pool_size || start > pool_size - len {
        return Err(PoolError::OutOfBounds { offset, len, pool_size });
    }
    Ok((start, len))
}

/// A validated slice of a pool; RAII external reference to the mapping.
pub struct PoolBuffer {
    inner: Arc<PoolInner>,
    offset: usize,
    len: usize,
}

impl PoolBuffer {
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Run `f` over this buffer's bytes.
    pub fn with_data<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let state = self.inner.state.lock();
        // SAFETY: offset/len were validated against the pool size at
        // creation and the mapping never shrinks.
        let data = unsafe {
            std::slice::from_raw_parts_mut(state.mapping.base.add(self.offset), self.len)
        };
        f(data)
    }
}

impl Drop for PoolBuffer {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.external_refs -= 1;
        if state.external_refs == 0 {
            if let Some(target) = state.pending.take() {
                match state.mapping.grow(target) {
                    Ok(()) => {
                        state.size = target;
                        debug!(size = target, "deferred resize applied");
                    }
                    Err(e) => debug!(error = %e, "deferred resize failed"),
                }
            }
        }
    }
}

impl std::fmt::Debug for PoolBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBuffer").field("offset", &self.offset).field("len", &self.len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_validation() {
        assert!(matches!(validate(64, -1, 4, 4, 4), Err(PoolError::BadGeometry { .. })));
        assert!(matches!(validate(64, 0, 0, 4, 4), Err(PoolError::BadGeometry { .. })));
        assert!(matches!(validate(64, 0, 4, -2, 4), Err(PoolError::BadGeometry { .. })));
        // stride below width
        assert!(matches!(validate(64, 0, 8, 2, 4), Err(PoolError::BadGeometry { .. })));
        // stride * height overflows
        assert!(matches!(
            validate(64, 0, 4, i32::MAX, i32::MAX),
            Err(PoolError::BadGeometry { .. })
        ));
        assert_eq!(validate(64, 16, 4, 8, 4), Ok((16, 32)));
    }

    #[test]
    fn bounds_depend_on_pool_size() {
        // same buffer fits a 64-byte pool but not a 32-byte one
        assert!(validate(64, 16, 4, 8, 4).is_ok());
        assert!(matches!(validate(32, 16, 4, 8, 4), Err(PoolError::OutOfBounds { .. })));
    }

    #[test]
    fn memfd_pool_reads_back_writes() {
        let pool = Pool::with_memfd(64).unwrap();
        let buffer = pool.create_buffer(16, 4, 8, 4).unwrap();
        buffer.with_data(|data| data.fill(0xAB));
        pool.with_data(|data| {
            assert_eq!(data[15], 0);
            assert_eq!(data[16], 0xAB);
            assert_eq!(data[47], 0xAB);
            assert_eq!(data[48], 0);
        });
    }

    #[test]
    fn create_buffer_rejects_out_of_bounds() {
        let pool = Pool::with_memfd(32).unwrap();
        let err = pool.create_buffer(16, 4, 8, 4).unwrap_err();
        assert_eq!(err, PoolError::OutOfBounds { offset: 16, len: 32, pool_size: 32 });
    }

    #[test]
    fn resize_only_grows() {
        let pool = Pool::with_memfd(32).unwrap();
        assert!(matches!(pool.resize(16), Err(PoolError::Shrink { .. })));
        pool.grow(64).unwrap();
        assert_eq!(pool.size(), 64);
        // the grown region is usable
        pool.create_buffer(32, 4, 8, 4).unwrap();
    }

    #[test]
    fn resize_defers_while_buffers_live() {
        let pool = Pool::with_memfd(32).unwrap();
        let buffer = pool.create_buffer(0, 4, 8, 4).unwrap();
        pool.grow(128).unwrap();
        // the mapping still has its old size while the buffer lives
        assert_eq!(pool.size(), 32);
        drop(buffer);
        assert_eq!(pool.size(), 128);
    }

    #[test]
    fn deferred_resizes_coalesce_to_the_largest() {
        let pool = Pool::with_memfd(32).unwrap();
        let buffer = pool.create_buffer(0, 4, 4, 4).unwrap();
        pool.grow(256).unwrap();
        pool.resize(64).unwrap();
        drop(buffer);
        assert_eq!(pool.size(), 256);
    }

    #[test]
    fn invalid_pool_sizes_are_rejected() {
        assert_eq!(Pool::with_memfd(0).unwrap_err(), PoolError::InvalidSize(0));
        assert_eq!(Pool::with_memfd(-5).unwrap_err(), PoolError::InvalidSize(-5));
    }
}
