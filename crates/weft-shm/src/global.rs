//! The serving side of the `weft_shm` capability.
//!
//! Binds hand out `weft_shm` objects; create_pool maps the passed fd into a
//! [`Pool`]; create_buffer validates against the pool and records a
//! [`ServedBuffer`] the embedding server can present from. Invalid
//! parameters are reported and the offending object is abandoned, never
//! fatal to the connection.

use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;
use weft_core::{Capability, Interface, ObjectHandle, ObjectId};
use weft_protocols::buffer::BufferResource;
use weft_protocols::shm::{self, Format, ShmResource};
use weft_protocols::shm_pool::{BufferSpec, ShmPoolResource};

use crate::pool::{Pool, PoolBuffer};

/// A bound buffer backed by pool storage.
pub struct ServedBuffer {
    resource: BufferResource,
    data: PoolBuffer,
    spec: BufferSpec,
}

impl ServedBuffer {
    pub fn resource(&self) -> &BufferResource {
        &self.resource
    }

    pub fn data(&self) -> &PoolBuffer {
        &self.data
    }

    pub fn spec(&self) -> BufferSpec {
        self.spec
    }
}

struct ShmState {
    formats: Vec<Format>,
    bound: Mutex<Vec<ShmResource>>,
    pools: Mutex<Vec<ShmPoolResource>>,
    buffers: Mutex<Vec<Arc<ServedBuffer>>>,
}

/// Capability implementation serving shared-memory pools.
pub struct ShmGlobal {
    state: Arc<ShmState>,
}

impl ShmGlobal {
    pub fn new(formats: Vec<Format>) -> ShmGlobal {
        ShmGlobal {
            state: Arc::new(ShmState {
                formats,
                bound: Mutex::new(Vec::new()),
                pools: Mutex::new(Vec::new()),
                buffers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Snapshot of the currently live buffers, newest last.
    pub fn buffers(&self) -> Vec<Arc<ServedBuffer>> {
        self.state.buffers.lock().clone()
    }
}

impl Capability for ShmGlobal {
    fn interface(&self) -> &'static Interface {
        &shm::INTERFACE
    }

    fn bind(&self, handle: ObjectHandle) {
        let resource = ShmResource::from_handle(handle);
        for &format in &self.state.formats {
            if let Err(e) = resource.format(format) {
                warn!(error = %e, "format announcement not sent");
            }
        }

        let state = self.state.clone();
        resource.on_create_pool(move |pool_resource, fd, size| {
            // the received descriptor outlives the callback only as a dup
            let fd = match dup_cloexec(fd) {
                Ok(fd) => fd,
                Err(e) => {
                    warn!(size, error = %e, "pool fd not duplicated");
                    return;
                }
            };
            match Pool::new(fd, size) {
                Ok(pool) => serve_pool(&state, pool_resource, pool),
                Err(e) => warn!(size, error = %e, "create_pool rejected"),
            }
        });

        self.state.bound.lock().push(resource);
    }
}

fn serve_pool(state: &Arc<ShmState>, resource: ShmPoolResource, pool: Pool) {
    let pool_id = resource.handle().id();

    let resize_pool = pool.clone();
    resource.on_resize(move |size| {
        if let Err(e) = resize_pool.resize(size) {
            warn!(size, error = %e, "resize rejected");
        }
    });

    let buffer_state = state.clone();
    resource.on_create_buffer(move |buffer_resource, spec| {
        match pool.create_buffer(spec.offset, spec.width, spec.height, spec.stride) {
            Ok(data) => {
                let buffer_id = buffer_resource.handle().id();
                let served = Arc::new(ServedBuffer { resource: buffer_resource, data, spec });
                served.resource.on_destroy({
                    let buffers = buffer_state.clone();
                    move || retire_buffer(&buffers, buffer_id)
                });
                buffer_state.buffers.lock().push(served);
            }
            Err(e) => warn!(?spec, error = %e, "create_buffer rejected"),
        }
    });

    let destroy_state = state.clone();
    resource.on_destroy(move || {
        destroy_state.pools.lock().retain(|p| p.handle().id() != pool_id);
    });

    state.pools.lock().push(resource);
}

fn retire_buffer(state: &Arc<ShmState>, id: ObjectId) {
    state.buffers.lock().retain(|b| b.resource().handle().id() != id);
}

fn dup_cloexec(fd: RawFd) -> std::io::Result<OwnedFd> {
    let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if dup < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: fcntl returned a fresh descriptor we alone own.
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}
