//! Pool sharing end to end: the fd crosses the socket, both sides see the
//! same bytes, and invalid buffers are rejected without killing the
//! connection.

use std::os::unix::net::UnixStream;
use std::sync::Arc;

use parking_lot::Mutex;
use weft_core::{Connection, Role};
use weft_protocols::display::{Display, DisplayResource};
use weft_protocols::shm::{Format, Shm};
use weft_protocols::{display, register_all, shm};
use weft_shm::{Pool, ShmGlobal};

struct Fixture {
    client: Connection,
    server: Connection,
    global: Arc<ShmGlobal>,
    shm: Shm,
}

fn serve_n(server: &Connection, expected: usize) {
    let mut seen = 0;
    while seen < expected {
        seen += server.dispatch_default().unwrap();
    }
}

/// Bring up a connection pair with the shm capability bound on the client.
fn fixture() -> Fixture {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let (a, b) = UnixStream::pair().unwrap();
    let client = Connection::from_stream(a, Role::Outbound, &display::INTERFACE).unwrap();
    let server = Connection::from_stream(b, Role::Inbound, &display::INTERFACE).unwrap();
    register_all(&client);
    register_all(&server);

    let global = Arc::new(ShmGlobal::new(vec![Format::Argb8888, Format::Xrgb8888]));
    server.advertise(global.clone());

    let server_display = DisplayResource::from_connection(&server);
    server_display.serve_sync();
    let server_conn = server.clone();
    server_display.on_get_registry(move |registry| {
        registry.serve(&server_conn).unwrap();
    });

    let registry = Display::from_connection(&client).get_registry().unwrap();
    let announced: Arc<Mutex<Option<(u32, u32)>>> = Arc::new(Mutex::new(None));
    let sink = announced.clone();
    registry.on_announce(move |name, interface, version| {
        if interface == "weft_shm" {
            *sink.lock() = Some((name, version));
        }
    });

    serve_n(&server, 1);
    while announced.lock().is_none() {
        client.dispatch_default().unwrap();
    }
    let (name, version) = announced.lock().take().unwrap();
    let bound = registry.bind(name, &shm::INTERFACE, version).unwrap();
    let shm = Shm::from_handle(bound);

    serve_n(&server, 1);
    Fixture { client, server, global, shm }
}

#[test]
fn formats_are_announced_on_bind() {
    let f = fixture();
    let formats: Arc<Mutex<Vec<Format>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = formats.clone();
    f.shm.on_format(move |format| sink.lock().push(format));

    while formats.lock().len() < 2 {
        f.client.dispatch_default().unwrap();
    }
    assert_eq!(*formats.lock(), vec![Format::Argb8888, Format::Xrgb8888]);
}

#[test]
fn pool_bytes_are_shared_across_the_socket() {
    let f = fixture();

    let local = Pool::with_memfd(64).unwrap();
    local.with_data(|data| {
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = i as u8;
        }
    });

    let pool = f.shm.create_pool(local.fd(), 64).unwrap();
    let _buffer = pool.create_buffer(16, 4, 8, 4, Format::Argb8888).unwrap();
    serve_n(&f.server, 2);

    let served = f.global.buffers();
    assert_eq!(served.len(), 1);
    let buffer = &served[0];
    assert_eq!(buffer.data().offset(), 16);
    assert_eq!(buffer.data().len(), 32);
    assert_eq!(buffer.spec().format, Format::Argb8888);
    buffer.data().with_data(|data| {
        assert_eq!(data[0], 16);
        assert_eq!(data[31], 47);
    });

    // writes on the serving side are visible to the creator
    buffer.data().with_data(|data| data[0] = 0xEE);
    local.with_data(|data| assert_eq!(data[16], 0xEE));
}

#[test]
fn oversized_buffers_are_rejected_not_fatal() {
    let f = fixture();

    let local = Pool::with_memfd(32).unwrap();
    let pool = f.shm.create_pool(local.fd(), 32).unwrap();
    // 32 bytes at offset 16 exceed the 32-byte pool
    let _bad = pool.create_buffer(16, 4, 8, 4, Format::Argb8888).unwrap();
    serve_n(&f.server, 2);
    assert!(f.global.buffers().is_empty());

    // the connection survives and serves a valid buffer afterwards
    let _good = pool.create_buffer(0, 4, 4, 4, Format::Xrgb8888).unwrap();
    serve_n(&f.server, 1);
    assert_eq!(f.global.buffers().len(), 1);
    assert!(f.server.last_error().is_none());
}

#[test]
fn destroyed_buffers_retire_from_the_global() {
    let f = fixture();

    let local = Pool::with_memfd(64).unwrap();
    let pool = f.shm.create_pool(local.fd(), 64).unwrap();
    let buffer = pool.create_buffer(0, 4, 8, 4, Format::Argb8888).unwrap();
    serve_n(&f.server, 2);
    assert_eq!(f.global.buffers().len(), 1);

    drop(buffer);
    serve_n(&f.server, 1);
    assert!(f.global.buffers().is_empty());
}

#[test]
fn resize_is_deferred_while_buffers_live() {
    let f = fixture();

    let local = Pool::with_memfd(32).unwrap();
    let pool = f.shm.create_pool(local.fd(), 32).unwrap();
    let buffer = pool.create_buffer(0, 4, 8, 4, Format::Argb8888).unwrap();
    serve_n(&f.server, 2);

    // grow the backing file locally, then tell the peer
    local.grow(128).unwrap();
    pool.resize(128).unwrap();
    serve_n(&f.server, 1);

    // a buffer beyond the old size is still rejected: the remote remap is
    // postponed while the first buffer lives
    let _far = pool.create_buffer(64, 4, 8, 4, Format::Argb8888).unwrap();
    serve_n(&f.server, 1);
    assert_eq!(f.global.buffers().len(), 1);

    drop(buffer);
    serve_n(&f.server, 1);
    assert!(f.global.buffers().is_empty());

    // with the reference gone the resize applied; the far buffer now fits
    let _far2 = pool.create_buffer(64, 4, 8, 4, Format::Argb8888).unwrap();
    serve_n(&f.server, 1);
    assert_eq!(f.global.buffers().len(), 1);
}
