//! End-to-end flow over a socketpair: registry discovery, capability bind,
//! surface lifecycle, explicit destructors.

use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;
use weft_core::{Capability, Connection, Interface, ObjectHandle, ObjectId, Role};
use weft_protocols::buffer::Buffer;
use weft_protocols::compositor::{self, CompositorResource};
use weft_protocols::display::{Display, DisplayResource};
use weft_protocols::surface::{Surface, SurfaceResource};
use weft_protocols::{buffer, display, register_all, surface};

#[derive(Default)]
struct CompositorCap {
    bound: Mutex<Vec<CompositorResource>>,
    surfaces: Mutex<Vec<SurfaceResource>>,
    commits: Arc<AtomicU32>,
    destroyed: Arc<AtomicBool>,
}

struct CompositorCapHandle(Arc<CompositorCap>);

impl Capability for CompositorCapHandle {
    fn interface(&self) -> &'static Interface {
        &compositor::INTERFACE
    }

    fn bind(&self, handle: ObjectHandle) {
        let cap = self.0.clone();
        let resource = CompositorResource::from_handle(handle);
        resource.on_create_surface(move |surface| {
            let commits = cap.commits.clone();
            surface.on_commit(move || {
                commits.fetch_add(1, Ordering::SeqCst);
            });
            let destroyed = cap.destroyed.clone();
            surface.on_destroy(move || destroyed.store(true, Ordering::SeqCst));
            cap.surfaces.lock().push(surface);
        });
        self.0.bound.lock().push(resource);
    }
}

fn pair() -> (Connection, Connection) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let (a, b) = UnixStream::pair().unwrap();
    let client = Connection::from_stream(a, Role::Outbound, &display::INTERFACE).unwrap();
    let server = Connection::from_stream(b, Role::Inbound, &display::INTERFACE).unwrap();
    register_all(&client);
    register_all(&server);
    (client, server)
}

fn serve_n(server: &Connection, expected: usize) {
    let mut seen = 0;
    while seen < expected {
        seen += server.dispatch_default().unwrap();
    }
}

#[test]
fn discover_bind_and_commit() {
    let (client, server) = pair();

    let cap = Arc::new(CompositorCap::default());
    server.advertise(Arc::new(CompositorCapHandle(cap.clone())));

    let server_display = DisplayResource::from_connection(&server);
    server_display.serve_sync();
    let server_conn = server.clone();
    server_display.on_get_registry(move |registry| {
        registry.serve(&server_conn).unwrap();
    });

    // client discovers the capability
    let display = Display::from_connection(&client);
    let registry = display.get_registry().unwrap();
    let announced: Arc<Mutex<Vec<(u32, String, u32)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = announced.clone();
    registry.on_announce(move |name, interface, version| {
        sink.lock().push((name, interface, version));
    });

    serve_n(&server, 1);
    while announced.lock().is_empty() {
        client.dispatch_default().unwrap();
    }

    let (name, interface, version) = announced.lock()[0].clone();
    assert_eq!(interface, "weft_compositor");
    assert_eq!(version, 1);

    // bind, create a surface, commit it
    let bound = registry.bind(name, &compositor::INTERFACE, version).unwrap();
    let comp = weft_protocols::compositor::Compositor::from_handle(bound);
    let surface = comp.create_surface().unwrap();
    surface.commit().unwrap();

    serve_n(&server, 3);
    assert_eq!(cap.bound.lock().len(), 1);
    assert_eq!(cap.surfaces.lock().len(), 1);
    assert_eq!(cap.commits.load(Ordering::SeqCst), 1);

    // dropping the last clone sends the explicit destructor
    let surface_id = surface.handle().id();
    assert_eq!(surface.handle().ref_count(), 1);
    drop(surface);
    serve_n(&server, 1);
    assert!(cap.destroyed.load(Ordering::SeqCst));

    // the id is free for reuse on the client side
    let surface2 = comp.create_surface().unwrap();
    assert_eq!(surface2.handle().id(), surface_id);
}

#[test]
fn attach_routes_buffer_and_offsets_to_the_slot() {
    let (client, server) = pair();

    let surface = Surface::from_handle(client.attach(ObjectId(5), &surface::INTERFACE, 1));
    let served = SurfaceResource::from_handle(server.attach(ObjectId(5), &surface::INTERFACE, 1));

    let got: Arc<Mutex<Option<(u32, i32, i32)>>> = Arc::new(Mutex::new(None));
    let sink = got.clone();
    served.on_attach(move |buffer, x, y| {
        *sink.lock() = Some((buffer.id().0, x, y));
    });

    let buffer = Buffer::from_handle(client.attach(ObjectId(7), &buffer::INTERFACE, 1));
    surface.attach(Some(&buffer), 10, 20).unwrap();
    serve_n(&server, 1);

    assert_eq!(*got.lock(), Some((7, 10, 20)));
}

#[test]
fn sync_fires_done_in_order() {
    let (client, server) = pair();
    DisplayResource::from_connection(&server).serve_sync();

    let display = Display::from_connection(&client);
    let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

    let first = display.sync().unwrap();
    let sink = order.clone();
    first.on_done(move |serial| sink.lock().push(serial));
    let second = display.sync().unwrap();
    let sink = order.clone();
    second.on_done(move |serial| sink.lock().push(serial));

    serve_n(&server, 2);
    let mut got = 0;
    while got < 2 {
        got += client.dispatch_default().unwrap();
    }
    assert_eq!(*order.lock(), vec![0, 1]);
}

#[test]
fn withdraw_reaches_observers() {
    let (client, server) = pair();
    let cap = Arc::new(CompositorCap::default());
    let name = server.advertise(Arc::new(CompositorCapHandle(cap)));

    let server_display = DisplayResource::from_connection(&server);
    server_display.serve_sync();
    let server_conn = server.clone();
    server_display.on_get_registry(move |registry| {
        registry.serve(&server_conn).unwrap();
        registry.withdraw(name).unwrap();
    });

    let display = Display::from_connection(&client);
    let registry = display.get_registry().unwrap();
    let withdrawn = Arc::new(AtomicU32::new(u32::MAX));
    let sink = withdrawn.clone();
    registry.on_withdraw(move |name| sink.store(name, Ordering::SeqCst));

    serve_n(&server, 1);
    while withdrawn.load(Ordering::SeqCst) == u32::MAX {
        client.dispatch_default().unwrap();
    }
    assert_eq!(withdrawn.load(Ordering::SeqCst), name);
}

#[test]
fn roundtrip_against_a_threaded_server() {
    let (client, server) = pair();
    DisplayResource::from_connection(&server).serve_sync();

    let server_thread = std::thread::spawn(move || {
        while server.dispatch_default().is_ok() {}
    });

    let display = Display::from_connection(&client);
    display.roundtrip(&client).unwrap();
    display.roundtrip(&client).unwrap();

    drop(display);
    drop(client); // hangup ends the server loop
    server_thread.join().unwrap();
}
