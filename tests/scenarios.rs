//! End-to-end flows between tasks on one kernel

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use spin::Mutex;

use portlink::error::ErrorClass;
use portlink::{
    create_subset, receive_command, receive_rights, reset_current, send_command, send_rights,
    Credentials, Handle, IpcConfig, IpcError, Kernel, MessageBuilder, MsgTypeName, Port,
    PortHolder, RightKind, RunLoop, Task, DEFAULT_MODE,
};

fn kernel() -> Arc<Kernel> {
    Kernel::new(IpcConfig::default()).unwrap()
}

fn user(kernel: &Arc<Kernel>, uid: u32) -> Arc<Task> {
    kernel.create_task(Credentials::new(uid, 20)).unwrap()
}

#[test]
fn register_lookup_rights_and_command() {
    let kernel = kernel();
    let a = user(&kernel, 501);
    let b = user(&kernel, 502);

    // A registers, B looks up and hands A its inbox as the reply port
    let service = Port::allocate(&a).unwrap();
    service.register(&a, "svc.test").unwrap();
    let inbox = Port::allocate(&b).unwrap();
    let remote = Port::lookup(&b, "svc.test").unwrap();
    remote
        .send(MessageBuilder::new(1).reply(inbox.name(), MsgTypeName::MakeSend))
        .unwrap();

    let mut hello = service.receive().unwrap().unwrap();
    assert_eq!(hello.audit_token().unwrap().euid, 502);
    assert_eq!(hello.audit_token().unwrap().pid, b.pid());
    let to_b = Port::wrap(hello.take_reply_port().unwrap());

    // A moves [r1, r2]; r1 is A's command port
    let commands = Port::allocate(&a).unwrap();
    let other = Port::allocate(&a).unwrap();
    let r1 = commands.make_send_right().unwrap();
    let r2 = other.make_send_right().unwrap();
    let (n1, n2) = (r1.name(), r2.name());
    send_rights(&to_b, vec![r1, r2]).unwrap();
    assert_eq!(a.space().refs(n1, RightKind::Send).unwrap(), 0);
    assert_eq!(a.space().refs(n2, RightKind::Send).unwrap(), 0);

    let mut msg = inbox.receive().unwrap().unwrap();
    let mut out: [Option<Handle>; 4] = Default::default();
    assert_eq!(receive_rights(&mut msg, &mut out).unwrap(), 2);
    let [first, second, ..] = out;
    let (first, second) = (first.unwrap(), second.unwrap());
    assert_ne!(first.name(), second.name());
    assert_eq!(first.space_id(), b.space().id());

    // B answers on r1
    let back = Port::wrap(first);
    send_command(&back, 42).unwrap();
    let reply = commands.receive().unwrap().unwrap();
    assert_eq!(receive_command(&reply).unwrap(), 42);
    drop(second);
}

#[test]
fn callbacks_carry_the_whole_exchange() {
    let kernel = kernel();
    let a = user(&kernel, 501);
    let b = user(&kernel, 502);

    // A: service plus command port, both driven by callbacks
    let loop_a = RunLoop::new(&a).unwrap();
    let service = Port::allocate(&a).unwrap();
    service.register(&a, "svc.flow").unwrap();
    let commands = Port::allocate(&a).unwrap();
    let spare = Port::allocate(&a).unwrap();
    let peer = Arc::new(PortHolder::default());
    let holder = Arc::clone(&peer);
    service.set_message_callback(move |_, msg| {
        holder.set(msg.take_reply_port().map(Port::wrap));
    });
    let decoded = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&decoded);
    commands.set_message_callback(move |_, msg| {
        *slot.lock() = receive_command(msg).ok();
    });
    service.schedule(&loop_a, DEFAULT_MODE).unwrap();
    commands.schedule(&loop_a, DEFAULT_MODE).unwrap();

    // B: inbox collecting whatever rights arrive
    let loop_b = RunLoop::new(&b).unwrap();
    let inbox = Port::allocate(&b).unwrap();
    let received: Arc<Mutex<Vec<Handle>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    inbox.set_message_callback(move |_, msg| {
        let mut out: [Option<Handle>; 4] = Default::default();
        receive_rights(msg, &mut out).unwrap();
        sink.lock().extend(out.into_iter().flatten());
    });
    inbox.schedule(&loop_b, DEFAULT_MODE).unwrap();

    let remote = Port::lookup(&b, "svc.flow").unwrap();
    remote
        .send(MessageBuilder::new(1).reply(inbox.name(), MsgTypeName::MakeSend))
        .unwrap();
    assert_eq!(loop_a.run_until_idle(DEFAULT_MODE).unwrap(), 1);
    let to_b = peer.get().unwrap();

    let rights = vec![
        commands.make_send_right().unwrap(),
        spare.make_send_right().unwrap(),
    ];
    send_rights(&to_b, rights).unwrap();
    loop_b.run_until_idle(DEFAULT_MODE).unwrap();
    let mut handles = core::mem::take(&mut *received.lock());
    assert_eq!(handles.len(), 2);

    // B answers and lets go of every right before A looks
    let back = Port::wrap(handles.remove(0));
    send_command(&back, 42).unwrap();
    drop(back);
    drop(handles);

    loop_a.run_until_idle(DEFAULT_MODE).unwrap();
    assert_eq!(*decoded.lock(), Some(42));
    assert!(!commands.is_valid());
    assert!(service.is_valid());
}

#[test]
fn subset_forwards_to_parent_and_shadows() {
    let kernel = kernel();
    let a = user(&kernel, 0);
    let parent_only = Port::allocate(&a).unwrap();
    parent_only.register(&a, "svc.parent").unwrap();
    let shadowed = Port::allocate(&a).unwrap();
    shadowed.register(&a, "svc.shared").unwrap();

    let requestor = Port::allocate(&a).unwrap();
    let requestor_right = requestor.make_send_right().unwrap();
    let subset = create_subset(&a, &requestor_right).unwrap();
    let saved = reset_current(&a, subset).unwrap();
    let shadow = Port::allocate(&a).unwrap();
    shadow.register(&a, "svc.shared").unwrap();

    let c = a.spawn().unwrap();
    let found = Port::lookup(&c, "svc.parent").unwrap();
    found.send(MessageBuilder::new(7)).unwrap();
    assert_eq!(parent_only.pending().unwrap(), 1);

    let shared = Port::lookup(&c, "svc.shared").unwrap();
    shared.send(MessageBuilder::new(8)).unwrap();
    assert_eq!(shadow.pending().unwrap(), 1);
    assert_eq!(shadowed.pending().unwrap(), 0);

    reset_current(&a, saved).unwrap();
}

#[test]
fn subset_goes_inactive_with_its_requestor() {
    let kernel = kernel();
    let a = user(&kernel, 0);
    let requestor = Port::allocate(&a).unwrap();
    let right = requestor.make_send_right().unwrap();
    let subset = create_subset(&a, &right).unwrap();
    let _saved = reset_current(&a, subset).unwrap();
    let c = a.spawn().unwrap();

    drop(right);
    drop(requestor);
    let err = Port::lookup(&c, "svc.anything").unwrap_err();
    assert_eq!(err, IpcError::NamespaceInactive);
    assert_eq!(err.class(), ErrorClass::Namespace);
}

#[test]
fn unschedule_stops_callbacks_for_queued_messages() {
    let kernel = kernel();
    let a = user(&kernel, 501);
    let runloop = RunLoop::new(&a).unwrap();
    let port = Port::allocate(&a).unwrap();
    let delivered = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&delivered);
    port.set_message_callback(move |_, _| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    port.schedule(&runloop, DEFAULT_MODE).unwrap();

    for id in 0..3 {
        port.send(MessageBuilder::new(id)).unwrap();
    }
    port.unschedule();
    runloop.run_until_idle(DEFAULT_MODE).unwrap();
    assert_eq!(delivered.load(Ordering::SeqCst), 0);
    assert_eq!(port.pending().unwrap(), 3);

    port.schedule(&runloop, DEFAULT_MODE).unwrap();
    runloop.run_until_idle(DEFAULT_MODE).unwrap();
    assert_eq!(delivered.load(Ordering::SeqCst), 3);
}

#[test]
fn peer_exit_invalidates_exactly_once() {
    let kernel = kernel();
    let server = user(&kernel, 0);
    let client = user(&kernel, 501);
    let service = Port::allocate(&server).unwrap();
    service.register(&server, "svc.exit").unwrap();

    let runloop = RunLoop::new(&client).unwrap();
    let remote = Port::lookup(&client, "svc.exit").unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&fired);
    remote.set_invalidation_callback(move |port| {
        assert!(!port.is_valid());
        seen.fetch_add(1, Ordering::SeqCst);
    });
    remote.schedule(&runloop, DEFAULT_MODE).unwrap();

    server.terminate();
    runloop.run_until_idle(DEFAULT_MODE).unwrap();
    runloop.run_until_idle(DEFAULT_MODE).unwrap();
    remote.invalidate();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(send_command(&remote, 1), Err(IpcError::Invalidated));
}

#[test]
fn over_max_transfer_fails_atomically() {
    let kernel = Kernel::new(IpcConfig::default().with_max_transfer_rights(2)).unwrap();
    let a = user(&kernel, 501);
    let b = user(&kernel, 502);
    let inbox = Port::allocate(&b).unwrap();
    inbox.register(&b, "svc.inbox").unwrap();
    let to_b = Port::lookup(&a, "svc.inbox").unwrap();

    let ports: Vec<Port> = (0..3).map(|_| Port::allocate(&a).unwrap()).collect();
    let rights: Vec<Handle> = ports.iter().map(|p| p.make_send_right().unwrap()).collect();
    let err = send_rights(&to_b, rights).unwrap_err();
    assert_eq!(err.error.class(), ErrorClass::Transport);

    // the handed-back rights still work
    let mut rights = err.into_rights();
    rights.truncate(2);
    send_rights(&to_b, rights).unwrap();
    let mut msg = inbox.receive().unwrap().unwrap();
    let mut out: [Option<Handle>; 4] = Default::default();
    assert_eq!(receive_rights(&mut msg, &mut out).unwrap(), 2);
}

#[test]
fn dead_peer_is_reported_as_such() {
    let kernel = kernel();
    let a = user(&kernel, 501);
    let b = user(&kernel, 502);
    let service = Port::allocate(&b).unwrap();
    service.register(&b, "svc.gone").unwrap();
    let remote = Port::lookup(&a, "svc.gone").unwrap();
    drop(service);

    let err = send_command(&remote, 5).unwrap_err();
    assert!(err.is_dead_peer());
    assert_eq!(err.class(), ErrorClass::Transport);
}
