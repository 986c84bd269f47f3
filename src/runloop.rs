//! Run loop
//!
//! A single-threaded dispatcher that delivers messages to scheduled receive
//! ports and turns kernel death notifications into port invalidations.
//! Sources are grouped by mode; one pass (`run_once`) serves only the ports
//! scheduled in the requested mode.
//!
//! Each loop owns a private notify port. Scheduling a port asks the kernel
//! for a no-senders (receive rights) or dead-name (send rights) notification
//! on that port. A receive port that loses its last sender first gets the
//! messages already queued on it, then invalidates.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use spin::Mutex;

use crate::error::{IpcError, IpcResult};
use crate::handle::Handle;
use crate::ipc::mach_msg::msg_receive;
use crate::ipc::notify::NotifyType;
use crate::ipc::right::RightKind;
use crate::kern::Task;
use crate::message::read_u32;
use crate::port::{Port, WeakPort};
use crate::types::{PortName, SpaceId};

/// Mode used when the caller has no reason to pick another
pub const DEFAULT_MODE: &str = "default";

struct Source {
    port: WeakPort,
    name: PortName,
    mode: String,
    receives: bool,
}

pub(crate) struct LoopShared {
    task: Arc<Task>,
    notify: Handle,
    sources: Mutex<Vec<Source>>,
}

/// Message dispatcher for one task
#[derive(Clone)]
pub struct RunLoop {
    shared: Arc<LoopShared>,
}

impl RunLoop {
    pub fn new(task: &Arc<Task>) -> IpcResult<Self> {
        let name = task.space().allocate_receive()?;
        let notify = Handle::from_raw(Arc::clone(task.space()), name, RightKind::Receive);
        log::debug!("runloop: task pid {} notify port {}", task.pid(), name);
        Ok(Self {
            shared: Arc::new(LoopShared {
                task: Arc::clone(task),
                notify,
                sources: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.shared.task
    }

    pub fn space_id(&self) -> SpaceId {
        self.shared.task.space().id()
    }

    /// Number of live scheduled ports, across all modes
    pub fn source_count(&self) -> usize {
        self.shared
            .sources
            .lock()
            .iter()
            .filter(|s| s.port.is_alive())
            .count()
    }

    pub(crate) fn notify_port(&self) -> PortName {
        self.shared.notify.name()
    }

    pub(crate) fn downgrade(&self) -> Weak<LoopShared> {
        Arc::downgrade(&self.shared)
    }

    pub(crate) fn upgrade(shared: &Weak<LoopShared>) -> Option<Self> {
        shared.upgrade().map(|shared| Self { shared })
    }

    pub(crate) fn add_source(&self, port: &Port, mode: &str) {
        self.shared.sources.lock().push(Source {
            port: port.downgrade(),
            name: port.name(),
            mode: mode.into(),
            receives: port.kind() == RightKind::Receive,
        });
    }

    pub(crate) fn remove_source(&self, port: &Port) {
        self.shared.sources.lock().retain(|s| !s.port.is(port));
    }

    /// One dispatch pass over `mode`. Returns the number of callbacks fired
    /// (messages delivered plus ports invalidated).
    pub fn run_once(&self, mode: &str) -> IpcResult<usize> {
        let mut fired = self.drain_notifications()?;

        let loop_ref = self.downgrade();
        let batch = self.shared.task.space().config().loop_batch;
        let ports: Vec<Port> = {
            let mut sources = self.shared.sources.lock();
            sources.retain(|s| s.port.is_alive());
            sources
                .iter()
                .filter(|s| s.receives && s.mode == mode)
                .filter_map(|s| s.port.upgrade())
                .collect()
        };

        for port in ports {
            for _ in 0..batch {
                // a callback may have unscheduled or invalidated the port
                if !port.is_scheduled_in(&loop_ref, mode) {
                    break;
                }
                match port.receive() {
                    Ok(Some(msg)) => {
                        port.deliver(msg);
                        fired += 1;
                    }
                    Ok(None) | Err(IpcError::Invalidated) => break,
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(fired)
    }

    fn drain_notifications(&self) -> IpcResult<usize> {
        let space = self.shared.task.space();
        let mut fired = 0;
        while let Some(msg) = msg_receive(space, self.notify_port())? {
            let watched = PortName(read_u32(msg.body(), 0)?);
            match NotifyType::from_msg_id(msg.id()) {
                Some(NotifyType::NoSenders | NotifyType::DeadName) => {
                    let ports: Vec<Port> = self
                        .shared
                        .sources
                        .lock()
                        .iter()
                        .filter(|s| s.name == watched)
                        .filter_map(|s| s.port.upgrade())
                        .collect();
                    for port in ports {
                        if port.kind() == RightKind::Receive {
                            fired += self.flush(&port)?;
                        }
                        if port.invalidate() {
                            fired += 1;
                        }
                    }
                }
                other => log::trace!("runloop: ignoring notification {:?} for {}", other, watched),
            }
        }
        Ok(fired)
    }

    /// Deliver what `port` holds now, in whatever mode it is scheduled
    fn flush(&self, port: &Port) -> IpcResult<usize> {
        let loop_ref = self.downgrade();
        let queued = port.pending().unwrap_or(0);
        let mut fired = 0;
        for _ in 0..queued {
            if !port.is_scheduled_by(&loop_ref) {
                break;
            }
            match port.receive() {
                Ok(Some(msg)) => {
                    port.deliver(msg);
                    fired += 1;
                }
                Ok(None) | Err(IpcError::Invalidated) => break,
                Err(err) => return Err(err),
            }
        }
        Ok(fired)
    }

    /// Run passes until one fires nothing
    pub fn run_until_idle(&self, mode: &str) -> IpcResult<usize> {
        let mut total = 0;
        loop {
            let fired = self.run_once(mode)?;
            if fired == 0 {
                return Ok(total);
            }
            total += fired;
        }
    }

    /// Run passes until `timeout` elapses, yielding between idle passes
    pub fn run_for(&self, mode: &str, timeout: Duration) -> IpcResult<usize> {
        let deadline = Instant::now() + timeout;
        let mut total = 0;
        loop {
            let fired = self.run_once(mode)?;
            total += fired;
            if Instant::now() >= deadline {
                return Ok(total);
            }
            if fired == 0 {
                std::thread::yield_now();
            }
        }
    }
}

impl core::fmt::Debug for RunLoop {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RunLoop")
            .field("task", &self.shared.task.pid())
            .field("notify", &self.shared.notify.name())
            .field("sources", &self.source_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IpcConfig;
    use crate::kern::{Credentials, Kernel};
    use crate::message::MessageBuilder;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn task() -> Arc<Task> {
        Kernel::new(IpcConfig::default())
            .unwrap()
            .create_task(Credentials::new(501, 20))
            .unwrap()
    }

    fn counting(port: &Port) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        port.set_message_callback(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    #[test]
    fn delivers_only_in_scheduled_mode() {
        let task = task();
        let runloop = RunLoop::new(&task).unwrap();
        let port = Port::allocate(&task).unwrap();
        let count = counting(&port);
        port.schedule(&runloop, "private").unwrap();
        port.send(MessageBuilder::new(1)).unwrap();

        assert_eq!(runloop.run_once(DEFAULT_MODE).unwrap(), 0);
        assert_eq!(runloop.run_once("private").unwrap(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unscheduled_port_keeps_messages() {
        let task = task();
        let runloop = RunLoop::new(&task).unwrap();
        let port = Port::allocate(&task).unwrap();
        let count = counting(&port);
        port.schedule(&runloop, DEFAULT_MODE).unwrap();
        port.unschedule();
        assert_eq!(runloop.source_count(), 0);

        port.send(MessageBuilder::new(1)).unwrap();
        runloop.run_until_idle(DEFAULT_MODE).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(port.pending().unwrap(), 1);
    }

    #[test]
    fn batch_limits_one_pass() {
        let kernel = Kernel::new(IpcConfig::default().with_loop_batch(2)).unwrap();
        let task = kernel.create_task(Credentials::ROOT).unwrap();
        let runloop = RunLoop::new(&task).unwrap();
        let port = Port::allocate(&task).unwrap();
        let count = counting(&port);
        port.schedule(&runloop, DEFAULT_MODE).unwrap();
        for id in 0..3 {
            port.send(MessageBuilder::new(id)).unwrap();
        }
        assert_eq!(runloop.run_once(DEFAULT_MODE).unwrap(), 2);
        assert_eq!(runloop.run_until_idle(DEFAULT_MODE).unwrap(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn peer_death_invalidates_send_port() {
        let kernel = Kernel::new(IpcConfig::default()).unwrap();
        let server = kernel.create_task(Credentials::ROOT).unwrap();
        let client = kernel.create_task(Credentials::ROOT).unwrap();
        let service = Port::allocate(&server).unwrap();
        service.register(&server, "svc.peer").unwrap();

        let runloop = RunLoop::new(&client).unwrap();
        let remote = Port::lookup(&client, "svc.peer").unwrap();
        let invalidations = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&invalidations);
        remote.set_invalidation_callback(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        remote.schedule(&runloop, DEFAULT_MODE).unwrap();

        drop(service);
        assert_eq!(runloop.run_until_idle(DEFAULT_MODE).unwrap(), 1);
        assert!(!remote.is_valid());
        assert_eq!(invalidations.load(Ordering::SeqCst), 1);
        runloop.run_until_idle(DEFAULT_MODE).unwrap();
        assert_eq!(invalidations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn no_senders_invalidates_receive_port() {
        let task = task();
        let runloop = RunLoop::new(&task).unwrap();
        let port = Port::allocate(&task).unwrap();
        port.schedule(&runloop, DEFAULT_MODE).unwrap();
        let send = port.make_send_right().unwrap();
        drop(send);
        runloop.run_until_idle(DEFAULT_MODE).unwrap();
        assert!(!port.is_valid());
    }

    #[test]
    fn queued_messages_outlive_last_sender() {
        let task = task();
        let runloop = RunLoop::new(&task).unwrap();
        let port = Port::allocate(&task).unwrap();
        let count = counting(&port);
        port.schedule(&runloop, "private").unwrap();
        let send = Port::wrap(port.make_send_right().unwrap());
        send.send(MessageBuilder::new(1)).unwrap();
        send.send(MessageBuilder::new(2)).unwrap();
        drop(send);

        // delivery ignores the run mode once the port is going away
        assert_eq!(runloop.run_once(DEFAULT_MODE).unwrap(), 3);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(!port.is_valid());
    }

    #[test]
    fn unscheduled_port_is_not_flushed() {
        let task = task();
        let runloop = RunLoop::new(&task).unwrap();
        let port = Port::allocate(&task).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        port.set_message_callback(move |port, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            port.unschedule();
        });
        port.schedule(&runloop, DEFAULT_MODE).unwrap();
        let send = Port::wrap(port.make_send_right().unwrap());
        for id in 0..3 {
            send.send(MessageBuilder::new(id)).unwrap();
        }
        drop(send);

        runloop.run_until_idle(DEFAULT_MODE).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn schedule_rules() {
        let task = task();
        let other = task.spawn().unwrap();
        let runloop = RunLoop::new(&task).unwrap();
        let second = RunLoop::new(&task).unwrap();
        let foreign = RunLoop::new(&other).unwrap();
        let port = Port::allocate(&task).unwrap();

        assert_eq!(port.schedule(&foreign, DEFAULT_MODE), Err(IpcError::ForeignTask));
        port.schedule(&runloop, DEFAULT_MODE).unwrap();
        port.schedule(&runloop, DEFAULT_MODE).unwrap();
        assert!(port.schedule(&second, DEFAULT_MODE).is_err());
        port.unschedule();
        port.schedule(&second, DEFAULT_MODE).unwrap();

        port.invalidate();
        assert_eq!(port.schedule(&runloop, DEFAULT_MODE), Err(IpcError::Invalidated));
        assert_eq!(second.source_count(), 0);
    }

    #[test]
    fn callback_may_invalidate_its_port() {
        let task = task();
        let runloop = RunLoop::new(&task).unwrap();
        let port = Port::allocate(&task).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        port.set_message_callback(move |port, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            port.invalidate();
        });
        port.schedule(&runloop, DEFAULT_MODE).unwrap();
        port.send(MessageBuilder::new(1)).unwrap();
        port.send(MessageBuilder::new(2)).unwrap();

        runloop.run_until_idle(DEFAULT_MODE).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
