//! Port wrapper
//!
//! A [`Port`] owns one right (through a [`Handle`]) and adds what a process
//! needs on top of the raw kernel calls: name registration and lookup,
//! message and invalidation callbacks, and scheduling into a [`RunLoop`].
//!
//! Lifecycle: `Unscheduled <-> Scheduled -> Invalidated`. Invalidation is
//! terminal: it fires the invalidation callback exactly once, releases the
//! right, and no message callback runs afterwards.
//!
//! `Port` is a cheap clone of a shared wrapper. The right is released when
//! the last clone is dropped (or at invalidation, whichever comes first).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use spin::Mutex;

use crate::error::{IpcError, IpcResult};
use crate::handle::Handle;
use crate::ipc::mach_msg::{msg_pending, msg_receive, msg_send};
use crate::ipc::notify::NotifyType;
use crate::ipc::right::{MsgTypeName, RightKind};
use crate::ipc::space::IpcSpace;
use crate::kern::Task;
use crate::message::{Message, MessageBuilder};
use crate::runloop::{LoopShared, RunLoop};
use crate::types::{PortName, SpaceId};

/// Called on the loop thread for every message delivered to a scheduled port
pub type MessageCallback = Arc<dyn Fn(&Port, &mut Message) + Send + Sync>;

/// Called once when the port becomes unusable
pub type InvalidationCallback = Arc<dyn Fn(&Port) + Send + Sync>;

enum Schedule {
    Unscheduled,
    Scheduled {
        runloop: Weak<LoopShared>,
        mode: String,
    },
    Invalidated,
}

pub(crate) struct PortShared {
    name: PortName,
    kind: RightKind,
    space: Arc<IpcSpace>,
    handle: Mutex<Option<Handle>>,
    registered: Mutex<Option<String>>,
    schedule: Mutex<Schedule>,
    on_message: Mutex<Option<MessageCallback>>,
    on_invalidate: Mutex<Option<InvalidationCallback>>,
    /// Loop whose notify port receives this port's death notification
    watched_by: Mutex<Weak<LoopShared>>,
    invalidated: AtomicBool,
}

/// A message port owned by this process
#[derive(Clone)]
pub struct Port {
    shared: Arc<PortShared>,
}

/// Non-owning reference held by run loops
#[derive(Clone)]
pub(crate) struct WeakPort(Weak<PortShared>);

impl WeakPort {
    pub(crate) fn upgrade(&self) -> Option<Port> {
        self.0.upgrade().map(|shared| Port { shared })
    }

    pub(crate) fn is(&self, port: &Port) -> bool {
        Weak::as_ptr(&self.0) == Arc::as_ptr(&port.shared)
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

impl Port {
    // ------------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------------

    /// Take ownership of an existing right. No kernel call is made.
    pub fn wrap(handle: Handle) -> Self {
        Self {
            shared: Arc::new(PortShared {
                name: handle.name(),
                kind: handle.kind(),
                space: Arc::clone(handle.space()),
                handle: Mutex::new(Some(handle)),
                registered: Mutex::new(None),
                schedule: Mutex::new(Schedule::Unscheduled),
                on_message: Mutex::new(None),
                on_invalidate: Mutex::new(None),
                watched_by: Mutex::new(Weak::new()),
                invalidated: AtomicBool::new(false),
            }),
        }
    }

    /// Allocate a fresh port and wrap its receive right
    pub fn allocate(task: &Task) -> IpcResult<Self> {
        let name = task.space().allocate_receive()?;
        Ok(Self::wrap(Handle::from_raw(
            Arc::clone(task.space()),
            name,
            RightKind::Receive,
        )))
    }

    /// Resolve a registered service name to a send right in `task`'s
    /// current namespace. Nothing is constructed on failure.
    pub fn lookup(task: &Task, name: &str) -> IpcResult<Self> {
        let local = task
            .kernel()
            .bootstrap()
            .look_up(task.space(), task.bootstrap_port(), name)?;
        let port = Self::wrap(Handle::from_raw(
            Arc::clone(task.space()),
            local,
            RightKind::Send,
        ));
        *port.shared.registered.lock() = Some(name.into());
        Ok(port)
    }

    /// Advertise this port under `name` in `task`'s current namespace
    pub fn register(&self, task: &Task, name: &str) -> IpcResult<()> {
        if task.space().id() != self.shared.space.id() {
            return Err(IpcError::ForeignTask);
        }
        let local = self.live_name()?;
        task.kernel()
            .bootstrap()
            .register(task.space(), task.bootstrap_port(), name, local)?;
        *self.shared.registered.lock() = Some(name.into());
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// Name of the right in the owning space (kept after invalidation)
    pub fn name(&self) -> PortName {
        self.shared.name
    }

    pub fn kind(&self) -> RightKind {
        self.shared.kind
    }

    pub fn space_id(&self) -> SpaceId {
        self.shared.space.id()
    }

    /// Service name this port was registered or looked up under
    pub fn registered_name(&self) -> Option<String> {
        self.shared.registered.lock().clone()
    }

    pub fn is_valid(&self) -> bool {
        !self.shared.invalidated.load(Ordering::Acquire)
    }

    pub fn is_scheduled(&self) -> bool {
        matches!(*self.shared.schedule.lock(), Schedule::Scheduled { .. })
    }

    /// Both values refer to the same wrapper instance
    pub fn ptr_eq(&self, other: &Port) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub(crate) fn downgrade(&self) -> WeakPort {
        WeakPort(Arc::downgrade(&self.shared))
    }

    pub(crate) fn space(&self) -> &Arc<IpcSpace> {
        &self.shared.space
    }

    fn live_name(&self) -> IpcResult<PortName> {
        self.shared
            .handle
            .lock()
            .as_ref()
            .map(Handle::name)
            .ok_or(IpcError::Invalidated)
    }

    // ------------------------------------------------------------------------
    // Callbacks
    // ------------------------------------------------------------------------

    /// Replace the message callback
    pub fn set_message_callback<F>(&self, callback: F)
    where
        F: Fn(&Port, &mut Message) + Send + Sync + 'static,
    {
        *self.shared.on_message.lock() = Some(Arc::new(callback));
    }

    /// Replace the invalidation callback
    pub fn set_invalidation_callback<F>(&self, callback: F)
    where
        F: Fn(&Port) + Send + Sync + 'static,
    {
        *self.shared.on_invalidate.lock() = Some(Arc::new(callback));
    }

    // ------------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------------

    /// Attach the port to `runloop` under `mode`.
    ///
    /// Receive ports get their messages delivered by the loop; every port
    /// gets its death reported there as an invalidation.
    pub fn schedule(&self, runloop: &RunLoop, mode: &str) -> IpcResult<()> {
        if runloop.space_id() != self.space_id() {
            return Err(IpcError::ForeignTask);
        }
        let loop_ref = runloop.downgrade();
        {
            let mut schedule = self.shared.schedule.lock();
            match &*schedule {
                Schedule::Invalidated => return Err(IpcError::Invalidated),
                Schedule::Scheduled { runloop: current, mode: m } if current.strong_count() > 0 => {
                    if Weak::ptr_eq(current, &loop_ref) && m == mode {
                        return Ok(());
                    }
                    return Err(IpcError::InvalidOperation("port already scheduled"));
                }
                _ => {}
            }
            *schedule = Schedule::Scheduled {
                runloop: loop_ref.clone(),
                mode: mode.into(),
            };
        }

        if let Err(err) = self.watch(runloop) {
            *self.shared.schedule.lock() = Schedule::Unscheduled;
            return Err(err);
        }
        runloop.add_source(self, mode);
        log::debug!("port {} scheduled in mode {:?}", self.name(), mode);
        Ok(())
    }

    /// Ask the kernel to report this port's death to `runloop`
    fn watch(&self, runloop: &RunLoop) -> IpcResult<()> {
        let loop_ref = runloop.downgrade();
        let mut watched_by = self.shared.watched_by.lock();
        if Weak::ptr_eq(&watched_by, &loop_ref) {
            return Ok(());
        }
        let name = self.live_name()?;
        let notify_type = match self.kind() {
            RightKind::Receive => NotifyType::NoSenders,
            RightKind::Send | RightKind::SendOnce => NotifyType::DeadName,
        };
        self.shared
            .space
            .request_notification(name, notify_type, runloop.notify_port())?;
        *watched_by = loop_ref;
        Ok(())
    }

    /// Detach from the loop. Once this returns no message callback runs for
    /// the port; queued messages stay queued.
    pub fn unschedule(&self) {
        let previous = {
            let mut schedule = self.shared.schedule.lock();
            if !matches!(*schedule, Schedule::Scheduled { .. }) {
                return;
            }
            core::mem::replace(&mut *schedule, Schedule::Unscheduled)
        };
        if let Schedule::Scheduled { runloop, .. } = previous {
            if let Some(runloop) = RunLoop::upgrade(&runloop) {
                runloop.remove_source(self);
            }
        }
        log::debug!("port {} unscheduled", self.name());
    }

    pub(crate) fn is_scheduled_in(&self, runloop: &Weak<LoopShared>, mode: &str) -> bool {
        match &*self.shared.schedule.lock() {
            Schedule::Scheduled {
                runloop: current,
                mode: m,
            } => Weak::ptr_eq(current, runloop) && m == mode,
            _ => false,
        }
    }

    pub(crate) fn is_scheduled_by(&self, runloop: &Weak<LoopShared>) -> bool {
        match &*self.shared.schedule.lock() {
            Schedule::Scheduled { runloop: current, .. } => Weak::ptr_eq(current, runloop),
            _ => false,
        }
    }

    /// Move to the terminal state: release the right, fire the invalidation
    /// callback. Returns false if the port was already invalidated.
    pub fn invalidate(&self) -> bool {
        if self.shared.invalidated.swap(true, Ordering::AcqRel) {
            return false;
        }
        let previous = core::mem::replace(&mut *self.shared.schedule.lock(), Schedule::Invalidated);
        if let Schedule::Scheduled { runloop, .. } = previous {
            if let Some(runloop) = RunLoop::upgrade(&runloop) {
                runloop.remove_source(self);
            }
        }
        let handle = self.shared.handle.lock().take();
        drop(handle);
        self.shared.on_message.lock().take();
        let callback = self.shared.on_invalidate.lock().take();

        log::info!("port {} invalidated", self.name());
        if let Some(callback) = callback {
            callback(self);
        }
        true
    }

    // ------------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------------

    /// Send a message to this port through the wrapped right.
    ///
    /// A send-once right is spent by the send and the port invalidates.
    pub fn send(&self, builder: MessageBuilder) -> IpcResult<()> {
        let mut slot = self.shared.handle.lock();
        let handle = slot.as_ref().ok_or(IpcError::Invalidated)?;
        let disposition = handle.kind().destination_disposition();
        let msg = builder.remote(handle.name(), disposition).build();
        msg_send(&self.shared.space, &msg)?;
        if disposition == MsgTypeName::MoveSendOnce {
            if let Some(spent) = slot.take() {
                spent.into_raw();
            }
            drop(slot);
            self.invalidate();
        }
        Ok(())
    }

    /// Dequeue the next message directly, bypassing any loop
    pub fn receive(&self) -> IpcResult<Option<Message>> {
        let name = self.receive_name()?;
        msg_receive(&self.shared.space, name)
    }

    /// Messages waiting on this port
    pub fn pending(&self) -> IpcResult<usize> {
        let name = self.receive_name()?;
        msg_pending(&self.shared.space, name)
    }

    /// Mint a new send right from this port's receive right
    pub fn make_send_right(&self) -> IpcResult<Handle> {
        let name = self.receive_name()?;
        self.shared.space.make_send(name)?;
        Ok(Handle::from_raw(
            Arc::clone(&self.shared.space),
            name,
            RightKind::Send,
        ))
    }

    fn receive_name(&self) -> IpcResult<PortName> {
        if self.kind() != RightKind::Receive {
            return Err(IpcError::InvalidRight {
                name: self.name(),
                expected: RightKind::Receive.as_str(),
            });
        }
        self.live_name()
    }

    /// Run the message callback; messages without one are dropped
    pub(crate) fn deliver(&self, mut msg: Message) {
        let callback = self.shared.on_message.lock().clone();
        match callback {
            Some(callback) => callback(self, &mut msg),
            None => log::debug!(
                "port {}: no message callback, dropping id {:#x}",
                self.name(),
                msg.id()
            ),
        }
    }
}

impl core::fmt::Debug for Port {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Port")
            .field("name", &self.shared.name)
            .field("kind", &self.shared.kind)
            .field("registered", &*self.shared.registered.lock())
            .field("valid", &self.is_valid())
            .finish()
    }
}
