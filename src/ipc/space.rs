//! IPC Space - per-task capability namespace
//!
//! A space maps port names to entries. Names are minted from a per-space
//! counter and never reused, so a stale name can only ever fail, never alias
//! a newer right. Send and receive rights for one port share a single name;
//! each send-once right gets a name of its own.
//!
//! Lock order is space, then port. Port destruction and notifications that
//! follow from a release run after the space lock is dropped.

use std::collections::BTreeMap;
use std::sync::Arc;

use spin::Mutex;

use super::entry::{IpcEntry, PortType};
use super::notify::{NotifyRequest, NotifyType};
use super::port::{KPort, PortState};
use super::right::{CarriedRight, MsgTypeName, RightKind};
use crate::config::IpcConfig;
use crate::error::{IpcError, IpcResult};
use crate::message::AuditToken;
use crate::types::{PortId, PortName, SpaceId};

/// Low byte of every minted name (Mach's generation bits)
const NAME_GENERATION: u32 = 0x03;

struct SpaceInner {
    active: bool,
    table: BTreeMap<PortName, IpcEntry>,
    /// Name holding send and/or receive rights for a port
    reverse: BTreeMap<PortId, PortName>,
    next_index: u32,
}

impl SpaceInner {
    fn mint_name(&mut self) -> PortName {
        let name = PortName((self.next_index << 8) | NAME_GENERATION);
        self.next_index += 1;
        name
    }

    fn active(&self) -> IpcResult<()> {
        if self.active {
            Ok(())
        } else {
            Err(IpcError::TaskTerminated)
        }
    }

    /// Insert one accounted right, merging send/receive by port
    fn insert(&mut self, port: Arc<KPort>, kind: RightKind) -> PortName {
        if kind != RightKind::SendOnce {
            if let Some(&name) = self.reverse.get(&port.id()) {
                if let Some(entry) = self.table.get_mut(&name) {
                    entry.add(kind);
                    return name;
                }
            }
        }
        let name = self.mint_name();
        if kind != RightKind::SendOnce {
            self.reverse.insert(port.id(), name);
        }
        let mut entry = IpcEntry::new(port);
        entry.add(kind);
        self.table.insert(name, entry);
        name
    }

    fn remove_if_empty(&mut self, name: PortName) {
        let empty = self.table.get(&name).map_or(false, IpcEntry::is_empty);
        if !empty {
            return;
        }
        if let Some(entry) = self.table.remove(&name) {
            if self.reverse.get(&entry.port.id()) == Some(&name) {
                self.reverse.remove(&entry.port.id());
            }
        }
    }
}

/// Rights taken from the sender for one message
#[derive(Debug)]
pub(crate) struct Copyin {
    pub dest: Arc<KPort>,
    /// Counted destination right when the sender moved it
    pub dest_right: Option<CarriedRight>,
    pub reply: Option<CarriedRight>,
    /// One entry per descriptor right; `None` for null names
    pub rights: Vec<Option<CarriedRight>>,
}

/// Per-task IPC space
pub struct IpcSpace {
    id: SpaceId,
    config: IpcConfig,
    owner: AuditToken,
    inner: Mutex<SpaceInner>,
}

impl IpcSpace {
    /// Create a space whose messages are stamped with `owner`
    pub fn new(config: IpcConfig, owner: AuditToken) -> Arc<Self> {
        Arc::new(Self {
            id: SpaceId::new(),
            config,
            owner,
            inner: Mutex::new(SpaceInner {
                active: true,
                table: BTreeMap::new(),
                reverse: BTreeMap::new(),
                next_index: 1,
            }),
        })
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub fn config(&self) -> &IpcConfig {
        &self.config
    }

    /// Identity written into the trailer of every message sent from here
    pub fn owner_token(&self) -> &AuditToken {
        &self.owner
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().active
    }

    /// Number of live names
    pub fn len(&self) -> usize {
        self.inner.lock().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// What `name` currently denotes
    pub fn port_type(&self, name: PortName) -> IpcResult<PortType> {
        let inner = self.inner.lock();
        inner.active()?;
        inner
            .table
            .get(&name)
            .map(IpcEntry::port_type)
            .ok_or(IpcError::InvalidName(name))
    }

    /// User references of `kind` held under `name`
    pub fn refs(&self, name: PortName, kind: RightKind) -> IpcResult<u32> {
        let inner = self.inner.lock();
        inner.active()?;
        inner
            .table
            .get(&name)
            .map(|entry| entry.count(kind))
            .ok_or(IpcError::InvalidName(name))
    }

    /// Resolve a name holding `kind` to its port
    pub(crate) fn port(&self, name: PortName, kind: RightKind) -> IpcResult<Arc<KPort>> {
        let inner = self.inner.lock();
        inner.active()?;
        let entry = inner.table.get(&name).ok_or(IpcError::InvalidName(name))?;
        let ty = entry.port_type();
        if ty.contains(PortType::DEAD_NAME) && !ty.contains(PortType::RECEIVE) {
            return Err(IpcError::PortDead);
        }
        if !ty.holds(kind) {
            return Err(IpcError::InvalidRight {
                name,
                expected: kind.as_str(),
            });
        }
        Ok(Arc::clone(&entry.port))
    }

    /// Resolve a name to its port whatever right it holds
    pub(crate) fn lookup(&self, name: PortName) -> IpcResult<(Arc<KPort>, PortType)> {
        let inner = self.inner.lock();
        inner.active()?;
        let entry = inner.table.get(&name).ok_or(IpcError::InvalidName(name))?;
        Ok((Arc::clone(&entry.port), entry.port_type()))
    }

    // ------------------------------------------------------------------------
    // Allocation and release
    // ------------------------------------------------------------------------

    /// Allocate a new port, returning the name of its receive right
    pub fn allocate_receive(&self) -> IpcResult<PortName> {
        let mut inner = self.inner.lock();
        inner.active()?;
        let port = KPort::new(Some(self.id), self.config.queue_limit);
        let name = inner.insert(port, RightKind::Receive);
        log::debug!("space {:?}: allocated receive right {}", self.id, name);
        Ok(name)
    }

    /// Mint a send right under the name of a receive right
    pub fn make_send(&self, name: PortName) -> IpcResult<()> {
        let mut inner = self.inner.lock();
        inner.active()?;
        let entry = inner
            .table
            .get_mut(&name)
            .ok_or(IpcError::InvalidName(name))?;
        if !entry.receive {
            return Err(IpcError::InvalidRight {
                name,
                expected: RightKind::Receive.as_str(),
            });
        }
        entry.add(RightKind::Send);
        entry.port.add_send();
        Ok(())
    }

    /// Give a send right to `port` to this space
    pub(crate) fn insert_send(&self, port: Arc<KPort>) -> IpcResult<PortName> {
        port.add_send();
        let (name, _) = self.copyout(CarriedRight::new(port, RightKind::Send))?;
        if name.is_dead() {
            return Err(IpcError::PortDead);
        }
        Ok(name)
    }

    /// Drop one right held under `name`
    pub fn release(&self, name: PortName, kind: RightKind) -> IpcResult<()> {
        let port = {
            let mut inner = self.inner.lock();
            inner.active()?;
            let entry = inner
                .table
                .get_mut(&name)
                .ok_or(IpcError::InvalidName(name))?;
            if !entry.take(kind) {
                return Err(IpcError::InvalidRight {
                    name,
                    expected: kind.as_str(),
                });
            }
            let port = Arc::clone(&entry.port);
            inner.remove_if_empty(name);
            port
        };
        log::trace!("space {:?}: released {} right {}", self.id, kind.as_str(), name);
        drop(CarriedRight::new(port, kind));
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Message transfer
    // ------------------------------------------------------------------------

    /// Take every right a message names, all or nothing.
    ///
    /// The whole request set is staged against copies of the affected
    /// entries; the table is only touched once every right has validated.
    pub(crate) fn copyin_all(
        &self,
        dest: (PortName, MsgTypeName),
        reply: Option<(PortName, MsgTypeName)>,
        rights: &[(PortName, MsgTypeName)],
    ) -> IpcResult<Copyin> {
        let mut inner = self.inner.lock();
        inner.active()?;

        let (dest_name, dest_disp) = dest;
        if !dest_name.is_valid() {
            return Err(IpcError::InvalidName(dest_name));
        }
        if dest_disp == MsgTypeName::MoveReceive {
            return Err(IpcError::InvalidRight {
                name: dest_name,
                expected: RightKind::Send.as_str(),
            });
        }
        if let Some((name, MsgTypeName::MoveReceive)) = reply {
            return Err(IpcError::InvalidRight {
                name,
                expected: RightKind::Send.as_str(),
            });
        }

        let mut scratch: BTreeMap<PortName, IpcEntry> = BTreeMap::new();
        let dest_port = stage(&mut scratch, &inner.table, dest_name, dest_disp, None)?;
        let dest_id = dest_port.id();
        let reply_port = match reply {
            Some((name, disp)) if !name.is_null() => {
                Some((disp, stage(&mut scratch, &inner.table, name, disp, Some(dest_id))?))
            }
            _ => None,
        };
        let mut staged = Vec::with_capacity(rights.len());
        for &(name, disp) in rights {
            if name.is_null() {
                staged.push(None);
                continue;
            }
            let port = stage(&mut scratch, &inner.table, name, disp, Some(dest_id))?;
            staged.push(Some((disp, port)));
        }

        // Commit
        for (name, entry) in scratch {
            inner.table.insert(name, entry);
            inner.remove_if_empty(name);
        }
        let take = |disp: MsgTypeName, port: Arc<KPort>| -> CarriedRight {
            match disp {
                MsgTypeName::CopySend | MsgTypeName::MakeSend => port.add_send(),
                MsgTypeName::MakeSendOnce => port.add_send_once(),
                MsgTypeName::MoveReceive => {
                    if let Err(err) = port.begin_transit() {
                        log::warn!("receive right {:?} not movable: {}", port.id(), err);
                    }
                }
                MsgTypeName::MoveSend | MsgTypeName::MoveSendOnce => {}
            }
            CarriedRight::new(port, disp.result_kind())
        };
        let dest_right = if dest_disp.is_move() {
            Some(take(dest_disp, Arc::clone(&dest_port)))
        } else {
            None
        };
        Ok(Copyin {
            dest: dest_port,
            dest_right,
            reply: reply_port.map(|(disp, port)| take(disp, port)),
            rights: staged
                .into_iter()
                .map(|slot| slot.map(|(disp, port)| take(disp, port)))
                .collect(),
        })
    }

    /// Undo a copyin whose message could not be queued.
    ///
    /// Moved rights go back under the names they were taken from; copied
    /// and made rights are simply released.
    pub(crate) fn restore(&self, returned: Vec<(PortName, MsgTypeName, Option<CarriedRight>)>) {
        let mut released = Vec::new();
        {
            let mut inner = self.inner.lock();
            for (name, disp, right) in returned {
                let Some(right) = right else {
                    continue;
                };
                if !disp.is_move() || !inner.active {
                    released.push(right);
                    continue;
                }
                let kind = right.kind();
                let Some(port) = right.into_port() else {
                    continue;
                };
                if kind == RightKind::Receive {
                    port.end_transit(self.id);
                }
                if kind != RightKind::SendOnce && !inner.reverse.contains_key(&port.id()) {
                    inner.reverse.insert(port.id(), name);
                }
                inner
                    .table
                    .entry(name)
                    .or_insert_with(|| IpcEntry::new(port))
                    .add(kind);
            }
        }
        drop(released);
    }

    /// Place a carried right into this space.
    ///
    /// A send or send-once right whose port died arrives as `DEAD`.
    pub(crate) fn copyout(&self, right: CarriedRight) -> IpcResult<(PortName, RightKind)> {
        let kind = right.kind();
        let dead = right.port().map_or(true, |port| port.is_dead());
        if dead && kind != RightKind::Receive {
            return Ok((PortName::DEAD, kind));
        }

        let mut inner = self.inner.lock();
        if !inner.active {
            drop(inner);
            drop(right);
            return Err(IpcError::TaskTerminated);
        }
        let Some(port) = right.into_port() else {
            return Ok((PortName::NULL, kind));
        };
        if kind == RightKind::Receive {
            port.end_transit(self.id);
        }
        let name = inner.insert(port, kind);
        Ok((name, kind))
    }

    // ------------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------------

    /// Ask for a notification about `name`, delivered to the receive right
    /// `notify` in this space
    pub fn request_notification(
        &self,
        name: PortName,
        notify_type: NotifyType,
        notify: PortName,
    ) -> IpcResult<()> {
        let notify_port = self.port(notify, RightKind::Receive)?;
        let request = NotifyRequest::new(notify_type, notify_port, name);
        match notify_type {
            NotifyType::NoSenders => {
                let port = self.port(name, RightKind::Receive)?;
                port.request_no_senders(request);
                Ok(())
            }
            NotifyType::DeadName => {
                let (port, ty) = self.lookup(name)?;
                if !ty.intersects(PortType::SEND | PortType::SEND_ONCE | PortType::DEAD_NAME) {
                    return Err(IpcError::InvalidRight {
                        name,
                        expected: RightKind::Send.as_str(),
                    });
                }
                if let Err(request) = port.request_dead_name(request) {
                    request.post();
                }
                Ok(())
            }
            _ => Err(IpcError::InvalidOperation("notification cannot be requested")),
        }
    }

    /// Tear the space down, releasing every right it holds
    pub fn destroy(&self) {
        let table = {
            let mut inner = self.inner.lock();
            if !inner.active {
                return;
            }
            inner.active = false;
            inner.reverse.clear();
            core::mem::take(&mut inner.table)
        };
        log::debug!("space {:?}: destroyed with {} names", self.id, table.len());
        for (_, entry) in table {
            for _ in 0..entry.send_urefs {
                entry.port.release_send();
            }
            for _ in 0..entry.send_once {
                entry.port.release_send_once();
            }
            if entry.receive {
                entry.port.destroy();
            }
        }
    }
}

/// Stage one right against the scratch copy of the table
fn stage(
    scratch: &mut BTreeMap<PortName, IpcEntry>,
    table: &BTreeMap<PortName, IpcEntry>,
    name: PortName,
    disp: MsgTypeName,
    dest: Option<PortId>,
) -> IpcResult<Arc<KPort>> {
    if !scratch.contains_key(&name) {
        let entry = table.get(&name).ok_or(IpcError::InvalidName(name))?;
        scratch.insert(name, entry.clone());
    }
    let entry = scratch
        .get_mut(&name)
        .ok_or(IpcError::InvalidName(name))?;

    let kind = disp.source_kind();
    if kind != RightKind::Receive && !entry.receive && entry.port.is_dead() {
        return Err(IpcError::PortDead);
    }
    let held = if disp.is_move() {
        entry.take(kind)
    } else {
        entry.count(kind) > 0
    };
    if !held {
        return Err(IpcError::InvalidRight {
            name,
            expected: kind.as_str(),
        });
    }
    if disp == MsgTypeName::MoveReceive {
        if Some(entry.port.id()) == dest {
            return Err(IpcError::InvalidOperation(
                "receive right sent in a message to its own port",
            ));
        }
        if entry.port.state() != PortState::Active {
            return Err(IpcError::PortDead);
        }
    }
    Ok(Arc::clone(&entry.port))
}

impl core::fmt::Debug for IpcSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("IpcSpace")
            .field("id", &self.id)
            .field("active", &inner.active)
            .field("names", &inner.table.len())
            .finish()
    }
}
