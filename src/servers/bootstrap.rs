//! Bootstrap Name Server
//!
//! Maps service names to ports for service discovery. Namespaces form a
//! tree: a lookup that misses in one namespace continues in its parent, so a
//! subset sees everything its parent sees unless it registers a shadowing
//! name of its own.
//!
//! Every namespace is a kernel-held port; tasks refer to a namespace through
//! a send right to it. A subset is tied to a requestor port and goes inactive
//! once that port dies, dropping its bindings. A subset is forgotten once no
//! send right to it is left and no other namespace forwards to it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};

use spin::Mutex;

use crate::config::IpcConfig;
use crate::error::{IpcError, IpcResult};
use crate::ipc::entry::PortType;
use crate::ipc::port::KPort;
use crate::ipc::right::RightKind;
use crate::ipc::space::IpcSpace;
use crate::types::{PortId, PortName};

/// Longest service name the server accepts
pub const BOOTSTRAP_NAME_MAX: usize = 127;

/// Bounded service name
pub type ServiceName = heapless::String<BOOTSTRAP_NAME_MAX>;

/// Validate and copy a service name
pub fn service_name(name: &str) -> IpcResult<ServiceName> {
    if name.is_empty() {
        return Err(IpcError::InvalidOperation("empty service name"));
    }
    if name.len() > BOOTSTRAP_NAME_MAX {
        return Err(IpcError::NameTooLong {
            len: name.len(),
            max: BOOTSTRAP_NAME_MAX,
        });
    }
    ServiceName::try_from(name).map_err(|_| IpcError::NameTooLong {
        len: name.len(),
        max: BOOTSTRAP_NAME_MAX,
    })
}

/// One lookup table
struct Namespace {
    parent: Option<PortId>,
    /// `None` for the root, which the server holds itself
    port: Option<Weak<KPort>>,
    /// Subsets live only as long as this port
    requestor: Option<Arc<KPort>>,
    /// Each bound port carries one send right held by the server
    services: BTreeMap<ServiceName, Arc<KPort>>,
    active: bool,
}

impl Namespace {
    fn new(
        parent: Option<PortId>,
        port: Option<Weak<KPort>>,
        requestor: Option<Arc<KPort>>,
    ) -> Self {
        Self {
            parent,
            port,
            requestor,
            services: BTreeMap::new(),
            active: true,
        }
    }

    /// Deactivate if the requestor died; returns bindings to release
    fn reap(&mut self) -> Vec<Arc<KPort>> {
        let orphaned = self.requestor.as_ref().map_or(false, |port| port.is_dead());
        if !self.active || !orphaned {
            return Vec::new();
        }
        self.active = false;
        self.requestor = None;
        log::info!(
            "bootstrap: subset deactivated, releasing {} bindings",
            self.services.len()
        );
        core::mem::take(&mut self.services).into_values().collect()
    }

    /// No task can name this namespace any more
    fn unreferenced(&self) -> bool {
        self.port.as_ref().map_or(false, |port| {
            port.upgrade().map_or(true, |port| port.send_rights() == 0)
        })
    }
}

/// Reap every namespace and drop the unreferenced ones that no child
/// forwards to; returns bindings to release
fn sweep(namespaces: &mut BTreeMap<PortId, Namespace>) -> Vec<Arc<KPort>> {
    let mut stale = Vec::new();
    for ns in namespaces.values_mut() {
        stale.extend(ns.reap());
    }
    loop {
        let parents: BTreeSet<PortId> = namespaces.values().filter_map(|ns| ns.parent).collect();
        let gone: Vec<PortId> = namespaces
            .iter()
            .filter(|(id, ns)| !parents.contains(*id) && ns.unreferenced())
            .map(|(id, _)| *id)
            .collect();
        if gone.is_empty() {
            return stale;
        }
        for id in gone {
            if let Some(ns) = namespaces.remove(&id) {
                log::debug!(
                    "bootstrap: namespace {:?} unreferenced, releasing {} bindings",
                    id,
                    ns.services.len()
                );
                stale.extend(ns.services.into_values());
            }
        }
    }
}

fn release_all(ports: Vec<Arc<KPort>>) {
    for port in ports {
        port.release_send();
    }
}

/// The kernel's name server
pub struct BootstrapServer {
    root: Arc<KPort>,
    namespaces: Mutex<BTreeMap<PortId, Namespace>>,
    queue_limit: usize,
}

impl BootstrapServer {
    pub fn new(config: &IpcConfig) -> Self {
        let root = KPort::new(None, config.queue_limit);
        let mut namespaces = BTreeMap::new();
        namespaces.insert(root.id(), Namespace::new(None, None, None));
        Self {
            root,
            namespaces: Mutex::new(namespaces),
            queue_limit: config.queue_limit,
        }
    }

    /// The root namespace port
    pub fn root_port(&self) -> Arc<KPort> {
        Arc::clone(&self.root)
    }

    /// Namespaces still tracked, the root included. Inactive subsets stay
    /// until their last send right goes.
    pub fn namespace_count(&self) -> usize {
        self.namespaces.lock().len()
    }

    /// Resolve a send right in `space` to the namespace it names
    fn namespace_of(&self, space: &IpcSpace, bootstrap: PortName) -> IpcResult<PortId> {
        let port = space
            .port(bootstrap, RightKind::Send)
            .map_err(|err| match err {
                IpcError::InvalidRight { .. } => IpcError::NotNamespace(bootstrap),
                other => other,
            })?;
        if self.namespaces.lock().contains_key(&port.id()) {
            Ok(port.id())
        } else {
            Err(IpcError::NotNamespace(bootstrap))
        }
    }

    /// Check that `bootstrap` names a live namespace
    pub fn check_namespace(&self, space: &IpcSpace, bootstrap: PortName) -> IpcResult<()> {
        let id = self.namespace_of(space, bootstrap)?;
        let (stale, active) = {
            let mut namespaces = self.namespaces.lock();
            let stale = sweep(&mut namespaces);
            (stale, namespaces.get(&id).map_or(false, |ns| ns.active))
        };
        release_all(stale);
        if active {
            Ok(())
        } else {
            Err(IpcError::NamespaceInactive)
        }
    }

    /// Look a service up through the namespace chain and give the caller a
    /// send right to it
    pub fn look_up(&self, space: &IpcSpace, bootstrap: PortName, name: &str) -> IpcResult<PortName> {
        let start = self.namespace_of(space, bootstrap)?;
        let key = service_name(name)?;

        let mut stale = Vec::new();
        let found = {
            let mut namespaces = self.namespaces.lock();
            stale.extend(sweep(&mut namespaces));
            let mut current = Some(start);
            loop {
                let Some(ns) = current.and_then(|id| namespaces.get_mut(&id)) else {
                    break Err(IpcError::UnknownService(name.into()));
                };
                if !ns.active {
                    break Err(IpcError::NamespaceInactive);
                }
                let dead = match ns.services.get(&key) {
                    Some(port) if !port.is_dead() => break Ok(Arc::clone(port)),
                    Some(_) => true,
                    None => false,
                };
                if dead {
                    stale.extend(ns.services.remove(&key));
                }
                current = ns.parent;
            }
        };
        release_all(stale);

        let port = found?;
        let local = space.insert_send(port)?;
        log::debug!("bootstrap: look_up {:?} -> {}", name, local);
        Ok(local)
    }

    /// Bind `name` to the port behind `service` (a send or receive right)
    pub fn register(
        &self,
        space: &IpcSpace,
        bootstrap: PortName,
        name: &str,
        service: PortName,
    ) -> IpcResult<()> {
        let id = self.namespace_of(space, bootstrap)?;
        let key = service_name(name)?;
        let (port, ty) = space.lookup(service)?;
        if !ty.intersects(PortType::SEND | PortType::RECEIVE) {
            return Err(IpcError::InvalidRight {
                name: service,
                expected: RightKind::Send.as_str(),
            });
        }
        if port.is_dead() {
            return Err(IpcError::PortDead);
        }

        let mut stale = Vec::new();
        let result = {
            let mut namespaces = self.namespaces.lock();
            stale.extend(sweep(&mut namespaces));
            match namespaces.get_mut(&id) {
                None => Err(IpcError::NotNamespace(bootstrap)),
                Some(ns) => {
                    if !ns.active {
                        Err(IpcError::NamespaceInactive)
                    } else if ns.services.get(&key).map_or(false, |p| !p.is_dead()) {
                        Err(IpcError::ServiceExists(name.into()))
                    } else {
                        port.add_send();
                        stale.extend(ns.services.insert(key, Arc::clone(&port)));
                        Ok(())
                    }
                }
            }
        };
        release_all(stale);
        if result.is_ok() {
            log::debug!("bootstrap: registered {:?} -> port {:?}", name, port.id());
        }
        result
    }

    /// Remove a local binding
    pub fn unregister(&self, space: &IpcSpace, bootstrap: PortName, name: &str) -> IpcResult<()> {
        let id = self.namespace_of(space, bootstrap)?;
        let key = service_name(name)?;
        let mut stale = Vec::new();
        let result = {
            let mut namespaces = self.namespaces.lock();
            stale.extend(sweep(&mut namespaces));
            match namespaces.get_mut(&id) {
                None => Err(IpcError::NotNamespace(bootstrap)),
                Some(ns) => {
                    if !ns.active {
                        Err(IpcError::NamespaceInactive)
                    } else {
                        match ns.services.remove(&key) {
                            Some(port) => {
                                stale.push(port);
                                Ok(())
                            }
                            None => Err(IpcError::UnknownService(name.into())),
                        }
                    }
                }
            }
        };
        release_all(stale);
        result
    }

    /// Names bound locally in a namespace (ancestors excluded)
    pub fn list(&self, space: &IpcSpace, bootstrap: PortName) -> IpcResult<Vec<String>> {
        let id = self.namespace_of(space, bootstrap)?;
        let namespaces = self.namespaces.lock();
        let ns = namespaces
            .get(&id)
            .ok_or(IpcError::NotNamespace(bootstrap))?;
        Ok(ns.services.keys().map(|k| k.as_str().into()).collect())
    }

    /// Create a child namespace of `bootstrap` that lives as long as the
    /// port behind `requestor`; returns a send right to it
    pub fn subset(
        &self,
        space: &IpcSpace,
        bootstrap: PortName,
        requestor: PortName,
    ) -> IpcResult<PortName> {
        let parent = self.namespace_of(space, bootstrap)?;
        let (requestor_port, _) = space.lookup(requestor)?;
        if requestor_port.is_dead() {
            return Err(IpcError::PortDead);
        }

        let port = KPort::new(None, self.queue_limit);
        let mut stale = Vec::new();
        let result = {
            let mut namespaces = self.namespaces.lock();
            stale.extend(sweep(&mut namespaces));
            match namespaces.get(&parent).map(|ns| ns.active) {
                None => Err(IpcError::NotNamespace(bootstrap)),
                Some(false) => Err(IpcError::NamespaceInactive),
                // the send right exists before the next sweep can see the entry
                Some(true) => space.insert_send(Arc::clone(&port)).map(|name| {
                    namespaces.insert(
                        port.id(),
                        Namespace::new(
                            Some(parent),
                            Some(Arc::downgrade(&port)),
                            Some(requestor_port),
                        ),
                    );
                    name
                }),
            }
        };
        release_all(stale);
        let name = result?;
        log::info!(
            "bootstrap: subset {:?} of {:?} created as {}",
            port.id(),
            parent,
            name
        );
        Ok(name)
    }
}

impl core::fmt::Debug for BootstrapServer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BootstrapServer")
            .field("root", &self.root.id())
            .field("namespaces", &self.namespace_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::AuditToken;

    struct Fixture {
        server: BootstrapServer,
        space: Arc<IpcSpace>,
        root: PortName,
    }

    fn fixture() -> Fixture {
        let config = IpcConfig::default();
        let server = BootstrapServer::new(&config);
        let space = IpcSpace::new(config, AuditToken::default());
        let root = space.insert_send(server.root_port()).unwrap();
        Fixture {
            server,
            space,
            root,
        }
    }

    #[test]
    fn name_limits() {
        assert!(service_name(&"a".repeat(127)).is_ok());
        assert_eq!(
            service_name(&"a".repeat(128)),
            Err(IpcError::NameTooLong { len: 128, max: 127 })
        );
        assert!(service_name("").is_err());
    }

    #[test]
    fn register_and_look_up() {
        let f = fixture();
        let service = f.space.allocate_receive().unwrap();
        f.server.register(&f.space, f.root, "svc.test", service).unwrap();
        assert_eq!(
            f.server.register(&f.space, f.root, "svc.test", service),
            Err(IpcError::ServiceExists("svc.test".into()))
        );

        // the space already names the port, so the send right merges
        let found = f.server.look_up(&f.space, f.root, "svc.test").unwrap();
        assert_eq!(found, service);
        assert_eq!(
            f.server.look_up(&f.space, f.root, "svc.missing"),
            Err(IpcError::UnknownService("svc.missing".into()))
        );
        assert_eq!(f.server.list(&f.space, f.root).unwrap(), vec!["svc.test".to_string()]);

        f.server.unregister(&f.space, f.root, "svc.test").unwrap();
        assert!(f.server.look_up(&f.space, f.root, "svc.test").is_err());
    }

    #[test]
    fn dead_binding_can_be_replaced() {
        let f = fixture();
        let first = f.space.allocate_receive().unwrap();
        f.server.register(&f.space, f.root, "svc", first).unwrap();
        f.space.release(first, RightKind::Receive).unwrap();

        let second = f.space.allocate_receive().unwrap();
        f.server.register(&f.space, f.root, "svc", second).unwrap();
        assert_eq!(f.server.look_up(&f.space, f.root, "svc").unwrap(), second);
    }

    #[test]
    fn subset_forwards_and_shadows() {
        let f = fixture();
        let parent_svc = f.space.allocate_receive().unwrap();
        let shadowed = f.space.allocate_receive().unwrap();
        let shadow = f.space.allocate_receive().unwrap();
        f.server.register(&f.space, f.root, "only.parent", parent_svc).unwrap();
        f.server.register(&f.space, f.root, "both", shadowed).unwrap();

        let requestor = f.space.allocate_receive().unwrap();
        let sub = f.server.subset(&f.space, f.root, requestor).unwrap();
        f.server.register(&f.space, sub, "both", shadow).unwrap();

        assert_eq!(f.server.look_up(&f.space, sub, "only.parent").unwrap(), parent_svc);
        assert_eq!(f.server.look_up(&f.space, sub, "both").unwrap(), shadow);
        assert_eq!(f.server.look_up(&f.space, f.root, "both").unwrap(), shadowed);
    }

    #[test]
    fn subset_dies_with_requestor() {
        let f = fixture();
        let requestor = f.space.allocate_receive().unwrap();
        let sub = f.server.subset(&f.space, f.root, requestor).unwrap();
        let svc = f.space.allocate_receive().unwrap();
        f.server.register(&f.space, sub, "svc", svc).unwrap();
        let port = f.space.port(svc, RightKind::Receive).unwrap();
        assert_eq!(port.send_rights(), 1);

        f.space.release(requestor, RightKind::Receive).unwrap();
        assert_eq!(
            f.server.look_up(&f.space, sub, "svc"),
            Err(IpcError::NamespaceInactive)
        );
        assert_eq!(port.send_rights(), 0);
        assert_eq!(
            f.server.check_namespace(&f.space, sub),
            Err(IpcError::NamespaceInactive)
        );
    }

    #[test]
    fn dropped_subsets_are_forgotten() {
        let f = fixture();
        for _ in 0..100 {
            let requestor = f.space.allocate_receive().unwrap();
            let sub = f.server.subset(&f.space, f.root, requestor).unwrap();
            f.space.release(sub, RightKind::Send).unwrap();
            f.space.release(requestor, RightKind::Receive).unwrap();
        }
        assert!(f.server.look_up(&f.space, f.root, "svc.none").is_err());
        assert_eq!(f.server.namespace_count(), 1);
    }

    #[test]
    fn inactive_subset_stays_while_named() {
        let f = fixture();
        let requestor = f.space.allocate_receive().unwrap();
        let sub = f.server.subset(&f.space, f.root, requestor).unwrap();
        let svc = f.space.allocate_receive().unwrap();
        f.server.register(&f.space, sub, "svc", svc).unwrap();
        let port = f.space.port(svc, RightKind::Receive).unwrap();
        f.space.release(requestor, RightKind::Receive).unwrap();

        assert_eq!(
            f.server.check_namespace(&f.space, sub),
            Err(IpcError::NamespaceInactive)
        );
        assert_eq!(f.server.namespace_count(), 2);
        assert_eq!(port.send_rights(), 0);

        f.space.release(sub, RightKind::Send).unwrap();
        f.server.check_namespace(&f.space, f.root).unwrap();
        assert_eq!(f.server.namespace_count(), 1);
    }

    #[test]
    fn parent_kept_while_child_forwards_to_it() {
        let f = fixture();
        let requestor = f.space.allocate_receive().unwrap();
        let outer = f.server.subset(&f.space, f.root, requestor).unwrap();
        let svc = f.space.allocate_receive().unwrap();
        f.server.register(&f.space, outer, "svc.outer", svc).unwrap();
        let inner = f.server.subset(&f.space, outer, requestor).unwrap();
        f.space.release(outer, RightKind::Send).unwrap();

        assert_eq!(f.server.look_up(&f.space, inner, "svc.outer").unwrap(), svc);
        assert_eq!(f.server.namespace_count(), 3);

        let port = f.space.port(svc, RightKind::Receive).unwrap();
        f.space.release(inner, RightKind::Send).unwrap();
        f.server.check_namespace(&f.space, f.root).unwrap();
        assert_eq!(f.server.namespace_count(), 1);
        assert_eq!(port.send_rights(), 1);
    }

    #[test]
    fn non_namespace_rejected() {
        let f = fixture();
        let port = f.space.allocate_receive().unwrap();
        f.space.make_send(port).unwrap();
        assert_eq!(
            f.server.look_up(&f.space, port, "x"),
            Err(IpcError::NotNamespace(port))
        );
    }
}
