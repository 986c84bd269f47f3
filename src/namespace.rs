//! Bootstrap namespace subsetting
//!
//! Every task has one current namespace, read by `Port::lookup` and
//! `Port::register` and inherited by children at spawn. A subset is an
//! empty child namespace that forwards misses to its parent; installing one
//! before spawning restricts what the child can discover to whatever the
//! parent chain exposes, with local registrations shadowing parent names.
//!
//! Switching is process-wide and has no implicit rollback. Save the handle
//! returned by [`reset_current`] or use a [`NamespaceGuard`].

use std::sync::Arc;

use thiserror::Error;

use crate::error::{IpcError, IpcResult};
use crate::handle::Handle;
use crate::ipc::right::RightKind;
use crate::kern::Task;
use crate::types::PortName;

/// A namespace that could not be installed, handed back to the caller
#[derive(Error, Debug)]
#[error("namespace not installed: {error}")]
pub struct NamespaceError {
    #[source]
    pub error: IpcError,
    pub namespace: Handle,
}

impl NamespaceError {
    pub fn into_namespace(self) -> Handle {
        self.namespace
    }
}

/// Name of `task`'s current namespace in its own space
pub fn current(task: &Task) -> PortName {
    task.bootstrap_port()
}

/// Create a child of the current namespace that lives as long as the port
/// behind `requestor`
pub fn create_subset(task: &Task, requestor: &Handle) -> IpcResult<Handle> {
    task.check_owner(requestor)?;
    let name = task
        .kernel()
        .bootstrap()
        .subset(task.space(), task.bootstrap_port(), requestor.name())?;
    log::info!("task pid {}: created namespace subset {}", task.pid(), name);
    Ok(Handle::from_raw(Arc::clone(task.space()), name, RightKind::Send))
}

/// Install `namespace` as current and return the namespace it replaced.
/// On failure the handle comes back inside the error.
pub fn reset_current(task: &Task, namespace: Handle) -> Result<Handle, NamespaceError> {
    let checked = task.check_owner(&namespace).and_then(|()| {
        if namespace.kind() != RightKind::Send {
            return Err(IpcError::InvalidRight {
                name: namespace.name(),
                expected: RightKind::Send.as_str(),
            });
        }
        task.kernel()
            .bootstrap()
            .check_namespace(task.space(), namespace.name())
    });
    if let Err(error) = checked {
        return Err(NamespaceError { error, namespace });
    }
    let name = namespace.name();
    let previous = task.replace_bootstrap(namespace);
    log::info!(
        "task pid {}: current namespace {} -> {}",
        task.pid(),
        previous.name(),
        name
    );
    Ok(previous)
}

/// Restores the namespace that was current before [`NamespaceGuard::install`]
/// when dropped
pub struct NamespaceGuard {
    task: Arc<Task>,
    saved: Option<Handle>,
}

impl NamespaceGuard {
    pub fn install(task: &Arc<Task>, namespace: Handle) -> Result<Self, NamespaceError> {
        let saved = reset_current(task, namespace)?;
        Ok(Self {
            task: Arc::clone(task),
            saved: Some(saved),
        })
    }

    /// Name of the namespace that will be restored
    pub fn saved(&self) -> Option<PortName> {
        self.saved.as_ref().map(Handle::name)
    }
}

impl Drop for NamespaceGuard {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            let name = saved.name();
            let replaced = self.task.replace_bootstrap(saved);
            log::info!(
                "task pid {}: restored namespace {} (was {})",
                self.task.pid(),
                name,
                replaced.name()
            );
        }
    }
}

/// Per-process variant of a service name
pub fn per_process_name(name: &str, pid: u32) -> String {
    format!("{}.{}", name, pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IpcConfig;
    use crate::ipc::entry::PortType;
    use crate::kern::{Credentials, Kernel};
    use crate::port::Port;

    fn parent() -> Arc<Task> {
        Kernel::new(IpcConfig::default())
            .unwrap()
            .create_task(Credentials::ROOT)
            .unwrap()
    }

    #[test]
    fn subset_is_inherited_and_forwards() {
        let task = parent();
        let global = Port::allocate(&task).unwrap();
        global.register(&task, "svc.global").unwrap();

        let requestor = Port::allocate(&task).unwrap();
        let requestor_right = requestor.make_send_right().unwrap();
        let subset = create_subset(&task, &requestor_right).unwrap();
        let previous = reset_current(&task, subset).unwrap();
        assert_ne!(current(&task), previous.name());

        let hidden = Port::allocate(&task).unwrap();
        hidden.register(&task, "svc.local").unwrap();

        let child = task.spawn().unwrap();
        assert!(Port::lookup(&child, "svc.global").is_ok());
        assert!(Port::lookup(&child, "svc.local").is_ok());

        reset_current(&task, previous).unwrap();
        assert!(Port::lookup(&task, "svc.local").is_err());
        assert!(Port::lookup(&task, "svc.global").is_ok());
    }

    #[test]
    fn guard_restores_on_drop() {
        let task = parent();
        let root = current(&task);
        let requestor = Port::allocate(&task).unwrap();
        let right = requestor.make_send_right().unwrap();
        let subset = create_subset(&task, &right).unwrap();
        {
            let guard = NamespaceGuard::install(&task, subset).unwrap();
            assert_eq!(guard.saved(), Some(root));
            assert_ne!(current(&task), root);
        }
        assert_eq!(current(&task), root);
    }

    #[test]
    fn reset_rejects_plain_ports() {
        let task = parent();
        let port = Port::allocate(&task).unwrap();
        let send = port.make_send_right().unwrap();
        let name = send.name();
        let err = reset_current(&task, send).unwrap_err();
        assert_eq!(err.error, IpcError::NotNamespace(name));
        assert_eq!(err.namespace.name(), name);
    }

    #[test]
    fn inactive_subset_is_handed_back() {
        let task = parent();
        let root = current(&task);
        let requestor = Port::allocate(&task).unwrap();
        let right = requestor.make_send_right().unwrap();
        let subset = create_subset(&task, &right).unwrap();
        let name = subset.name();
        drop(right);
        drop(requestor);

        let err = reset_current(&task, subset).unwrap_err();
        assert_eq!(err.error, IpcError::NamespaceInactive);
        let subset = err.into_namespace();
        assert_eq!(subset.name(), name);
        assert!(subset.port_type().unwrap().contains(PortType::SEND));
        assert_eq!(current(&task), root);
    }

    #[test]
    fn foreign_requestor_rejected() {
        let task = parent();
        let other = task.spawn().unwrap();
        let port = Port::allocate(&other).unwrap();
        let right = port.make_send_right().unwrap();
        assert_eq!(create_subset(&task, &right).unwrap_err(), IpcError::ForeignTask);
    }

    #[test]
    fn per_process_names() {
        assert_eq!(per_process_name("com.example.agent", 412), "com.example.agent.412");
    }
}
