//! Signal handler table
//!
//! Handlers are installed in bulk and looked up by signal number. Nothing
//! here touches a Port from interrupt context: a [`SignalForwarder`] posts
//! the signal number as a command, and a table attached to a loop-scheduled
//! port dispatches it on the loop thread.

use std::sync::Arc;

use spin::Mutex;

use crate::command::{receive_command, send_command};
use crate::error::{IpcError, IpcResult};
use crate::port::Port;

/// Handlers a table can hold
pub const SIGNAL_TABLE_CAPACITY: usize = 32;

/// Highest accepted signal number
pub const SIGNAL_MAX: i32 = 64;

pub type SignalHandler = Arc<dyn Fn(i32) + Send + Sync>;

/// One signal number and its handler
#[derive(Clone)]
pub struct SignalHandlerEntry {
    pub signum: i32,
    pub handler: SignalHandler,
}

impl SignalHandlerEntry {
    pub fn new<F>(signum: i32, handler: F) -> Self
    where
        F: Fn(i32) + Send + Sync + 'static,
    {
        Self {
            signum,
            handler: Arc::new(handler),
        }
    }
}

impl core::fmt::Debug for SignalHandlerEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SignalHandlerEntry")
            .field("signum", &self.signum)
            .finish_non_exhaustive()
    }
}

/// Fixed-capacity signal number to handler map
#[derive(Default)]
pub struct SignalTable {
    entries: Mutex<heapless::Vec<SignalHandlerEntry, SIGNAL_TABLE_CAPACITY>>,
}

impl SignalTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install every entry or none of them
    pub fn install(&self, batch: &[SignalHandlerEntry]) -> IpcResult<()> {
        let mut entries = self.entries.lock();
        for (i, entry) in batch.iter().enumerate() {
            if entry.signum <= 0 || entry.signum > SIGNAL_MAX {
                return Err(IpcError::SignalTable("signal number out of range"));
            }
            let installed = entries.iter().any(|e| e.signum == entry.signum);
            let repeated = batch[..i].iter().any(|e| e.signum == entry.signum);
            if installed || repeated {
                return Err(IpcError::SignalTable("signal already has a handler"));
            }
        }
        if entries.len() + batch.len() > SIGNAL_TABLE_CAPACITY {
            return Err(IpcError::SignalTable("signal table full"));
        }
        for entry in batch {
            entries
                .push(entry.clone())
                .map_err(|_| IpcError::SignalTable("signal table full"))?;
        }
        log::debug!("signal table: installed {} handlers", batch.len());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Run the handler for `signum`; false if none is installed
    pub fn dispatch(&self, signum: i32) -> bool {
        let handler = self
            .entries
            .lock()
            .iter()
            .find(|e| e.signum == signum)
            .map(|e| Arc::clone(&e.handler));
        match handler {
            Some(handler) => {
                handler(signum);
                true
            }
            None => {
                log::debug!("signal {}: no handler", signum);
                false
            }
        }
    }

    /// Dispatch every command arriving on `port`. Replaces the port's
    /// message callback.
    pub fn attach(self: &Arc<Self>, port: &Port) {
        let table = Arc::clone(self);
        port.set_message_callback(move |_, msg| {
            // mismatched messages are logged by the decoder
            if let Ok(signum) = receive_command(msg) {
                table.dispatch(signum);
            }
        });
    }
}

impl core::fmt::Debug for SignalTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let signals: Vec<i32> = self.entries.lock().iter().map(|e| e.signum).collect();
        f.debug_struct("SignalTable").field("signals", &signals).finish()
    }
}

/// Posts signals to a loop instead of handling them in place
#[derive(Debug, Clone)]
pub struct SignalForwarder {
    port: Port,
}

impl SignalForwarder {
    /// `port` is a send (or receive) right to the loop's signal port
    pub fn new(port: Port) -> Self {
        Self { port }
    }

    pub fn raise(&self, signum: i32) -> IpcResult<()> {
        send_command(&self.port, signum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IpcConfig;
    use crate::kern::{Credentials, Kernel};
    use crate::runloop::{RunLoop, DEFAULT_MODE};
    use std::sync::atomic::{AtomicI32, Ordering};

    fn recorder() -> (Arc<AtomicI32>, SignalHandlerEntry) {
        let last = Arc::new(AtomicI32::new(0));
        let seen = Arc::clone(&last);
        let entry = SignalHandlerEntry::new(15, move |signum| seen.store(signum, Ordering::SeqCst));
        (last, entry)
    }

    #[test]
    fn install_and_dispatch() {
        let table = SignalTable::new();
        let (last, entry) = recorder();
        table.install(&[entry]).unwrap();
        assert!(table.dispatch(15));
        assert_eq!(last.load(Ordering::SeqCst), 15);
        assert!(!table.dispatch(2));
    }

    #[test]
    fn install_is_all_or_nothing() {
        let table = SignalTable::new();
        let (_, entry) = recorder();
        let other = SignalHandlerEntry::new(1, |_| {});
        assert!(table.install(&[other.clone(), entry.clone(), entry.clone()]).is_err());
        assert!(table.is_empty());

        table.install(&[entry.clone()]).unwrap();
        assert!(table.install(&[other, entry]).is_err());
        assert_eq!(table.len(), 1);
        assert!(table.install(&[SignalHandlerEntry::new(0, |_| {})]).is_err());
    }

    #[test]
    fn capacity_is_bounded() {
        let table = SignalTable::new();
        let all: Vec<_> = (1..=SIGNAL_MAX)
            .map(|n| SignalHandlerEntry::new(n, |_| {}))
            .collect();
        assert_eq!(
            table.install(&all),
            Err(IpcError::SignalTable("signal table full"))
        );
        table.install(&all[..SIGNAL_TABLE_CAPACITY]).unwrap();
        assert_eq!(table.len(), SIGNAL_TABLE_CAPACITY);
    }

    #[test]
    fn forwarded_signal_runs_on_the_loop() {
        let kernel = Kernel::new(IpcConfig::default()).unwrap();
        let task = kernel.create_task(Credentials::ROOT).unwrap();
        let runloop = RunLoop::new(&task).unwrap();
        let port = Port::allocate(&task).unwrap();
        let table = Arc::new(SignalTable::new());
        let (last, entry) = recorder();
        table.install(&[entry]).unwrap();
        table.attach(&port);
        port.schedule(&runloop, DEFAULT_MODE).unwrap();

        let forwarder = SignalForwarder::new(Port::wrap(port.make_send_right().unwrap()));
        forwarder.raise(15).unwrap();
        assert_eq!(last.load(Ordering::SeqCst), 0);
        runloop.run_until_idle(DEFAULT_MODE).unwrap();
        assert_eq!(last.load(Ordering::SeqCst), 15);
    }
}
