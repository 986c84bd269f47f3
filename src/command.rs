//! Command protocol: one `i32` in a simple message

use crate::error::{IpcError, IpcResult};
use crate::message::{read_u32, Message, MessageBuilder, HEADER_SIZE};
use crate::port::Port;

/// Message ID of a command
pub const COMMAND_MSG_ID: i32 = 0x504C_0002;

/// Header plus the encoded command
pub const COMMAND_MSG_SIZE: usize = HEADER_SIZE + 4;

/// Send `command` to `port`
pub fn send_command(port: &Port, command: i32) -> IpcResult<()> {
    port.send(MessageBuilder::new(COMMAND_MSG_ID).payload(&command.to_le_bytes()))?;
    log::debug!("sent command {} to {}", command, port.name());
    Ok(())
}

/// Decode the command carried by `msg`, rejecting anything that is not
/// exactly a command message
pub fn receive_command(msg: &Message) -> IpcResult<i32> {
    let reason = if msg.id() != COMMAND_MSG_ID {
        Some("not a command message")
    } else if msg.is_complex() {
        Some("command message carries descriptors")
    } else if msg.size() != COMMAND_MSG_SIZE {
        Some("command message has the wrong size")
    } else {
        None
    };
    if let Some(reason) = reason {
        log::warn!(
            "dropping id {:#x} ({} bytes): {}",
            msg.id(),
            msg.size(),
            reason
        );
        return Err(IpcError::ProtocolMismatch(reason));
    }
    Ok(read_u32(msg.body(), 0)? as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IpcConfig;
    use crate::kern::{Credentials, Kernel};

    fn port() -> (std::sync::Arc<crate::kern::Task>, Port) {
        let kernel = Kernel::new(IpcConfig::default()).unwrap();
        let task = kernel.create_task(Credentials::ROOT).unwrap();
        let port = Port::allocate(&task).unwrap();
        (task, port)
    }

    #[test]
    fn round_trip() {
        let (_task, port) = port();
        for value in [0, 42, -1, i32::MIN, i32::MAX] {
            send_command(&port, value).unwrap();
            let msg = port.receive().unwrap().unwrap();
            assert_eq!(msg.size(), COMMAND_MSG_SIZE);
            assert_eq!(receive_command(&msg).unwrap(), value);
        }
    }

    #[test]
    fn wrong_size_rejected() {
        let (_task, port) = port();
        port.send(MessageBuilder::new(COMMAND_MSG_ID).payload(&[1, 2, 3, 4, 5, 6, 7, 8]))
            .unwrap();
        let msg = port.receive().unwrap().unwrap();
        assert!(matches!(
            receive_command(&msg),
            Err(IpcError::ProtocolMismatch(_))
        ));
    }

    #[test]
    fn wrong_id_or_complex_rejected() {
        let (_task, port) = port();
        port.send(MessageBuilder::new(9).payload(&42i32.to_le_bytes()))
            .unwrap();
        port.send(MessageBuilder::new(COMMAND_MSG_ID).complex()).unwrap();
        for _ in 0..2 {
            let msg = port.receive().unwrap().unwrap();
            assert!(receive_command(&msg).is_err());
        }
    }

    #[test]
    fn dead_destination_fails() {
        let kernel = Kernel::new(IpcConfig::default()).unwrap();
        let server = kernel.create_task(Credentials::ROOT).unwrap();
        let client = kernel.create_task(Credentials::ROOT).unwrap();
        let service = Port::allocate(&server).unwrap();
        service.register(&server, "svc.cmd").unwrap();
        let remote = Port::lookup(&client, "svc.cmd").unwrap();
        drop(service);
        assert_eq!(send_command(&remote, 1), Err(IpcError::PortDead));
    }
}
