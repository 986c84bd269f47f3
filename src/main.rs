//! portlink demo
//!
//! Two tasks on one in-process kernel: A registers a service, B looks it up
//! and says hello with its inbox as the reply port, A moves rights into that
//! inbox (the first one is A's command port), and B answers with a command.

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use spin::Mutex;

use portlink::{
    receive_command, receive_rights, require_rights, send_command, send_rights, Credentials,
    Handle, IpcConfig, Kernel, MessageBuilder, MsgTypeName, Port, PortHolder, RunLoop,
    DEFAULT_MODE,
};

const SERVICE_NAME: &str = "svc.test";

/// First message B sends to the service
const HELLO_MSG_ID: i32 = 0x504C_0100;

#[derive(Parser, Debug)]
#[command(name = "portlink", about = "Register, look up, move rights and post a command")]
struct Args {
    /// Rights A moves to B (the first is A's command port)
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u16).range(1..=64))]
    rights: u16,

    /// Command B sends back
    #[arg(long, default_value_t = 42, allow_negative_numbers = true)]
    command: i32,

    /// Messages queued per port before sends fail
    #[arg(long, default_value_t = portlink::config::DEFAULT_QUEUE_LIMIT)]
    queue_limit: usize,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = IpcConfig::default().with_queue_limit(args.queue_limit);
    let kernel = Kernel::new(config).context("invalid configuration")?;

    let a = kernel.create_task(Credentials::new(501, 20))?;
    let b = kernel.create_task(Credentials::new(502, 20))?;
    let wanted = usize::from(args.rights);

    // A: a registered service plus a private command port
    let loop_a = RunLoop::new(&a)?;
    let service = Port::allocate(&a)?;
    service.register(&a, SERVICE_NAME)?;
    let commands = Port::allocate(&a)?;

    let peer = Arc::new(PortHolder::default());
    {
        let peer = Arc::clone(&peer);
        service.set_message_callback(move |_, msg| {
            if let Some(token) = msg.audit_token() {
                log::info!("A: hello from pid {} (euid {})", token.pid, token.euid);
            }
            if let Some(reply) = msg.take_reply_port() {
                peer.set(Some(Port::wrap(reply)));
            }
        });
    }
    let decoded = Arc::new(Mutex::new(None));
    {
        let decoded = Arc::clone(&decoded);
        commands.set_message_callback(move |_, msg| {
            if let Ok(value) = receive_command(msg) {
                *decoded.lock() = Some(value);
            }
        });
    }
    service.schedule(&loop_a, DEFAULT_MODE)?;
    commands.schedule(&loop_a, DEFAULT_MODE)?;

    // B: look the service up and introduce its inbox
    let loop_b = RunLoop::new(&b)?;
    let inbox = Port::allocate(&b)?;
    let received: Arc<Mutex<Vec<Handle>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let received = Arc::clone(&received);
        let room = wanted + 2;
        inbox.set_message_callback(move |_, msg| {
            let mut out: Vec<Option<Handle>> = (0..room).map(|_| None).collect();
            match receive_rights(msg, &mut out) {
                Ok(count) => {
                    log::info!("B: received {} rights (room for {})", count, room);
                    received.lock().extend(out.into_iter().flatten());
                }
                Err(err) => log::warn!("B: rights transfer rejected: {}", err),
            }
        });
    }
    inbox.schedule(&loop_b, DEFAULT_MODE)?;

    let remote = Port::lookup(&b, SERVICE_NAME).context("B: service lookup")?;
    remote.send(MessageBuilder::new(HELLO_MSG_ID).reply(inbox.name(), MsgTypeName::MakeSend))?;
    loop_a.run_until_idle(DEFAULT_MODE)?;
    let to_b = peer.get().context("A: no hello reached the service")?;

    // A: move the rights
    let extras = (1..wanted)
        .map(|_| Port::allocate(&a))
        .collect::<Result<Vec<_>, _>>()?;
    let mut rights = vec![commands.make_send_right()?];
    for port in &extras {
        rights.push(port.make_send_right()?);
    }
    send_rights(&to_b, rights).map_err(|err| err.error)?;

    // B: collect them and answer on the first
    loop_b.run_until_idle(DEFAULT_MODE)?;
    let mut handles = core::mem::take(&mut *received.lock());
    require_rights(handles.len(), wanted)?;
    let back = Port::wrap(handles.remove(0));
    send_command(&back, args.command)?;

    loop_a.run_until_idle(DEFAULT_MODE)?;
    let Some(value) = decoded.lock().take() else {
        bail!("A: command never arrived");
    };

    println!("service:  {}", SERVICE_NAME);
    println!("rights:   {} sent, {} received", wanted, handles.len() + 1);
    println!("command:  {} sent, {} decoded", args.command, value);
    if value != args.command {
        bail!("command mismatch");
    }
    Ok(())
}
