//! `btvsctl`: talks to the vendor-specific HCI service from the command line.
//!
//! Every argument is a vendor command written as `OPCODE[:HEXPARAMS]`. Once
//! the interface is ready the configured event filter is installed and the
//! commands are sent in order. Completions and events are printed to stdout as
//! JSON lines until the interface goes down or the process is interrupted.

use std::{env, sync::Arc, time::Duration};

use btvs::{
   CommandRequest, NotifyQueue, VendorCallbacks, VendorSession, config::Config, error::Result,
   remote::dbus::DbusBinder,
};
use log::{info, warn};
use serde_json::json;
use tokio::{runtime::Handle, signal, sync::mpsc, task, time};

/// Lifecycle notifications forwarded to the main loop.
enum Signal {
   Ready,
   Down,
}

struct Printer {
   signals: mpsc::UnboundedSender<Signal>,
}

impl Printer {
   fn print(&self, line: serde_json::Value) {
      println!("{line}");
   }

   fn forward(&self, signal: Signal) {
      let _ = self.signals.send(signal);
   }
}

impl VendorCallbacks for Printer {
   fn on_interface_ready(&self) {
      self.print(json!({ "type": "ready" }));
      self.forward(Signal::Ready);
   }

   fn on_interface_down(&self) {
      self.print(json!({ "type": "down" }));
      self.forward(Signal::Down);
   }

   fn on_command_complete(&self, opcode: u16, params: &[u8]) {
      self.print(json!({
         "type": "command_complete",
         "opcode": format!("{opcode:#06x}"),
         "params": hex::encode(params),
      }));
   }

   fn on_event(&self, params: &[u8]) {
      self.print(json!({
         "type": "event",
         "params": hex::encode(params),
      }));
   }
}

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   let commands = env::args()
      .skip(1)
      .map(|arg| arg.parse::<CommandRequest>())
      .collect::<Result<Vec<_>>>()?;

   // Load configuration
   let config = Config::load()?;
   let filter = config.event_filter()?;
   info!(
      "Using vendor service {} on the {} bus",
      config.service_name, config.bus
   );

   let notify = NotifyQueue::new();
   let dispatcher = notify.spawn();
   let binder = Arc::new(DbusBinder::new(Handle::current(), config));
   let (tx, mut signals) = mpsc::unbounded_channel();

   let session = Arc::new(VendorSession::new(
      binder.clone(),
      Arc::new(Printer { signals: tx }),
      notify.clone(),
   ));

   loop {
      tokio::select! {
         received = signals.recv() => match received {
            Some(Signal::Ready) => {
               let session = session.clone();
               let filter = filter.clone();
               let commands = commands.clone();
               // Session calls block on the service's replies; keep selecting
               // so an interrupt is seen while commands are still going out.
               task::spawn_blocking(move || {
                  if let Some(filter) = &filter {
                     session.set_filter(filter.mask(), filter.value());
                  }
                  for command in &commands {
                     session.send_command(command.opcode, &command.params);
                  }
                  info!("Sent {} command(s)", commands.len());
               });
            },
            Some(Signal::Down) | None => {
               warn!("Vendor interface is down");
               break;
            },
         },
         _ = signal::ctrl_c() => {
            info!("Interrupted, releasing session...");
            break;
         },
      }
   }

   task::spawn_blocking(move || session.release()).await?;
   binder.shutdown();

   // The consumer exits once the last session holding the queue is gone.
   drop(notify);
   if time::timeout(Duration::from_secs(2), dispatcher).await.is_err() {
      warn!("Notification queue did not drain in time");
   }

   Ok(())
}
