use tokio::sync::{mpsc, oneshot};

use crate::net::{Request, Response};
use crate::notify::PageMessage;

/// Platform entry points into the runtime
#[derive(Debug)]
pub enum Event {
  /// Precache the generation this build ships
  Install,
  /// Claim pages for the installed generation and purge the rest
  Activate,
  /// Intercepted request; the routed response goes back on `reply`
  Fetch {
    request: Request,
    reply: Option<oneshot::Sender<Response>>,
  },
  /// Platform background-sync event
  BackgroundSync { tag: String },
  /// Request posted by a page
  Message(PageMessage),
  ConnectivityRestored,
  /// Periodic wake-up
  Poll,
}

/// Work a handler leaves behind to finish after it has returned
#[derive(Debug)]
pub enum Deferred {
  /// Refresh a cached asset that was just served
  Revalidate(Request),
  Sync(crate::sync::SyncTrigger),
  Activate,
}

/// Merges page messages and externally produced events into one stream
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl Event {
  /// Fetch event plus the receiver its response will arrive on
  pub fn fetch(request: Request) -> (Self, oneshot::Receiver<Response>) {
    let (reply, response) = oneshot::channel();
    let event = Event::Fetch {
      request,
      reply: Some(reply),
    };
    (event, response)
  }
}

impl EventHandler {
  /// Create a handler fed by the page-to-worker side of the notification channel
  pub fn new(mut inbound: mpsc::UnboundedReceiver<PageMessage>) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    // Forward page requests
    let forward = tx.clone();
    tokio::spawn(async move {
      while let Some(message) = inbound.recv().await {
        if forward.send(Event::Message(message)).is_err() {
          break;
        }
      }
    });

    Self { tx, rx }
  }

  /// Sender for hosts that observe platform events (connectivity, background sync)
  pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
    self.tx.clone()
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
