//! Messages between the worker runtime and connected page clients.

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

/// Worker to page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
  /// A sync pass has started
  SyncSubmissions,
  /// Submissions acknowledged by the server in the last pass
  SyncComplete { count: usize },
  /// A submission needs the user's attention
  SubmissionFailed { id: String, error: String },
  /// Pages are now served from this generation
  GenerationActivated { generation: String },
}

/// Page to worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PageMessage {
  /// Run a sync pass now, ignoring retry schedules
  SyncNow,
  /// Activate the waiting generation immediately
  SkipWaiting,
}

impl PageMessage {
  pub fn from_json(json: &str) -> serde_json::Result<Self> {
    serde_json::from_str(json)
  }
}

/// Fire-and-forget fan-out to every connected page. Nothing is buffered for
/// pages that connect later.
#[derive(Clone)]
pub struct NotificationChannel {
  outbound: broadcast::Sender<WorkerMessage>,
  inbound: mpsc::UnboundedSender<PageMessage>,
}

impl NotificationChannel {
  /// Create the channel and the receiver the runtime reads page requests from.
  pub fn new(capacity: usize) -> (Self, mpsc::UnboundedReceiver<PageMessage>) {
    let (outbound, _) = broadcast::channel(capacity.max(1));
    let (inbound, inbound_rx) = mpsc::unbounded_channel();
    (Self { outbound, inbound }, inbound_rx)
  }

  /// Send to all connected pages. Returns how many received it; zero is fine.
  pub fn broadcast(&self, message: WorkerMessage) -> usize {
    match self.outbound.send(message) {
      Ok(n) => {
        debug!(clients = n, "broadcast");
        n
      }
      Err(broadcast::error::SendError(message)) => {
        trace!(?message, "no clients connected");
        0
      }
    }
  }

  pub fn connect(&self) -> ClientHandle {
    ClientHandle {
      rx: self.outbound.subscribe(),
      tx: self.inbound.clone(),
    }
  }

  pub fn client_count(&self) -> usize {
    self.outbound.receiver_count()
  }
}

/// A connected page.
pub struct ClientHandle {
  rx: broadcast::Receiver<WorkerMessage>,
  tx: mpsc::UnboundedSender<PageMessage>,
}

impl ClientHandle {
  /// Next broadcast message; `None` once the worker has shut down.
  pub async fn recv(&mut self) -> Option<WorkerMessage> {
    loop {
      match self.rx.recv().await {
        Ok(message) => return Some(message),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
          debug!(skipped, "client lagged behind broadcasts");
        }
        Err(broadcast::error::RecvError::Closed) => return None,
      }
    }
  }

  /// Already-delivered message, if any, without waiting.
  pub fn try_recv(&mut self) -> Option<WorkerMessage> {
    loop {
      match self.rx.try_recv() {
        Ok(message) => return Some(message),
        Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
        Err(_) => return None,
      }
    }
  }

  /// Send a request to the worker. Returns false if the worker is gone.
  pub fn post(&self, message: PageMessage) -> bool {
    self.tx.send(message).is_ok()
  }
}
