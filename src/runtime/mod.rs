//! The worker runtime: one explicitly constructed object owning every store,
//! with a dispatch table for platform events.
//!
//! Handlers do their immediate work and hand back [`Deferred`] actions, which
//! the runtime runs in the background and joins on shutdown.

mod event;

pub use event::{Deferred, Event, EventHandler};

use chrono::Utc;
use color_eyre::Result;
use futures::future::join_all;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheStore, GenerationManager, SqliteCacheStore};
use crate::config::Config;
use crate::db::Database;
use crate::error::{GenerationError, StoreResult};
use crate::net::{Fetcher, HttpFetcher, Request, Response};
use crate::notify::{NotificationChannel, PageMessage, WorkerMessage};
use crate::outbox::{Backoff, NewSubmission, Outbox, QueuedSubmission};
use crate::router::{Routed, Router};
use crate::sync::{HttpSubmissionApi, SubmissionApi, SyncCoordinator, SyncReport, SyncTrigger};

/// Broadcast buffer per connected page
const CHANNEL_CAPACITY: usize = 64;

/// Shortest sleep of the run loop, so a pass that is still claiming records
/// is not raced by the next wake-up
const MIN_WAKE: Duration = Duration::from_secs(1);

/// Result of dispatching one event
#[derive(Debug, Default)]
pub struct Dispatch {
  pub routed: Option<Routed>,
  pub deferred: Vec<Deferred>,
}

pub struct Runtime {
  config: Config,
  store: Arc<dyn CacheStore>,
  generations: Arc<GenerationManager>,
  router: Arc<Router>,
  outbox: Arc<Outbox>,
  coordinator: Arc<SyncCoordinator>,
  channel: NotificationChannel,
  tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
  /// Open the database and wire the live network clients.
  pub fn init(config: Config) -> Result<(Self, mpsc::UnboundedReceiver<PageMessage>)> {
    let db = Arc::new(Database::open(
      &config.database_path()?,
      config.storage.quota_bytes,
    )?);

    let fetcher = Arc::new(HttpFetcher::new(config.sync.single_timeout())?);
    // Sync attempts are bounded by the coordinator's own timeouts
    let api = Arc::new(HttpSubmissionApi::new(
      reqwest::Client::builder().build()?,
      config.resolve(&config.server.submissions_path)?,
      Config::get_api_token(),
      config.sync.async_processing,
    )?);

    Self::with_parts(config, db, fetcher, api)
  }

  /// Build a runtime over explicit collaborators.
  ///
  /// Records a previous process left IN_FLIGHT are returned to PENDING here.
  pub fn with_parts(
    config: Config,
    db: Arc<Database>,
    fetcher: Arc<dyn Fetcher>,
    api: Arc<dyn SubmissionApi>,
  ) -> Result<(Self, mpsc::UnboundedReceiver<PageMessage>)> {
    let store: Arc<dyn CacheStore> = Arc::new(SqliteCacheStore::new(db.clone()));

    let manifest = config
      .cache
      .precache
      .iter()
      .map(|path| config.resolve(path))
      .collect::<Result<Vec<_>>>()?;
    let generations = Arc::new(GenerationManager::new(
      store.clone(),
      fetcher.clone(),
      config.cache.generation.clone(),
      manifest,
      config.cache.vary_headers.clone(),
    ));

    let mut shell_fallbacks = vec![config.resolve(&config.cache.offline_url)?];
    let root = config.resolve("/")?;
    if !shell_fallbacks.contains(&root) {
      shell_fallbacks.push(root);
    }
    let router = Arc::new(Router::new(
      store.clone(),
      fetcher,
      &config.server.base_url,
      config.server.api_prefix.clone(),
      shell_fallbacks,
      config.cache.vary_headers.clone(),
    ));

    let outbox = Arc::new(
      Outbox::new(db, Backoff::from_config(&config.retry))?
        .with_cache_eviction(store.clone())
        .with_receipt_limit(config.storage.receipt_limit),
    );
    outbox.recover_in_flight()?;

    let (channel, inbound) = NotificationChannel::new(CHANNEL_CAPACITY);
    let coordinator = Arc::new(SyncCoordinator::new(
      outbox.clone(),
      api,
      channel.clone(),
      &config.sync,
    ));

    info!(device = %outbox.device_id(), generation = %config.cache.generation, "runtime initialized");

    let runtime = Self {
      config,
      store,
      generations,
      router,
      outbox,
      coordinator,
      channel,
      tasks: Mutex::new(Vec::new()),
    };
    Ok((runtime, inbound))
  }

  pub fn channel(&self) -> &NotificationChannel {
    &self.channel
  }

  pub fn outbox(&self) -> &Arc<Outbox> {
    &self.outbox
  }

  pub fn generations(&self) -> &GenerationManager {
    &self.generations
  }

  /// Tag of the generation currently serving pages.
  pub fn live_generation(&self) -> StoreResult<Option<String>> {
    self.store.live_generation()
  }

  /// Handle one event and start whatever it deferred.
  pub async fn handle(&self, event: Event) -> Option<Response> {
    let Dispatch { routed, deferred } = self.dispatch(event).await;
    for action in deferred {
      self.perform(action);
    }
    routed.map(|r| r.response)
  }

  /// The dispatch table. Does the event's immediate work only.
  pub async fn dispatch(&self, event: Event) -> Dispatch {
    let mut dispatch = Dispatch::default();

    match event {
      Event::Install => {
        if install(&self.generations).await && self.config.skip_waiting {
          dispatch.deferred.push(Deferred::Activate);
        }
      }
      Event::Activate => {
        if let Err(e) = self.activate() {
          warn!(error = %e, "activation failed");
        }
      }
      Event::Fetch { request, reply } => {
        let mut routed = self.router.handle(&request).await;
        if let Some(request) = routed.revalidate.take() {
          dispatch.deferred.push(Deferred::Revalidate(request));
        }
        if let Some(reply) = reply {
          if reply.send(routed.response.clone()).is_err() {
            debug!(url = %request.url, "page went away before its response");
          }
        }
        dispatch.routed = Some(routed);
      }
      Event::BackgroundSync { tag } => {
        if tag == self.config.sync.background_sync_tag {
          dispatch.deferred.push(Deferred::Sync(SyncTrigger::BackgroundSync));
        } else {
          debug!(tag, "ignoring background sync for another tag");
        }
      }
      Event::Message(PageMessage::SyncNow) => {
        dispatch.deferred.push(Deferred::Sync(SyncTrigger::UserRetry));
      }
      Event::Message(PageMessage::SkipWaiting) => {
        dispatch.deferred.push(Deferred::Activate);
      }
      Event::ConnectivityRestored => {
        dispatch
          .deferred
          .push(Deferred::Sync(SyncTrigger::ConnectivityRestored));
      }
      Event::Poll => {
        if self.has_due_work() {
          dispatch.deferred.push(Deferred::Sync(SyncTrigger::Poll));
        }
      }
    }

    dispatch
  }

  fn perform(&self, action: Deferred) {
    let task = match action {
      Deferred::Revalidate(request) => {
        let router = self.router.clone();
        tokio::spawn(async move { router.revalidate(&request).await })
      }
      Deferred::Sync(trigger) => {
        let coordinator = self.coordinator.clone();
        tokio::spawn(async move {
          if let Err(e) = coordinator.run_pass(trigger).await {
            warn!(?trigger, error = %e, "sync pass failed");
          }
        })
      }
      Deferred::Activate => {
        if let Err(e) = self.activate() {
          warn!(error = %e, "activation failed");
        }
        return;
      }
    };

    self.track(task);
  }

  fn track(&self, task: JoinHandle<()>) {
    if let Ok(mut tasks) = self.tasks.lock() {
      tasks.retain(|t| !t.is_finished());
      tasks.push(task);
    }
  }

  /// Start an event without waiting for it.
  ///
  /// Fetches and installs wait on the network, so they run as tracked tasks
  /// and the caller can keep serving other events. Fetch responses go back
  /// on the event's reply channel. Everything else is handled as usual.
  pub async fn accept(&self, event: Event) {
    match event {
      Event::Fetch { request, reply } => {
        let router = self.router.clone();
        self.track(tokio::spawn(async move {
          let mut routed = router.handle(&request).await;
          if let Some(reply) = reply {
            if reply.send(routed.response).is_err() {
              debug!(url = %request.url, "page went away before its response");
            }
          }
          if let Some(stale) = routed.revalidate.take() {
            router.revalidate(&stale).await;
          }
        }));
      }
      Event::Install => {
        let generations = self.generations.clone();
        let channel = self.channel.clone();
        let skip_waiting = self.config.skip_waiting;
        self.track(tokio::spawn(async move {
          if install(&generations).await && skip_waiting {
            if let Err(e) = activate(&generations, &channel) {
              warn!(error = %e, "activation failed");
            }
          }
        }));
      }
      event => {
        self.handle(event).await;
      }
    }
  }

  /// Make the installed generation live, purge the others, and tell pages.
  pub fn activate(&self) -> Result<Vec<String>, GenerationError> {
    activate(&self.generations, &self.channel)
  }

  /// Route an intercepted request.
  pub async fn fetch(&self, request: Request) -> Response {
    let event = Event::Fetch {
      request,
      reply: None,
    };
    match self.handle(event).await {
      Some(response) => response,
      None => Response::new(503, Vec::new()),
    }
  }

  /// Queue a submission and ask for a background sync.
  pub fn submit(&self, submission: NewSubmission) -> StoreResult<QueuedSubmission> {
    let queued = self.outbox.enqueue(submission)?;
    self.perform(Deferred::Sync(SyncTrigger::BackgroundSync));
    Ok(queued)
  }

  /// Run a pass in the foreground.
  pub async fn sync(&self, trigger: SyncTrigger) -> StoreResult<SyncReport> {
    self.coordinator.run_pass(trigger).await
  }

  fn has_due_work(&self) -> bool {
    match self.outbox.next_due() {
      Ok(Some(due)) => due <= Utc::now(),
      Ok(None) => false,
      Err(e) => {
        warn!(error = %e, "failed to read outbox schedule");
        false
      }
    }
  }

  /// Time until the next scheduled retry, capped by the poll interval.
  fn next_wake(&self) -> Duration {
    let poll = self.config.sync.poll_interval();
    let until_due = match self.outbox.next_due() {
      Ok(Some(due)) => (due - Utc::now()).to_std().unwrap_or(Duration::ZERO),
      Ok(None) => poll,
      Err(e) => {
        warn!(error = %e, "failed to read outbox schedule");
        poll
      }
    };
    until_due.min(poll).max(MIN_WAKE)
  }

  /// Serve events until interrupted, then shut down.
  pub async fn run(&self, mut events: EventHandler) -> Result<()> {
    info!("runtime running");

    // Anything queued while no runtime was up
    self.perform(Deferred::Sync(SyncTrigger::BackgroundSync));

    loop {
      let wake = self.next_wake();
      tokio::select! {
        event = events.next() => match event {
          Some(event) => self.accept(event).await,
          None => break,
        },
        _ = tokio::time::sleep(wake) => {
          self.handle(Event::Poll).await;
        }
        _ = tokio::signal::ctrl_c() => {
          info!("interrupted");
          break;
        }
      }
    }

    self.shutdown().await;
    Ok(())
  }

  /// Wait for every deferred action started so far.
  pub async fn wait_idle(&self) {
    loop {
      let pending: Vec<JoinHandle<()>> = match self.tasks.lock() {
        Ok(mut tasks) => tasks.drain(..).collect(),
        Err(_) => return,
      };
      if pending.is_empty() {
        return;
      }
      for result in join_all(pending).await {
        if let Err(e) = result {
          warn!(error = %e, "deferred task panicked");
        }
      }
    }
  }

  /// Teardown: let outstanding syncs and revalidations finish.
  pub async fn shutdown(&self) {
    self.wait_idle().await;
    info!("runtime stopped");
  }
}

/// Precache the configured generation. False when it did not install.
async fn install(generations: &GenerationManager) -> bool {
  match generations.install().await {
    Ok(assets) => {
      debug!(assets, "install complete");
      true
    }
    Err(e) => {
      warn!(error = %e, "install failed, keeping current generation");
      false
    }
  }
}

fn activate(
  generations: &GenerationManager,
  channel: &NotificationChannel,
) -> Result<Vec<String>, GenerationError> {
  let purged = generations.activate()?;
  info!(generation = %generations.tag(), purged = purged.len(), "generation activated");
  channel.broadcast(WorkerMessage::GenerationActivated {
    generation: generations.tag().to_string(),
  });
  Ok(purged)
}
