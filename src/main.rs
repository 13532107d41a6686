use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fieldsync::config::Config;
use fieldsync::net::Request;
use fieldsync::outbox::NewSubmission;
use fieldsync::runtime::{Event, EventHandler, Runtime};
use fieldsync::sync::SyncTrigger;

#[derive(Parser, Debug)]
#[command(name = "fieldsync")]
#[command(about = "Offline-first submission runtime for field data collection")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/fieldsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the configured generation
  Install,
  /// Make the installed generation live and purge older ones
  Activate,
  /// Queue a submission
  Submit {
    /// Form identifier
    form: String,
    /// Submission data as JSON
    data: String,
    #[arg(long)]
    form_version: Option<String>,
    /// Client id to reuse (default: a fresh uuid)
    #[arg(long)]
    id: Option<String>,
  },
  /// Show outbox and cache state
  Status,
  /// Give a dead-lettered submission another retry budget
  Requeue { id: String },
  /// Run one sync pass now
  Sync {
    /// Only send records whose retry is due
    #[arg(long)]
    scheduled: bool,
  },
  /// Route one request the way an intercepted page request would be
  Fetch {
    /// Path on the app origin or absolute URL
    url: String,
    /// Treat as a full page load
    #[arg(long)]
    navigate: bool,
    #[arg(long, default_value = "GET")]
    method: String,
  },
  /// Serve events until interrupted
  Run,
}

fn init_logging(config: &Config) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fieldsync=info"));

  match &config.storage.log_dir {
    Some(dir) => {
      std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
      let appender = tracing_appender::rolling::daily(dir, "fieldsync.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .init();
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
      Ok(None)
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _guard = init_logging(&config)?;

  let (runtime, inbound) = Runtime::init(config.clone())?;

  match args.command {
    Command::Install => {
      let assets = runtime.generations().install().await?;
      println!("installed {} ({} assets)", runtime.generations().tag(), assets);
      if config.skip_waiting {
        let purged = runtime.activate()?;
        println!("activated, purged {:?}", purged);
      }
    }
    Command::Activate => {
      let purged = runtime.activate()?;
      println!("activated {}, purged {:?}", runtime.generations().tag(), purged);
    }
    Command::Submit {
      form,
      data,
      form_version,
      id,
    } => {
      let payload: serde_json::Value =
        serde_json::from_str(&data).map_err(|e| eyre!("Submission data is not valid JSON: {}", e))?;
      let mut submission = NewSubmission::new(form, payload);
      if let Some(version) = form_version {
        submission = submission.with_form_version(version);
      }
      if let Some(id) = id {
        submission = submission.with_id(id);
      }

      let queued = runtime.submit(submission)?;
      println!("queued {}", queued.id);
      runtime.shutdown().await;
    }
    Command::Status => {
      let stats = runtime.outbox().stats()?;
      println!(
        "generation: {}",
        runtime.live_generation()?.as_deref().unwrap_or("(none)")
      );
      println!("device:     {}", runtime.outbox().device_id());
      println!(
        "outbox:     {} pending, {} in flight, {} failed, {} dead-lettered, {} synced",
        stats.pending, stats.in_flight, stats.failed, stats.dead_letter, stats.synced
      );
      if let Some(due) = runtime.outbox().next_due()? {
        println!("next retry: {}", due.to_rfc3339());
      }
      for record in runtime.outbox().dead_letters()? {
        println!(
          "  {} {} {}",
          record.id,
          record.form_id,
          record.last_error.as_deref().unwrap_or("")
        );
      }
    }
    Command::Requeue { id } => {
      let record = runtime.outbox().requeue(&id)?;
      println!("requeued {} ({})", record.id, record.state);
    }
    Command::Sync { scheduled } => {
      let trigger = if scheduled {
        SyncTrigger::Poll
      } else {
        SyncTrigger::UserRetry
      };
      let report = runtime.sync(trigger).await?;
      println!(
        "synced {}, failed {}, dead-lettered {}, released {}",
        report.synced, report.failed, report.dead_lettered, report.released
      );
    }
    Command::Fetch {
      url,
      navigate,
      method,
    } => {
      let url = config.resolve(&url)?;
      let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid method {}: {}", method, e))?;
      let request = if navigate {
        Request::navigate(url)
      } else {
        Request::new(method, url)
      };

      let response = runtime.fetch(request).await;
      println!("{}", response.status);
      println!("{}", String::from_utf8_lossy(&response.body));
      runtime.shutdown().await;
    }
    Command::Run => {
      let events = EventHandler::new(inbound);
      if runtime.live_generation()?.is_none() {
        runtime.handle(Event::Install).await;
      }
      runtime.run(events).await?;
    }
  }

  Ok(())
}
