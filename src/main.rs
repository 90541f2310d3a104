use clap::{Parser, Subcommand};
use color_eyre::Result;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use letterbox::cache::{CacheResult, Filters, KeyFactory};
use letterbox::config::Config;
use letterbox::logging;
use letterbox::newsletters::schema::SCHEMAS;
use letterbox::newsletters::{ClientOptions, NewsletterClient};
use letterbox::remote::{RemoteExecutor, RestExecutor};

#[derive(Parser, Debug)]
#[command(name = "letterbox")]
#[command(about = "Read and triage newsletters from the command line")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/letterbox/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List newsletters
  List(ListArgs),
  /// Show a single newsletter
  Show { id: String },
  /// Toggle the liked flag
  Like { id: String },
  /// Toggle the read flag
  Read { id: String },
  Archive {
    #[arg(required = true)]
    ids: Vec<String>,
  },
  Unarchive {
    #[arg(required = true)]
    ids: Vec<String>,
  },
  Delete {
    #[arg(required = true)]
    ids: Vec<String>,
  },
  /// Add a newsletter to the reading queue
  QueueAdd { id: String },
  /// Remove a newsletter from the reading queue
  QueueRemove { id: String },
  /// Show the reading queue
  Queue,
  /// Count unread newsletters
  Unread,
  /// List newsletter sources
  Sources {
    #[arg(short, long)]
    search: Option<String>,
  },
}

#[derive(clap::Args, Debug)]
struct ListArgs {
  /// Show archived newsletters instead of the inbox
  #[arg(long)]
  archived: bool,
  /// Only read (true) or unread (false) newsletters
  #[arg(long)]
  read: Option<bool>,
  #[arg(long)]
  liked: bool,
  #[arg(short, long)]
  search: Option<String>,
  /// Restrict to a source (repeatable)
  #[arg(long = "source")]
  sources: Vec<String>,
  /// Oldest first
  #[arg(long)]
  oldest: bool,
  #[arg(short, long, default_value_t = 0)]
  page: u64,
}

impl ListArgs {
  fn filters(&self) -> Filters {
    let mut filters = Filters::new();
    filters.insert("isArchived".into(), json!(self.archived));
    if let Some(read) = self.read {
      filters.insert("isRead".into(), json!(read));
    }
    if self.liked {
      filters.insert("isLiked".into(), json!(true));
    }
    if let Some(search) = &self.search {
      filters.insert("search".into(), json!(search));
    }
    filters.insert("sourceIds".into(), json!(self.sources));
    if self.oldest {
      filters.insert("sortBy".into(), json!("oldest"));
    }
    filters.insert("page".into(), json!(self.page));
    filters
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.logging)?;

  let token = Config::get_api_token()?;
  let keys = Arc::new(KeyFactory::new(SCHEMAS));
  let remote = RestExecutor::new(&config.backend, &token, Arc::clone(&keys))?;
  let client = NewsletterClient::new(Arc::new(remote), keys, ClientOptions::from(&config));

  let output = run(&client, args.command).await?;
  println!("{}", serde_json::to_string_pretty(&output)?);

  // Let confirmed writes refresh what they touched before exiting
  client.flush().await;
  debug!("pending invalidations flushed");

  Ok(())
}

async fn run<R: RemoteExecutor>(client: &NewsletterClient<R>, command: Command) -> Result<Value> {
  let output = match command {
    Command::List(args) => with_source(client.list_newsletters(&args.filters()).await?)?,
    Command::Show { id } => with_source(client.get_newsletter(&id).await?)?,
    Command::Like { id } => serde_json::to_value(client.toggle_like(&id).await?)?,
    Command::Read { id } => serde_json::to_value(client.toggle_read(&id).await?)?,
    Command::Archive { ids } => serde_json::to_value(client.archive(&ids).await?)?,
    Command::Unarchive { ids } => serde_json::to_value(client.unarchive(&ids).await?)?,
    Command::Delete { ids } => serde_json::to_value(client.delete(&ids).await?)?,
    Command::QueueAdd { id } => serde_json::to_value(client.add_to_queue(&id).await?)?,
    Command::QueueRemove { id } => json!({ "removed": client.remove_from_queue(&id).await? }),
    Command::Queue => with_source(client.reading_queue().await?)?,
    Command::Unread => with_source(client.unread_count().await?)?,
    Command::Sources { search } => {
      let mut filters = Filters::new();
      if let Some(search) = search {
        filters.insert("search".into(), json!(search));
      }
      with_source(client.sources(&filters).await?)?
    }
  };
  Ok(output)
}

fn with_source<T: Serialize>(result: CacheResult<T>) -> Result<Value> {
  Ok(json!({
    "source": format!("{:?}", result.source),
    "cached_at": result.cached_at.map(|at| at.to_rfc3339()),
    "data": serde_json::to_value(result.data)?,
  }))
}
