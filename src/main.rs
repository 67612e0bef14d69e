#![deny(dead_code)] // DO NOT REMOVE THIS EVER
use anyhow::{anyhow, Result};
use clap::Parser;
use log::{debug, error, info, warn, LevelFilter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

mod utils;

use parley::config::{self, ClientConfig};
use parley::models::{Attachment, Contact, ContactStatus, DeliveryStatus, Draft, LocalId, Message, MessageBody};
use parley::sync::outbound::SendTicket;
use parley::sync::{
    ContactDirectory, ConversationStore, InMemoryBackend, OutboundQueue, SyncEvent, SyncSubscription, ViewUpdate,
};

/// Command line arguments for parley
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "parley: a console client for live conversation logs.",
    long_about = "parley keeps local conversation views in sync with an append-only message log.\n\n\
    Commands once running:\n\
    /open <id>  /send <text>  /file <path>  /retry <local-id>  /contacts [query]  /view  /quit"
)]
struct Args {
    /// Directory holding config.json
    #[arg(long, value_name = "PATH", help = "Override the directory holding config.json")]
    config_dir: Option<PathBuf>,

    /// Log file; logs go to stdout when set to "-"
    #[arg(long, value_name = "FILE", default_value = "parley.log")]
    log_file: PathBuf,

    /// One of off, error, warn, info, debug, trace
    #[arg(long, value_name = "LEVEL", default_value = "debug")]
    log_level: String,
}

/// Everything the console loop drives.
struct Session {
    config: ClientConfig,
    backend: InMemoryBackend,
    store: ConversationStore,
    sync: SyncSubscription,
    queue: OutboundQueue,
    directory: ContactDirectory,
    contacts_path: PathBuf,
    active: Option<String>,
}

/// Peers the in-memory roster starts with.
fn demo_roster(me: &Contact) -> Vec<Contact> {
    let mut roster = vec![me.clone()];
    for (id, name, status) in [
        ("daniel", "Daniel", ContactStatus::Online),
        ("zeal", "Zeal", ContactStatus::Away),
        ("wisdom", "Wisdom", ContactStatus::Offline),
        ("grace", "Grace", ContactStatus::Online),
    ] {
        let mut contact = Contact::new(id, name);
        contact.status = status;
        roster.push(contact);
    }
    roster
}

fn render(message: &Message) -> String {
    let marker = match message.delivery_status {
        DeliveryStatus::Committed => "",
        DeliveryStatus::Pending => " (sending)",
        DeliveryStatus::Failed => " (failed, /retry to resend)",
    };
    format!(
        "[{}] {}: {}{}",
        message.timestamp.format("%H:%M:%S"),
        message.sender_id,
        message.body.preview(),
        marker
    )
}

/// Report the outcome of a send without blocking the console.
fn watch_ticket(ticket: SendTicket) {
    let local_id = ticket.local_id().clone();
    tokio::spawn(async move {
        match ticket.outcome().await {
            Ok(message) => debug!("{} committed as {}", local_id, message.id),
            Err(e) => println!("! {} failed: {}", local_id, e),
        }
    });
}

async fn read_attachment(path: &Path) -> Result<Attachment> {
    let bytes = tokio::fs::read(path).await?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("Not a file path: {}", path.display()))?
        .to_string();
    Ok(Attachment {
        file_name,
        content_type: utils::guess_content_type(path).to_string(),
        bytes,
    })
}

impl Session {
    async fn start(config: ClientConfig) -> Result<Self> {
        let backend = InMemoryBackend::new();
        let remote = Arc::new(backend.clone());

        let (store, view_rx) =
            ConversationStore::with_match_window(chrono::Duration::seconds(config.match_window_secs));
        let (sync, sync_rx) = SyncSubscription::new(remote.clone(), store.clone());
        let queue = OutboundQueue::new(remote.clone(), remote.clone(), store.clone())
            .with_retry_policy(config.retry)
            .with_max_attachment_bytes(config.max_attachment_bytes);

        let contacts_path = config.contacts_path()?;
        let directory = ContactDirectory::load(&contacts_path, config.me())?;
        let _roster_task = directory.follow(remote).await?;
        backend.set_roster(demo_roster(&config.me())).await;

        tokio::spawn(print_updates(view_rx, sync_rx));

        Ok(Session {
            config,
            backend,
            store,
            sync,
            queue,
            directory,
            contacts_path,
            active: None,
        })
    }

    fn active(&self) -> Result<&str> {
        self.active
            .as_deref()
            .ok_or_else(|| anyhow!("No open conversation, use /open <id> first"))
    }

    /// Returns false once the user asked to quit.
    async fn handle(&mut self, line: &str) -> Result<bool> {
        let (command, rest) = match line.split_once(' ') {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };

        match command {
            "/open" => {
                if rest.is_empty() {
                    return Err(anyhow!("Usage: /open <id>"));
                }
                let participants = vec![self.config.self_id.clone(), rest.to_string()];
                self.store.create_conversation(rest, &participants).await;
                self.sync.switch_to(rest).await?;
                self.active = Some(rest.to_string());
                println!("Opened {}", rest);
            }
            "/send" => {
                let conversation_id = self.active()?.to_string();
                let draft = Draft::text(&self.config.self_id, rest);
                let body = draft.body.clone();
                let ticket = self.queue.send(&conversation_id, draft).await?;
                self.directory.record_preview(&conversation_id, &body).await;
                watch_ticket(ticket);
            }
            "/file" => {
                let conversation_id = self.active()?.to_string();
                let attachment = read_attachment(Path::new(rest)).await?;
                let ticket = self
                    .queue
                    .send_attachment(&conversation_id, &self.config.self_id, attachment)
                    .await?;
                let body = ticket.item().draft.body.clone();
                self.directory.record_preview(&conversation_id, &body).await;
                watch_ticket(ticket);
            }
            "/retry" => {
                let conversation_id = self.active()?.to_string();
                let ticket = self.queue.retry(&conversation_id, &LocalId(rest.to_string())).await?;
                watch_ticket(ticket);
            }
            "/discard" => {
                let conversation_id = self.active()?.to_string();
                self.queue.discard(&conversation_id, &LocalId(rest.to_string())).await?;
            }
            "/contacts" => {
                let contacts = if rest.is_empty() {
                    self.directory.contacts().await
                } else {
                    self.directory.filter(rest).await
                };
                for contact in contacts {
                    println!("  {:<12} {:<12} {:?}  {}", contact.id, contact.name, contact.status, contact.last_message);
                }
            }
            "/view" => {
                let conversation_id = self.active()?.to_string();
                for message in self.store.view(&conversation_id).await {
                    println!("  {:<44} {}", message.id, render(&message));
                }
                for item in self.queue.outstanding().await {
                    if item.conversation_id == conversation_id {
                        println!("  outstanding: {}", item.local_id);
                    }
                }
            }
            // Simulates the peer writing into the open conversation
            "/peer" => {
                let conversation_id = self.active()?.to_string();
                self.backend
                    .commit_external(&conversation_id, &conversation_id, MessageBody::text(rest))
                    .await;
            }
            "/offline" => {
                let offline = rest != "off";
                self.backend.set_offline(offline).await;
                println!("Backend {}", if offline { "offline" } else { "online" });
            }
            "/quit" => return Ok(false),
            "" => {}
            other => println!("Unknown command {}", other),
        }
        Ok(true)
    }

    async fn shutdown(self) -> Result<()> {
        self.sync.close_all().await;
        self.directory.save(&self.contacts_path).await?;
        info!("Session closed");
        Ok(())
    }
}

async fn print_updates(mut view_rx: mpsc::Receiver<ViewUpdate>, mut sync_rx: mpsc::Receiver<SyncEvent>) {
    loop {
        tokio::select! {
            Some(update) = view_rx.recv() => {
                if let Some(last) = update.messages.last() {
                    println!("{} | {}", update.conversation_id, render(last));
                }
            }
            Some(event) = sync_rx.recv() => match event {
                SyncEvent::Opened { conversation_id } => info!("Feed open for {}", conversation_id),
                SyncEvent::FeedError { conversation_id, error } => {
                    println!("! Feed for {} broke: {}. Use /open to reconnect.", conversation_id, error)
                }
                SyncEvent::Closed { conversation_id } => info!("Feed closed for {}", conversation_id),
            },
            else => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_file = if args.log_file.as_os_str() == "-" {
        None
    } else {
        Some(args.log_file.as_path())
    };
    let level: LevelFilter = args
        .log_level
        .parse()
        .map_err(|_| anyhow!("Unknown log level: {}", args.log_level))?;
    utils::setup_logging(log_file, level)?;
    info!("System information: {} {}", std::env::consts::OS, std::env::consts::ARCH);

    let config_dir = match args.config_dir {
        Some(dir) => dir,
        None => config::get_config_dir()?,
    };
    let config = config::load_config(&config_dir)?;
    info!("Running as {} ({})", config.display_name, config.self_id);

    let mut session = Session::start(config).await?;
    println!("parley ready. /open <id> to start, /contacts to list peers, /quit to exit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match session.handle(line.trim()).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                warn!("Command failed: {}", e);
                println!("! {}", e);
            }
        }
    }

    if let Err(e) = session.shutdown().await {
        error!("Failed to shut down cleanly: {}", e);
        return Err(e);
    }
    println!("Chat session ended.");
    Ok(())
}
