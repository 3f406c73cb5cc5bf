//! Terminal REPL: the reference driver for a running BitChat node.
//!
//! Loads or creates a persisted identity, opens the configured links, starts
//! a [`RuntimeHandle`], and pumps stdin lines into its Application API while
//! printing [`AppEvent`]s as they arrive.

use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use rand_core::OsRng;
use serde::{Deserialize, Serialize};

use bitchat_core::identity::storage::{SecretStore, NOISE_STATIC_KEY, SIGNING_KEY};
use bitchat_core::identity::SecureIdentityStateManager;
use bitchat_core::noise::{IdentityKeyPair, NoiseKeyPair};
use bitchat_core::types::{Fingerprint, PeerId};
use bitchat_core::BitchatConfig;
use bitchat_runtime::{AppEvent, RuntimeBuilder, RuntimeHandle};

use crate::config::CliConfig;
use crate::error::{CliError, Result};
use crate::tcp_link;

/// A flat-file [`SecretStore`]: the whole keychain is one bincode blob on
/// disk, loaded at startup and rewritten after every mutation. Adequate for
/// a single-user terminal client; a real deployment would back this with
/// the OS keychain instead.
#[derive(Debug, Default, Serialize, Deserialize)]
struct FileSecretStore {
    #[serde(skip)]
    path: Option<std::path::PathBuf>,
    data: BTreeMap<String, Vec<u8>>,
}

impl FileSecretStore {
    fn load(path: &Path) -> Result<Self> {
        let mut store = if path.exists() {
            let bytes = std::fs::read(path)?;
            bincode::deserialize::<Self>(&bytes).map_err(|e| CliError::Config(format!("corrupt identity file: {e}")))?
        } else {
            Self::default()
        };
        store.path = Some(path.to_path_buf());
        Ok(store)
    }

    fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else { return Ok(()) };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = bincode::serialize(&self.data).map_err(|e| CliError::Config(format!("failed to write identity file: {e}")))?;
        std::fs::write(path, bytes)?;
        Ok(())
    }
}

impl SecretStore for FileSecretStore {
    fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.data.get(name).cloned()
    }

    fn put(&mut self, name: &str, data: Vec<u8>) -> bool {
        self.data.insert(name.to_string(), data);
        let _ = self.flush();
        true
    }

    fn delete(&mut self, name: &str) -> bool {
        let removed = self.data.remove(name).is_some();
        let _ = self.flush();
        removed
    }

    fn delete_all_owned(&mut self) -> usize {
        let count = self.data.len();
        self.data.clear();
        let _ = self.flush();
        count
    }
}

/// Load the static Noise/signing keys from `store`, generating and
/// persisting a fresh pair the first time the node runs.
fn load_or_create_keys(store: &mut FileSecretStore) -> (NoiseKeyPair, IdentityKeyPair) {
    let noise_key = match store.get(NOISE_STATIC_KEY) {
        Some(bytes) if bytes.len() == 32 => {
            let mut buf = [0u8; 32];
            buf.copy_from_slice(&bytes);
            NoiseKeyPair::from_bytes(buf)
        }
        _ => {
            let key = NoiseKeyPair::generate(&mut OsRng);
            store.put(NOISE_STATIC_KEY, key.private_key_bytes().to_vec());
            key
        }
    };

    let signing_key = match store.get(SIGNING_KEY) {
        Some(bytes) if bytes.len() == 32 => {
            let mut buf = [0u8; 32];
            buf.copy_from_slice(&bytes);
            IdentityKeyPair::from_bytes(&buf)
        }
        _ => {
            let key = IdentityKeyPair::generate(&mut OsRng);
            store.put(SIGNING_KEY, key.private_key_bytes().to_vec());
            key
        }
    };

    (noise_key, signing_key)
}

/// Nicknames learned from `PeerDiscovered` events, shared between the event
/// printer and the REPL so `/m nickname message` can resolve a fingerprint.
type NicknameTable = Arc<Mutex<BTreeMap<String, Fingerprint>>>;

/// Run the node: connect/listen on the configured links, start the runtime,
/// and drive the terminal REPL until EOF.
pub async fn run(config: CliConfig) -> Result<()> {
    let identity_path = config.identity_file();
    let mut secret_store = FileSecretStore::load(&identity_path)?;
    let (noise_key, signing_key) = load_or_create_keys(&mut secret_store);

    let identity = SecureIdentityStateManager::with_storage(Box::new(secret_store));
    let peer_id = PeerId::random(&mut OsRng);

    let mut builder = RuntimeBuilder::new(peer_id, noise_key, signing_key, config.nickname.clone(), identity)
        .with_config(BitchatConfig::default())
        .with_logging(true);

    match tcp_link::listen(&config.listen_addr, |_link| {}).await {
        Ok(()) => println!("listening on {}", config.listen_addr),
        Err(e) => println!("warning: failed to listen on {}: {e}", config.listen_addr),
    }

    for addr in &config.peer_addrs {
        match tcp_link::connect(addr).await {
            Ok(link) => {
                println!("connected to {addr}");
                builder = builder.with_link(link);
            }
            Err(e) => println!("warning: failed to connect to {addr}: {e}"),
        }
    }

    let mut handle = builder.start();
    let nicknames: NicknameTable = Arc::new(Mutex::new(BTreeMap::new()));

    let mut events = handle.subscribe_events().expect("events channel not yet taken");
    let printer_nicknames = Arc::clone(&nicknames);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event, &printer_nicknames);
        }
    });

    println!("bitchat node {} online as '{}'", handle.peer_id(), config.nickname);
    repl(&mut handle, &nicknames).await
}

fn print_event(event: &AppEvent, nicknames: &NicknameTable) {
    match event {
        AppEvent::Message { from, fingerprint, channel, content, .. } => match channel {
            Some(channel) => println!("[#{channel}] {from}: {content}"),
            None => {
                let who = fingerprint.as_ref().map(|f| f.to_string()).unwrap_or_else(|| from.to_string());
                println!("[pm] {who}: {content}");
            }
        },
        AppEvent::PeerDiscovered { peer_id, fingerprint, nickname } => {
            if let (Some(nickname), Some(fingerprint)) = (nickname, fingerprint) {
                nicknames.lock().unwrap().insert(nickname.clone(), fingerprint.clone());
            }
            println!("* {} joined ({})", nickname.as_deref().unwrap_or("unknown"), peer_id);
        }
        AppEvent::PeerLost { peer_id } => println!("* {peer_id} disconnected"),
        AppEvent::DeliveryUpdate { message_id, status } => println!("* {message_id} -> {status:?}"),
        AppEvent::ChannelMetadata(info) => {
            let lock = if info.is_password_protected { "locked" } else { "open" };
            println!("* #{} ({lock}, created by {})", info.channel, info.creator_fingerprint)
        }
    }
}

/// Read stdin lines on a blocking thread and forward them to the REPL loop.
fn spawn_stdin_reader() -> tokio::sync::mpsc::Receiver<String> {
    let (tx, rx) = tokio::sync::mpsc::channel(16);
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
    rx
}

async fn repl(handle: &mut RuntimeHandle, nicknames: &NicknameTable) -> Result<()> {
    let mut current_channel: Option<String> = None;
    let mut input = spawn_stdin_reader();

    print!("> ");
    io::stdout().flush().ok();

    while let Some(line) = input.recv().await {
        let line = line.trim();
        if !line.is_empty() {
            if let Err(e) = handle_line(handle, nicknames, &mut current_channel, line).await {
                println!("error: {e}");
            }
        }
        print!("> ");
        io::stdout().flush().ok();
    }

    Ok(())
}

async fn handle_line(
    handle: &mut RuntimeHandle,
    nicknames: &NicknameTable,
    current_channel: &mut Option<String>,
    line: &str,
) -> Result<()> {
    if let Some(rest) = line.strip_prefix("/j ") {
        let mut parts = rest.splitn(2, ' ');
        let channel = parts.next().unwrap_or("").trim_start_matches('#').to_string();
        if channel.is_empty() {
            return Err(CliError::Config("usage: /j #name [password]".into()));
        }
        if let Some(password) = parts.next() {
            handle.set_channel_password(channel.clone(), password.to_string()).await?;
        }
        *current_channel = Some(channel.clone());
        println!("joined #{channel}");
    } else if let Some(rest) = line.strip_prefix("/m ") {
        let mut parts = rest.splitn(2, ' ');
        let nickname = parts.next().unwrap_or("");
        let content = parts.next().unwrap_or("");
        if nickname.is_empty() || content.is_empty() {
            return Err(CliError::Config("usage: /m nickname message".into()));
        }
        let fingerprint = nicknames.lock().unwrap().get(nickname).cloned();
        match fingerprint {
            Some(fingerprint) => handle.send_private(fingerprint, content.to_string()).await?,
            None => println!("unknown nickname: {nickname}"),
        }
    } else if line == "/w" {
        let known = nicknames.lock().unwrap();
        if known.is_empty() {
            println!("no known peers yet");
        }
        for (nickname, fingerprint) in known.iter() {
            println!("{nickname}  {fingerprint}");
        }
    } else if line == "/rooms" {
        match current_channel {
            Some(channel) => println!("#{channel}"),
            None => println!("not in a channel"),
        }
    } else if let Some(password) = line.strip_prefix("/pass ") {
        match current_channel {
            Some(channel) => handle.set_channel_password(channel.clone(), password.trim().to_string()).await?,
            None => println!("join a channel first with /j"),
        }
    } else if let Some(nickname) = line.strip_prefix("/transfer ") {
        let nickname = nickname.trim();
        let fingerprint = nicknames.lock().unwrap().get(nickname).cloned();
        match fingerprint {
            Some(fingerprint) => handle.toggle_favorite(fingerprint).await?,
            None => println!("unknown nickname: {nickname}"),
        }
    } else if line == "/clear" {
        print!("\x1b[2J\x1b[H");
        io::stdout().flush().ok();
    } else if let Some(rest) = line.strip_prefix('/') {
        println!("unknown command: /{rest}");
    } else {
        handle.send_public(line.to_string(), Vec::new(), current_channel.clone()).await?;
    }

    Ok(())
}
