//! A length-prefixed TCP [`Link`] binding: the reference transport for the
//! terminal client. Real deployments sit BLE or Nostr behind the same
//! trait; this one exists so the protocol core can be driven over a LAN
//! for local testing without any radio hardware.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};

use bitchat_core::errors::BitchatError;
use bitchat_core::link::{Link, LinkEvent};

const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

pub struct TcpLink {
    outbound: mpsc::Sender<Vec<u8>>,
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    events: Mutex<mpsc::Receiver<LinkEvent>>,
}

#[async_trait::async_trait]
impl Link for TcpLink {
    async fn send(&self, frame: Vec<u8>) -> Result<(), BitchatError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| BitchatError::configuration("tcp link writer task has stopped"))
    }

    async fn recv(&self) -> Result<Vec<u8>, BitchatError> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| BitchatError::configuration("tcp link reader task has stopped"))
    }

    async fn next_event(&self) -> Option<LinkEvent> {
        self.events.lock().await.recv().await
    }
}

/// Wrap an established [`TcpStream`] as a [`Link`], spawning the reader and
/// writer tasks that drive it.
pub fn spawn(stream: TcpStream) -> Arc<TcpLink> {
    let (read_half, write_half) = stream.into_split();

    let (outbound_tx, outbound_rx) = mpsc::channel::<Vec<u8>>(64);
    let (inbound_tx, inbound_rx) = mpsc::channel::<Vec<u8>>(64);
    let (event_tx, event_rx) = mpsc::channel::<LinkEvent>(8);

    tokio::spawn(writer_task(write_half, outbound_rx));
    tokio::spawn(reader_task(read_half, inbound_tx, event_tx.clone()));
    let _ = event_tx.try_send(LinkEvent::PeerUp(None));

    Arc::new(TcpLink { outbound: outbound_tx, inbound: Mutex::new(inbound_rx), events: Mutex::new(event_rx) })
}

async fn writer_task(mut write_half: tokio::net::tcp::OwnedWriteHalf, mut outbound_rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(frame) = outbound_rx.recv().await {
        if frame.len() as u64 > MAX_FRAME_LEN as u64 {
            continue;
        }
        let len = (frame.len() as u32).to_be_bytes();
        if write_half.write_all(&len).await.is_err() || write_half.write_all(&frame).await.is_err() {
            break;
        }
    }
}

async fn reader_task(
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    event_tx: mpsc::Sender<LinkEvent>,
) {
    loop {
        let mut len_bytes = [0u8; 4];
        if read_half.read_exact(&mut len_bytes).await.is_err() {
            break;
        }
        let len = u32::from_be_bytes(len_bytes);
        if len > MAX_FRAME_LEN {
            break;
        }
        let mut frame = vec![0u8; len as usize];
        if read_half.read_exact(&mut frame).await.is_err() {
            break;
        }
        if inbound_tx.send(frame).await.is_err() {
            break;
        }
    }
    let _ = event_tx.send(LinkEvent::PeerDown(None)).await;
}

/// Accept inbound connections on `addr`, handing each one to `on_connect`.
pub async fn listen<F>(addr: &str, mut on_connect: F) -> std::io::Result<()>
where
    F: FnMut(Arc<TcpLink>) + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _peer_addr)) => on_connect(spawn(stream)),
                Err(_) => break,
            }
        }
    });
    Ok(())
}

pub async fn connect(addr: &str) -> std::io::Result<Arc<TcpLink>> {
    let stream = TcpStream::connect(addr).await?;
    Ok(spawn(stream))
}
