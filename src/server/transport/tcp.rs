use std::{net::SocketAddr, time::Duration};

use anyhow::Result;
use bytes::{Buf, BytesMut};
use codec::{Direction, find_cookie, message::Message};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc::Receiver,
    time::{sleep, sleep_until},
};

use crate::{
    server::{Router, exchanger::Outbound, queue::TrainBuffer},
    statistics::{Identifier, Stats, StatisticsReporter},
    server::transport::Transport,
};

/// Ceiling of the reconnect backoff for dialed connections.
const RECONNECT_CEILING: Duration = Duration::from_secs(8);

/// Reassembly headroom: beyond this many buffered bytes without a
/// decodable frame the connection is treated as broken.
const MAX_REASSEMBLY: usize = 1 << 22;

/// Listener side of a reliable service endpoint.
pub async fn listener(router: Router, port: u16, magic_cookies: bool) -> Result<()> {
    let listener = TcpListener::bind(SocketAddr::new(router.config.unicast, port)).await?;
    let local_addr = listener.local_addr()?;

    log::info!("tcp endpoint up: local addr={local_addr}, magic cookies={magic_cookies}");

    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(it) => it,
            Err(e) => {
                log::error!("tcp accept failed: local addr={local_addr}, err={e}");
                break;
            }
        };

        log::info!("tcp socket accept: addr={peer}, local addr={local_addr}");

        let router = router.clone();
        let mut receiver = router.exchanger.get_receiver(peer);

        tokio::spawn(async move {
            let reporter = router.statistics.get_reporter(Identifier {
                transport: Transport::Tcp,
                local: local_addr,
            });

            // On the accepted side the peer talks as a client and we
            // answer as the service.
            let role = Role {
                local_port: port,
                expect: Direction::ClientToService,
                send: Direction::ServiceToClient,
                magic_cookies,
            };

            let _ = run_connection(&router, socket, peer, &mut receiver, &reporter, &role).await;
            router.exchanger.remove(&peer);
        });
    }

    Ok(())
}

/// Client side: dial a remote reliable endpoint and keep the connection
/// alive with exponential backoff while frames are queued for it.
pub async fn client_connection(
    router: Router,
    target: SocketAddr,
    mut receiver: Receiver<Outbound>,
) {
    let reporter = router.statistics.get_reporter(Identifier {
        transport: Transport::Tcp,
        local: SocketAddr::new(router.config.unicast, 0),
    });

    let role = Role {
        local_port: 0,
        expect: Direction::ServiceToClient,
        send: Direction::ClientToService,
        // Dialed connections go to remote services; whether they expect
        // cookies is that service's configuration, mirrored locally.
        magic_cookies: router
            .config
            .services
            .iter()
            .any(|entry| entry.reliable.as_ref().is_some_and(|reliable| {
                reliable.port == target.port() && reliable.enable_magic_cookies
            })),
    };

    let mut backoff = Duration::from_millis(250);

    loop {
        match TcpStream::connect(target).await {
            Ok(socket) => {
                log::info!("tcp connected: target={target}");
                backoff = Duration::from_millis(250);

                if run_connection(&router, socket, target, &mut receiver, &reporter, &role)
                    .await
                    .is_ok()
                {
                    // Orderly shutdown by the peer, no retry.
                    break;
                }
            }
            Err(e) => {
                log::warn!("tcp connect failed: target={target}, err={e}, retry in {backoff:?}");
            }
        }

        sleep(backoff).await;
        backoff = (backoff * 2).min(RECONNECT_CEILING);
    }

    router.exchanger.remove(&target);
}

struct Role {
    local_port: u16,
    /// Cookie direction expected from the peer during resync.
    expect: Direction,
    /// Cookie direction put in front of our packets.
    send: Direction,
    magic_cookies: bool,
}

async fn run_connection(
    router: &Router,
    mut socket: TcpStream,
    peer: SocketAddr,
    receiver: &mut Receiver<Outbound>,
    reporter: &StatisticsReporter,
    role: &Role,
) -> Result<()> {
    if let Err(e) = socket.set_nodelay(true) {
        log::error!("tcp socket set nodelay failed: addr={peer}, err={e}");
    }

    let max_message_size = router.config.tcp.max_message_size;
    let flush_delay = Duration::from_millis(router.config.tcp.flush_delay);
    let cookie = role.magic_cookies.then(|| role.send.cookie());

    let mut train = TrainBuffer::new(max_message_size, flush_delay, cookie);
    let mut buffer = BytesMut::with_capacity(8192);
    let mut chunk = [0u8; 8192];

    loop {
        let departure = train
            .next_departure()
            .map(tokio::time::Instant::from_std)
            .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            read = socket.read(&mut chunk) => {
                let size = read?;
                if size == 0 {
                    log::info!("tcp socket closed: addr={peer}");
                    return Ok(());
                }

                reporter.send(&[Stats::ReceivedBytes(size)]);
                buffer.extend_from_slice(&chunk[..size]);

                if !drain_frames(router, &mut buffer, peer, reporter, role, max_message_size) {
                    anyhow::bail!("protocol error without magic cookies");
                }

                if buffer.len() > MAX_REASSEMBLY {
                    anyhow::bail!("reassembly buffer overflow");
                }
            }
            item = receiver.recv() => {
                let Some(item) = item else {
                    // Our endpoint registration is gone; shut down.
                    return Ok(());
                };

                for packet in train.push(&item.bytes, item.flush, std::time::Instant::now()) {
                    reporter.send(&[Stats::SendBytes(packet.len()), Stats::SendPkts(1)]);
                    socket.write_all(&packet).await?;
                }
            }
            _ = sleep_until(departure) => {
                if let Some(packet) = train.flush_due(std::time::Instant::now()) {
                    reporter.send(&[Stats::SendBytes(packet.len()), Stats::SendPkts(1)]);
                    socket.write_all(&packet).await?;
                }
            }
        }
    }
}

/// Cut complete frames out of the reassembly buffer.
///
/// A framing error triggers magic cookie resynchronization: scan forward
/// for the peer direction's cookie, discard everything in front of it
/// and resume behind the cookie message. Returns `false` when the
/// stream is unrecoverable (no cookies configured), which closes the
/// connection.
fn drain_frames(
    router: &Router,
    buffer: &mut BytesMut,
    peer: SocketAddr,
    reporter: &StatisticsReporter,
    role: &Role,
    max_message_size: usize,
) -> bool {
    loop {
        let oversized = max_message_size != 0
            && buffer.len() >= 8
            && u32::from_be_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]) as usize
                > max_message_size;

        let error = if oversized {
            Some(codec::Error::PayloadTooLarge)
        } else {
            match Message::decode(buffer) {
                Ok((message, consumed)) => {
                    reporter.send(&[Stats::ReceivedPkts(1)]);

                    // Cookies are framing noise, everything else routes.
                    if !message.header.is_magic_cookie() {
                        router.handle_network_message(role.local_port, true, peer, &message);
                    }

                    buffer.advance(consumed);
                    continue;
                }
                Err(codec::Error::Incomplete) => return true,
                Err(e) => Some(e),
            }
        };

        if let Some(e) = error {
            if !role.magic_cookies {
                log::warn!("tcp framing error, closing: addr={peer}, err={e}");
                return false;
            }

            reporter.send(&[Stats::Resyncs(1), Stats::ErrorPkts(1)]);

            // Skip at least one byte so a rogue cookie-shaped prefix
            // cannot pin us in place.
            match find_cookie(&buffer[1..], role.expect) {
                Some(offset) => {
                    log::warn!("tcp resync: addr={peer}, discarded={}", offset + 1);
                    buffer.advance(offset + 1);
                }
                None => {
                    // Keep a cookie-sized tail, the rest is garbage.
                    let keep = 15.min(buffer.len());
                    let discard = buffer.len() - keep;
                    buffer.advance(discard);
                    return true;
                }
            }
        }
    }
}
