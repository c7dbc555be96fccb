use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::{Duration, Instant},
};

use ahash::AHashMap;
use anyhow::Result;
use bytes::BytesMut;
use codec::message::Message;
use tokio::{net::UdpSocket, sync::mpsc::channel, time::sleep_until};

use crate::{
    server::{Router, exchanger::Outbound, queue::TrainBuffer},
    statistics::{Identifier, Stats},
    server::transport::Transport,
};

/// Idle deadline used when no train is waiting to depart.
fn park() -> tokio::time::Instant {
    tokio::time::Instant::now() + Duration::from_secs(3600)
}

/// One UDP endpoint: a single socket, datagram framing in, per peer
/// trains out.
///
/// Every received datagram carries zero or more complete SOME/IP
/// messages back to back; the reassembly state resets with each
/// datagram, so a malformed tail never poisons the next one.
pub async fn endpoint(router: Router, bind: SocketAddr, register_as: u16) -> Result<()> {
    let socket = UdpSocket::bind(bind).await?;
    run(router, socket, register_as).await
}

/// Drive an already bound socket; the client socket is bound by the
/// server setup because its ephemeral port is announced in discovery.
pub async fn run(router: Router, socket: UdpSocket, register_as: u16) -> Result<()> {
    let local_addr = socket.local_addr()?;

    let (sender, mut receiver) = channel::<(SocketAddr, Outbound)>(512);
    router.udp.register(register_as, sender);

    let reporter = router.statistics.get_reporter(Identifier {
        transport: Transport::Udp,
        local: local_addr,
    });

    log::info!("udp endpoint up: local addr={local_addr}");

    let mtu = codec::MAX_UDP_MESSAGE_SIZE;
    let flush_delay = Duration::from_millis(router.config.tcp.flush_delay);

    let mut trains = AHashMap::<SocketAddr, TrainBuffer>::new();
    let mut buffer = BytesMut::zeroed(mtu);

    loop {
        let departure = trains
            .values()
            .filter_map(TrainBuffer::next_departure)
            .min()
            .map(tokio::time::Instant::from_std)
            .unwrap_or_else(park);

        tokio::select! {
            result = socket.recv_from(&mut buffer) => {
                let (size, from) = match result {
                    Ok(it) => it,
                    Err(e) => {
                        if e.kind() == std::io::ErrorKind::ConnectionReset {
                            continue;
                        }

                        log::error!("udp endpoint recv error: local addr={local_addr}, err={e}");
                        break;
                    }
                };

                reporter.send(&[Stats::ReceivedBytes(size)]);
                dispatch_datagram(&router, &reporter, local_addr.port(), from, &buffer[..size]);
            }
            Some((target, item)) = receiver.recv() => {
                let train = trains
                    .entry(target)
                    .or_insert_with(|| TrainBuffer::new(mtu, flush_delay, None));

                for packet in train.push(&item.bytes, item.flush, Instant::now()) {
                    reporter.send(&[Stats::SendBytes(packet.len()), Stats::SendPkts(1)]);
                    if let Err(e) = socket.send_to(&packet, target).await {
                        log::warn!("udp send failed: target={target}, err={e}");
                    }
                }
            }
            _ = sleep_until(departure) => {
                let now = Instant::now();
                for (target, train) in trains.iter_mut() {
                    if let Some(packet) = train.flush_due(now) {
                        reporter.send(&[Stats::SendBytes(packet.len()), Stats::SendPkts(1)]);
                        if let Err(e) = socket.send_to(&packet, *target).await {
                            log::warn!("udp send failed: target={target}, err={e}");
                        }
                    }
                }
            }
        }
    }

    router.udp.unregister(register_as);
    Ok(())
}

/// A listener joined to an eventgroup's multicast group. Spawned when a
/// SubscribeAck points notifications at a group, dropped when the
/// subscription ends.
pub async fn multicast_listener(router: Router, group: Ipv4Addr, port: u16) -> Result<()> {
    let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)).await?;

    let interface = match router.config.unicast {
        IpAddr::V4(addr) => addr,
        IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
    };

    socket.join_multicast_v4(group, interface)?;
    log::info!("joined notification group: group={group}:{port}");

    let reporter = router.statistics.get_reporter(Identifier {
        transport: Transport::Udp,
        local: socket.local_addr()?,
    });

    let mut buffer = BytesMut::zeroed(codec::MAX_UDP_MESSAGE_SIZE);
    loop {
        let (size, from) = match socket.recv_from(&mut buffer).await {
            Ok(it) => it,
            Err(e) => {
                log::error!("multicast listener error: group={group}:{port}, err={e}");
                break;
            }
        };

        reporter.send(&[Stats::ReceivedBytes(size)]);
        dispatch_datagram(&router, &reporter, port, from, &buffer[..size]);
    }

    Ok(())
}

/// Split a datagram into messages and hand each to the router. Malformed
/// frames drop the remainder of the datagram, counted, never more.
fn dispatch_datagram(
    router: &Router,
    reporter: &crate::statistics::StatisticsReporter,
    local_port: u16,
    from: SocketAddr,
    mut datagram: &[u8],
) {
    while !datagram.is_empty() {
        match Message::decode(datagram) {
            Ok((message, consumed)) => {
                reporter.send(&[Stats::ReceivedPkts(1)]);
                router.handle_network_message(local_port, false, from, &message);
                datagram = &datagram[consumed..];
            }
            Err(e) => {
                reporter.send(&[Stats::ErrorPkts(1)]);
                log::debug!("dropping malformed datagram tail: from={from}, err={e}");
                break;
            }
        }
    }
}
