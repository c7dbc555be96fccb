use std::sync::Arc;

use bytes::BytesMut;

use codec::{
    ClientId,
    command::{Availability, Command, RoutingEntry},
    message::{Message, ReturnCode},
};
use service::{
    ServiceHandler,
    eventgroups::{EventgroupKey, Subscriber},
    pending::PendingKey,
    routing::{ServiceKey, Version},
};

use crate::{config::Config, server::local::GuestBook, statistics::Statistics};

/// The daemon's ear on the service core: logs the lifecycle, keeps the
/// statistics, and turns availability edges and request timeouts into
/// commands towards the guests.
#[derive(Clone)]
pub struct Observer {
    config: Arc<Config>,
    #[allow(unused)]
    statistics: Statistics,
    guests: GuestBook,
}

impl Observer {
    pub fn new(config: Arc<Config>, statistics: Statistics, guests: GuestBook) -> Self {
        Self {
            config,
            statistics,
            guests,
        }
    }
}

impl ServiceHandler for Observer {
    fn on_client_assigned(&self, client: ClientId, name: &str) {
        log::info!("client assigned: client={client:#06x}, name={name:?}");
    }

    fn on_client_released(&self, client: ClientId, name: &str) {
        log::info!(
            "client released: client={client:#06x}, name={name:?}, quarantine={}ms",
            self.config.service_discovery.cyclic_offer_delay
        );
    }

    /// Availability edges become RoutingInfo broadcasts so every guest
    /// sees the same picture.
    fn on_availability(&self, key: ServiceKey, version: Version, available: bool) {
        log::info!(
            "availability: service={:#06x}, instance={:#06x}, available={available}",
            key.0,
            key.1
        );

        self.guests.broadcast(&Command::RoutingInfo {
            entries: vec![RoutingEntry {
                service: key.0,
                instance: key.1,
                major: version.0,
                minor: version.1,
                availability: if available {
                    Availability::Available
                } else {
                    Availability::Unavailable
                },
            }],
        });
    }

    /// A relayed request ran into its deadline: the sender receives the
    /// error response its offerer never produced.
    fn on_request_expired(&self, key: PendingKey, method: u16) {
        let (service, instance, client, session) = key;

        log::warn!(
            "request timed out: service={service:#06x}, method={method:#06x}, client={client:#06x}, session={session}"
        );

        let mut header = codec::message::Header::new(
            service,
            method,
            codec::message::MessageType::Error,
        );
        header.client = client;
        header.session = session;
        header.return_code = ReturnCode::Timeout;

        let mut frame = BytesMut::new();
        Message {
            header,
            payload: &[],
        }
        .encode(&mut frame);

        self.guests.send(client, &Command::SendMessage {
            instance,
            frame: frame.to_vec(),
            uid: 0,
            gid: 0,
        });
    }

    fn on_subscription_expired(&self, key: EventgroupKey, subscriber: Subscriber) {
        log::info!(
            "subscription expired: service={:#06x}, instance={:#06x}, eventgroup={:#06x}, subscriber={subscriber:?}",
            key.0,
            key.1,
            key.2
        );
    }
}
