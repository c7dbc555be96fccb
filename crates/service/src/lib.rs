//! ## SOME/IP routing service
//!
//! The state and decision core of the routing host: client identities,
//! the routing table, eventgroup subscriptions, request/response
//! pairing, the access policy and the service discovery machines. The
//! daemon crate owns the sockets and drives this one; everything here is
//! transport free and synchronous, which is what keeps it testable.

pub mod clients;
pub mod discovery;
pub mod eventgroups;
pub mod events;
pub mod pending;
pub mod policy;
pub mod routing;

use crate::{
    clients::ClientRegistry,
    eventgroups::{EventgroupKey, Subscriber, SubscriptionTable},
    pending::{PendingKey, PendingStore},
    policy::{Access, Credentials, PolicyEngine, PolicyMode, PolicySet},
    routing::{OfferOutcome, Provider, RoutingTable, ServiceKey, Version},
};

use codec::{
    ANY_MAJOR, ANY_MINOR, ClientId, EventgroupId, InstanceId, MethodId, SessionId,
    command::CommandStatus,
    message::{Header, MessageType},
};

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, sleep},
    time::Duration,
};

use ahash::AHashMap;
use parking_lot::Mutex;

/// A coarse seconds counter advanced by the janitor thread.
///
/// This timer does not tick by itself; tests advance it manually, the
/// running service advances it once a second.
///
/// ```
/// use someip_router_service::Timer;
///
/// let timer = Timer::default();
///
/// assert_eq!(timer.get(), 0);
/// assert_eq!(timer.add(), 1);
/// assert_eq!(timer.get(), 1);
/// ```
#[derive(Default)]
pub struct Timer(AtomicU64);

impl Timer {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn add(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Callbacks out of the service core.
///
/// The daemon's observer implements this to log, count and push
/// RoutingInfo updates to its guests. All handlers default to no-ops.
pub trait ServiceHandler: Send + Sync + 'static {
    /// A guest was assigned its client id.
    #[allow(unused_variables)]
    fn on_client_assigned(&self, client: ClientId, name: &str) {}

    /// A guest's id was released, after deregistration or connection
    /// loss.
    #[allow(unused_variables)]
    fn on_client_released(&self, client: ClientId, name: &str) {}

    /// The availability of a `(service, instance)` flipped. This is the
    /// edge the RoutingInfo broadcast is generated from.
    #[allow(unused_variables)]
    fn on_availability(&self, key: ServiceKey, version: Version, available: bool) {}

    /// A relayed request was not answered before its deadline; the
    /// caller owes the sender an `E_TIMEOUT` error response.
    #[allow(unused_variables)]
    fn on_request_expired(&self, key: PendingKey, method: MethodId) {}

    /// An eventgroup subscription lapsed without a refresh.
    #[allow(unused_variables)]
    fn on_subscription_expired(&self, key: EventgroupKey, subscriber: Subscriber) {}
}

pub struct ServiceOptions<T> {
    /// Name of this routing host instance.
    pub host_name: String,
    /// Configured client id hints, by application name.
    pub static_clients: AHashMap<String, ClientId>,
    pub policy_mode: PolicyMode,
    pub policies: PolicySet,
    /// How long a relayed request may stay unanswered.
    pub request_timeout: Duration,
    /// Hold time of released client ids, one discovery round.
    pub quarantine: Duration,
    /// Relay messages between remote peers. Off by default; the host
    /// then only routes for its own guests.
    pub forwarding: bool,
    pub handler: T,
}

/// Where a message relayed for a guest has to go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Another guest of this host.
    Local { client: ClientId },
    /// A remote provider endpoint.
    Remote { endpoint: SocketAddr, reliable: bool },
}

/// The routing service core.
///
/// One instance per routing host. Control operations are expected to
/// arrive serialized (the daemon funnels them through one control task);
/// data path lookups only take short read locks.
pub struct Service<T> {
    host_name: String,
    clients: ClientRegistry,
    routing: RoutingTable,
    subscriptions: SubscriptionTable,
    pending: PendingStore,
    policy: PolicyEngine,
    timer: Timer,
    request_timeout_ticks: u64,
    forwarding: bool,
    /// Endpoints of remote requesters, keyed like pending requests, so
    /// a local offerer's response finds its way back out.
    remote_requests: Mutex<AHashMap<PendingKey, (SocketAddr, bool, u64)>>,
    handler: T,
}

impl<T> Service<T>
where
    T: ServiceHandler,
{
    pub fn new(options: ServiceOptions<T>) -> Arc<Self> {
        let quarantine_ticks = options.quarantine.as_secs().max(1);

        let this = Arc::new(Self {
            host_name: options.host_name,
            clients: ClientRegistry::new(options.static_clients, quarantine_ticks),
            routing: RoutingTable::default(),
            subscriptions: SubscriptionTable::default(),
            pending: PendingStore::default(),
            policy: PolicyEngine::new(options.policy_mode, options.policies),
            timer: Timer::default(),
            request_timeout_ticks: options.request_timeout.as_secs().max(1),
            forwarding: options.forwarding,
            remote_requests: Mutex::new(AHashMap::new()),
            handler: options.handler,
        });

        // Background janitor: advances the coarse clock and expires
        // subscriptions, pending requests, remote offers and quarantined
        // client ids.
        let this_ = Arc::downgrade(&this);
        thread::spawn(move || {
            while let Some(this) = this_.upgrade() {
                let now = this.timer.add();
                this.sweep(now);

                drop(this);
                sleep(Duration::from_secs(1));
            }
        });

        this
    }

    /// One sweep over everything that can lapse. Called by the janitor;
    /// tests call it directly with a hand-advanced timer.
    pub fn sweep(&self, now: u64) {
        self.clients.sweep(now);

        for key in self.routing.sweep(now) {
            log::info!(
                "remote offer lapsed: service={:#06x}, instance={:#06x}",
                key.0,
                key.1
            );

            self.handler.on_availability(key, (ANY_MAJOR, ANY_MINOR), false);
        }

        for (key, subscriber) in self.subscriptions.sweep(now) {
            self.handler.on_subscription_expired(key, subscriber);
        }

        for (key, request) in self.pending.sweep(now) {
            self.handler.on_request_expired(key, request.method);
        }

        // Remote requesters wait at most as long as local ones.
        self.remote_requests.lock().retain(|_, (_, _, deadline)| *deadline > now);
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn subscriptions(&self) -> &SubscriptionTable {
        &self.subscriptions
    }

    pub fn pending(&self) -> &PendingStore {
        &self.pending
    }

    pub fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    // ---- guest lifecycle -------------------------------------------------

    /// Mint a client id for a connecting guest.
    pub fn assign_client(&self, name: &str, pid: u32, credentials: Credentials) -> Option<ClientId> {
        let client = self.clients.assign(name, pid, credentials)?;
        self.handler.on_client_assigned(client, name);
        Some(client)
    }

    /// Tear down everything a guest leaves behind. Returns the offers it
    /// held so the discovery side can StopOffer them.
    pub fn release_client(&self, client: ClientId) -> Vec<(ServiceKey, Version)> {
        let stopped = self.routing.release_client(client);
        for (key, version) in &stopped {
            self.handler.on_availability(*key, *version, false);
        }

        self.subscriptions.release_client(client);
        self.pending.release_client(client);

        if let Some(info) = self.clients.release(client, self.timer.get()) {
            self.handler.on_client_released(client, &info.name);
        }

        stopped
    }

    // ---- control operations ----------------------------------------------

    /// A guest offers a service instance.
    pub fn offer(&self, client: ClientId, key: ServiceKey, version: Version) -> CommandStatus {
        let Some(info) = self.clients.get(client) else {
            return CommandStatus::Rejected;
        };

        if !self.policy.authorize_service(&info.credentials, Access::Offer, key.0, key.1) {
            return CommandStatus::Denied;
        }

        match self.routing.offer_local(client, key, version) {
            OfferOutcome::Conflict => CommandStatus::Rejected,
            OfferOutcome::Refreshed => CommandStatus::Ok,
            OfferOutcome::Inserted => {
                self.handler.on_availability(key, version, true);
                CommandStatus::Ok
            }
        }
    }

    /// A guest withdraws its offer.
    pub fn stop_offer(&self, client: ClientId, key: ServiceKey, version: Version) -> bool {
        let stopped = self.routing.stop_offer_local(client, key);
        if stopped {
            self.handler.on_availability(key, version, false);
        }

        stopped
    }

    /// A guest requests a service. Returns whether it is available right
    /// now, so the caller can push an immediate availability event.
    pub fn request(
        &self,
        client: ClientId,
        key: ServiceKey,
        version: Version,
    ) -> Result<bool, CommandStatus> {
        let Some(info) = self.clients.get(client) else {
            return Err(CommandStatus::Rejected);
        };

        if !self.policy.authorize_service(&info.credentials, Access::Request, key.0, key.1) {
            return Err(CommandStatus::Denied);
        }

        Ok(self.routing.request(client, key, version.0, version.1))
    }

    pub fn release_request(&self, client: ClientId, key: ServiceKey) {
        self.routing.release_request(client, key);
    }

    /// A guest subscribes an eventgroup. The caller is responsible for
    /// driving the discovery side when the provider is remote.
    pub fn subscribe_local(
        &self,
        client: ClientId,
        key: EventgroupKey,
        ttl: u32,
    ) -> CommandStatus {
        let Some(info) = self.clients.get(client) else {
            return CommandStatus::Rejected;
        };

        if !self.policy.authorize_subscribe(&info.credentials, key.0, key.1, key.2) {
            return CommandStatus::Denied;
        }

        self.subscriptions.subscribe(key, Subscriber::Local(client), 0, ttl, &self.timer);
        CommandStatus::Ok
    }

    pub fn unsubscribe_local(&self, client: ClientId, key: EventgroupKey) {
        self.subscriptions.unsubscribe(&key, &Subscriber::Local(client));
    }

    // ---- message relay ---------------------------------------------------

    /// Route a SOME/IP message submitted by a guest.
    ///
    /// On success the caller also receives the session id the host
    /// assigned for requests (to be patched into the frame before it
    /// leaves); responses keep the session they carry.
    pub fn route_from_guest(
        &self,
        sender: ClientId,
        instance: InstanceId,
        header: &Header,
    ) -> Result<(Route, Option<SessionId>), codec::message::ReturnCode> {
        use codec::message::ReturnCode;

        let key = (header.service, instance);

        if header.message_type.is_response() {
            // A local offerer answers: the target client is in the
            // header. Remote requesters were recorded on the way in.
            let pending_key = (header.service, instance, header.client, header.session);
            if let Some((endpoint, reliable, _)) = self.remote_requests.lock().remove(&pending_key) {
                return Ok((Route::Remote { endpoint, reliable }, None));
            }

            if self.clients.contains(header.client) {
                self.pending.complete(&pending_key);
                return Ok((Route::Local { client: header.client }, None));
            }

            return Err(ReturnCode::NotReachable);
        }

        if header.message_type == MessageType::Notification {
            // Notifications are distributed to subscribers, not routed
            // to a provider.
            return Err(ReturnCode::WrongMessageType);
        }

        let Some(info) = self.clients.get(sender) else {
            return Err(ReturnCode::NotOk);
        };

        if !self.policy.authorize(
            &info.credentials,
            Access::Request,
            header.service,
            instance,
            header.method,
        ) {
            return Err(ReturnCode::NotOk);
        }

        let Some(provider) = self.routing.resolve(key, ANY_MAJOR, ANY_MINOR) else {
            return Err(ReturnCode::NotReachable);
        };

        let session = match header.message_type {
            MessageType::Request | MessageType::RequestNoReturn => {
                let session = self.pending.next_session(sender, header.service, instance, header.method);

                if header.message_type.expects_response() {
                    self.pending.insert(
                        (header.service, instance, sender, session),
                        header.method,
                        self.timer.get() + self.request_timeout_ticks,
                    );
                }

                Some(session)
            }
            _ => None,
        };

        let route = match provider {
            Provider::Local { client } => Route::Local { client },
            Provider::Remote { reliable, unreliable, .. } => {
                // Reliability follows what the provider announced; TCP
                // wins when it offered both.
                match (reliable, unreliable) {
                    (Some(endpoint), _) => Route::Remote { endpoint, reliable: true },
                    (None, Some(endpoint)) => Route::Remote { endpoint, reliable: false },
                    (None, None) => return Err(ReturnCode::NotReachable),
                }
            }
        };

        Ok((route, session))
    }

    /// Route a SOME/IP message received from the network. The caller has
    /// already resolved the instance from the receiving endpoint.
    pub fn route_inbound(
        &self,
        instance: InstanceId,
        header: &Header,
        from: SocketAddr,
        reliable: bool,
    ) -> Option<Route> {
        let key = (header.service, instance);

        if header.message_type.is_response() {
            // Pair with the pending request; unmatched responses are
            // dropped silently (the requester may have restarted).
            self.pending.complete(&(header.service, instance, header.client, header.session))?;
            return Some(Route::Local { client: header.client });
        }

        let provider = self.routing.resolve(key, ANY_MAJOR, ANY_MINOR)?;
        let client = match provider {
            Provider::Local { client } => client,
            Provider::Remote { reliable: tcp, unreliable: udp, .. } => {
                // Pure relay between two remote peers, opt-in.
                if !self.forwarding {
                    return None;
                }

                return match (tcp, udp) {
                    (Some(endpoint), _) => Some(Route::Remote { endpoint, reliable: true }),
                    (None, Some(endpoint)) => Some(Route::Remote { endpoint, reliable: false }),
                    (None, None) => None,
                };
            }
        };

        if header.message_type.expects_response() {
            self.remote_requests.lock().insert(
                (header.service, instance, header.client, header.session),
                (from, reliable, self.timer.get() + self.request_timeout_ticks),
            );
        }

        Some(Route::Local { client })
    }

    /// Local subscribers a notification for `eventgroups` goes to.
    pub fn notification_targets(
        &self,
        key: ServiceKey,
        eventgroups: &[EventgroupId],
    ) -> Vec<Subscriber> {
        let mut targets = Vec::new();
        for eventgroup in eventgroups {
            for subscriber in self.subscriptions.subscribers(&(key.0, key.1, *eventgroup)) {
                if !targets.contains(&subscriber) {
                    targets.push(subscriber);
                }
            }
        }

        targets
    }

    // ---- discovery bridging ----------------------------------------------

    /// Apply a received remote offer to the routing table.
    pub fn apply_remote_offer(
        &self,
        key: ServiceKey,
        version: Version,
        reliable: Option<SocketAddr>,
        unreliable: Option<SocketAddr>,
        ttl: u32,
    ) -> OfferOutcome {
        let expires_at = (ttl != codec::TTL_INFINITE).then(|| self.timer.get() + ttl as u64);
        let outcome = self.routing.offer_remote(key, version, reliable, unreliable, expires_at);

        match outcome {
            OfferOutcome::Inserted => self.handler.on_availability(key, version, true),
            OfferOutcome::Conflict => log::warn!(
                "remote offer conflicts with local service: service={:#06x}, instance={:#06x}",
                key.0,
                key.1
            ),
            OfferOutcome::Refreshed => {}
        }

        outcome
    }

    /// Apply a received StopOffer.
    pub fn apply_remote_stop(&self, key: ServiceKey) {
        if self.routing.stop_offer_remote(key) {
            self.handler.on_availability(key, (ANY_MAJOR, ANY_MINOR), false);
        }
    }

    /// A peer rebooted: drop everything learned from it.
    pub fn apply_peer_reboot(&self, address: SocketAddr) {
        for key in self.routing.release_peer(&address) {
            self.handler.on_availability(key, (ANY_MAJOR, ANY_MINOR), false);
        }

        self.subscriptions.release_peer(&address);
    }

    /// A remote peer subscribes one of our eventgroups. Accepted when a
    /// local offer for the service exists.
    pub fn remote_subscribe(
        &self,
        key: EventgroupKey,
        endpoint: SocketAddr,
        reliable: bool,
        counter: u8,
        ttl: u32,
    ) -> bool {
        let offered = self
            .routing
            .local_offers()
            .iter()
            .any(|((service, instance), _, _)| *service == key.0 && *instance == key.1);

        if !offered {
            return false;
        }

        self.subscriptions.subscribe(
            key,
            Subscriber::Remote { endpoint, reliable },
            counter,
            ttl,
            &self.timer,
        );

        true
    }

    pub fn remote_unsubscribe(&self, key: EventgroupKey, endpoint: SocketAddr, reliable: bool) {
        self.subscriptions.unsubscribe(&key, &Subscriber::Remote { endpoint, reliable });
    }
}
