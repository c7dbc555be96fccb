use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::server::transport::Transport;

/// The type of information passed in the statistics channel.
#[derive(Debug, Clone, Copy)]
pub enum Stats {
    ReceivedBytes(usize),
    SendBytes(usize),
    ReceivedPkts(usize),
    SendPkts(usize),
    ErrorPkts(usize),
    /// Outbound messages thrown away under backpressure.
    DroppedPkts(usize),
    /// Magic cookie resynchronizations on a stream endpoint.
    Resyncs(usize),
}

pub trait Number {
    fn add(&self, value: usize);
    fn get(&self) -> usize;
}

#[derive(Default)]
pub struct Count(AtomicUsize);

impl Number for Count {
    fn add(&self, value: usize) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per endpoint counters.
#[derive(Default)]
pub struct Counts<T> {
    pub received_bytes: T,
    pub send_bytes: T,
    pub received_pkts: T,
    pub send_pkts: T,
    pub error_pkts: T,
    pub dropped_pkts: T,
    pub resyncs: T,
}

impl<T: Number> Counts<T> {
    /// # Example
    ///
    /// ```
    /// use someip_router::statistics::*;
    ///
    /// let counts = Counts::<Count>::default();
    ///
    /// counts.add(&Stats::ReceivedBytes(16));
    /// counts.add(&Stats::ReceivedPkts(1));
    /// counts.add(&Stats::Resyncs(1));
    ///
    /// assert_eq!(counts.received_bytes.get(), 16);
    /// assert_eq!(counts.received_pkts.get(), 1);
    /// assert_eq!(counts.resyncs.get(), 1);
    /// ```
    pub fn add(&self, payload: &Stats) {
        match payload {
            Stats::ReceivedBytes(v) => self.received_bytes.add(*v),
            Stats::ReceivedPkts(v) => self.received_pkts.add(*v),
            Stats::SendBytes(v) => self.send_bytes.add(*v),
            Stats::SendPkts(v) => self.send_pkts.add(*v),
            Stats::ErrorPkts(v) => self.error_pkts.add(*v),
            Stats::DroppedPkts(v) => self.dropped_pkts.add(*v),
            Stats::Resyncs(v) => self.resyncs.add(*v),
        }
    }
}

/// Identifies one counted endpoint: the transport plus the local socket
/// it is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identifier {
    pub transport: Transport,
    pub local: SocketAddr,
}

/// Endpoint statistics of the whole routing host.
#[derive(Clone, Default)]
pub struct Statistics(Arc<RwLock<AHashMap<Identifier, Arc<Counts<Count>>>>>);

impl Statistics {
    /// Register an endpoint and get the reporter its task counts with.
    pub fn get_reporter(&self, id: Identifier) -> StatisticsReporter {
        let counts = self
            .0
            .write()
            .entry(id)
            .or_insert_with(|| Arc::new(Counts::default()))
            .clone();

        StatisticsReporter(counts)
    }

    pub fn unregister(&self, id: &Identifier) {
        self.0.write().remove(id);
    }

    /// Snapshot of one endpoint's counters.
    pub fn get(&self, id: &Identifier) -> Option<Counts<usize>> {
        self.0.read().get(id).map(|counts| Counts {
            received_bytes: counts.received_bytes.get(),
            received_pkts: counts.received_pkts.get(),
            send_bytes: counts.send_bytes.get(),
            send_pkts: counts.send_pkts.get(),
            error_pkts: counts.error_pkts.get(),
            dropped_pkts: counts.dropped_pkts.get(),
            resyncs: counts.resyncs.get(),
        })
    }
}

/// Held by each endpoint task to feed the shared statistics.
#[derive(Clone)]
pub struct StatisticsReporter(Arc<Counts<Count>>);

impl StatisticsReporter {
    pub fn send(&self, reports: &[Stats]) {
        for report in reports {
            self.0.add(report);
        }
    }
}
