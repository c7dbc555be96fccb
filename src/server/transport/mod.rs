pub mod tcp;
pub mod udp;

use std::{net::SocketAddr, sync::Arc};

use ahash::AHashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc::Sender;

use crate::server::exchanger::Outbound;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Udp,
    Tcp,
    /// The local IPC stream between host and guests.
    Local,
}

/// Registry of the host's UDP endpoint tasks by local port.
///
/// Outbound unreliable frames are posted to the task owning the port
/// they must leave from, so responses depart from the service's
/// configured endpoint. Key `0` is the shared client socket used for
/// requests towards remote services.
#[derive(Clone, Default)]
pub struct UdpPorts(Arc<RwLock<AHashMap<u16, Sender<(SocketAddr, Outbound)>>>>);

pub const CLIENT_PORT_KEY: u16 = 0;

impl UdpPorts {
    pub fn register(&self, port: u16, sender: Sender<(SocketAddr, Outbound)>) {
        self.0.write().insert(port, sender);
    }

    pub fn unregister(&self, port: u16) {
        self.0.write().remove(&port);
    }

    /// Post a frame leaving from `port`, falling back to the client
    /// socket when the port has no task.
    pub fn send(&self, port: u16, target: SocketAddr, item: Outbound) -> bool {
        let ports = self.0.read();
        let sender = ports.get(&port).or_else(|| ports.get(&CLIENT_PORT_KEY));

        sender.is_some_and(|sender| sender.try_send((target, item)).is_ok())
    }
}
