//! The privileged endpoint: one relay connection that is only held open
//! while this instance is the primary among its peers.

use std::sync::Arc;
use std::time::Duration;

use courier_core::leadership::{Candidate, Eligibility, LeadershipArbiter, LeadershipChange};
use courier_settings::LinkSettings;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::connection::{Connection, ConnectionConfig};
use crate::dispatch::{DispatchTable, RequestHandler};
use crate::documents::DocumentStore;
use crate::handlers::register_entity_handlers;
use crate::transport::{Transport, TransportError};

#[derive(Clone, Debug)]
pub struct EndpointConfig {
    pub connection: ConnectionConfig,
    /// Stable id used to break leadership ties.
    pub local_id: String,
    pub eligibility: Eligibility,
    pub handler_timeout: Duration,
}

impl EndpointConfig {
    pub fn from_settings(settings: &LinkSettings) -> Result<Self, TransportError> {
        Ok(Self {
            connection: ConnectionConfig::from_settings(settings)?,
            local_id: settings.endpoint_id.clone(),
            eligibility: Eligibility::default(),
            handler_timeout: settings.handler_timeout(),
        })
    }
}

pub struct Endpoint {
    connection: Connection,
    dispatch: Arc<DispatchTable>,
    arbiter: Mutex<LeadershipArbiter>,
}

impl Endpoint {
    pub fn new(transport: Arc<dyn Transport>, config: EndpointConfig) -> Self {
        let connection = Connection::new(transport, config.connection);
        let dispatch = Arc::new(DispatchTable::with_timeout(config.handler_timeout));
        connection.set_fallback(dispatch.clone());
        Self {
            connection,
            dispatch,
            arbiter: Mutex::new(LeadershipArbiter::new(config.local_id, config.eligibility)),
        }
    }

    pub fn register(&self, kind: &str, handler: impl RequestHandler + 'static) {
        self.dispatch.register(kind, handler);
    }

    /// Install the entity CRUD handlers backed by `store`.
    pub fn with_documents(self, store: Arc<dyn DocumentStore>) -> Self {
        register_entity_handlers(&self.dispatch, store);
        self
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn dispatch_table(&self) -> &Arc<DispatchTable> {
        &self.dispatch
    }

    pub fn is_primary(&self) -> bool {
        self.arbiter.lock().is_primary()
    }

    /// Recompute leadership for the given active set and open or close the
    /// relay connection on a transition.
    pub fn apply_membership(&self, candidates: &[Candidate]) -> LeadershipChange {
        let (change, primary) = {
            let mut arbiter = self.arbiter.lock();
            let change = arbiter.reevaluate(candidates);
            (change, arbiter.view().primary.clone())
        };
        match change {
            LeadershipChange::Promoted => {
                info!("became primary, connecting to relay");
                self.connection.connect();
            }
            LeadershipChange::Demoted => {
                info!(primary = ?primary, "lost primary role, disconnecting");
                self.connection.disconnect();
            }
            LeadershipChange::Unchanged => {
                debug!(primary = ?primary, "membership changed, leadership unchanged");
            }
        }
        change
    }

    /// Follow a membership feed until it closes or `cancel` fires.
    pub async fn run_presence(
        &self,
        mut members: watch::Receiver<Vec<Candidate>>,
        cancel: CancellationToken,
    ) {
        let initial = members.borrow_and_update().clone();
        let _ = self.apply_membership(&initial);
        loop {
            tokio::select! {
                changed = members.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = members.borrow_and_update().clone();
                    let _ = self.apply_membership(&current);
                }
                () = cancel.cancelled() => break,
            }
        }
        debug!("presence feed stopped");
    }

    /// Close the relay link regardless of leadership.
    pub fn shutdown(&self) {
        self.connection.disconnect();
    }

    /// Like [`Endpoint::shutdown`], but wait up to `limit` for the close
    /// handshake. Returns `false` if the link was still closing.
    pub async fn close(&self, limit: Duration) -> bool {
        self.shutdown();
        tokio::time::timeout(limit, self.connection.wait_closed())
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::documents::MemoryStore;
    use crate::testing::{MockPeer, MockTransport};
    use courier_core::envelope::PING;
    use courier_core::{close_code, Envelope};
    use tokio::sync::mpsc;

    fn endpoint(local_id: &str) -> (Endpoint, mpsc::UnboundedReceiver<MockPeer>) {
        let (transport, peers) = MockTransport::new();
        let config = EndpointConfig {
            connection: ConnectionConfig::new("ws://relay.test/ws/endpoint"),
            local_id: local_id.into(),
            eligibility: Eligibility::default(),
            handler_timeout: Duration::from_secs(60),
        };
        (Endpoint::new(Arc::new(transport), config), peers)
    }

    fn gm(id: &str) -> Candidate {
        Candidate::new(id, 4, true)
    }

    async fn wait_state(endpoint: &Endpoint, target: ConnectionState) {
        let mut rx = endpoint.connection().subscribe_state();
        let _ = rx.wait_for(|s| *s == target).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn only_primary_connects() {
        let (a, mut peers_a) = endpoint("A");
        let (b, mut peers_b) = endpoint("B");
        let members = vec![gm("A"), gm("B")];

        assert_eq!(a.apply_membership(&members), LeadershipChange::Promoted);
        assert_eq!(b.apply_membership(&members), LeadershipChange::Unchanged);

        let mut peer = peers_a.recv().await.unwrap();
        assert_eq!(peer.next().await.unwrap().kind, PING);
        assert!(a.is_primary());
        assert!(!b.is_primary());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(peers_b.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn failover_moves_the_link() {
        let (a, mut peers_a) = endpoint("A");
        let (b, mut peers_b) = endpoint("B");
        let both = vec![gm("A"), gm("B")];
        let _ = a.apply_membership(&both);
        let _ = b.apply_membership(&both);
        let _peer_a = peers_a.recv().await.unwrap();
        wait_state(&a, ConnectionState::Open).await;

        // A leaves; B's view changes and it takes over.
        let only_b = vec![gm("B")];
        assert_eq!(b.apply_membership(&only_b), LeadershipChange::Promoted);
        let mut peer_b = peers_b.recv().await.unwrap();
        assert_eq!(peer_b.next().await.unwrap().kind, PING);

        // A returns; B steps down with a normal close.
        assert_eq!(b.apply_membership(&both), LeadershipChange::Demoted);
        assert_eq!(peer_b.closed().await.map(|(code, _)| code), Some(close_code::NORMAL));
        wait_state(&b, ConnectionState::Closed).await;
    }

    #[tokio::test(start_paused = true)]
    async fn close_waits_for_the_normal_close() {
        let (a, mut peers) = endpoint("A");
        let _ = a.apply_membership(&[gm("A")]);
        let mut peer = peers.recv().await.unwrap();
        assert_eq!(peer.next().await.unwrap().kind, PING);

        assert!(a.close(Duration::from_secs(2)).await);
        assert_eq!(a.connection().state(), ConnectionState::Closed);
        assert_eq!(peer.closed().await.map(|(code, _)| code), Some(close_code::NORMAL));
    }

    #[tokio::test(start_paused = true)]
    async fn lower_tier_never_connects() {
        let (a, mut peers) = endpoint("A");
        let members = vec![Candidate::new("A", 1, true)];
        assert_eq!(a.apply_membership(&members), LeadershipChange::Unchanged);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(peers.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn presence_feed_drives_leadership() {
        let (a, mut peers) = endpoint("A");
        let a = Arc::new(a);
        let (tx, rx) = watch::channel(Vec::new());
        let cancel = CancellationToken::new();
        let task = {
            let a = a.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { a.run_presence(rx, cancel).await })
        };

        tx.send_replace(vec![gm("A")]);
        let mut peer = peers.recv().await.unwrap();
        assert_eq!(peer.next().await.unwrap().kind, PING);

        tx.send_replace(vec![gm("A"), gm("0-first")]);
        assert_eq!(peer.closed().await.map(|(code, _)| code), Some(close_code::NORMAL));

        cancel.cancel();
        task.await.unwrap();
        assert!(!a.is_primary());
    }

    #[tokio::test(start_paused = true)]
    async fn relay_requests_reach_entity_handlers() {
        let (a, mut peers) = endpoint("A");
        let store = Arc::new(MemoryStore::new());
        let a = a.with_documents(store.clone());
        let _ = a.apply_membership(&[gm("A")]);
        let mut peer = peers.recv().await.unwrap();
        assert_eq!(peer.next().await.unwrap().kind, PING);

        peer.push(
            &Envelope::new("create-entity")
                .with_correlation_id("relay-1-1")
                .with_field("entityType", "Item")
                .with_field("data", serde_json::json!({"name": "Rope"})),
        );
        let reply = peer.next().await.unwrap();
        assert_eq!(reply.kind, "entity-created");
        assert_eq!(reply.correlation_id.as_deref(), Some("relay-1-1"));
        assert_eq!(store.len(), 1);

        peer.push(&Envelope::new("launch-rockets").with_correlation_id("relay-2-1"));
        let reply = peer.next().await.unwrap();
        assert_eq!(reply.kind, "error");
        assert_eq!(reply.error.as_deref(), Some("Unknown message kind: launch-rockets"));
    }
}
