//! Loopback transport between nodes of one process.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::coord::{
    encode_envelope, Envelope, LogId, Network, NodeIdentity, NodeRequest, NodeResponse,
    SessionOperationId, SubmitRequest, SubmitResponse,
};
use crate::oplog::OpLogEntry;

/// Frames delivered to one node, in send order per sender.
pub type Inbox = mpsc::UnboundedReceiver<Vec<u8>>;

/// Delivery counters of a hub.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub delivered: u64,
    pub dropped: u64,
}

struct Faults {
    isolated: HashSet<NodeIdentity>,
    drop_rate: f64,
    rng: SmallRng,
}

struct HubInner {
    nodes: Mutex<HashMap<NodeIdentity, mpsc::UnboundedSender<Vec<u8>>>>,
    faults: Mutex<Faults>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Router shared by every node of a local cluster.
#[derive(Clone)]
pub struct LocalHub {
    inner: Arc<HubInner>,
}

impl LocalHub {
    /// `seed` drives the random drops.
    pub fn new(seed: u64) -> Self {
        Self {
            inner: Arc::new(HubInner {
                nodes: Mutex::new(HashMap::new()),
                faults: Mutex::new(Faults {
                    isolated: HashSet::new(),
                    drop_rate: 0.0,
                    rng: SmallRng::seed_from_u64(seed),
                }),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Attach a node and return its sending endpoint and inbox.
    pub fn register(&self, identity: NodeIdentity) -> anyhow::Result<(LocalEndpoint, Inbox)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut nodes = self
            .inner
            .nodes
            .lock()
            .map_err(|_| anyhow::anyhow!("hub lock poisoned"))?;
        anyhow::ensure!(
            !nodes.contains_key(&identity),
            "node {identity} is already registered"
        );
        nodes.insert(identity.clone(), tx);
        let endpoint = LocalEndpoint {
            identity,
            hub: self.clone(),
        };
        Ok((endpoint, rx))
    }

    pub fn unregister(&self, identity: &NodeIdentity) {
        if let Ok(mut nodes) = self.inner.nodes.lock() {
            nodes.remove(identity);
        }
    }

    /// Drop all traffic to and from `node` until `heal`.
    pub fn isolate(&self, node: &NodeIdentity) {
        self.update_faults(|faults| {
            faults.isolated.insert(node.clone());
        });
        tracing::info!(node = %node, "node isolated");
    }

    pub fn heal(&self, node: &NodeIdentity) {
        self.update_faults(|faults| {
            faults.isolated.remove(node);
        });
        tracing::info!(node = %node, "node healed");
    }

    /// Probability in `[0, 1]` that a frame between two different nodes is
    /// lost.
    pub fn set_drop_rate(&self, rate: f64) {
        self.update_faults(|faults| faults.drop_rate = rate.clamp(0.0, 1.0));
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
        }
    }

    fn update_faults(&self, f: impl FnOnce(&mut Faults)) {
        match self.inner.faults.lock() {
            Ok(mut faults) => f(&mut faults),
            Err(_) => tracing::warn!("hub fault lock poisoned"),
        }
    }

    /// Whether a frame from `from` to `to` is lost. Self-delivery never is.
    fn should_drop(&self, from: &NodeIdentity, to: &NodeIdentity) -> bool {
        if from == to {
            return false;
        }
        let Ok(mut faults) = self.inner.faults.lock() else {
            return false;
        };
        if faults.isolated.contains(from) || faults.isolated.contains(to) {
            return true;
        }
        let rate = faults.drop_rate;
        rate > 0.0 && faults.rng.gen_bool(rate)
    }

    fn deliver(&self, from: &NodeIdentity, to: &NodeIdentity, frame: Vec<u8>) {
        if self.should_drop(from, to) {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(from = %from, to = %to, "frame dropped");
            return;
        }
        let sender = match self.inner.nodes.lock() {
            Ok(nodes) => nodes.get(to).cloned(),
            Err(_) => None,
        };
        match sender {
            Some(sender) if sender.send(frame).is_ok() => {
                self.inner.delivered.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(from = %from, to = %to, "no such node");
            }
        }
    }
}

/// Sending side of one registered node.
#[derive(Clone)]
pub struct LocalEndpoint {
    identity: NodeIdentity,
    hub: LocalHub,
}

impl LocalEndpoint {
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }
}

impl Network for LocalEndpoint {
    fn submit(
        &self,
        to: &NodeIdentity,
        database: &str,
        operation_id: &SessionOperationId,
        request: &SubmitRequest,
    ) {
        let frame = encode_envelope(&Envelope::Submit {
            database: database.to_string(),
            from: self.identity.clone(),
            operation_id: operation_id.clone(),
            request: request.clone(),
        });
        self.hub.deliver(&self.identity, to, frame);
    }

    fn send_request(
        &self,
        to: &BTreeSet<NodeIdentity>,
        database: &str,
        log_id: &LogId,
        request: &NodeRequest,
    ) {
        let frame = encode_envelope(&Envelope::Request {
            database: database.to_string(),
            from: self.identity.clone(),
            log_id: *log_id,
            request: request.clone(),
        });
        for member in to {
            self.hub.deliver(&self.identity, member, frame.clone());
        }
    }

    fn send_response(
        &self,
        to: &NodeIdentity,
        database: &str,
        log_id: &LogId,
        response: &NodeResponse,
    ) {
        let frame = encode_envelope(&Envelope::Response {
            database: database.to_string(),
            from: self.identity.clone(),
            log_id: *log_id,
            response: response.clone(),
        });
        self.hub.deliver(&self.identity, to, frame);
    }

    fn reply(
        &self,
        to: &NodeIdentity,
        database: &str,
        operation_id: &SessionOperationId,
        response: &SubmitResponse,
    ) {
        let frame = encode_envelope(&Envelope::Reply {
            database: database.to_string(),
            operation_id: operation_id.clone(),
            response: response.clone(),
        });
        self.hub.deliver(&self.identity, to, frame);
    }

    fn catch_up(&self, to: &NodeIdentity, database: &str, entries: &[OpLogEntry]) {
        let frame = encode_envelope(&Envelope::CatchUp {
            database: database.to_string(),
            from: self.identity.clone(),
            entries: entries.to_vec(),
        });
        self.hub.deliver(&self.identity, to, frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::decode_envelope;

    fn node(name: &str, id: u64) -> NodeIdentity {
        NodeIdentity::new(name, id)
    }

    fn reply_to(endpoint: &LocalEndpoint, to: &NodeIdentity, counter: u64) {
        endpoint.reply(
            to,
            "db",
            &SessionOperationId::new("one", counter),
            &SubmitResponse::Error("x".into()),
        );
    }

    #[tokio::test]
    async fn frames_arrive_in_order() {
        let hub = LocalHub::new(1);
        let (one, _one_inbox) = hub.register(node("one", 1)).expect("register one");
        let (_two, mut two_inbox) = hub.register(node("two", 2)).expect("register two");
        assert!(hub.register(node("two", 2)).is_err());

        for counter in 0..3 {
            reply_to(&one, &node("two", 2), counter);
        }
        for counter in 0..3 {
            let frame = two_inbox.recv().await.expect("frame");
            match decode_envelope(&frame).expect("decode") {
                Envelope::Reply { operation_id, .. } => assert_eq!(operation_id.counter, counter),
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        assert_eq!(hub.stats().delivered, 3);
    }

    #[tokio::test]
    async fn isolation_drops_both_directions() {
        let hub = LocalHub::new(1);
        let (one, mut one_inbox) = hub.register(node("one", 1)).expect("register one");
        let (two, mut two_inbox) = hub.register(node("two", 2)).expect("register two");

        hub.isolate(&node("two", 2));
        reply_to(&one, &node("two", 2), 1);
        reply_to(&two, &node("one", 1), 2);
        // Self-delivery is unaffected.
        reply_to(&two, &node("two", 2), 3);
        assert_eq!(hub.stats(), HubStats { delivered: 1, dropped: 2 });
        assert!(one_inbox.try_recv().is_err());
        assert!(two_inbox.try_recv().is_ok());

        hub.heal(&node("two", 2));
        reply_to(&one, &node("two", 2), 4);
        assert!(two_inbox.try_recv().is_ok());
    }

    #[tokio::test]
    async fn full_drop_rate_loses_everything() {
        let hub = LocalHub::new(7);
        let (one, _one_inbox) = hub.register(node("one", 1)).expect("register one");
        let (_two, mut two_inbox) = hub.register(node("two", 2)).expect("register two");
        hub.set_drop_rate(1.0);
        for counter in 0..10 {
            reply_to(&one, &node("two", 2), counter);
        }
        assert!(two_inbox.try_recv().is_err());
        assert_eq!(hub.stats().dropped, 10);
    }
}
