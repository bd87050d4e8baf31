//! In-flight request state and the handler contract driven by the coordinator.

use std::collections::{BTreeMap, BTreeSet};

use tokio::time::Instant;

use super::coordinator::CoordinatorCore;
use super::messages::NodeResponse;
use super::types::{LogId, NodeIdentity, Submission};

/// Bookkeeping for one request round, keyed by its log id.
///
/// `involved_members` is the membership snapshot taken when the round was
/// sent; `responses` only ever holds keys from that set, one live response per
/// member.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub log_id: LogId,
    pub submission: Submission,
    pub involved_members: BTreeSet<NodeIdentity>,
    pub responses: BTreeMap<NodeIdentity, NodeResponse>,
    pub created_at: Instant,
    pub deadline: Instant,
}

impl RequestContext {
    /// Majority of the involved members.
    pub fn quorum(&self) -> usize {
        (self.involved_members.len() / 2) + 1
    }

    /// Every involved member answered.
    pub fn is_complete(&self) -> bool {
        self.responses.len() == self.involved_members.len()
    }

    /// Involved members that have not answered yet.
    pub fn pending_members(&self) -> Vec<NodeIdentity> {
        self.involved_members
            .iter()
            .filter(|member| !self.responses.contains_key(*member))
            .cloned()
            .collect()
    }
}

/// Protocol logic attached to one request round.
///
/// Both callbacks run on the coordinator task with exclusive access to the
/// core, so they may start further rounds or reply directly. Returning
/// `Ok(true)` retires the context; `Ok(false)` keeps it waiting. An error
/// fails the whole operation with an error reply.
pub trait ResponseHandler: Send + 'static {
    fn receive(
        &mut self,
        core: &mut CoordinatorCore,
        context: &RequestContext,
        member: &NodeIdentity,
        response: &NodeResponse,
    ) -> anyhow::Result<bool>;

    /// Called on every sweep once the deadline has passed.
    fn timeout(
        &mut self,
        core: &mut CoordinatorCore,
        context: &RequestContext,
    ) -> anyhow::Result<bool>;
}
