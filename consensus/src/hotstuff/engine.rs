/// Consensus Engine - drives one replica through the HotStuff protocol
///
/// The engine is a run-to-completion state machine: each input (`start`,
/// `on_message`, `on_data`, `on_tick`) is processed fully before the next
/// one, and its effects are queued as `Action`s for the caller to `drain`.
/// The only I/O it performs is through the block store.
///
/// It ties together:
/// - Validator (safety state: last vote, lock, high QC)
/// - BlockTree (pending headers on top of the store)
/// - Pacemaker (leader rotation, view timer, timeout collection)
/// - Vote collection and QC aggregation for the views this replica leads next

use crate::crypto::{hash_data, sign, verify, BLSSecretKey};
use crate::hotstuff::certificate::{aggregate_qc, verify_qc, verify_vote};
use crate::hotstuff::tree::BlockTree;
use crate::hotstuff::types::{
    Hash, Header, Message, MsgTo, Proposal, QuorumCertificate, Timeout, Vote,
};
use crate::hotstuff::Validator;
use crate::pacemaker::{Pacemaker, TimeoutCollector};
use crate::replica::ReplicaSet;
use crate::storage::{BlockStore, Pruner, RetentionPolicy, StorageError};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Maximum number of proposals (and certificates) held while their parent
/// (or block) is unknown
pub const ORPHAN_CAPACITY: usize = 64;

/// Uncertified messages more than this many views ahead of the current view
/// are dropped
pub const VIEW_HORIZON: u64 = 1024;

/// Consensus engine errors
///
/// Protocol violations are never reported here; they are dropped and
/// logged. Every error returned by the engine is fatal for the replica.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Safety violation: {0}")]
    SafetyViolation(String),

    #[error("Replica {0} is not in the replica set")]
    UnknownReplica(u64),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine parameters
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// This replica's index in `replicas`
    pub index: u64,
    pub replicas: ReplicaSet,
    /// Duration of one pacemaker tick
    pub interval: Duration,
    /// Cap on the timeout backoff exponent
    pub max_backoff: u32,
    /// How many committed payloads to keep
    pub retention: RetentionPolicy,
}

/// Effect requested by the engine
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Deliver a message to the listed replicas
    Send(MsgTo),
    /// Newly committed headers, oldest first
    Commit(Vec<Header>),
    /// This replica leads the view and needs a payload to propose
    Ready(u64),
}

/// Result of adding a vote
#[derive(Debug)]
enum VoteOutcome {
    Pending,
    Quorum(Vec<Vote>),
    Duplicate,
    Conflicting(Hash),
    Certified,
}

#[derive(Debug, Default)]
struct ViewVotes {
    by_voter: HashMap<u64, Hash>,
    by_block: HashMap<Hash, Vec<Vote>>,
    certified: bool,
}

/// Vote collector for aggregating votes into QCs
///
/// Keeps at most one vote per voter per view.
#[derive(Debug, Default)]
struct VoteCollector {
    views: BTreeMap<u64, ViewVotes>,
}

impl VoteCollector {
    /// Add a verified vote and check if its block reached a quorum
    fn add(&mut self, vote: Vote, quorum_size: usize) -> VoteOutcome {
        let entry = self.views.entry(vote.view).or_default();
        if entry.certified {
            return VoteOutcome::Certified;
        }
        match entry.by_voter.get(&vote.voter) {
            Some(hash) if *hash == vote.block_hash => return VoteOutcome::Duplicate,
            Some(hash) => return VoteOutcome::Conflicting(*hash),
            None => {}
        }

        entry.by_voter.insert(vote.voter, vote.block_hash);
        let votes = entry.by_block.entry(vote.block_hash).or_default();
        votes.push(vote);
        if votes.len() >= quorum_size {
            let quorum = votes.clone();
            entry.certified = true;
            return VoteOutcome::Quorum(quorum);
        }
        VoteOutcome::Pending
    }

    /// Drop every view below `view`
    fn prune(&mut self, view: u64) {
        self.views = self.views.split_off(&view);
    }
}

/// Proposals waiting for their parent and QCs waiting for their block
#[derive(Debug, Default)]
struct OrphanPool {
    proposals: BTreeMap<(u64, Hash), Proposal>,
    certificates: BTreeMap<(u64, Hash), QuorumCertificate>,
}

impl OrphanPool {
    fn insert_proposal(&mut self, proposal: Proposal) {
        let key = (proposal.header.view, proposal.header.hash());
        self.proposals.insert(key, proposal);
        // Evict the lowest view
        if self.proposals.len() > ORPHAN_CAPACITY {
            self.proposals.pop_first();
        }
    }

    fn insert_certificate(&mut self, qc: QuorumCertificate) {
        self.certificates.insert((qc.view, qc.block_hash), qc);
        if self.certificates.len() > ORPHAN_CAPACITY {
            self.certificates.pop_first();
        }
    }

    fn take_children(&mut self, parent: &Hash) -> Vec<Proposal> {
        let keys: Vec<_> = self
            .proposals
            .iter()
            .filter(|(_, proposal)| proposal.header.parent == *parent)
            .map(|(key, _)| *key)
            .collect();
        keys.iter()
            .filter_map(|key| self.proposals.remove(key))
            .collect()
    }

    fn take_certificates(&mut self, block: &Hash) -> Vec<QuorumCertificate> {
        let keys: Vec<_> = self
            .certificates
            .keys()
            .filter(|(_, hash)| hash == block)
            .copied()
            .collect();
        keys.iter()
            .filter_map(|key| self.certificates.remove(key))
            .collect()
    }

    /// Drop everything at or below `view`
    fn prune(&mut self, view: u64) {
        self.proposals.retain(|(v, _), _| *v > view);
        self.certificates.retain(|(v, _), _| *v > view);
    }

    fn len(&self) -> usize {
        self.proposals.len() + self.certificates.len()
    }
}

/// Main consensus engine
pub struct ConsensusEngine {
    replicas: ReplicaSet,

    /// Safety state and signing key
    validator: Validator,

    /// View clock and leader rotation
    pacemaker: Pacemaker,

    /// Pending headers backed by the store
    tree: BlockTree,

    votes: VoteCollector,
    timeouts: TimeoutCollector,
    orphans: OrphanPool,
    pruner: Pruner,

    /// First proposal seen per uncommitted view
    proposals: BTreeMap<u64, Hash>,

    /// Stored proposals for views this replica has not entered yet
    deferred: BTreeMap<u64, Hash>,

    /// Payload for this replica's next proposal
    pending_data: Option<Vec<u8>>,

    /// Last view this replica proposed in
    proposed_view: u64,

    /// Last view a Ready prompt was emitted for
    ready_view: u64,

    actions: Vec<Action>,
    started: bool,
}

impl ConsensusEngine {
    /// Create a new consensus engine over an initialized store
    ///
    /// Persisted vote state is restored, so a restarted replica never votes
    /// twice in a view.
    pub fn new(store: BlockStore, secret_key: BLSSecretKey, config: EngineConfig) -> Result<Self> {
        if !config.replicas.contains(config.index) {
            return Err(EngineError::UnknownReplica(config.index));
        }
        let genesis = store.genesis()?.ok_or(StorageError::NotInitialized)?;
        let state = store.load_state()?;
        let tree = BlockTree::new(store)?;
        let mut pacemaker = Pacemaker::new(config.replicas.len(), config.interval, config.max_backoff);

        let (validator, proposed_view) = match state {
            Some(state) => {
                info!(
                    view = state.view,
                    last_voted = state.last_voted,
                    "Restored consensus state"
                );
                pacemaker.advance_view(state.view, false);
                (Validator::restore(config.index, secret_key, &state), state.last_voted)
            }
            None => (Validator::new(config.index, secret_key, genesis.certificate), 0),
        };
        pacemaker.advance_view(validator.high_qc().view.saturating_add(1), false);

        Ok(Self {
            replicas: config.replicas,
            validator,
            pacemaker,
            tree,
            votes: VoteCollector::default(),
            timeouts: TimeoutCollector::new(),
            orphans: OrphanPool::default(),
            pruner: Pruner::with_policy(config.retention),
            proposals: BTreeMap::new(),
            deferred: BTreeMap::new(),
            pending_data: None,
            proposed_view,
            ready_view: 0,
            actions: Vec::new(),
            started: false,
        })
    }

    pub fn index(&self) -> u64 {
        self.validator.index()
    }

    pub fn current_view(&self) -> u64 {
        self.pacemaker.current_view()
    }

    pub fn leader(&self, view: u64) -> u64 {
        self.pacemaker.leader(view)
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    pub fn pacemaker(&self) -> &Pacemaker {
        &self.pacemaker
    }

    pub fn store(&self) -> &BlockStore {
        self.tree.store()
    }

    pub fn committed(&self) -> &Header {
        self.tree.committed()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Number of held orphan proposals and certificates
    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    /// Begin participating; the leader of the current view may propose
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        info!(
            index = self.index(),
            view = self.current_view(),
            "Consensus engine started"
        );
        self.propose_if_ready()
    }

    /// Take the actions queued since the last call
    pub fn drain(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    /// Process one protocol message
    pub fn on_message(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Proposal(proposal) => self.on_proposal(proposal)?,
            Message::Vote(vote) => self.on_vote(vote)?,
            Message::Certificate(qc) => self.on_certificate(qc)?,
            Message::Timeout(timeout) => self.on_timeout_message(timeout)?,
        }
        self.vote_if_ready()?;
        self.propose_if_ready()
    }

    /// Supply the payload for this replica's next proposal
    pub fn on_data(&mut self, data: Vec<u8>) -> Result<()> {
        self.pending_data = Some(data);
        self.propose_if_ready()
    }

    /// One pacemaker tick
    pub fn on_tick(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }
        if self.pacemaker.tick() {
            let view = self.pacemaker.on_timeout();
            warn!(
                view,
                backoff = self.pacemaker.timeout_count(),
                "View timed out"
            );
            self.timeouts.prune(view);
            self.send_timeout(view)?;
        }
        self.vote_if_ready()?;
        self.propose_if_ready()
    }

    fn others(&self) -> Vec<u64> {
        let index = self.index();
        self.replicas.indices().filter(|i| *i != index).collect()
    }

    /// Whether `qc` is identical to a certificate that was already verified
    fn qc_known(&self, qc: &QuorumCertificate) -> bool {
        qc == self.validator.high_qc()
            || qc == self.validator.locked_qc()
            || self.tree.certificate(&qc.block_hash) == Some(qc)
    }

    /// Whether `view` is too far ahead to be taken on an unverified claim
    fn beyond_horizon(&self, view: u64) -> bool {
        view > self.current_view().saturating_add(VIEW_HORIZON)
    }

    fn persist(&self) -> Result<()> {
        let state = self.validator.state(self.current_view());
        self.tree.store().save_state(&state)?;
        Ok(())
    }

    fn advance_view(&mut self, view: u64, progress: bool) {
        if self.pacemaker.advance_view(view, progress) {
            debug!(view, progress, "Entered view");
            self.timeouts.prune(view);
        }
    }

    fn propose_if_ready(&mut self) -> Result<()> {
        while self.try_propose()? {}
        Ok(())
    }

    /// Propose in the current view if this replica leads it and can
    ///
    /// Returns whether a proposal was made.
    fn try_propose(&mut self) -> Result<bool> {
        let view = self.current_view();
        if !self.started || self.leader(view) != self.index() || self.proposed_view >= view {
            return Ok(false);
        }

        let high_qc = self.validator.high_qc().clone();
        let quorum = self.replicas.quorum_size();
        if high_qc.view.saturating_add(1) != view && !self.timeouts.has_quorum(view, quorum) {
            return Ok(false);
        }
        if !self.tree.contains(&high_qc.block_hash)? {
            return Ok(false);
        }

        let Some(data) = self.pending_data.take() else {
            if self.ready_view < view {
                self.ready_view = view;
                debug!(view, "Waiting for payload");
                self.actions.push(Action::Ready(view));
            }
            return Ok(false);
        };

        let header = Header::new(view, high_qc.block_hash, hash_data(&data), Some(high_qc));
        let hash = header.hash();
        let signature = sign(self.validator.secret_key(), &Proposal::signing_bytes(&hash));
        let proposal = Proposal::new(header, data, signature);
        self.proposed_view = view;

        info!(view, block = %hash, "Proposing");
        let recipients = self.others();
        self.actions.push(Action::Send(MsgTo::new(
            recipients,
            Message::Proposal(proposal.clone()),
        )));
        self.on_proposal(proposal)?;
        Ok(true)
    }

    /// Handle a proposal and any orphans it unblocks
    fn on_proposal(&mut self, proposal: Proposal) -> Result<()> {
        let mut queue = VecDeque::from([proposal]);
        while let Some(proposal) = queue.pop_front() {
            if let Some(hash) = self.accept_proposal(proposal)? {
                for qc in self.orphans.take_certificates(&hash) {
                    self.process_certificate(qc)?;
                }
                queue.extend(self.orphans.take_children(&hash));
            }
        }
        Ok(())
    }

    /// Validate, store and possibly vote on a proposal
    ///
    /// Returns the header hash when the header was newly stored.
    fn accept_proposal(&mut self, proposal: Proposal) -> Result<Option<Hash>> {
        let header = &proposal.header;
        let view = header.view;
        let Some(justify) = header.justify.as_ref() else {
            debug!(view, "Dropping proposal without justify");
            return Ok(None);
        };
        if self.beyond_horizon(view) {
            debug!(view, current = self.current_view(), "Dropping proposal beyond the view horizon");
            return Ok(None);
        }
        let hash = header.hash();
        if self.tree.contains(&hash)? {
            return Ok(None);
        }

        let leader = self.leader(view);
        let signed = self.replicas.public_key(leader).is_some_and(|public_key| {
            verify(public_key, &Proposal::signing_bytes(&hash), &proposal.signature)
        });
        if !signed {
            debug!(view, leader, "Dropping proposal not signed by the leader");
            return Ok(None);
        }
        if hash_data(&proposal.data) != header.data_hash {
            debug!(view, block = %hash, "Dropping proposal with mismatched data");
            return Ok(None);
        }
        if header.parent != justify.block_hash || justify.view >= view {
            debug!(view, block = %hash, "Dropping proposal with inconsistent justify");
            return Ok(None);
        }

        let Some(parent) = self.tree.get(&header.parent)? else {
            debug!(view, block = %hash, "Holding proposal with unknown parent");
            self.orphans.insert_proposal(proposal);
            return Ok(None);
        };
        if parent.view != justify.view {
            debug!(view, block = %hash, "Dropping proposal with misdated justify");
            return Ok(None);
        }
        if !self.qc_known(justify) {
            if let Err(e) = verify_qc(justify, &self.replicas) {
                debug!(view, block = %hash, error = %e, "Dropping proposal with invalid justify");
                return Ok(None);
            }
        }

        let first = *self.proposals.entry(view).or_insert(hash);
        if first != hash {
            warn!(view, leader, first = %first, second = %hash, "Leader equivocated");
        }

        let justify = justify.clone();
        let Proposal { header, data, .. } = proposal;
        self.tree.insert(header.clone(), &data)?;
        debug!(view, block = %hash, "Stored proposal");

        self.process_certificate(justify)?;

        let current = self.current_view();
        if view < current {
            debug!(view, current, "Not voting on stale proposal");
        } else if view > current {
            debug!(view, current, block = %hash, "Deferring vote until the view is entered");
            self.deferred.entry(view).or_insert(hash);
        } else {
            self.try_vote(&header)?;
        }
        Ok(Some(hash))
    }

    /// Vote on a deferred proposal once its view is the current one
    fn vote_if_ready(&mut self) -> Result<()> {
        let current = self.current_view();
        self.deferred = self.deferred.split_off(&current);
        let Some(hash) = self.deferred.remove(&current) else {
            return Ok(());
        };
        if let Some(header) = self.tree.get(&hash)? {
            self.try_vote(&header)?;
        }
        Ok(())
    }

    /// Vote on a stored header of the current view if the safety rules allow
    fn try_vote(&mut self, header: &Header) -> Result<()> {
        let view = header.view;
        if !self.validator.safe_node(header, &self.tree)? {
            debug!(view, block = %header.hash(), "Proposal violates the lock");
            return Ok(());
        }
        let Some(vote) = self.validator.vote(header) else {
            return Ok(());
        };
        // Vote state hits the store before the vote leaves
        self.persist()?;
        let Some(next) = view.checked_add(1).map(|v| self.leader(v)) else {
            return Ok(());
        };
        debug!(view, block = %vote.block_hash, next, "Voted");
        if next == self.index() {
            self.collect_vote(vote)
        } else {
            self.actions
                .push(Action::Send(MsgTo::new(vec![next], Message::Vote(vote))));
            Ok(())
        }
    }

    /// Check a vote received from the network before collecting it
    fn on_vote(&mut self, vote: Vote) -> Result<()> {
        let view = vote.view;
        let voter = vote.voter;
        if self.beyond_horizon(view) {
            debug!(view, voter, "Dropping vote beyond the view horizon");
            return Ok(());
        }
        let addressed = view
            .checked_add(1)
            .is_some_and(|next| self.leader(next) == self.index());
        if !addressed {
            debug!(view, voter, "Dropping vote addressed to another leader");
            return Ok(());
        }
        if view < self.validator.high_qc().view {
            debug!(view, voter, "Dropping stale vote");
            return Ok(());
        }
        if let Err(e) = verify_vote(&vote, &self.replicas) {
            debug!(view, voter, error = %e, "Dropping invalid vote");
            return Ok(());
        }
        self.collect_vote(vote)
    }

    /// Add a verified vote as the leader of the following view
    fn collect_vote(&mut self, vote: Vote) -> Result<()> {
        let view = vote.view;
        let voter = vote.voter;
        let block_hash = vote.block_hash;
        let quorum = self.replicas.quorum_size();
        match self.votes.add(vote, quorum) {
            VoteOutcome::Quorum(votes) => match aggregate_qc(view, block_hash, &votes, quorum) {
                Ok(qc) => {
                    debug!(view, block = %block_hash, "Formed QC");
                    let recipients = self.others();
                    self.actions.push(Action::Send(MsgTo::new(
                        recipients,
                        Message::Certificate(qc.clone()),
                    )));
                    self.process_certificate(qc)?;
                }
                Err(e) => debug!(view, error = %e, "Failed to aggregate votes"),
            },
            VoteOutcome::Conflicting(first) => {
                warn!(view, voter, first = %first, second = %block_hash, "Replica voted twice");
            }
            VoteOutcome::Duplicate | VoteOutcome::Pending | VoteOutcome::Certified => {}
        }
        Ok(())
    }

    /// Handle a QC broadcast by the leader that formed it
    fn on_certificate(&mut self, qc: QuorumCertificate) -> Result<()> {
        if qc.view < self.validator.high_qc().view || self.qc_known(&qc) {
            return Ok(());
        }
        if let Err(e) = verify_qc(&qc, &self.replicas) {
            debug!(view = qc.view, error = %e, "Dropping invalid certificate");
            return Ok(());
        }
        self.process_certificate(qc)
    }

    /// Apply a verified QC: high QC, lock, commit rule, view advance
    fn process_certificate(&mut self, qc: QuorumCertificate) -> Result<()> {
        if !self.tree.contains(&qc.block_hash)? {
            debug!(view = qc.view, block = %qc.block_hash, "Holding certificate for unknown block");
            self.advance_view(qc.view.saturating_add(1), true);
            self.orphans.insert_certificate(qc);
            return Ok(());
        }

        self.tree.certify(&qc);
        let mut changed = false;
        if self.validator.update_high_qc(&qc) {
            self.tree.store().set_head(&qc.block_hash)?;
            changed = true;
        }
        if let Some(certified) = self.tree.get(&qc.block_hash)? {
            if let Some(justify) = certified.justify.as_ref() {
                changed |= self.validator.update_lock(justify);
            }
        }

        if let Some(block) = self.validator.check_commit(&qc, &self.tree)? {
            self.commit(block)?;
        }

        self.advance_view(qc.view.saturating_add(1), true);
        self.votes.prune(self.validator.high_qc().view);
        if changed {
            self.persist()?;
        }
        Ok(())
    }

    /// Finalize `block` and every uncommitted ancestor
    fn commit(&mut self, block: Header) -> Result<()> {
        if block.view <= self.tree.committed().view {
            return Ok(());
        }
        let hash = block.hash();
        let Some(branch) = self.tree.branch(&block)? else {
            error!(view = block.view, block = %hash, "Commit does not extend the committed chain");
            return Err(EngineError::SafetyViolation(format!(
                "block {} at view {} does not extend the committed head",
                hash, block.view
            )));
        };

        match self.tree.store().set_committed(&hash) {
            Ok(()) => {}
            Err(StorageError::ConflictingCommit { committed, proposed }) => {
                error!(%committed, %proposed, "Store refused commit");
                return Err(EngineError::SafetyViolation(format!(
                    "block {} conflicts with committed head {}",
                    proposed, committed
                )));
            }
            Err(e) => return Err(e.into()),
        }

        self.tree.prune(block.clone());
        self.orphans.prune(block.view);
        self.proposals = self.proposals.split_off(&block.view.saturating_add(1));
        info!(view = block.view, block = %hash, count = branch.len(), "Committed");
        self.actions.push(Action::Commit(branch));

        self.pruner.prune(self.tree.store(), &block)?;
        Ok(())
    }

    /// Handle another replica's timeout
    fn on_timeout_message(&mut self, timeout: Timeout) -> Result<()> {
        let view = timeout.view;
        let voter = timeout.voter;
        if view < self.current_view() {
            debug!(view, voter, "Dropping stale timeout");
            return Ok(());
        }
        if self.beyond_horizon(view) {
            debug!(view, voter, "Dropping timeout beyond the view horizon");
            return Ok(());
        }
        if self.timeouts.contains(view, voter) {
            return Ok(());
        }

        let signed = self.replicas.public_key(voter).is_some_and(|public_key| {
            verify(
                public_key,
                &Timeout::signing_bytes(view, &timeout.high_qc),
                &timeout.signature,
            )
        });
        if !signed {
            debug!(view, voter, "Dropping timeout with bad signature");
            return Ok(());
        }
        if timeout.high_qc.view >= view {
            debug!(view, voter, "Dropping timeout carrying a QC from its own view");
            return Ok(());
        }

        let carries_newer = timeout.high_qc.view > self.validator.high_qc().view;
        if carries_newer && !self.qc_known(&timeout.high_qc) {
            if let Err(e) = verify_qc(&timeout.high_qc, &self.replicas) {
                debug!(view, voter, error = %e, "Dropping timeout with invalid QC");
                return Ok(());
            }
        }

        let high_qc = timeout.high_qc.clone();
        let count = match self.timeouts.add(timeout) {
            Ok(count) => count,
            Err(e) => {
                debug!(error = %e, "Dropping timeout");
                return Ok(());
            }
        };
        if carries_newer {
            self.process_certificate(high_qc)?;
        }

        // f+1 replicas gave up on the views before `view`, so at least one
        // honest replica did: follow them
        if view > self.current_view() && count > self.replicas.max_faults() {
            info!(view, count, "Joining view change");
            self.advance_view(view, false);
            self.send_timeout(view)?;
        }
        if self.timeouts.has_quorum(view, self.replicas.quorum_size()) {
            self.advance_view(view, false);
        }
        Ok(())
    }

    /// Broadcast this replica's timeout for `view`
    fn send_timeout(&mut self, view: u64) -> Result<()> {
        let index = self.index();
        if self.timeouts.contains(view, index) {
            return Ok(());
        }

        let high_qc = self.validator.high_qc().clone();
        let signature = sign(
            self.validator.secret_key(),
            &Timeout::signing_bytes(view, &high_qc),
        );
        let timeout = Timeout::new(view, high_qc, index, signature);
        let recipients = self.others();
        self.actions.push(Action::Send(MsgTo::new(
            recipients,
            Message::Timeout(timeout.clone()),
        )));

        if let Err(e) = self.timeouts.add(timeout) {
            debug!(error = %e, "Own timeout already collected");
        }
        if self.timeouts.has_quorum(view, self.replicas.quorum_size()) {
            self.advance_view(view, false);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hotstuff::fixtures::Cluster;

    fn config(cluster: &Cluster, index: u64) -> EngineConfig {
        EngineConfig {
            index,
            replicas: cluster.replicas.clone(),
            interval: Duration::from_millis(10),
            max_backoff: 6,
            retention: RetentionPolicy::KeepAll,
        }
    }

    fn engine(cluster: &Cluster, index: u64) -> ConsensusEngine {
        ConsensusEngine::new(cluster.store(index), cluster.secret_key(index), config(cluster, index)).unwrap()
    }

    fn sends(actions: &[Action]) -> Vec<&MsgTo> {
        actions
            .iter()
            .filter_map(|action| match action {
                Action::Send(msg) => Some(msg),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_engine_creation() {
        let cluster = Cluster::new(4);
        let engine = engine(&cluster, 1);

        assert_eq!(engine.index(), 1);
        assert_eq!(engine.current_view(), 1);
        assert_eq!(engine.leader(1), 2);
        assert!(!engine.is_started());
        assert_eq!(engine.committed(), &cluster.genesis.header);
    }

    #[test]
    fn test_engine_unknown_index() {
        let cluster = Cluster::new(4);
        let result = ConsensusEngine::new(cluster.store(1), cluster.secret_key(1), config(&cluster, 9));
        assert!(matches!(result, Err(EngineError::UnknownReplica(9))));
    }

    #[test]
    fn test_engine_requires_genesis() {
        let cluster = Cluster::new(4);
        let result = ConsensusEngine::new(BlockStore::in_memory(), cluster.secret_key(1), config(&cluster, 1));
        assert!(matches!(
            result,
            Err(EngineError::StorageError(StorageError::NotInitialized))
        ));
    }

    #[test]
    fn test_leader_emits_ready_once() {
        let cluster = Cluster::new(4);
        let mut leader = engine(&cluster, 2);

        leader.start().unwrap();
        assert_eq!(leader.drain(), vec![Action::Ready(1)]);

        leader.on_tick().unwrap();
        assert!(leader.drain().is_empty());
    }

    #[test]
    fn test_non_leader_stays_quiet() {
        let cluster = Cluster::new(4);
        let mut replica = engine(&cluster, 1);

        replica.start().unwrap();
        replica.on_data(b"payload".to_vec()).unwrap();
        assert!(replica.drain().is_empty());
    }

    #[test]
    fn test_propose_broadcasts_and_votes() {
        let cluster = Cluster::new(4);
        let mut leader = engine(&cluster, 2);
        leader.start().unwrap();
        leader.drain();

        leader.on_data(b"payload".to_vec()).unwrap();
        let actions = leader.drain();
        let sends = sends(&actions);
        assert_eq!(sends.len(), 2);

        let Message::Proposal(proposal) = &sends[0].message else {
            panic!("expected proposal, got {:?}", sends[0].message);
        };
        assert_eq!(sends[0].recipients, vec![1, 3, 4]);
        assert_eq!(proposal.header.view, 1);
        assert_eq!(proposal.header.parent, cluster.genesis.hash());
        assert_eq!(proposal.header.justify.as_ref(), Some(&cluster.genesis.certificate));

        // Own vote goes to the leader of view 2
        assert_eq!(sends[1].recipients, vec![3]);
        assert!(matches!(sends[1].message, Message::Vote(ref v) if v.voter == 2 && v.view == 1));
        assert_eq!(leader.validator().last_voted(), 1);
        assert!(leader.store().contains(&proposal.header.hash()).unwrap());
    }

    #[test]
    fn test_vote_is_persisted() {
        let cluster = Cluster::new(4);
        let mut leader = engine(&cluster, 2);
        leader.start().unwrap();
        leader.on_data(b"payload".to_vec()).unwrap();

        let state = cluster.store(2).load_state().unwrap().unwrap();
        assert_eq!(state.last_voted, 1);
    }

    #[test]
    fn test_rejects_proposal_from_wrong_leader() {
        let cluster = Cluster::new(4);
        let mut replica = engine(&cluster, 1);
        replica.start().unwrap();

        let header = Header::new(
            1,
            cluster.genesis.hash(),
            hash_data(b"x"),
            Some(cluster.genesis.certificate.clone()),
        );
        // Replica 3 does not lead view 1
        let signature = sign(&cluster.secret_key(3), &Proposal::signing_bytes(&header.hash()));
        let proposal = Proposal::new(header.clone(), b"x".to_vec(), signature);

        replica.on_message(Message::Proposal(proposal)).unwrap();
        assert!(replica.drain().is_empty());
        assert!(!replica.store().contains(&header.hash()).unwrap());
        assert_eq!(replica.validator().last_voted(), 0);
    }

    #[test]
    fn test_rejects_proposal_with_wrong_data() {
        let cluster = Cluster::new(4);
        let mut replica = engine(&cluster, 1);
        replica.start().unwrap();

        let header = Header::new(
            1,
            cluster.genesis.hash(),
            hash_data(b"x"),
            Some(cluster.genesis.certificate.clone()),
        );
        let signature = sign(&cluster.secret_key(2), &Proposal::signing_bytes(&header.hash()));
        let proposal = Proposal::new(header.clone(), b"not x".to_vec(), signature);

        replica.on_message(Message::Proposal(proposal)).unwrap();
        assert!(replica.drain().is_empty());
        assert!(!replica.store().contains(&header.hash()).unwrap());
    }

    #[test]
    fn test_tick_timeout_broadcasts() {
        let cluster = Cluster::new(4);
        let mut replica = engine(&cluster, 1);
        replica.start().unwrap();

        replica.on_tick().unwrap();
        assert!(replica.drain().is_empty());
        replica.on_tick().unwrap();

        let actions = replica.drain();
        let sends = sends(&actions);
        assert_eq!(sends.len(), 1);
        let Message::Timeout(timeout) = &sends[0].message else {
            panic!("expected timeout");
        };
        assert_eq!(timeout.view, 2);
        assert_eq!(timeout.high_qc, cluster.genesis.certificate);
        assert_eq!(replica.current_view(), 2);
    }

    /// Proposal extending `parent`, signed by `leader`
    fn proposal_by(cluster: &Cluster, leader: u64, view: u64, parent: &Header, justify: QuorumCertificate) -> Proposal {
        let data = view.to_le_bytes();
        let header = Header::new(view, parent.hash(), hash_data(&data), Some(justify));
        let signature = sign(&cluster.secret_key(leader), &Proposal::signing_bytes(&header.hash()));
        Proposal::new(header, data.to_vec(), signature)
    }

    fn votes_to(actions: &[Action]) -> Vec<(u64, u64)> {
        sends(actions)
            .into_iter()
            .filter_map(|msg| match &msg.message {
                Message::Vote(vote) => Some((msg.recipients[0], vote.view)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_max_view_messages_are_dropped() {
        let cluster = Cluster::new(4);
        let mut replica = engine(&cluster, 1);
        replica.start().unwrap();
        let genesis = cluster.genesis.header.clone();
        let forged = sign(&cluster.secret_key(2), b"forged");

        replica
            .on_message(Message::Vote(Vote::new(u64::MAX, Hash::zero(), 2, forged.clone())))
            .unwrap();
        replica
            .on_message(Message::Timeout(Timeout::new(
                u64::MAX,
                cluster.genesis.certificate.clone(),
                2,
                forged,
            )))
            .unwrap();
        let proposal = proposal_by(&cluster, 4, u64::MAX, &genesis, cluster.genesis.certificate.clone());
        replica.on_message(Message::Proposal(proposal.clone())).unwrap();

        assert!(replica.drain().is_empty());
        assert_eq!(replica.current_view(), 1);
        assert!(!replica.store().contains(&proposal.header.hash()).unwrap());
    }

    #[test]
    fn test_vote_claiming_own_index_is_verified() {
        // Replica 3 leads view 2 and collects the votes for view 1
        let cluster = Cluster::new(4);
        let mut leader = engine(&cluster, 3);
        leader.start().unwrap();
        leader.drain();

        let block = proposal_by(&cluster, 2, 1, &cluster.genesis.header, cluster.genesis.certificate.clone());
        let hash = block.header.hash();
        let forged = crate::hotstuff::certificate::sign_vote(&cluster.secret_key(4), 1, &hash);
        leader.on_message(Message::Vote(Vote::new(1, hash, 3, forged))).unwrap();
        for voter in [1, 2] {
            let signature = crate::hotstuff::certificate::sign_vote(&cluster.secret_key(voter), 1, &hash);
            leader.on_message(Message::Vote(Vote::new(1, hash, voter, signature))).unwrap();
        }
        assert!(leader.drain().is_empty());
        assert_eq!(leader.validator().high_qc(), &cluster.genesis.certificate);

        // Its own vote completes the quorum once it sees the proposal
        leader.on_message(Message::Proposal(block)).unwrap();
        let actions = leader.drain();
        let certificates: Vec<&QuorumCertificate> = sends(&actions)
            .into_iter()
            .filter_map(|msg| match &msg.message {
                Message::Certificate(qc) => Some(qc),
                _ => None,
            })
            .collect();
        assert_eq!(certificates.len(), 1);
        assert_eq!(certificates[0].voters, vec![1, 2, 3]);
        assert!(verify_qc(certificates[0], &cluster.replicas).is_ok());
    }

    #[test]
    fn test_future_proposal_does_not_block_voting() {
        let cluster = Cluster::new(4);
        let mut replica = engine(&cluster, 1);
        replica.start().unwrap();
        let genesis = &cluster.genesis;

        // Replica 4 leads views 3, 7, ..., 103, ..., 4_000_003
        let ahead = proposal_by(&cluster, 4, 103, &genesis.header, genesis.certificate.clone());
        let beyond = proposal_by(&cluster, 4, 4_000_003, &genesis.header, genesis.certificate.clone());
        replica.on_message(Message::Proposal(ahead.clone())).unwrap();
        replica.on_message(Message::Proposal(beyond.clone())).unwrap();

        assert!(replica.drain().is_empty());
        assert_eq!(replica.validator().last_voted(), 0);
        assert!(replica.store().contains(&ahead.header.hash()).unwrap());
        assert!(!replica.store().contains(&beyond.header.hash()).unwrap());

        let honest = proposal_by(&cluster, 2, 1, &genesis.header, genesis.certificate.clone());
        replica.on_message(Message::Proposal(honest)).unwrap();
        assert_eq!(votes_to(&replica.drain()), vec![(3, 1)]);
        assert_eq!(replica.validator().last_voted(), 1);
    }

    #[test]
    fn test_deferred_proposal_voted_on_entering_view() {
        let cluster = Cluster::new(4);
        let mut replica = engine(&cluster, 1);
        replica.start().unwrap();
        let genesis = &cluster.genesis;

        // View-change proposal for view 2 arrives before replica 1 gives up on view 1
        let proposal = proposal_by(&cluster, 3, 2, &genesis.header, genesis.certificate.clone());
        replica.on_message(Message::Proposal(proposal)).unwrap();
        assert!(replica.drain().is_empty());
        assert_eq!(replica.validator().last_voted(), 0);

        replica.on_tick().unwrap();
        replica.on_tick().unwrap();
        assert_eq!(replica.current_view(), 2);
        assert_eq!(votes_to(&replica.drain()), vec![(4, 2)]);
        assert_eq!(replica.validator().last_voted(), 2);
    }

    #[test]
    fn test_known_certificate_matches_exactly() {
        let cluster = Cluster::new(4);
        let mut replica = engine(&cluster, 1);
        replica.start().unwrap();
        let genesis = &cluster.genesis;

        let first = proposal_by(&cluster, 2, 1, &genesis.header, genesis.certificate.clone());
        let certificate = cluster.certify(&first.header);
        replica.on_message(Message::Proposal(first.clone())).unwrap();
        replica.on_message(Message::Certificate(certificate.clone())).unwrap();
        replica.drain();

        // Same view and block, signatures from the wrong keys
        let signatures = (0..3)
            .map(|_| crate::hotstuff::certificate::sign_vote(&cluster.secret_key(4), 1, &first.header.hash()))
            .collect();
        let forged = QuorumCertificate::new(1, first.header.hash(), vec![1, 2, 3], signatures);
        assert!(replica.qc_known(&certificate));
        assert!(!replica.qc_known(&forged));

        let second = proposal_by(&cluster, 3, 2, &first.header, forged);
        replica.on_message(Message::Proposal(second.clone())).unwrap();
        assert!(!replica.store().contains(&second.header.hash()).unwrap());
        assert_eq!(replica.validator().last_voted(), 1);
    }

    #[test]
    fn test_vote_collector_outcomes() {
        let cluster = Cluster::new(4);
        let block = hash_data(b"block");
        let other = hash_data(b"other");
        let vote = |voter: u64, hash: Hash| {
            let sig = crate::hotstuff::certificate::sign_vote(&cluster.secret_key(voter), 1, &hash);
            Vote::new(1, hash, voter, sig)
        };

        let mut collector = VoteCollector::default();
        assert!(matches!(collector.add(vote(1, block), 3), VoteOutcome::Pending));
        assert!(matches!(collector.add(vote(1, block), 3), VoteOutcome::Duplicate));
        assert!(matches!(collector.add(vote(1, other), 3), VoteOutcome::Conflicting(h) if h == block));
        assert!(matches!(collector.add(vote(2, block), 3), VoteOutcome::Pending));
        assert!(matches!(collector.add(vote(3, block), 3), VoteOutcome::Quorum(ref v) if v.len() == 3));
        assert!(matches!(collector.add(vote(4, block), 3), VoteOutcome::Certified));

        collector.prune(2);
        assert!(collector.views.is_empty());
    }

    #[test]
    fn test_orphan_pool_evicts_lowest_view() {
        let cluster = Cluster::new(4);
        let mut pool = OrphanPool::default();
        let parent = hash_data(b"parent");
        for view in 1..=(ORPHAN_CAPACITY as u64 + 1) {
            let header = Header::new(view, parent, Hash::zero(), None);
            let signature = sign(&cluster.secret_key(1), b"orphan");
            pool.insert_proposal(Proposal::new(header, vec![], signature));
        }

        assert_eq!(pool.len(), ORPHAN_CAPACITY);
        let children = pool.take_children(&parent);
        assert_eq!(children.len(), ORPHAN_CAPACITY);
        assert_eq!(children[0].header.view, 2);
        assert_eq!(pool.len(), 0);
    }
}
