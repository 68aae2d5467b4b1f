//! View-change hooks: blame accounting, status broadcasting, and the
//! view-transition timers.
//!
//! The minimum machinery around the core: a replica blames the current view
//! when its leader stalls, a quorum of blames justifies announcing the
//! transition and cancelling the optimistic commit timers, and the
//! view-transition timer bounds the wait before the next view starts.
//! Leader rotation itself lives behind the pacemaker.

use crate::chain::ChainState;
use crate::ConsensusConfig;
use std::collections::BTreeMap;
use tracing::{debug, info, trace};
use trellis_core::{Action, OutboundMessage, TimerId};
use trellis_messages::{Blame, BlameNotify, NewView, Status};
use trellis_types::{KeyPair, ReplicaId, Signature};

/// Per-view blame and transition state.
pub struct ViewState {
    id: ReplicaId,
    key: KeyPair,
    nmajority: usize,
    config: ConsensusConfig,
    view: u64,
    /// Blames collected for the current view.
    blames: BTreeMap<ReplicaId, Signature>,
    /// Whether we broadcast our own blame this view.
    blamed: bool,
    /// Whether the transition for this view has been announced.
    transitioning: bool,
}

impl ViewState {
    /// Create view state for view 0.
    pub fn new(id: ReplicaId, key: KeyPair, nmajority: usize, config: ConsensusConfig) -> Self {
        Self {
            id,
            key,
            nmajority,
            config,
            view: 0,
            blames: BTreeMap::new(),
            blamed: false,
            transitioning: false,
        }
    }

    /// The current view number.
    pub fn view(&self) -> u64 {
        self.view
    }

    /// Whether a view transition is in flight.
    pub fn is_transitioning(&self) -> bool {
        self.transitioning
    }

    /// Timers to arm at startup.
    pub fn startup_actions(&self) -> Vec<Action> {
        vec![
            Action::SetTimer {
                id: TimerId::Blame,
                duration: self.config.blame_timeout,
            },
            Action::SetTimer {
                id: TimerId::Status,
                duration: self.config.status_interval,
            },
        ]
    }

    /// Progress was observed (the high QC advanced); give the leader a
    /// fresh blame window.
    pub fn on_progress(&mut self) -> Vec<Action> {
        if self.transitioning {
            return Vec::new();
        }
        vec![Action::SetTimer {
            id: TimerId::Blame,
            duration: self.config.blame_timeout,
        }]
    }

    /// The blame timer expired: complain about the current leader.
    pub fn on_blame_timeout(&mut self) -> Vec<Action> {
        if self.blamed || self.transitioning {
            return Vec::new();
        }
        self.blamed = true;
        let signature = self.key.sign(&Blame::signing_bytes(self.view));
        let blame = Blame {
            replica: self.id,
            view: self.view,
            signature,
        };
        info!(replica = %self.id, view = self.view, "blaming current leader");
        self.blames.insert(self.id, blame.signature);
        let mut actions = vec![Action::Broadcast {
            message: OutboundMessage::Blame(blame),
        }];
        actions.extend(self.maybe_begin_transition());
        actions
    }

    /// Count a verified blame from a peer.
    pub fn on_blame(&mut self, blame: &Blame) -> Vec<Action> {
        if blame.view != self.view {
            trace!(view = blame.view, current = self.view, "blame for another view");
            return Vec::new();
        }
        if self.blames.insert(blame.replica, blame.signature).is_some() {
            debug!(replica = %blame.replica, "duplicate blame");
            return Vec::new();
        }
        self.maybe_begin_transition()
    }

    /// A verified blame-notify short-circuits local blame counting.
    pub fn on_blame_notify(&mut self, notify: &BlameNotify) -> Vec<Action> {
        if notify.view != self.view || self.transitioning {
            return Vec::new();
        }
        for blame in &notify.blames {
            self.blames.insert(blame.replica, blame.signature);
        }
        self.maybe_begin_transition()
    }

    /// The view-transition timer expired: enter the next view and announce
    /// our highest QC to its leader.
    pub fn on_view_transition_timeout(
        &mut self,
        chain: &ChainState,
        next_leader: ReplicaId,
    ) -> Vec<Action> {
        if !self.transitioning {
            return Vec::new();
        }
        self.view += 1;
        self.blames.clear();
        self.blamed = false;
        self.transitioning = false;
        info!(replica = %self.id, view = self.view, leader = %next_leader, "entering new view");

        let mut actions = vec![Action::SetTimer {
            id: TimerId::Blame,
            duration: self.config.blame_timeout,
        }];
        if next_leader == self.id {
            // We lead the new view; no need to tell ourselves.
            return actions;
        }
        actions.push(Action::Send {
            to: next_leader,
            message: OutboundMessage::NewView(NewView(self.signed_status(chain))),
        });
        actions
    }

    /// The status timer expired: report our highest QC to the proposer and
    /// re-arm.
    pub fn on_status_timeout(&mut self, chain: &ChainState, proposer: ReplicaId) -> Vec<Action> {
        let mut actions = vec![Action::SetTimer {
            id: TimerId::Status,
            duration: self.config.status_interval,
        }];
        if proposer != self.id {
            let status = self.signed_status(chain);
            actions.push(Action::Send {
                to: proposer,
                message: OutboundMessage::Status(status),
            });
        }
        actions
    }

    fn signed_status(&self, chain: &ChainState) -> Status {
        let hqc = chain.hqc().clone();
        let signature = self
            .key
            .sign(&Status::signing_bytes(self.view, hqc.block_hash));
        Status {
            replica: self.id,
            view: self.view,
            hqc,
            signature,
        }
    }

    fn maybe_begin_transition(&mut self) -> Vec<Action> {
        if self.transitioning || self.blames.len() < self.nmajority {
            return Vec::new();
        }
        self.transitioning = true;
        info!(replica = %self.id, view = self.view, blames = self.blames.len(), "blame quorum, starting view transition");
        let blames = self
            .blames
            .iter()
            .map(|(&replica, &signature)| Blame {
                replica,
                view: self.view,
                signature,
            })
            .collect();
        vec![
            Action::Broadcast {
                message: OutboundMessage::BlameNotify(BlameNotify {
                    view: self.view,
                    blames,
                }),
            },
            Action::CancelCommitTimers,
            Action::SetTimer {
                id: TimerId::ViewTransition,
                duration: self.config.view_transition_timeout,
            },
        ]
    }
}

impl std::fmt::Debug for ViewState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewState")
            .field("replica", &self.id)
            .field("view", &self.view)
            .field("blames", &self.blames.len())
            .field("transitioning", &self.transitioning)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_types::{ReplicaConfig, ReplicaInfo};

    fn keys(n: u64) -> Vec<KeyPair> {
        (0..n).map(|i| KeyPair::from_seed(&[i as u8 + 1; 32])).collect()
    }

    fn new_view_state() -> (ViewState, Vec<KeyPair>) {
        let keys = keys(4);
        let state = ViewState::new(
            ReplicaId(0),
            keys[0].clone(),
            3,
            ConsensusConfig::default(),
        );
        (state, keys)
    }

    fn blame_from(keys: &[KeyPair], replica: u64, view: u64) -> Blame {
        Blame {
            replica: ReplicaId(replica),
            view,
            signature: keys[replica as usize].sign(&Blame::signing_bytes(view)),
        }
    }

    fn chain() -> ChainState {
        let mut config = ReplicaConfig::new(1);
        let ks = keys(4);
        for (i, key) in ks.iter().enumerate() {
            config
                .add_replica(ReplicaInfo {
                    id: ReplicaId(i as u64),
                    peer_addr: format!("127.0.0.1:{}", 9300 + i).parse().unwrap(),
                    public_key: key.public_key(),
                })
                .unwrap();
        }
        ChainState::new(ReplicaId(0), ks[0].clone(), config, ConsensusConfig::default())
    }

    #[test]
    fn blame_quorum_triggers_transition() {
        let (mut state, keys) = new_view_state();
        let actions = state.on_blame_timeout();
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Broadcast { message: OutboundMessage::Blame(_) })));
        assert!(!state.is_transitioning(), "one blame is not a quorum");

        state.on_blame(&blame_from(&keys, 1, 0));
        let actions = state.on_blame(&blame_from(&keys, 2, 0));
        assert!(state.is_transitioning());
        assert!(actions.iter().any(|a| matches!(a, Action::CancelCommitTimers)));
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::SetTimer {
                id: TimerId::ViewTransition,
                ..
            }
        )));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Broadcast { message: OutboundMessage::BlameNotify(_) })));
    }

    #[test]
    fn blames_for_other_views_are_ignored() {
        let (mut state, keys) = new_view_state();
        state.on_blame(&blame_from(&keys, 1, 3));
        state.on_blame(&blame_from(&keys, 2, 3));
        state.on_blame(&blame_from(&keys, 3, 3));
        assert!(!state.is_transitioning());
    }

    #[test]
    fn duplicate_blames_count_once() {
        let (mut state, keys) = new_view_state();
        state.on_blame(&blame_from(&keys, 1, 0));
        state.on_blame(&blame_from(&keys, 1, 0));
        state.on_blame(&blame_from(&keys, 1, 0));
        assert!(!state.is_transitioning());
    }

    #[test]
    fn transition_advances_view_and_resets_blames() {
        let (mut state, keys) = new_view_state();
        let chain = chain();
        state.on_blame_timeout();
        state.on_blame(&blame_from(&keys, 1, 0));
        state.on_blame(&blame_from(&keys, 2, 0));
        assert!(state.is_transitioning());

        let actions = state.on_view_transition_timeout(&chain, ReplicaId(1));
        assert_eq!(state.view(), 1);
        assert!(!state.is_transitioning());
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Send { to: ReplicaId(1), message: OutboundMessage::NewView(_) })));
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::SetTimer {
                id: TimerId::Blame,
                ..
            }
        )));
    }

    #[test]
    fn blame_notify_short_circuits_counting() {
        let (mut state, keys) = new_view_state();
        let notify = BlameNotify {
            view: 0,
            blames: vec![
                blame_from(&keys, 1, 0),
                blame_from(&keys, 2, 0),
                blame_from(&keys, 3, 0),
            ],
        };
        let actions = state.on_blame_notify(&notify);
        assert!(state.is_transitioning());
        assert!(actions.iter().any(|a| matches!(a, Action::CancelCommitTimers)));
    }

    #[test]
    fn status_timeout_reports_to_proposer_and_rearms() {
        let (mut state, _) = new_view_state();
        let chain = chain();
        let actions = state.on_status_timeout(&chain, ReplicaId(2));
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::SetTimer {
                id: TimerId::Status,
                ..
            }
        )));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Send { to: ReplicaId(2), message: OutboundMessage::Status(_) })));

        // When we are the proposer there is nothing to send.
        let actions = state.on_status_timeout(&chain, ReplicaId(0));
        assert_eq!(actions.len(), 1);
    }

    #[test]
    fn no_progress_reset_during_transition() {
        let (mut state, keys) = new_view_state();
        state.on_blame_timeout();
        state.on_blame(&blame_from(&keys, 1, 0));
        state.on_blame(&blame_from(&keys, 2, 0));
        assert!(state.is_transitioning());
        assert!(state.on_progress().is_empty());
    }
}
