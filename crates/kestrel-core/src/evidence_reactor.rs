// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Gossips pending evidence to every peer. Modeled after the mempool
//! broadcast: evidence accumulates in a concurrent list and each peer gets a
//! routine that walks the list, shipping items the peer can accept.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{
    select,
    sync::mpsc,
    task::JoinHandle,
    time::sleep,
};

use crate::{
    clist::ListElement,
    evidence::{decode_evidence_list, encode_evidence_list, Evidence, EvidencePool},
    messages::{ChannelDescriptor, EVIDENCE_CHANNEL, MAX_MSG_SIZE},
    metrics::Metrics,
    network::{stop_channel, stopped, Frame},
    peer_state::PeerRegistry,
    types::PeerId,
};

/// Broadcast uncommitted evidence this often, restarting the scan.
const BROADCAST_EVIDENCE_INTERVAL: Duration = Duration::from_secs(60);
/// If the peer is behind or not yet initialized, sleep this long and retry.
const PEER_CATCHUP_SLEEP_INTERVAL: Duration = Duration::from_millis(100);

pub struct EvidenceReactor {
    inner: Arc<EvidenceReactorInner>,
    stop_guard: Mutex<Option<mpsc::Receiver<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct EvidenceReactorInner {
    pool: Arc<EvidencePool>,
    peers: Arc<PeerRegistry>,
    metrics: Arc<Metrics>,
    stop: mpsc::Sender<()>,
}

impl EvidenceReactor {
    pub fn new(
        pool: Arc<EvidencePool>,
        peers: Arc<PeerRegistry>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let (stop_sender, stop_receiver) = stop_channel();
        Arc::new(Self {
            inner: Arc::new(EvidenceReactorInner {
                pool,
                peers,
                metrics,
                stop: stop_sender,
            }),
            stop_guard: Mutex::new(Some(stop_receiver)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn channels() -> Vec<ChannelDescriptor> {
        vec![ChannelDescriptor {
            id: EVIDENCE_CHANNEL,
            priority: 5,
            recv_capacity: MAX_MSG_SIZE,
        }]
    }

    /// Starts the broadcast routine for a newly attached peer. `peer_stop`
    /// is the peer's stop signal; the routine ends when it fires, when the
    /// reactor stops, or when the peer's frame channel closes.
    pub fn add_peer(&self, peer_id: PeerId, sender: mpsc::Sender<Frame>, peer_stop: mpsc::Sender<()>) {
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            inner
                .broadcast_evidence_routine(peer_id, sender, peer_stop)
                .await;
        });
        self.tasks.lock().push(task);
    }

    /// Handles one inbound evidence frame. Returns false when the peer must
    /// be disconnected (malformed frame or proven-invalid evidence).
    pub fn receive(&self, peer_id: PeerId, payload: &[u8]) -> bool {
        let evidence = match decode_evidence_list(payload) {
            Ok(evidence) => evidence,
            Err(e) => {
                tracing::warn!("Dropping peer {peer_id}: bad evidence frame: {e}");
                self.inner.metrics.wire_decode_failures_total.inc();
                return false;
            }
        };
        for ev in evidence {
            self.inner.metrics.evidence_received_total.inc();
            match self.inner.pool.add_evidence(ev) {
                Ok(()) => {}
                Err(e) if e.is_invalid() => {
                    // Proven Byzantine input terminates the whole batch.
                    tracing::error!("Dropping peer {peer_id}: {e}");
                    self.inner.metrics.evidence_rejected_total.inc();
                    return false;
                }
                Err(e) => {
                    tracing::debug!("Evidence from {peer_id} not added: {e}");
                }
            }
        }
        true
    }

    /// Signals all routines to stop and waits for them.
    pub async fn shutdown(&self) {
        self.stop_guard.lock().take();
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        futures::future::join_all(tasks).await;
    }
}

impl EvidenceReactorInner {
    async fn broadcast_evidence_routine(
        self: Arc<Self>,
        peer_id: PeerId,
        sender: mpsc::Sender<Frame>,
        peer_stop: mpsc::Sender<()>,
    ) {
        let mut cursor: Option<Arc<ListElement<Evidence>>> = None;
        loop {
            if sender.is_closed() {
                return;
            }

            let Some(element) = cursor.clone() else {
                // Nothing under the cursor; wait for the list to fill, then
                // scan from the head.
                select! {
                    _ = self.pool.pending_wait() => {}
                    _ = self.stopped() => return,
                    _ = stopped(&peer_stop) => return,
                }
                cursor = self.pool.pending_front();
                continue;
            };

            let (to_send, mut retry) = self.check_send(peer_id, element.value());
            if !to_send.is_empty() {
                let frame = Frame {
                    channel: EVIDENCE_CHANNEL,
                    payload: encode_evidence_list(&to_send).into(),
                };
                let count = to_send.len() as u64;
                retry = select! {
                    sent = sender.send(frame) => {
                        if sent.is_ok() {
                            self.metrics.evidence_broadcast_total.inc_by(count);
                        }
                        sent.is_err()
                    }
                    _ = self.stopped() => return,
                    _ = stopped(&peer_stop) => return,
                };
            }

            if retry {
                select! {
                    _ = sleep(PEER_CATCHUP_SLEEP_INTERVAL) => {}
                    _ = self.stopped() => return,
                    _ = stopped(&peer_stop) => return,
                }
                continue;
            }

            select! {
                _ = sleep(BROADCAST_EVIDENCE_INTERVAL) => {
                    // Start from the beginning every tick.
                    cursor = None;
                }
                _ = element.next_wait() => {
                    // May be None when the element was evicted; the next
                    // iteration restarts from the head.
                    cursor = element.next();
                }
                _ = self.stopped() => return,
                _ = stopped(&peer_stop) => return,
            }
        }
    }

    /// Decides what to send for one pending item, against the peer's
    /// mirrored height and the last committed block time.
    ///
    /// Returns the items to ship plus whether to sleep and retry: a peer
    /// without a mirror yet, or one still behind the evidence height, is
    /// retried; evidence past either age bound is skipped for good.
    fn check_send(&self, peer_id: PeerId, evidence: &Evidence) -> (Vec<Evidence>, bool) {
        let Some(peer_state) = self.peers.get(peer_id) else {
            // The consensus reactor attaches the mirror; transport may hand
            // us the peer first. Wait a beat and retry.
            return (Vec::new(), true);
        };

        let peer_height = peer_state.get_height();
        let ev_height = evidence.height();
        if peer_height < ev_height {
            // Peer is behind; sleep while it catches up.
            return (Vec::new(), true);
        }

        let state = self.pool.state();
        let age_blocks = peer_height - ev_height;
        let age_duration =
            Duration::from_secs(state.last_block_time.saturating_sub(evidence.time()));
        if age_blocks > state.params.evidence.max_age_num_blocks
            || age_duration > state.params.evidence.max_age_duration
        {
            // Too old for an honest peer: it either got committed already or
            // never will.
            tracing::info!(
                peer_height,
                ev_height,
                ?age_duration,
                "Not sending peer old evidence"
            );
            return (Vec::new(), false);
        }

        (vec![evidence.clone()], false)
    }

    async fn stopped(&self) {
        let stopped = self.stop.send(()).await;
        assert!(stopped.is_err());
    }
}
