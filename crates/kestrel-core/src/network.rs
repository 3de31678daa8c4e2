// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Transport-facing types. The transport itself (discovery, handshake,
//! framing on the wire) lives outside this crate; it hands the reactors an
//! ordered frame channel per peer and tears the peer down when our side of
//! the channel closes.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{
    messages::{encode_msg, ConsensusMessage},
    types::PeerId,
};

/// One length-delimited message on one logical channel.
#[derive(Clone, Debug)]
pub struct Frame {
    pub channel: u8,
    pub payload: Bytes,
}

/// Both directions of an established peer connection.
pub struct Connection {
    pub peer_id: PeerId,
    pub sender: mpsc::Sender<Frame>,
    pub receiver: mpsc::Receiver<Frame>,
}

/// Sends a consensus message on the given channel, waiting for channel
/// capacity. Returns false when the peer is gone.
pub async fn send_msg(
    sender: &mpsc::Sender<Frame>,
    channel: u8,
    msg: &ConsensusMessage,
) -> bool {
    let frame = Frame {
        channel,
        payload: encode_msg(msg).into(),
    };
    sender.send(frame).await.is_ok()
}

/// Best-effort send used by event-bus broadcasts: a slow peer drops the
/// frame rather than stalling the bus delivery task.
pub fn try_send_msg(sender: &mpsc::Sender<Frame>, channel: u8, msg: &ConsensusMessage) -> bool {
    let frame = Frame {
        channel,
        payload: encode_msg(msg).into(),
    };
    sender.try_send(frame).is_ok()
}

/// A stop signal: capacity-one channel with its permit pre-occupied, so
/// `send` on any sender clone blocks until the receiver is dropped.
pub fn stop_channel() -> (mpsc::Sender<()>, mpsc::Receiver<()>) {
    let (sender, receiver) = mpsc::channel(1);
    sender.try_send(()).unwrap();
    (sender, receiver)
}

/// Completes once the receiver half of a stop channel has been dropped.
pub async fn stopped(stop: &mpsc::Sender<()>) {
    let result = stop.send(()).await;
    assert!(result.is_err());
}
