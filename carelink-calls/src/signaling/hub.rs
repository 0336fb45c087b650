use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::{counter, gauge};
use tokio::sync::mpsc::{self, error::TrySendError};

use super::envelope::{self, EnvelopeError, ServerMessage};

/// What a connection's writer task should put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(Arc<str>),
    /// Keepalive; produced by the writer itself, never queued by the hub.
    Ping,
    Close { code: u16, reason: &'static str },
}

pub type Outbound = mpsc::Sender<Frame>;

pub const CLOSE_NORMAL: u16 = 1000;

#[derive(Debug)]
struct Participant {
    connection_id: u64,
    /// Token subject that registered this participant id.
    subject: String,
    tx: Outbound,
}

type Room = HashMap<String, Participant>;

/// Live registry of connected participants per call, and the relay between them.
///
/// Each room is mutated under its map entry, so join/leave on the same call id are atomic
/// with respect to each other. Sends are `try_send` into per-connection queues and never
/// wait on a peer.
#[derive(Debug, Default)]
pub struct SignalingHub {
    rooms: DashMap<String, Room>,
    next_connection_id: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    #[error("participant id {participant_id} is held by another identity")]
    ParticipantIdTaken { participant_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayReport {
    pub delivered: usize,
    pub failed: usize,
}

impl SignalingHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an admitted participant. The admittee's queue receives `CONNECTED` before any
    /// other participant hears `USER_JOINED`. Returns the connection id to pass to [`leave`].
    ///
    /// Re-joining under the same participant id replaces the earlier connection, but only for
    /// the token subject that registered it. Any other subject is refused and the room is left
    /// untouched.
    ///
    /// [`leave`]: SignalingHub::leave
    pub fn join(&self, room_id: &str, participant_id: &str, subject: &str, tx: Outbound) -> Result<u64, JoinError> {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1;
        let connected = encode(&ServerMessage::Connected {
            room_id: room_id.to_string(),
            participant_id: participant_id.to_string(),
        });

        let (peers, participant_count, superseded) = {
            let mut room = match self.rooms.entry(room_id.to_string()) {
                Entry::Occupied(entry) => entry.into_ref(),
                Entry::Vacant(entry) => {
                    gauge!("signaling_active_rooms").increment(1.0);
                    entry.insert(Room::new())
                }
            };
            if room.get(participant_id).is_some_and(|p| p.subject != subject) {
                counter!("signaling_join_conflicts_total").increment(1);
                tracing::warn!(room_id, participant_id, subject, "participant id held by another identity, join refused");
                return Err(JoinError::ParticipantIdTaken {
                    participant_id: participant_id.to_string(),
                });
            }
            let superseded = room.insert(
                participant_id.to_string(),
                Participant {
                    connection_id,
                    subject: subject.to_string(),
                    tx: tx.clone(),
                },
            );
            if let Some(text) = connected {
                deliver(room_id, participant_id, &tx, Frame::Text(text));
            }
            (peers_except(&room, participant_id), room.len(), superseded)
        };

        if let Some(old) = superseded {
            tracing::info!(
                room_id,
                participant_id,
                old_connection_id = old.connection_id,
                "participant re-joined, closing previous connection"
            );
            let _ = old.tx.try_send(Frame::Close {
                code: CLOSE_NORMAL,
                reason: "superseded",
            });
        }

        tracing::info!(room_id, participant_id, connection_id, participant_count, "participant joined");
        self.broadcast(
            room_id,
            &peers,
            &ServerMessage::UserJoined {
                user_id: participant_id.to_string(),
                participant_count,
            },
        );
        Ok(connection_id)
    }

    /// Forward a client message to every other participant in the room, stamped with the
    /// sender id. A room with no other participants is a no-op.
    pub fn relay(&self, room_id: &str, sender_id: &str, raw: &str) -> Result<RelayReport, EnvelopeError> {
        let stamped = envelope::stamp(raw, sender_id)?;
        let peers = self
            .rooms
            .get(room_id)
            .map(|room| peers_except(&room, sender_id))
            .unwrap_or_default();

        let text: Arc<str> = stamped.text.into();
        let mut report = RelayReport { delivered: 0, failed: 0 };
        for (peer_id, tx) in &peers {
            if deliver(room_id, peer_id, tx, Frame::Text(text.clone())) {
                report.delivered += 1;
            } else {
                report.failed += 1;
            }
        }

        counter!("signaling_messages_relayed_total").increment(report.delivered as u64);
        tracing::debug!(
            room_id,
            sender_id,
            kind = %stamped.kind,
            delivered = report.delivered,
            failed = report.failed,
            "message relayed"
        );
        Ok(report)
    }

    /// Remove a participant if `connection_id` is still the registered one. Returns `false`
    /// for a connection that was already replaced by a newer join.
    pub fn leave(&self, room_id: &str, participant_id: &str, connection_id: u64) -> bool {
        let peers = match self.rooms.entry(room_id.to_string()) {
            Entry::Vacant(_) => return false,
            Entry::Occupied(mut entry) => {
                let current = entry
                    .get()
                    .get(participant_id)
                    .is_some_and(|p| p.connection_id == connection_id);
                if !current {
                    return false;
                }
                entry.get_mut().remove(participant_id);
                if entry.get().is_empty() {
                    entry.remove();
                    gauge!("signaling_active_rooms").decrement(1.0);
                    tracing::debug!(room_id, "room emptied and removed");
                    Vec::new()
                } else {
                    peers_except(entry.get(), participant_id)
                }
            }
        };

        tracing::info!(room_id, participant_id, connection_id, remaining = peers.len(), "participant left");
        self.broadcast(
            room_id,
            &peers,
            &ServerMessage::PeerDisconnected {
                user_id: participant_id.to_string(),
            },
        );
        true
    }

    pub fn participant_count(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map(|room| room.len()).unwrap_or(0)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    fn broadcast(&self, room_id: &str, peers: &[(String, Outbound)], message: &ServerMessage) {
        if peers.is_empty() {
            return;
        }
        let Some(text) = encode(message) else { return };
        for (peer_id, tx) in peers {
            deliver(room_id, peer_id, tx, Frame::Text(text.clone()));
        }
    }
}

fn peers_except(room: &Room, participant_id: &str) -> Vec<(String, Outbound)> {
    room.iter()
        .filter(|(id, _)| id.as_str() != participant_id)
        .map(|(id, p)| (id.clone(), p.tx.clone()))
        .collect()
}

fn encode(message: &ServerMessage) -> Option<Arc<str>> {
    match message.encode() {
        Ok(text) => Some(text.into()),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode server message");
            None
        }
    }
}

/// Best-effort enqueue. A full or closed queue only affects that recipient.
fn deliver(room_id: &str, participant_id: &str, tx: &Outbound, frame: Frame) -> bool {
    match tx.try_send(frame) {
        Ok(()) => true,
        Err(e) => {
            let reason = match e {
                TrySendError::Full(_) => "queue full",
                TrySendError::Closed(_) => "connection closed",
            };
            counter!("signaling_relay_failures_total", "reason" => reason).increment(1);
            tracing::warn!(room_id, participant_id, reason, "dropping signaling message for peer");
            false
        }
    }
}
