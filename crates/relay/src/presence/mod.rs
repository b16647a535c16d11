// Process-local room membership and connection fanout.
//
// Every live WebSocket registers one connection bound to one participant.
// A participant may hold many connections and may join a room from any of
// them; it stays in the room until its last joined connection leaves.
// Nothing here is shared across relay instances.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;
use voyage_common::{
    protocol::ws::ServerEvent,
    types::{PresenceStatus, RealtimeStats},
};

pub type ConnectionId = Uuid;
pub type Outbound = mpsc::UnboundedSender<ServerEvent>;

#[derive(Debug)]
struct ConnectionEntry {
    participant_id: String,
    outbound: Outbound,
    rooms: HashSet<String>,
}

#[derive(Debug, Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    /// Present iff the participant has at least one live connection.
    participants: HashMap<String, HashSet<ConnectionId>>,
    /// room id -> participant -> connections of that participant joined to the room.
    rooms: HashMap<String, HashMap<String, HashSet<ConnectionId>>>,
}

impl RegistryState {
    fn recipients(&self, room_id: &str, exclude_participant: Option<&str>) -> Vec<Outbound> {
        let Some(members) = self.rooms.get(room_id) else {
            return Vec::new();
        };

        members
            .iter()
            .filter(|(participant_id, _)| Some(participant_id.as_str()) != exclude_participant)
            .flat_map(|(_, connection_ids)| connection_ids.iter())
            .filter_map(|connection_id| self.connections.get(connection_id))
            .map(|entry| entry.outbound.clone())
            .collect()
    }

    fn sorted_participants(&self, room_id: &str) -> Vec<String> {
        let mut participants: Vec<String> =
            self.rooms.get(room_id).map(|members| members.keys().cloned().collect()).unwrap_or_default();
        participants.sort_unstable();
        participants
    }

    /// Detach one connection from one room. Returns true when this was the
    /// participant's last connection in the room.
    fn detach(&mut self, connection_id: ConnectionId, participant_id: &str, room_id: &str) -> bool {
        let Some(members) = self.rooms.get_mut(room_id) else {
            return false;
        };
        let Some(connection_ids) = members.get_mut(participant_id) else {
            return false;
        };
        if !connection_ids.remove(&connection_id) {
            return false;
        }

        let participant_left = connection_ids.is_empty();
        if participant_left {
            members.remove(participant_id);
            if members.is_empty() {
                self.rooms.remove(room_id);
            }
        }

        participant_left
    }
}

/// Result of a successful [`PresenceRegistry::join_room`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub participant_id: String,
    /// Room members after the join, sorted.
    pub participants: Vec<String>,
    /// False when the participant was already in the room via another connection.
    pub newly_present: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PresenceRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl PresenceRegistry {
    /// Register a live connection for `participant_id`.
    pub async fn connect(&self, participant_id: &str, outbound: Outbound) -> ConnectionId {
        let connection_id = Uuid::new_v4();
        let mut guard = self.state.write().await;
        guard.connections.insert(
            connection_id,
            ConnectionEntry {
                participant_id: participant_id.to_string(),
                outbound,
                rooms: HashSet::new(),
            },
        );
        guard.participants.entry(participant_id.to_string()).or_default().insert(connection_id);

        connection_id
    }

    /// Idempotently join `room_id` from `connection_id`. Emits `user_joined`
    /// to the other members when the participant was not yet present.
    pub async fn join_room(&self, connection_id: ConnectionId, room_id: &str) -> Option<JoinOutcome> {
        let (outcome, recipients) = {
            let mut guard = self.state.write().await;
            let participant_id = {
                let entry = guard.connections.get_mut(&connection_id)?;
                entry.rooms.insert(room_id.to_string());
                entry.participant_id.clone()
            };

            let members = guard.rooms.entry(room_id.to_string()).or_default();
            let newly_present = !members.contains_key(&participant_id);
            members.entry(participant_id.clone()).or_default().insert(connection_id);

            let recipients = if newly_present {
                guard.recipients(room_id, Some(&participant_id))
            } else {
                Vec::new()
            };
            let participants = guard.sorted_participants(room_id);

            (JoinOutcome { participant_id, participants, newly_present }, recipients)
        };

        if outcome.newly_present {
            debug!(room_id, participant = %outcome.participant_id, "participant joined room");
            let event = ServerEvent::UserJoined {
                participant: outcome.participant_id.clone(),
                doc_id: room_id.to_string(),
                timestamp: Utc::now(),
            };
            fan_out(recipients, &event);
        }

        Some(outcome)
    }

    /// Leave `room_id` from one connection. Emits `user_left` exactly once,
    /// when the participant's last connection in the room is gone.
    pub async fn leave_room(&self, connection_id: ConnectionId, room_id: &str) -> bool {
        let (participant_id, recipients) = {
            let mut guard = self.state.write().await;
            let participant_id = match guard.connections.get_mut(&connection_id) {
                Some(entry) => {
                    entry.rooms.remove(room_id);
                    entry.participant_id.clone()
                }
                None => return false,
            };

            if !guard.detach(connection_id, &participant_id, room_id) {
                return false;
            }

            let recipients = guard.recipients(room_id, None);
            (participant_id, recipients)
        };

        debug!(room_id, participant = %participant_id, "participant left room");
        fan_out(
            recipients,
            &ServerEvent::UserLeft {
                participant: participant_id,
                doc_id: room_id.to_string(),
                timestamp: Utc::now(),
            },
        );

        true
    }

    /// Drop a connection, leaving every room it had joined. Returns the rooms
    /// the participant left entirely.
    pub async fn disconnect(&self, connection_id: ConnectionId) -> Vec<String> {
        let (participant_id, departures) = {
            let mut guard = self.state.write().await;
            let Some(entry) = guard.connections.remove(&connection_id) else {
                return Vec::new();
            };

            if let Some(connection_ids) = guard.participants.get_mut(&entry.participant_id) {
                connection_ids.remove(&connection_id);
                if connection_ids.is_empty() {
                    guard.participants.remove(&entry.participant_id);
                }
            }

            let mut departures = Vec::new();
            for room_id in &entry.rooms {
                if guard.detach(connection_id, &entry.participant_id, room_id) {
                    departures.push((room_id.clone(), guard.recipients(room_id, None)));
                }
            }

            (entry.participant_id, departures)
        };

        let mut left_rooms = Vec::with_capacity(departures.len());
        for (room_id, recipients) in departures {
            fan_out(
                recipients,
                &ServerEvent::UserLeft {
                    participant: participant_id.clone(),
                    doc_id: room_id.clone(),
                    timestamp: Utc::now(),
                },
            );
            left_rooms.push(room_id);
        }

        left_rooms
    }

    /// Best-effort, at-most-once delivery to every connection in the room,
    /// skipping all connections of `exclude_participant`. Returns the number
    /// of connections the event was queued for.
    pub async fn broadcast(
        &self,
        room_id: &str,
        event: ServerEvent,
        exclude_participant: Option<&str>,
    ) -> usize {
        let recipients = self.state.read().await.recipients(room_id, exclude_participant);
        fan_out(recipients, &event)
    }

    pub async fn send_to_connection(&self, connection_id: ConnectionId, event: ServerEvent) -> bool {
        let outbound =
            self.state.read().await.connections.get(&connection_id).map(|entry| entry.outbound.clone());
        outbound.is_some_and(|sender| sender.send(event).is_ok())
    }

    /// Deliver to every connection of one participant, regardless of room.
    pub async fn send_to_participant(&self, participant_id: &str, event: ServerEvent) -> usize {
        let recipients: Vec<Outbound> = {
            let guard = self.state.read().await;
            guard
                .participants
                .get(participant_id)
                .into_iter()
                .flatten()
                .filter_map(|connection_id| guard.connections.get(connection_id))
                .map(|entry| entry.outbound.clone())
                .collect()
        };
        fan_out(recipients, &event)
    }

    pub async fn typing(&self, room_id: &str, participant_id: &str, is_typing: bool) -> usize {
        self.broadcast(
            room_id,
            ServerEvent::TypingIndicator {
                doc_id: room_id.to_string(),
                participant: participant_id.to_string(),
                is_typing,
                timestamp: Utc::now(),
            },
            Some(participant_id),
        )
        .await
    }

    pub async fn presence_update(
        &self,
        room_id: &str,
        participant_id: &str,
        status: PresenceStatus,
    ) -> usize {
        self.broadcast(
            room_id,
            ServerEvent::PresenceUpdate {
                doc_id: room_id.to_string(),
                participant: participant_id.to_string(),
                status,
                timestamp: Utc::now(),
            },
            Some(participant_id),
        )
        .await
    }

    /// Copy of the room's current members, sorted.
    pub async fn participants(&self, room_id: &str) -> Vec<String> {
        self.state.read().await.sorted_participants(room_id)
    }

    /// Whether this connection (not just its participant) has joined the room.
    pub async fn is_member(&self, connection_id: ConnectionId, room_id: &str) -> bool {
        self.state.read().await.connections.get(&connection_id).is_some_and(|entry| entry.rooms.contains(room_id))
    }

    pub async fn connection_count(&self, participant_id: &str) -> usize {
        self.state.read().await.participants.get(participant_id).map_or(0, HashSet::len)
    }

    pub async fn stats(&self) -> RealtimeStats {
        let guard = self.state.read().await;
        RealtimeStats {
            connected_participants: guard.participants.len(),
            active_rooms: guard.rooms.len(),
            total_connections: guard.connections.len(),
        }
    }
}

fn fan_out(recipients: Vec<Outbound>, event: &ServerEvent) -> usize {
    let mut sent_count = 0;
    for recipient in recipients {
        if recipient.send(event.clone()).is_ok() {
            sent_count += 1;
        }
    }
    sent_count
}
