use std::{collections::HashMap, sync::Arc};

use axum::extract::ws::Message;
use nextpaste_core::RoomId;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionHandle, ConnectionId, ConnectionSummary, EnqueueError};

/// Outcome of one fan-out, counted per recipient.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomStats {
    pub room_id: RoomId,
    pub member_count: usize,
    pub members: Vec<ConnectionSummary>,
}

/// A set of live connections that see each other's broadcasts.
#[derive(Debug)]
pub struct Room {
    id: RoomId,
    members: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
}

impl Room {
    pub fn new(id: impl Into<RoomId>) -> Self {
        Self {
            id: id.into(),
            members: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn insert(&self, conn: ConnectionHandle) {
        self.members.write().await.insert(conn.id(), conn);
    }

    pub async fn remove(&self, id: ConnectionId) -> bool {
        self.members.write().await.remove(&id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.members.read().await.is_empty()
    }

    pub async fn members(&self) -> Vec<ConnectionHandle> {
        self.members.read().await.values().cloned().collect()
    }

    /// Queues `messages` on every member except `exclude`.
    ///
    /// Never waits on a slow member: when a member's queue is full the rest of the
    /// batch is dropped for that member only.
    pub async fn broadcast(
        &self,
        messages: &[Message],
        exclude: Option<ConnectionId>,
    ) -> BroadcastReport {
        let members = self.members.read().await;
        let mut report = BroadcastReport::default();

        for (id, conn) in members.iter() {
            if Some(*id) == exclude {
                continue;
            }

            let mut delivered = true;
            for message in messages {
                match conn.try_enqueue(message.clone()) {
                    Ok(()) => {}
                    Err(EnqueueError::Full) => {
                        warn!(room_id = %self.id, conn = %id, "outbound queue full; dropping frame");
                        delivered = false;
                        break;
                    }
                    Err(EnqueueError::Closed) => {
                        debug!(room_id = %self.id, conn = %id, "skipping closed connection");
                        delivered = false;
                        break;
                    }
                }
            }

            if delivered {
                report.delivered += 1;
            } else {
                report.dropped += 1;
            }
        }

        report
    }

    /// Closes every member's queue and connection and empties the room.
    pub async fn close_all(&self) {
        let mut members = self.members.write().await;
        for conn in members.values() {
            conn.close();
        }
        members.clear();
    }

    pub async fn stats(&self) -> RoomStats {
        let members = self.members.read().await;
        RoomStats {
            room_id: self.id.clone(),
            member_count: members.len(),
            members: members.values().map(ConnectionHandle::summary).collect(),
        }
    }
}

/// Owns every room of one namespace. Rooms exist only while they have members.
///
/// Lock order is always registry, then room.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<RoomId, Arc<Room>>>,
}

impl RoomRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn join(&self, room_id: &str, conn: ConnectionHandle) -> Arc<Room> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(room_id.to_owned())
            .or_insert_with(|| {
                info!(room_id, "room created");
                Arc::new(Room::new(room_id))
            })
            .clone();
        room.insert(conn).await;
        room
    }

    /// Removes `conn` from the room, deleting the room once it is empty.
    /// Returns whether the connection was a member; repeated calls are harmless.
    pub async fn leave(&self, room_id: &str, conn: ConnectionId) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(room_id).cloned() else {
            return false;
        };

        let removed = room.remove(conn).await;
        if room.is_empty().await {
            rooms.remove(room_id);
            info!(room_id, "room removed");
        }
        removed
    }

    pub async fn room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    pub async fn broadcast(
        &self,
        room_id: &str,
        messages: &[Message],
        exclude: Option<ConnectionId>,
    ) -> BroadcastReport {
        match self.room(room_id).await {
            Some(room) => room.broadcast(messages, exclude).await,
            None => BroadcastReport::default(),
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn stats(&self) -> Vec<RoomStats> {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let mut stats = Vec::with_capacity(rooms.len());
        for room in rooms {
            stats.push(room.stats().await);
        }
        stats.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        stats
    }

    pub async fn shutdown(&self) {
        let mut rooms = self.rooms.write().await;
        for (room_id, room) in rooms.drain() {
            room.close_all().await;
            info!(room_id = %room_id, "room closed");
        }
    }
}
