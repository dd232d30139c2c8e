use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A remote party in a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallParticipant {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default)]
    pub is_therapist: bool,
    #[serde(default)]
    pub is_muted: bool,
    #[serde(default)]
    pub is_video_enabled: bool,
}

impl CallParticipant {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            avatar: None,
            is_therapist: false,
            is_muted: false,
            is_video_enabled: true,
        }
    }
}

/// The remote parties of the current call.
///
/// Each participant is reachable through one peer id; media and hang-ups
/// arrive keyed by peer id, the UI works with participant ids.
#[derive(Debug, Clone, Default)]
pub struct ParticipantRoster {
    participants: Vec<CallParticipant>,
    /// participant id -> peer id
    peers: HashMap<String, String>,
}

impl ParticipantRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the participant is already present.
    pub fn add(&mut self, participant: CallParticipant, peer_id: impl Into<String>) -> bool {
        if self.participants.iter().any(|p| p.id == participant.id) {
            return false;
        }
        self.peers.insert(participant.id.clone(), peer_id.into());
        self.participants.push(participant);
        true
    }

    pub fn remove(&mut self, id: &str) -> Option<CallParticipant> {
        let index = self.participants.iter().position(|p| p.id == id)?;
        self.peers.remove(id);
        Some(self.participants.remove(index))
    }

    pub fn participants(&self) -> &[CallParticipant] {
        &self.participants
    }

    pub fn participant(&self, id: &str) -> Option<&CallParticipant> {
        self.participants.iter().find(|p| p.id == id)
    }

    pub fn participant_mut(&mut self, id: &str) -> Option<&mut CallParticipant> {
        self.participants.iter_mut().find(|p| p.id == id)
    }

    pub fn peer_of(&self, id: &str) -> Option<&str> {
        self.peers.get(id).map(String::as_str)
    }

    /// Participant id reached through `peer_id`.
    pub fn by_peer(&self, peer_id: &str) -> Option<&str> {
        self.peers
            .iter()
            .find(|(_, peer)| peer.as_str() == peer_id)
            .map(|(id, _)| id.as_str())
    }

    /// Peer ids in join order.
    pub fn peer_ids(&self) -> Vec<String> {
        self.participants
            .iter()
            .filter_map(|p| self.peers.get(&p.id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn clear(&mut self) {
        self.participants.clear();
        self.peers.clear();
    }
}
