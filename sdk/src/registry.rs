use dashmap::DashMap;
use std::sync::Arc;

/// A remote participant known by its source identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub user_id: String,
    /// Activity bitmask as reported by the relay; zero means silent.
    pub speaking: u32,
}

impl Participant {
    #[must_use]
    pub fn new(user_id: impl Into<String>, speaking: u32) -> Self {
        Self {
            user_id: user_id.into(),
            speaking,
        }
    }
}

/// SSRC -> participant map, shared between the session driver and its handle.
/// Entries live as long as the session; pruning on leave is left to the owner.
#[derive(Debug, Clone, Default)]
pub struct ParticipantRegistry {
    participants: Arc<DashMap<u32, Participant>>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, ssrc: u32, participant: Participant) {
        self.participants.insert(ssrc, participant);
    }

    pub fn get(&self, ssrc: u32) -> Option<Participant> {
        self.participants.get(&ssrc).map(|entry| entry.value().clone())
    }

    /// Updates the activity bitmask of a known participant. Returns false if
    /// `ssrc` is unknown.
    pub fn set_speaking(&self, ssrc: u32, speaking: u32) -> bool {
        match self.participants.get_mut(&ssrc) {
            Some(mut entry) => {
                entry.speaking = speaking;
                true
            }
            None => false,
        }
    }
}
