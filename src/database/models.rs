use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

pub type ParticipantId = i64;
pub type GroupId = i64;
pub type MatchId = i64;
pub type GameId = i64;
pub type MapId = i64;

/// An entrant of a tournament group. Player or team, the engine does not care which.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Participant {
    pub participant_id: ParticipantId,
    pub name: String,
}

/// A round-robin group within a tournament stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Group {
    pub group_id: GroupId,
    pub name: String,
}

/// A playable map. Only its existence matters to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct GameMap {
    pub map_id: MapId,
    pub name: String,
}

/// The status of a match.
///
/// The admin match editor walks `Pending -> Scheduled -> InProgress -> Completed` and may cancel
/// anything that has not finished. Recording games with score application moves a match straight
/// to `AdminApproved`.
#[derive(
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    Clone,
    Copy,
    sqlx::Type,
    Serialize,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
)]
#[sqlx(type_name = "match_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MatchStatus {
    #[default]
    Pending,
    Scheduled,
    InProgress,
    Completed,
    AdminApproved,
    Cancelled,
}

impl MatchStatus {
    /// Whether the match has reached a state the admin editor can no longer move it out of.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MatchStatus::Completed | MatchStatus::AdminApproved | MatchStatus::Cancelled
        )
    }

    /// Whether `next` is a legal move from `self`.
    pub fn can_transition_to(self, next: MatchStatus) -> bool {
        use MatchStatus::*;
        match (self, next) {
            (Cancelled, AdminApproved) => false,
            // Re-submitting scores for an approved or completed match re-approves it.
            (_, AdminApproved) => true,
            (current, Cancelled) => !current.is_terminal(),
            (Pending, Scheduled) | (Scheduled, InProgress) | (InProgress, Completed) => true,
            _ => false,
        }
    }

    pub fn all() -> Vec<MatchStatus> {
        MatchStatus::iter().collect()
    }
}

/// A head-to-head match between two slots of a group.
///
/// A slot is `None` while it is still to be decided.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Match {
    pub match_id: MatchId,
    pub group_id: GroupId,
    pub slot_a: Option<ParticipantId>,
    pub slot_b: Option<ParticipantId>,
    pub status: MatchStatus,
    pub date: Option<DateTime<Utc>>,
    pub draft_keys: Vec<String>,
    pub comment: Option<String>,
}

impl Match {
    /// The occupied slots of the match, slot A first.
    pub fn participants(&self) -> Vec<ParticipantId> {
        self.slot_a.into_iter().chain(self.slot_b).collect()
    }

    /// Whether either slot holds `participant_id`.
    pub fn involves(&self, participant_id: ParticipantId) -> bool {
        self.slot_a == Some(participant_id) || self.slot_b == Some(participant_id)
    }
}

/// A match that is about to be created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSpec {
    pub slot_a: ParticipantId,
    pub slot_b: ParticipantId,
    pub status: MatchStatus,
    pub draft_keys: Vec<String>,
}

impl MatchSpec {
    pub fn new(slot_a: ParticipantId, slot_b: ParticipantId) -> Self {
        Self {
            slot_a,
            slot_b,
            status: MatchStatus::Pending,
            draft_keys: Vec::new(),
        }
    }
}

/// The per-match score row of a participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct MatchParticipant {
    pub match_id: MatchId,
    pub participant_id: ParticipantId,
    pub won_score: i32,
    pub lost_score: i32,
    pub is_winner: bool,
}

impl MatchParticipant {
    pub fn new(match_id: MatchId, participant_id: ParticipantId) -> Self {
        Self {
            match_id,
            participant_id,
            won_score: 0,
            lost_score: 0,
            is_winner: false,
        }
    }
}

/// One played map of a match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Game {
    pub game_id: GameId,
    pub match_id: MatchId,
    /// 1-based position of the game in the submission that created it.
    pub sequence: i32,
    pub map_id: MapId,
    /// Object store key of the replay, always a permanent key once stored.
    pub replay_key: Option<String>,
    pub participants: Vec<GameParticipant>,
}

/// A participant's entry within one game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameParticipant {
    pub participant_id: ParticipantId,
    pub civilization: Option<String>,
    pub is_winner: bool,
}

/// A game row about to be inserted. The replay key has already been promoted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewGame {
    pub sequence: i32,
    pub map_id: MapId,
    pub replay_key: Option<String>,
    pub participants: Vec<GameParticipant>,
}

/// One game of a result submission as the admin UI sends it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameSubmission {
    pub map_id: MapId,
    /// Either a freshly uploaded temp key or the permanent key of a replay the game already had.
    #[serde(default)]
    pub replay_key: Option<String>,
    pub participants: Vec<GameParticipant>,
}

/// A match together with its score rows and games, as it is after an engine call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatedMatch {
    #[serde(rename = "match")]
    pub bracket: Match,
    pub participants: Vec<MatchParticipant>,
    pub games: Vec<Game>,
}

impl UpdatedMatch {
    pub fn participant(&self, participant_id: ParticipantId) -> Option<&MatchParticipant> {
        self.participants
            .iter()
            .find(|p| p.participant_id == participant_id)
    }

    pub fn winners(&self) -> Vec<ParticipantId> {
        self.participants
            .iter()
            .filter(|p| p.is_winner)
            .map(|p| p.participant_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::MatchStatus::{self, *};
    use std::str::FromStr;

    #[test]
    fn admin_path_moves_forward_only() {
        assert!(Pending.can_transition_to(Scheduled));
        assert!(Scheduled.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(!Scheduled.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn cancel_only_from_non_terminal() {
        for status in MatchStatus::all() {
            assert_eq!(status.can_transition_to(Cancelled), !status.is_terminal());
        }
    }

    #[test]
    fn approval_from_anything_but_cancelled() {
        for status in MatchStatus::all() {
            assert_eq!(status.can_transition_to(AdminApproved), status != Cancelled);
        }
    }

    #[test]
    fn status_strings_match_the_database_enum() {
        assert_eq!(AdminApproved.to_string(), "admin_approved");
        assert_eq!(MatchStatus::from_str("in_progress").unwrap(), InProgress);
    }
}
