use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::models::*;
use super::{Database, GameDatabase, GroupDatabase, MatchDatabase, StoreTransaction};
use crate::utils::error::DatabaseError;

/// Operations of a transaction that can be made to fail on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    InsertGame,
    InsertMatch,
    UpdateScore,
    Commit,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    last_id: i64,
    participants: BTreeMap<ParticipantId, Participant>,
    groups: BTreeMap<GroupId, Group>,
    memberships: BTreeMap<GroupId, Vec<ParticipantId>>,
    maps: BTreeMap<MapId, GameMap>,
    matches: BTreeMap<MatchId, Match>,
    match_participants: Vec<MatchParticipant>,
    games: BTreeMap<GameId, Game>,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }
}

/// A database held in process memory.
///
/// Transactions work on a copy of the whole state and swap it in on commit, so a failed or
/// abandoned transaction leaves nothing behind. A transaction holds the store-wide writer lock
/// from `begin` until it is committed, rolled back or dropped, and writes outside a transaction
/// wait for it too. Readers never wait.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    state: Mutex<MemoryState>,
    writer: Arc<AsyncMutex<()>>,
    faults: Mutex<Vec<(FaultPoint, usize)>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the operation at `point` fail once, after letting `skip` calls through.
    pub fn fail_at(&self, point: FaultPoint, skip: usize) {
        lock(&self.faults).push((point, skip));
    }

    /// Whether any game row references `key`.
    pub fn references_replay(&self, key: &str) -> bool {
        lock(&self.state)
            .games
            .values()
            .any(|g| g.replay_key.as_deref() == Some(key))
    }

    /// Drops the score rows of a match, leaving it with nobody to score.
    #[cfg(test)]
    pub(crate) fn clear_score_rows(&self, match_id: MatchId) {
        lock(&self.state)
            .match_participants
            .retain(|p| p.match_id != match_id);
    }

    fn trip(&self, point: FaultPoint) -> Result<(), DatabaseError> {
        let mut faults = lock(&self.faults);
        let Some(index) = faults.iter().position(|(p, _)| *p == point) else {
            return Ok(());
        };
        if faults[index].1 > 0 {
            faults[index].1 -= 1;
            return Ok(());
        }
        faults.remove(index);
        Err(DatabaseError::Unavailable(format!("fault injected at {:?}", point)))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl GroupDatabase for MemoryDatabase {
    async fn create_group(&self, name: &str) -> Result<Group, DatabaseError> {
        let _writer = self.writer.lock().await;
        let mut state = lock(&self.state);
        let group = Group {
            group_id: state.next_id(),
            name: name.to_string(),
        };
        state.groups.insert(group.group_id, group.clone());
        state.memberships.insert(group.group_id, Vec::new());
        Ok(group)
    }

    async fn get_group(&self, group_id: GroupId) -> Result<Option<Group>, DatabaseError> {
        Ok(lock(&self.state).groups.get(&group_id).cloned())
    }

    async fn get_group_participants(
        &self,
        group_id: GroupId,
    ) -> Result<Vec<Participant>, DatabaseError> {
        let state = lock(&self.state);
        let members = state
            .memberships
            .get(&group_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.participants.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        Ok(members)
    }

    async fn create_participant(&self, name: &str) -> Result<Participant, DatabaseError> {
        let _writer = self.writer.lock().await;
        let mut state = lock(&self.state);
        let participant = Participant {
            participant_id: state.next_id(),
            name: name.to_string(),
        };
        state
            .participants
            .insert(participant.participant_id, participant.clone());
        Ok(participant)
    }

    async fn get_participants(
        &self,
        participant_ids: &[ParticipantId],
    ) -> Result<Vec<Participant>, DatabaseError> {
        let state = lock(&self.state);
        Ok(participant_ids
            .iter()
            .filter_map(|id| state.participants.get(id).cloned())
            .collect())
    }
}

impl MatchDatabase for MemoryDatabase {
    async fn get_match(&self, match_id: MatchId) -> Result<Option<Match>, DatabaseError> {
        Ok(lock(&self.state).matches.get(&match_id).cloned())
    }

    async fn get_matches_by_group(&self, group_id: GroupId) -> Result<Vec<Match>, DatabaseError> {
        Ok(lock(&self.state)
            .matches
            .values()
            .filter(|m| m.group_id == group_id)
            .cloned()
            .collect())
    }

    async fn get_match_participants(
        &self,
        match_id: MatchId,
    ) -> Result<Vec<MatchParticipant>, DatabaseError> {
        Ok(match_participants(&lock(&self.state), match_id))
    }

    async fn set_match_status(
        &self,
        match_id: MatchId,
        status: MatchStatus,
    ) -> Result<(), DatabaseError> {
        let _writer = self.writer.lock().await;
        if let Some(bracket) = lock(&self.state).matches.get_mut(&match_id) {
            bracket.status = status;
        }
        Ok(())
    }
}

impl GameDatabase for MemoryDatabase {
    async fn get_games(&self, match_id: MatchId) -> Result<Vec<Game>, DatabaseError> {
        let mut games: Vec<Game> = lock(&self.state)
            .games
            .values()
            .filter(|g| g.match_id == match_id)
            .cloned()
            .collect();
        games.sort_by_key(|g| g.sequence);
        Ok(games)
    }

    async fn add_map(&self, name: &str) -> Result<GameMap, DatabaseError> {
        let _writer = self.writer.lock().await;
        let mut state = lock(&self.state);
        let map = GameMap {
            map_id: state.next_id(),
            name: name.to_string(),
        };
        state.maps.insert(map.map_id, map.clone());
        Ok(map)
    }

    async fn get_maps(&self, map_ids: &[MapId]) -> Result<Vec<GameMap>, DatabaseError> {
        let state = lock(&self.state);
        Ok(map_ids
            .iter()
            .filter_map(|id| state.maps.get(id).cloned())
            .collect())
    }
}

fn match_participants(state: &MemoryState, match_id: MatchId) -> Vec<MatchParticipant> {
    let mut rows: Vec<MatchParticipant> = state
        .match_participants
        .iter()
        .filter(|p| p.match_id == match_id)
        .cloned()
        .collect();
    rows.sort_by_key(|p| p.participant_id);
    rows
}

impl Database for MemoryDatabase {
    type Transaction<'a> = MemoryTransaction<'a>;

    async fn begin(&self) -> Result<Self::Transaction<'_>, DatabaseError> {
        let writer = self.writer.clone().lock_owned().await;
        Ok(MemoryTransaction {
            db: self,
            state: lock(&self.state).clone(),
            _writer: writer,
        })
    }
}

/// A transaction on a [`MemoryDatabase`].
pub struct MemoryTransaction<'a> {
    db: &'a MemoryDatabase,
    state: MemoryState,
    _writer: OwnedMutexGuard<()>,
}

impl StoreTransaction for MemoryTransaction<'_> {
    async fn lock_match(&mut self, _match_id: MatchId) -> Result<(), DatabaseError> {
        Ok(())
    }

    async fn get_match_participants(
        &mut self,
        match_id: MatchId,
    ) -> Result<Vec<MatchParticipant>, DatabaseError> {
        Ok(match_participants(&self.state, match_id))
    }

    async fn get_replay_keys(&mut self, match_ids: &[MatchId]) -> Result<Vec<String>, DatabaseError> {
        Ok(self
            .state
            .games
            .values()
            .filter(|g| match_ids.contains(&g.match_id))
            .filter_map(|g| g.replay_key.clone())
            .collect())
    }

    async fn delete_games(&mut self, match_id: MatchId) -> Result<u64, DatabaseError> {
        let before = self.state.games.len();
        self.state.games.retain(|_, g| g.match_id != match_id);
        Ok((before - self.state.games.len()) as u64)
    }

    async fn insert_game(
        &mut self,
        match_id: MatchId,
        game: &NewGame,
    ) -> Result<GameId, DatabaseError> {
        self.db.trip(FaultPoint::InsertGame)?;
        if !self.state.matches.contains_key(&match_id) {
            return Err(DatabaseError::Constraint(format!(
                "match {} does not exist",
                match_id
            )));
        }
        if !self.state.maps.contains_key(&game.map_id) {
            return Err(DatabaseError::Constraint(format!(
                "map {} does not exist",
                game.map_id
            )));
        }
        if let Some(p) = game
            .participants
            .iter()
            .find(|p| !self.state.participants.contains_key(&p.participant_id))
        {
            return Err(DatabaseError::Constraint(format!(
                "participant {} does not exist",
                p.participant_id
            )));
        }
        if self
            .state
            .games
            .values()
            .any(|g| g.match_id == match_id && g.sequence == game.sequence)
        {
            return Err(DatabaseError::Constraint(format!(
                "game {} of match {} already exists",
                game.sequence, match_id
            )));
        }

        let game_id = self.state.next_id();
        self.state.games.insert(
            game_id,
            Game {
                game_id,
                match_id,
                sequence: game.sequence,
                map_id: game.map_id,
                replay_key: game.replay_key.clone(),
                participants: game.participants.clone(),
            },
        );
        Ok(game_id)
    }

    async fn update_match_participant(
        &mut self,
        participant: &MatchParticipant,
    ) -> Result<(), DatabaseError> {
        self.db.trip(FaultPoint::UpdateScore)?;
        if let Some(row) = self.state.match_participants.iter_mut().find(|p| {
            p.match_id == participant.match_id && p.participant_id == participant.participant_id
        }) {
            row.won_score = participant.won_score;
            row.lost_score = participant.lost_score;
            row.is_winner = participant.is_winner;
        }
        Ok(())
    }

    async fn set_match_status(
        &mut self,
        match_id: MatchId,
        status: MatchStatus,
    ) -> Result<(), DatabaseError> {
        if let Some(bracket) = self.state.matches.get_mut(&match_id) {
            bracket.status = status;
        }
        Ok(())
    }

    async fn delete_matches(&mut self, match_ids: &[MatchId]) -> Result<u64, DatabaseError> {
        let before = self.state.matches.len();
        self.state.matches.retain(|id, _| !match_ids.contains(id));
        self.state
            .games
            .retain(|_, g| !match_ids.contains(&g.match_id));
        self.state
            .match_participants
            .retain(|p| !match_ids.contains(&p.match_id));
        Ok((before - self.state.matches.len()) as u64)
    }

    async fn insert_match(
        &mut self,
        group_id: GroupId,
        spec: &MatchSpec,
    ) -> Result<Match, DatabaseError> {
        self.db.trip(FaultPoint::InsertMatch)?;
        if !self.state.groups.contains_key(&group_id) {
            return Err(DatabaseError::Constraint(format!(
                "group {} does not exist",
                group_id
            )));
        }
        let bracket = Match {
            match_id: self.state.next_id(),
            group_id,
            slot_a: Some(spec.slot_a),
            slot_b: Some(spec.slot_b),
            status: spec.status,
            date: None,
            draft_keys: spec.draft_keys.clone(),
            comment: None,
        };
        for participant_id in bracket.participants() {
            self.state
                .match_participants
                .push(MatchParticipant::new(bracket.match_id, participant_id));
        }
        self.state.matches.insert(bracket.match_id, bracket.clone());
        Ok(bracket)
    }

    async fn set_group_participants(
        &mut self,
        group_id: GroupId,
        participant_ids: &[ParticipantId],
    ) -> Result<(), DatabaseError> {
        self.state
            .memberships
            .insert(group_id, participant_ids.to_vec());
        Ok(())
    }

    async fn commit(self) -> Result<(), DatabaseError> {
        self.db.trip(FaultPoint::Commit)?;
        *lock(&self.db.state) = self.state;
        Ok(())
    }

    async fn rollback(self) -> Result<(), DatabaseError> {
        Ok(())
    }
}
