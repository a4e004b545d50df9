use std::collections::{BTreeSet, HashSet};

use futures::future::join_all;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::database::models::*;
use crate::database::{Database, StoreTransaction};
use crate::storage::{bounded, ObjectMetadata, ObjectStore};
use crate::utils::error::{EngineError, ErrorContext};
use crate::Engine;

/// A replay that was copied from its temp key to a permanent key during a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Promotion {
    pub temp_key: String,
    pub permanent_key: String,
}

/// What the transaction body did.
enum Written {
    /// The match has no score rows, nothing was written.
    Skipped,
    Replaced {
        games: Vec<Game>,
        participants: Vec<MatchParticipant>,
        status: MatchStatus,
        previous_replays: Vec<String>,
    },
}

/// The permanent key of a promoted replay.
///
/// Derived from the match, the submission batch and the game's 1-based position in the
/// submission, so submitting the same games in another order gives other keys. The temp key's
/// extension is kept. A fresh batch id per submission keeps the keys of a failed submission
/// apart from those of the games already stored.
pub fn permanent_replay_key(
    prefix: &str,
    match_id: MatchId,
    batch: &str,
    sequence: i32,
    temp_key: &str,
) -> String {
    format!(
        "{}match_{}/{}/game_{}{}",
        prefix,
        match_id,
        batch,
        sequence,
        extension(temp_key)
    )
}

/// The extension of the last segment of a key, dot included, or an empty string.
fn extension(key: &str) -> String {
    let name = key.rsplit('/').next().unwrap_or(key);
    match name.rfind('.') {
        Some(dot) if dot > 0 && dot + 1 < name.len() => {
            let ext = &name[dot + 1..];
            if ext.len() <= 16 && ext.chars().all(|c| c.is_ascii_alphanumeric()) {
                format!(".{}", ext)
            } else {
                String::new()
            }
        }
        _ => String::new(),
    }
}

/// Recomputes the score rows of a match from its games.
///
/// Every entry of a participant counts as a won or lost game for them. The match winners are
/// everyone with the highest number of won games, as long as that number is above zero; ties make
/// several winners.
pub fn tally_scores(rows: &[MatchParticipant], games: &[NewGame]) -> Vec<MatchParticipant> {
    let mut tallied: Vec<MatchParticipant> = rows
        .iter()
        .map(|row| {
            let entries = games
                .iter()
                .flat_map(|g| &g.participants)
                .filter(|p| p.participant_id == row.participant_id);
            let (won, lost) = entries.fold((0, 0), |(won, lost), p| {
                if p.is_winner {
                    (won + 1, lost)
                } else {
                    (won, lost + 1)
                }
            });
            MatchParticipant {
                won_score: won,
                lost_score: lost,
                is_winner: false,
                ..row.clone()
            }
        })
        .collect();

    let max_won = tallied.iter().map(|r| r.won_score).max().unwrap_or(0);
    if max_won > 0 {
        for row in tallied.iter_mut() {
            row.is_winner = row.won_score == max_won;
        }
    }
    tallied
}

impl<DB, S> Engine<DB, S>
where
    DB: Database,
    S: ObjectStore,
{
    /// Replaces the games of a match with a new batch.
    ///
    /// Replays referenced by temp keys are copied to permanent keys while the games are written.
    /// When `apply_score` is set the score rows are recomputed and the match is approved.
    ///
    /// `files_to_remove` are deleted up front on a best-effort basis. If the transaction commits,
    /// the promoted temp keys and the replays the old games no longer share with the new ones are
    /// deleted, again best-effort. If it does not, every permanent key created by this call is
    /// deleted and the temp uploads stay where they are, so the admin can submit again.
    #[instrument(skip(self, games, files_to_remove), fields(games = games.len()))]
    pub async fn record_games(
        &self,
        match_id: MatchId,
        games: Vec<GameSubmission>,
        apply_score: bool,
        files_to_remove: Vec<String>,
    ) -> Result<UpdatedMatch, EngineError> {
        let _guard = self.match_locks.lock(match_id).await;

        let bracket = self
            .database
            .get_match(match_id)
            .await
            .context(|| format!("loading match {}", match_id))?
            .ok_or_else(|| EngineError::not_found("Match", match_id))?;
        self.validate_submission(&bracket, &games, apply_score, &files_to_remove)
            .await?;

        self.remove_objects(&files_to_remove, "unlinked replay").await;

        let batch = Uuid::new_v4().simple().to_string();
        let mut promotions = Vec::new();

        let mut tx = self
            .database
            .begin()
            .await
            .context(|| format!("recording games of match {}", match_id))?;
        let written = match self
            .write_games(&mut tx, &bracket, &games, apply_score, &batch, &mut promotions)
            .await
        {
            Ok(written) => tx
                .commit()
                .await
                .context(|| format!("committing games of match {}", match_id))
                .map(|_| written),
            Err(e) => {
                if let Err(rollback_error) = tx.rollback().await {
                    error!(
                        "Error rolling back games of match {}: {}",
                        match_id, rollback_error
                    );
                }
                Err(e)
            }
        };

        let written = match written {
            Ok(written) => written,
            Err(e) => {
                warn!("Recording games of match {} failed: {}", match_id, e);
                self.undo_promotions(&promotions).await;
                return Err(e);
            }
        };

        match written {
            Written::Skipped => {
                info!("Match {} has no participants, nothing to record", match_id);
                Ok(UpdatedMatch {
                    bracket,
                    participants: Vec::new(),
                    games: Vec::new(),
                })
            }
            Written::Replaced {
                games,
                participants,
                status,
                previous_replays,
            } => {
                let temp_keys: Vec<String> =
                    promotions.iter().map(|p| p.temp_key.clone()).collect();
                self.remove_objects(&temp_keys, "promoted temp").await;

                let kept: HashSet<&str> = games
                    .iter()
                    .filter_map(|g| g.replay_key.as_deref())
                    .collect();
                let replaced: Vec<String> = previous_replays
                    .into_iter()
                    .filter(|key| !kept.contains(key.as_str()) && !files_to_remove.contains(key))
                    .collect();
                self.remove_objects(&replaced, "replaced replay").await;

                info!(
                    "Recorded {} games for match {} ({} replays promoted)",
                    games.len(),
                    match_id,
                    promotions.len()
                );
                Ok(UpdatedMatch {
                    bracket: Match { status, ..bracket },
                    participants,
                    games,
                })
            }
        }
    }

    /// The transaction body of [`Engine::record_games`]. Every promotion is pushed before its
    /// copy starts, so a copy that fails halfway is still undone.
    async fn write_games<T>(
        &self,
        tx: &mut T,
        bracket: &Match,
        submissions: &[GameSubmission],
        apply_score: bool,
        batch: &str,
        promotions: &mut Vec<Promotion>,
    ) -> Result<Written, EngineError>
    where
        T: StoreTransaction,
    {
        let match_id = bracket.match_id;
        tx.lock_match(match_id)
            .await
            .context(|| format!("locking match {}", match_id))?;

        let rows = tx
            .get_match_participants(match_id)
            .await
            .context(|| format!("loading participants of match {}", match_id))?;
        if rows.is_empty() {
            return Ok(Written::Skipped);
        }

        let previous_replays = tx
            .get_replay_keys(&[match_id])
            .await
            .context(|| format!("loading replays of match {}", match_id))?;
        let deleted = tx
            .delete_games(match_id)
            .await
            .context(|| format!("deleting games of match {}", match_id))?;
        debug!("Deleted {} previous games of match {}", deleted, match_id);

        let mut new_games = Vec::with_capacity(submissions.len());
        let mut games = Vec::with_capacity(submissions.len());
        for (index, submission) in submissions.iter().enumerate() {
            let sequence = index as i32 + 1;
            let replay_key = match &submission.replay_key {
                Some(temp_key) if self.is_temp_key(temp_key) => {
                    let permanent_key = permanent_replay_key(
                        &self.config.permanent_prefix,
                        match_id,
                        batch,
                        sequence,
                        temp_key,
                    );
                    promotions.push(Promotion {
                        temp_key: temp_key.clone(),
                        permanent_key: permanent_key.clone(),
                    });
                    bounded(
                        self.config.storage_timeout,
                        temp_key,
                        self.storage.copy(temp_key, &permanent_key),
                    )
                    .await
                    .context(|| {
                        format!(
                            "promoting replay {} of game {} of match {}",
                            temp_key, sequence, match_id
                        )
                    })?;
                    Some(permanent_key)
                }
                other => other.clone(),
            };

            let game = NewGame {
                sequence,
                map_id: submission.map_id,
                replay_key,
                participants: submission.participants.clone(),
            };
            let game_id = tx
                .insert_game(match_id, &game)
                .await
                .context(|| format!("inserting game {} of match {}", sequence, match_id))?;
            games.push(Game {
                game_id,
                match_id,
                sequence,
                map_id: game.map_id,
                replay_key: game.replay_key.clone(),
                participants: game.participants.clone(),
            });
            new_games.push(game);
        }

        let (participants, status) = if apply_score {
            let tallied = tally_scores(&rows, &new_games);
            for row in &tallied {
                tx.update_match_participant(row).await.context(|| {
                    format!(
                        "writing score of participant {} in match {}",
                        row.participant_id, match_id
                    )
                })?;
            }
            tx.set_match_status(match_id, MatchStatus::AdminApproved)
                .await
                .context(|| format!("approving match {}", match_id))?;
            (tallied, MatchStatus::AdminApproved)
        } else {
            (rows, bracket.status)
        };

        Ok(Written::Replaced {
            games,
            participants,
            status,
            previous_replays,
        })
    }

    /// Deletes the permanent copies of a failed submission. A failure here is logged and the
    /// object left for the retention sweep; it never replaces the error being returned.
    async fn undo_promotions(&self, promotions: &[Promotion]) {
        let timeout = self.config.storage_timeout;
        let results = join_all(promotions.iter().map(|p| {
            bounded(
                timeout,
                &p.permanent_key,
                self.storage.delete(&p.permanent_key),
            )
        }))
        .await;

        for (promotion, result) in promotions.iter().zip(results) {
            if let Err(e) = result {
                error!(
                    "Unable to roll back promoted replay {}: {}",
                    promotion.permanent_key, e
                );
            }
        }
    }

    /// Rejects a submission before anything is touched.
    async fn validate_submission(
        &self,
        bracket: &Match,
        games: &[GameSubmission],
        apply_score: bool,
        files_to_remove: &[String],
    ) -> Result<(), EngineError> {
        if apply_score && !bracket.status.can_transition_to(MatchStatus::AdminApproved) {
            return Err(EngineError::Validation(format!(
                "Match {} is {} and cannot be approved",
                bracket.match_id, bracket.status
            )));
        }

        let own_prefix = self.match_replay_prefix(bracket.match_id);
        for (index, game) in games.iter().enumerate() {
            let sequence = index + 1;
            if game.participants.is_empty() {
                return Err(EngineError::Validation(format!(
                    "Game {} of match {} has no participants",
                    sequence, bracket.match_id
                )));
            }
            let mut seen = HashSet::new();
            if let Some(p) = game
                .participants
                .iter()
                .find(|p| !seen.insert(p.participant_id))
            {
                return Err(EngineError::Validation(format!(
                    "Participant {} appears twice in game {} of match {}",
                    p.participant_id, sequence, bracket.match_id
                )));
            }
            if let Some(key) = &game.replay_key {
                if !self.is_temp_key(key) && !key.starts_with(&own_prefix) {
                    return Err(EngineError::Validation(format!(
                        "Replay {} of game {} does not belong to match {}",
                        key, sequence, bracket.match_id
                    )));
                }
                if files_to_remove.contains(key) {
                    return Err(EngineError::Validation(format!(
                        "Replay {} of game {} is also marked for removal",
                        key, sequence
                    )));
                }
            }
        }

        let map_ids: BTreeSet<MapId> = games.iter().map(|g| g.map_id).collect();
        let map_ids: Vec<MapId> = map_ids.into_iter().collect();
        let found: HashSet<MapId> = self
            .database
            .get_maps(&map_ids)
            .await
            .context(|| format!("loading maps for match {}", bracket.match_id))?
            .into_iter()
            .map(|m| m.map_id)
            .collect();
        if let Some(missing) = map_ids.iter().find(|id| !found.contains(id)) {
            return Err(EngineError::not_found("Map", missing));
        }

        let participant_ids: BTreeSet<ParticipantId> = games
            .iter()
            .flat_map(|g| g.participants.iter().map(|p| p.participant_id))
            .collect();
        let participant_ids: Vec<ParticipantId> = participant_ids.into_iter().collect();
        let found: HashSet<ParticipantId> = self
            .database
            .get_participants(&participant_ids)
            .await
            .context(|| format!("loading participants for match {}", bracket.match_id))?
            .into_iter()
            .map(|p| p.participant_id)
            .collect();
        if let Some(missing) = participant_ids.iter().find(|id| !found.contains(id)) {
            return Err(EngineError::not_found("Participant", missing));
        }

        Ok(())
    }

    /// Uploads a replay to a fresh temp key and returns the key.
    ///
    /// This is how the admin UI attaches a file to a game before the games are submitted.
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    pub async fn stage_replay(
        &self,
        bytes: Vec<u8>,
        filename: Option<&str>,
    ) -> Result<String, EngineError> {
        if bytes.is_empty() {
            return Err(EngineError::Validation("Replay file is empty".to_string()));
        }
        let key = format!(
            "{}{}{}",
            self.config.temp_prefix,
            Uuid::new_v4().simple(),
            filename.map(extension).unwrap_or_default()
        );
        let metadata = ObjectMetadata {
            content_type: Some("application/octet-stream".to_string()),
            filename: filename.map(str::to_string),
        };
        bounded(
            self.config.storage_timeout,
            &key,
            self.storage.upload(&key, bytes, &metadata),
        )
        .await
        .context(|| format!("uploading replay {}", key))?;

        info!("Staged replay {}", key);
        Ok(key)
    }

    /// Moves a match along the admin editor's status path.
    #[instrument(skip(self))]
    pub async fn update_match_status(
        &self,
        match_id: MatchId,
        status: MatchStatus,
    ) -> Result<Match, EngineError> {
        let _guard = self.match_locks.lock(match_id).await;

        let bracket = self
            .database
            .get_match(match_id)
            .await
            .context(|| format!("loading match {}", match_id))?
            .ok_or_else(|| EngineError::not_found("Match", match_id))?;
        if !bracket.status.can_transition_to(status) {
            return Err(EngineError::Validation(format!(
                "Match {} cannot go from {} to {}",
                match_id, bracket.status, status
            )));
        }

        self.database
            .set_match_status(match_id, status)
            .await
            .context(|| format!("setting status of match {}", match_id))?;
        info!("Match {} is now {}", match_id, status);

        Ok(Match { status, ..bracket })
    }

    /// Reads a match with its score rows and games.
    pub async fn get_match(&self, match_id: MatchId) -> Result<UpdatedMatch, EngineError> {
        let bracket = self
            .database
            .get_match(match_id)
            .await
            .context(|| format!("loading match {}", match_id))?
            .ok_or_else(|| EngineError::not_found("Match", match_id))?;
        let participants = self
            .database
            .get_match_participants(match_id)
            .await
            .context(|| format!("loading participants of match {}", match_id))?;
        let games = self
            .database
            .get_games(match_id)
            .await
            .context(|| format!("loading games of match {}", match_id))?;

        Ok(UpdatedMatch {
            bracket,
            participants,
            games,
        })
    }

    fn is_temp_key(&self, key: &str) -> bool {
        key.starts_with(&self.config.temp_prefix)
    }

    fn match_replay_prefix(&self, match_id: MatchId) -> String {
        format!("{}match_{}/", self.config.permanent_prefix, match_id)
    }
}
