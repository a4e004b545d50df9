use std::collections::HashMap;

use models::*;
use sqlx::{PgPool, Postgres};
use tracing::info;

use crate::utils::error::DatabaseError;

/// An in-process database with the same transactional behaviour as Postgres.
pub mod memory;
/// Models for the database.
///
/// These models are specific to the current database design and schema.
/// Most if not all are directly mapped to a table in the database.
pub mod models;

/// The Postgres database used by the tournament engine.
#[derive(Debug, Clone)]
pub struct PgDatabase {
    pub pool: PgPool,
}

impl PgDatabase {
    pub async fn connect(database_url: &str) -> Result<Self, DatabaseError> {
        let pool = PgPool::connect(database_url).await?;
        info!("Successfully connected to the database.");

        Ok(PgDatabase { pool })
    }

    pub async fn migrate(&self) -> Result<(), DatabaseError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

/// Groups and the participants entered into them.
#[allow(async_fn_in_trait)]
pub trait GroupDatabase {
    /// Creates an empty group.
    async fn create_group(&self, name: &str) -> Result<Group, DatabaseError>;

    /// Retrieves a group by its id.
    async fn get_group(&self, group_id: GroupId) -> Result<Option<Group>, DatabaseError>;

    /// Retrieves the current members of a group in their stored order.
    async fn get_group_participants(
        &self,
        group_id: GroupId,
    ) -> Result<Vec<Participant>, DatabaseError>;

    /// Adds a participant to the database.
    async fn create_participant(&self, name: &str) -> Result<Participant, DatabaseError>;

    /// Retrieves the participants with the given ids. Unknown ids are skipped.
    async fn get_participants(
        &self,
        participant_ids: &[ParticipantId],
    ) -> Result<Vec<Participant>, DatabaseError>;
}

#[allow(async_fn_in_trait)]
pub trait MatchDatabase {
    /// Retrieves a match by its id.
    async fn get_match(&self, match_id: MatchId) -> Result<Option<Match>, DatabaseError>;

    /// Retrieves all matches of a group, oldest first.
    async fn get_matches_by_group(&self, group_id: GroupId) -> Result<Vec<Match>, DatabaseError>;

    /// Retrieves the score rows of a match.
    async fn get_match_participants(
        &self,
        match_id: MatchId,
    ) -> Result<Vec<MatchParticipant>, DatabaseError>;

    /// Sets the status of a match.
    ///
    /// The caller is responsible for checking that the transition is legal.
    async fn set_match_status(
        &self,
        match_id: MatchId,
        status: MatchStatus,
    ) -> Result<(), DatabaseError>;
}

#[allow(async_fn_in_trait)]
pub trait GameDatabase {
    /// Retrieves the games of a match ordered by their sequence.
    async fn get_games(&self, match_id: MatchId) -> Result<Vec<Game>, DatabaseError>;

    /// Adds a map to the database.
    async fn add_map(&self, name: &str) -> Result<GameMap, DatabaseError>;

    /// Retrieves the maps with the given ids. Unknown ids are skipped.
    async fn get_maps(&self, map_ids: &[MapId]) -> Result<Vec<GameMap>, DatabaseError>;
}

/// Any relational store the engine can run on.
///
/// Reads go straight through the trait family above. Everything that mutates matches or games
/// goes through a [`StoreTransaction`] so it can be rolled back as a whole.
#[allow(async_fn_in_trait)]
pub trait Database: GroupDatabase + MatchDatabase + GameDatabase {
    type Transaction<'a>: StoreTransaction
    where
        Self: 'a;

    async fn begin(&self) -> Result<Self::Transaction<'_>, DatabaseError>;
}

/// A unit of work on the relational store. Nothing is visible to other readers before `commit`.
#[allow(async_fn_in_trait)]
pub trait StoreTransaction {
    /// Serialises writers of the same match until the transaction ends.
    async fn lock_match(&mut self, match_id: MatchId) -> Result<(), DatabaseError>;

    async fn get_match_participants(
        &mut self,
        match_id: MatchId,
    ) -> Result<Vec<MatchParticipant>, DatabaseError>;

    /// Retrieves every replay key referenced by the games of the given matches.
    async fn get_replay_keys(&mut self, match_ids: &[MatchId]) -> Result<Vec<String>, DatabaseError>;

    /// Deletes every game of a match along with its game participants.
    async fn delete_games(&mut self, match_id: MatchId) -> Result<u64, DatabaseError>;

    /// Inserts a game and its game participants.
    async fn insert_game(&mut self, match_id: MatchId, game: &NewGame)
        -> Result<GameId, DatabaseError>;

    /// Writes the score columns of a match participant row.
    async fn update_match_participant(
        &mut self,
        participant: &MatchParticipant,
    ) -> Result<(), DatabaseError>;

    async fn set_match_status(
        &mut self,
        match_id: MatchId,
        status: MatchStatus,
    ) -> Result<(), DatabaseError>;

    /// Deletes matches and everything they own.
    async fn delete_matches(&mut self, match_ids: &[MatchId]) -> Result<u64, DatabaseError>;

    /// Creates a match in a group along with a score row for each of its slots.
    async fn insert_match(
        &mut self,
        group_id: GroupId,
        spec: &MatchSpec,
    ) -> Result<Match, DatabaseError>;

    /// Replaces the membership list of a group.
    async fn set_group_participants(
        &mut self,
        group_id: GroupId,
        participant_ids: &[ParticipantId],
    ) -> Result<(), DatabaseError>;

    async fn commit(self) -> Result<(), DatabaseError>;

    async fn rollback(self) -> Result<(), DatabaseError>;
}

const MATCH_COLUMNS: &str =
    "match_id, group_id, slot_a, slot_b, status, date, draft_keys, comment";

impl GroupDatabase for PgDatabase {
    async fn create_group(&self, name: &str) -> Result<Group, DatabaseError> {
        let group = sqlx::query_as::<_, Group>(
            r#"
            INSERT INTO groups (name)
            VALUES ($1)
            RETURNING group_id, name
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        Ok(group)
    }

    async fn get_group(&self, group_id: GroupId) -> Result<Option<Group>, DatabaseError> {
        let group = sqlx::query_as::<_, Group>(
            r#"
            SELECT group_id, name FROM groups WHERE group_id = $1
            LIMIT 1
            "#,
        )
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(group)
    }

    async fn get_group_participants(
        &self,
        group_id: GroupId,
    ) -> Result<Vec<Participant>, DatabaseError> {
        let participants = sqlx::query_as::<_, Participant>(
            r#"
            SELECT p.participant_id, p.name
            FROM group_participants AS gp
            JOIN participants AS p
            ON gp.participant_id = p.participant_id
            WHERE gp.group_id = $1
            ORDER BY gp.position
            "#,
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(participants)
    }

    async fn create_participant(&self, name: &str) -> Result<Participant, DatabaseError> {
        let participant = sqlx::query_as::<_, Participant>(
            r#"
            INSERT INTO participants (name)
            VALUES ($1)
            RETURNING participant_id, name
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        Ok(participant)
    }

    async fn get_participants(
        &self,
        participant_ids: &[ParticipantId],
    ) -> Result<Vec<Participant>, DatabaseError> {
        let participants = sqlx::query_as::<_, Participant>(
            r#"
            SELECT participant_id, name
            FROM participants
            WHERE participant_id = ANY($1)
            "#,
        )
        .bind(participant_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(participants)
    }
}

impl MatchDatabase for PgDatabase {
    async fn get_match(&self, match_id: MatchId) -> Result<Option<Match>, DatabaseError> {
        let bracket = sqlx::query_as::<_, Match>(&format!(
            "SELECT {MATCH_COLUMNS} FROM matches WHERE match_id = $1 LIMIT 1"
        ))
        .bind(match_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(bracket)
    }

    async fn get_matches_by_group(&self, group_id: GroupId) -> Result<Vec<Match>, DatabaseError> {
        let matches = sqlx::query_as::<_, Match>(&format!(
            "SELECT {MATCH_COLUMNS} FROM matches WHERE group_id = $1 ORDER BY match_id"
        ))
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(matches)
    }

    async fn get_match_participants(
        &self,
        match_id: MatchId,
    ) -> Result<Vec<MatchParticipant>, DatabaseError> {
        // ORDER BY participant_id ensures we always get the participants in the same order.
        let participants = sqlx::query_as::<_, MatchParticipant>(
            r#"
            SELECT match_id, participant_id, won_score, lost_score, is_winner
            FROM match_participants
            WHERE match_id = $1
            ORDER BY participant_id
            "#,
        )
        .bind(match_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(participants)
    }

    async fn set_match_status(
        &self,
        match_id: MatchId,
        status: MatchStatus,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            UPDATE matches
            SET status = $1
            WHERE match_id = $2
            "#,
        )
        .bind(status)
        .bind(match_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Temp struct necessary because games and their participants live in separate tables.
#[derive(sqlx::FromRow)]
struct GameRow {
    game_id: GameId,
    match_id: MatchId,
    sequence: i32,
    map_id: MapId,
    replay_key: Option<String>,
}

#[derive(sqlx::FromRow)]
struct GameParticipantRow {
    game_id: GameId,
    participant_id: ParticipantId,
    civilization: Option<String>,
    is_winner: bool,
}

impl GameDatabase for PgDatabase {
    async fn get_games(&self, match_id: MatchId) -> Result<Vec<Game>, DatabaseError> {
        let rows = sqlx::query_as::<_, GameRow>(
            r#"
            SELECT game_id, match_id, sequence, map_id, replay_key
            FROM games
            WHERE match_id = $1
            ORDER BY sequence
            "#,
        )
        .bind(match_id)
        .fetch_all(&self.pool)
        .await?;

        let game_ids: Vec<GameId> = rows.iter().map(|g| g.game_id).collect();

        let participant_rows = sqlx::query_as::<_, GameParticipantRow>(
            r#"
            SELECT game_id, participant_id, civilization, is_winner
            FROM game_participants
            WHERE game_id = ANY($1)
            ORDER BY game_id, position
            "#,
        )
        .bind(&game_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_game: HashMap<GameId, Vec<GameParticipant>> = HashMap::new();
        for row in participant_rows {
            by_game.entry(row.game_id).or_default().push(GameParticipant {
                participant_id: row.participant_id,
                civilization: row.civilization,
                is_winner: row.is_winner,
            });
        }

        let games = rows
            .into_iter()
            .map(|row| Game {
                participants: by_game.remove(&row.game_id).unwrap_or_default(),
                game_id: row.game_id,
                match_id: row.match_id,
                sequence: row.sequence,
                map_id: row.map_id,
                replay_key: row.replay_key,
            })
            .collect();

        Ok(games)
    }

    async fn add_map(&self, name: &str) -> Result<GameMap, DatabaseError> {
        let map = sqlx::query_as::<_, GameMap>(
            r#"
            INSERT INTO maps (name)
            VALUES ($1)
            RETURNING map_id, name
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        Ok(map)
    }

    async fn get_maps(&self, map_ids: &[MapId]) -> Result<Vec<GameMap>, DatabaseError> {
        let maps = sqlx::query_as::<_, GameMap>(
            r#"
            SELECT map_id, name
            FROM maps
            WHERE map_id = ANY($1)
            "#,
        )
        .bind(map_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(maps)
    }
}

impl Database for PgDatabase {
    type Transaction<'a> = PgTransaction<'a>;

    async fn begin(&self) -> Result<Self::Transaction<'_>, DatabaseError> {
        Ok(PgTransaction {
            tx: self.pool.begin().await?,
        })
    }
}

/// A Postgres transaction. Dropping it without committing rolls it back.
pub struct PgTransaction<'a> {
    tx: sqlx::Transaction<'a, Postgres>,
}

impl StoreTransaction for PgTransaction<'_> {
    async fn lock_match(&mut self, match_id: MatchId) -> Result<(), DatabaseError> {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(match_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn get_match_participants(
        &mut self,
        match_id: MatchId,
    ) -> Result<Vec<MatchParticipant>, DatabaseError> {
        let participants = sqlx::query_as::<_, MatchParticipant>(
            r#"
            SELECT match_id, participant_id, won_score, lost_score, is_winner
            FROM match_participants
            WHERE match_id = $1
            ORDER BY participant_id
            "#,
        )
        .bind(match_id)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(participants)
    }

    async fn get_replay_keys(&mut self, match_ids: &[MatchId]) -> Result<Vec<String>, DatabaseError> {
        let keys = sqlx::query_scalar::<_, String>(
            r#"
            SELECT replay_key
            FROM games
            WHERE match_id = ANY($1) AND replay_key IS NOT NULL
            ORDER BY match_id, sequence
            "#,
        )
        .bind(match_ids)
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(keys)
    }

    async fn delete_games(&mut self, match_id: MatchId) -> Result<u64, DatabaseError> {
        // game_participants go with their games through ON DELETE CASCADE
        let deleted = sqlx::query("DELETE FROM games WHERE match_id = $1")
            .bind(match_id)
            .execute(&mut *self.tx)
            .await?
            .rows_affected();

        Ok(deleted)
    }

    async fn insert_game(
        &mut self,
        match_id: MatchId,
        game: &NewGame,
    ) -> Result<GameId, DatabaseError> {
        let game_id = sqlx::query_scalar::<_, GameId>(
            r#"
            INSERT INTO games (match_id, sequence, map_id, replay_key)
            VALUES ($1, $2, $3, $4)
            RETURNING game_id
            "#,
        )
        .bind(match_id)
        .bind(game.sequence)
        .bind(game.map_id)
        .bind(&game.replay_key)
        .fetch_one(&mut *self.tx)
        .await?;

        for (position, participant) in game.participants.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO game_participants (game_id, position, participant_id, civilization, is_winner)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(game_id)
            .bind(position as i32)
            .bind(participant.participant_id)
            .bind(&participant.civilization)
            .bind(participant.is_winner)
            .execute(&mut *self.tx)
            .await?;
        }

        Ok(game_id)
    }

    async fn update_match_participant(
        &mut self,
        participant: &MatchParticipant,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            UPDATE match_participants
            SET won_score = $1, lost_score = $2, is_winner = $3
            WHERE match_id = $4 AND participant_id = $5
            "#,
        )
        .bind(participant.won_score)
        .bind(participant.lost_score)
        .bind(participant.is_winner)
        .bind(participant.match_id)
        .bind(participant.participant_id)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn set_match_status(
        &mut self,
        match_id: MatchId,
        status: MatchStatus,
    ) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE matches SET status = $1 WHERE match_id = $2")
            .bind(status)
            .bind(match_id)
            .execute(&mut *self.tx)
            .await?;

        Ok(())
    }

    async fn delete_matches(&mut self, match_ids: &[MatchId]) -> Result<u64, DatabaseError> {
        // games, game_participants and match_participants cascade
        let deleted = sqlx::query("DELETE FROM matches WHERE match_id = ANY($1)")
            .bind(match_ids)
            .execute(&mut *self.tx)
            .await?
            .rows_affected();

        Ok(deleted)
    }

    async fn insert_match(
        &mut self,
        group_id: GroupId,
        spec: &MatchSpec,
    ) -> Result<Match, DatabaseError> {
        let bracket = sqlx::query_as::<_, Match>(&format!(
            r#"
            INSERT INTO matches (group_id, slot_a, slot_b, status, draft_keys)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {MATCH_COLUMNS}
            "#
        ))
        .bind(group_id)
        .bind(spec.slot_a)
        .bind(spec.slot_b)
        .bind(spec.status)
        .bind(&spec.draft_keys)
        .fetch_one(&mut *self.tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO match_participants (match_id, participant_id)
            SELECT $1, UNNEST($2::bigint[])
            "#,
        )
        .bind(bracket.match_id)
        .bind(bracket.participants())
        .execute(&mut *self.tx)
        .await?;

        Ok(bracket)
    }

    async fn set_group_participants(
        &mut self,
        group_id: GroupId,
        participant_ids: &[ParticipantId],
    ) -> Result<(), DatabaseError> {
        sqlx::query("DELETE FROM group_participants WHERE group_id = $1")
            .bind(group_id)
            .execute(&mut *self.tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO group_participants (group_id, participant_id, position)
            SELECT $1, t.participant_id, t.position
            FROM UNNEST($2::bigint[]) WITH ORDINALITY AS t(participant_id, position)
            "#,
        )
        .bind(group_id)
        .bind(participant_ids)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn commit(self) -> Result<(), DatabaseError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), DatabaseError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
