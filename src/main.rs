use std::path::PathBuf;

use anyhow::Context;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tracing::{error, info, info_span};

use tournament_engine::config::Config;
use tournament_engine::database::models::{
    GameSubmission, GroupId, MatchId, MatchStatus, ParticipantId,
};
use tournament_engine::database::{Database, GameDatabase, GroupDatabase, PgDatabase};
use tournament_engine::log::setup_tracing;
use tournament_engine::storage::{Endpoint, HttpObjectStore, ObjectStore};
use tournament_engine::Engine;

/// A thread-safe Error type used by the runner.
type AppError = anyhow::Error;

/// One admin action, as the admin UI hands it over.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum AdminAction {
    CreateParticipant {
        name: String,
    },
    AddMap {
        name: String,
    },
    CreateGroup {
        name: String,
        participants: Vec<ParticipantId>,
    },
    ReconcileGroup {
        group_id: GroupId,
        participants: Vec<ParticipantId>,
    },
    StageReplay {
        path: PathBuf,
    },
    RecordGames {
        match_id: MatchId,
        games: Vec<GameSubmission>,
        #[serde(default)]
        apply_score: bool,
        #[serde(default)]
        files_to_remove: Vec<String>,
    },
    UpdateMatchStatus {
        match_id: MatchId,
        status: MatchStatus,
    },
    GetMatch {
        match_id: MatchId,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = setup_tracing() {
        panic!("Error trying to setup tracing: {}", e);
    }

    if let Err(e) = run().await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

/// Reads one action from the file given as the first argument, or from stdin, runs it and prints
/// the result as JSON.
async fn run() -> Result<(), AppError> {
    let setup_span = info_span!("runner_setup");
    let config = {
        let _guard = setup_span.enter();
        Config::from_env()?
    };

    let database = PgDatabase::connect(&config.database_url).await?;
    database.migrate().await?;
    info!("Database migrations are up to date");

    let storage = HttpObjectStore::new(
        Endpoint::new(config.object_store_url.clone()),
        config.object_store_token.clone(),
    );
    let engine = Engine::new(database, storage, config.engine);

    let input = match std::env::args().nth(1) {
        Some(path) => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Unable to read action file {}", path))?,
        None => {
            let mut input = String::new();
            tokio::io::stdin().read_to_string(&mut input).await?;
            input
        }
    };
    let action: AdminAction = serde_json::from_str(&input).context("Malformed admin action")?;

    let output = execute(&engine, action).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}

async fn execute<DB, S>(engine: &Engine<DB, S>, action: AdminAction) -> Result<Value, AppError>
where
    DB: Database,
    S: ObjectStore,
{
    let output = match action {
        AdminAction::CreateParticipant { name } => {
            serde_json::to_value(engine.database().create_participant(&name).await?)?
        }
        AdminAction::AddMap { name } => {
            serde_json::to_value(engine.database().add_map(&name).await?)?
        }
        AdminAction::CreateGroup { name, participants } => {
            let (group, outcome) = engine.create_group(&name, participants).await?;
            json!({ "group": group, "created": outcome.created, "deleted": outcome.deleted })
        }
        AdminAction::ReconcileGroup {
            group_id,
            participants,
        } => serde_json::to_value(
            engine
                .reconcile_group_participants(group_id, participants)
                .await?,
        )?,
        AdminAction::StageReplay { path } => {
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("Unable to read replay {}", path.display()))?;
            let filename = path.file_name().and_then(|n| n.to_str());
            json!({ "key": engine.stage_replay(bytes, filename).await? })
        }
        AdminAction::RecordGames {
            match_id,
            games,
            apply_score,
            files_to_remove,
        } => serde_json::to_value(
            engine
                .record_games(match_id, games, apply_score, files_to_remove)
                .await?,
        )?,
        AdminAction::UpdateMatchStatus { match_id, status } => {
            serde_json::to_value(engine.update_match_status(match_id, status).await?)?
        }
        AdminAction::GetMatch { match_id } => {
            serde_json::to_value(engine.get_match(match_id).await?)?
        }
    };
    Ok(output)
}
