use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};

use super::pairing::{round_robin_pairs, Pair};
use crate::database::models::{Group, GroupId, Match, MatchId, MatchSpec, ParticipantId};
use crate::database::{Database, StoreTransaction};
use crate::storage::ObjectStore;
use crate::utils::error::{DatabaseError, EngineError, ErrorContext};
use crate::Engine;

/// What a reconciliation is about to change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilePlan {
    pub deleted: Vec<MatchId>,
    pub created: Vec<MatchSpec>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty() && self.created.is_empty()
    }
}

/// What a reconciliation changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileOutcome {
    pub created: Vec<Match>,
    pub deleted: Vec<MatchId>,
}

/// The pairs already covered by matches with both slots filled.
pub fn existing_pairs(matches: &[Match]) -> Vec<Pair<ParticipantId>> {
    matches
        .iter()
        .filter_map(|m| match (m.slot_a, m.slot_b) {
            (Some(a), Some(b)) => Some(Pair::new(a, b)),
            _ => None,
        })
        .collect()
}

/// The matches a group is missing.
///
/// Every round-robin pair of `desired` that no existing pair covers, in either order.
pub fn matches_to_create(
    existing_pairs: &[Pair<ParticipantId>],
    desired: &[ParticipantId],
) -> Vec<MatchSpec> {
    let existing: HashSet<&Pair<ParticipantId>> = existing_pairs.iter().collect();
    round_robin_pairs(&dedup(desired))
        .into_iter()
        .filter(|pair| !existing.contains(pair))
        .map(|pair| MatchSpec::new(pair.first, pair.second))
        .collect()
}

/// The matches that hold a participant who is no longer wanted.
///
/// Empty slots are still to be decided and never invalidate a match on their own.
pub fn matches_to_delete(existing: &[Match], desired: &[ParticipantId]) -> Vec<MatchId> {
    let desired: HashSet<ParticipantId> = desired.iter().copied().collect();
    existing
        .iter()
        .filter(|m| m.participants().iter().any(|p| !desired.contains(p)))
        .map(|m| m.match_id)
        .collect()
}

/// Diffs the full current match set against the full desired participant list.
///
/// Deletions are worked out first and creations against what survives them, so a pair that
/// stays valid keeps its match.
pub fn plan(existing: &[Match], desired: &[ParticipantId]) -> ReconcilePlan {
    let desired = dedup(desired);
    let deleted = matches_to_delete(existing, &desired);
    let surviving: Vec<Match> = existing
        .iter()
        .filter(|m| !deleted.contains(&m.match_id))
        .cloned()
        .collect();
    let created = matches_to_create(&existing_pairs(&surviving), &desired);

    ReconcilePlan { deleted, created }
}

/// Keeps the first occurrence of every id.
fn dedup(ids: &[ParticipantId]) -> Vec<ParticipantId> {
    let mut seen = HashSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

impl<DB, S> Engine<DB, S>
where
    DB: Database,
    S: ObjectStore,
{
    /// Creates a group and its round-robin matches for the initial participants.
    #[instrument(skip(self))]
    pub async fn create_group(
        &self,
        name: &str,
        participant_ids: Vec<ParticipantId>,
    ) -> Result<(Group, ReconcileOutcome), EngineError> {
        if name.trim().is_empty() {
            return Err(EngineError::Validation("Group name is empty".to_string()));
        }
        self.ensure_participants_exist(&dedup(&participant_ids)).await?;

        let group = self
            .database
            .create_group(name)
            .await
            .context(|| format!("creating group {}", name))?;
        info!("Created group {} ({})", group.name, group.group_id);

        let outcome = self
            .reconcile_group_participants(group.group_id, participant_ids)
            .await?;
        Ok((group, outcome))
    }

    /// Brings a group's matches in line with its new participant list.
    ///
    /// `participant_ids` is always the complete list of members. Matches holding anyone not on
    /// the list are deleted with their games, and every missing pair gets a new `Pending` match.
    /// Waits for any game recording on a match about to be deleted. All of it commits together
    /// or not at all. Replays owned by deleted matches are removed from the object store after
    /// the commit.
    #[instrument(skip(self))]
    pub async fn reconcile_group_participants(
        &self,
        group_id: GroupId,
        participant_ids: Vec<ParticipantId>,
    ) -> Result<ReconcileOutcome, EngineError> {
        let _guard = self.group_locks.lock(group_id).await;

        self.database
            .get_group(group_id)
            .await
            .context(|| format!("loading group {}", group_id))?
            .ok_or_else(|| EngineError::not_found("Group", group_id))?;

        let desired = dedup(&participant_ids);
        self.ensure_participants_exist(&desired).await?;

        let existing = self
            .database
            .get_matches_by_group(group_id)
            .await
            .context(|| format!("loading matches of group {}", group_id))?;
        let plan = plan(&existing, &desired);

        // Recording games on a match about to be deleted has to finish first, or its replays
        // would be missed by the cleanup below.
        let mut doomed = plan.deleted.clone();
        doomed.sort_unstable();
        let mut match_guards = Vec::with_capacity(doomed.len());
        for match_id in doomed {
            match_guards.push(self.match_locks.lock(match_id).await);
        }

        let mut tx = self
            .database
            .begin()
            .await
            .context(|| format!("reconciling group {}", group_id))?;
        let applied = match apply_plan(&mut tx, group_id, &desired, &plan).await {
            Ok(applied) => tx.commit().await.map(|_| applied),
            Err(e) => {
                if let Err(rollback_error) = tx.rollback().await {
                    error!(
                        "Error rolling back reconciliation of group {}: {}",
                        group_id, rollback_error
                    );
                }
                Err(e)
            }
        };
        let (created, orphaned_replays) =
            applied.context(|| format!("reconciling group {}", group_id))?;

        self.remove_objects(&orphaned_replays, "deleted match replay").await;

        info!(
            "Reconciled group {}: {} matches created, {} deleted",
            group_id,
            created.len(),
            plan.deleted.len()
        );
        Ok(ReconcileOutcome {
            created,
            deleted: plan.deleted,
        })
    }

    async fn ensure_participants_exist(&self, ids: &[ParticipantId]) -> Result<(), EngineError> {
        let found: HashSet<ParticipantId> = self
            .database
            .get_participants(ids)
            .await
            .context(|| "loading participants".to_string())?
            .into_iter()
            .map(|p| p.participant_id)
            .collect();
        match ids.iter().find(|id| !found.contains(id)) {
            Some(missing) => Err(EngineError::not_found("Participant", missing)),
            None => Ok(()),
        }
    }
}

/// Writes a plan inside a transaction. Returns the created matches and the replay keys of the
/// deleted ones.
async fn apply_plan<T>(
    tx: &mut T,
    group_id: GroupId,
    desired: &[ParticipantId],
    plan: &ReconcilePlan,
) -> Result<(Vec<Match>, Vec<String>), DatabaseError>
where
    T: StoreTransaction,
{
    let mut orphaned_replays = Vec::new();
    if !plan.deleted.is_empty() {
        let mut doomed = plan.deleted.clone();
        doomed.sort_unstable();
        for match_id in doomed {
            tx.lock_match(match_id).await?;
        }
        orphaned_replays = tx.get_replay_keys(&plan.deleted).await?;
        tx.delete_matches(&plan.deleted).await?;
    }
    tx.set_group_participants(group_id, desired).await?;

    let mut created = Vec::with_capacity(plan.created.len());
    for spec in &plan.created {
        created.push(tx.insert_match(group_id, spec).await?);
    }
    Ok((created, orphaned_replays))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::database::memory::{FaultPoint, MemoryDatabase};
    use crate::database::models::{GameParticipant, GameSubmission, MatchStatus};
    use crate::database::{GameDatabase, GroupDatabase, MatchDatabase};
    use crate::storage::memory::MemoryObjectStore;
    use crate::storage::ObjectStore;
    use std::time::Duration;

    fn bracket(match_id: MatchId, a: Option<ParticipantId>, b: Option<ParticipantId>) -> Match {
        Match {
            match_id,
            group_id: 1,
            slot_a: a,
            slot_b: b,
            status: MatchStatus::Pending,
            date: None,
            draft_keys: Vec::new(),
            comment: None,
        }
    }

    fn sides(specs: &[MatchSpec]) -> Vec<(ParticipantId, ParticipantId)> {
        specs.iter().map(|s| (s.slot_a, s.slot_b)).collect()
    }

    #[test]
    fn creates_every_pair_of_a_new_group() {
        let created = matches_to_create(&[], &[1, 2, 3]);
        assert_eq!(sides(&created), vec![(1, 2), (1, 3), (2, 3)]);
        assert!(created
            .iter()
            .all(|s| s.status == MatchStatus::Pending && s.draft_keys.is_empty()));
    }

    #[test]
    fn existing_pairs_match_in_either_order() {
        let created = matches_to_create(&[Pair::new(2, 1)], &[1, 2, 3]);
        assert_eq!(sides(&created), vec![(1, 3), (2, 3)]);
    }

    #[test]
    fn deletes_matches_of_removed_participants_only() {
        let existing = vec![
            bracket(10, Some(1), Some(2)),
            bracket(11, Some(1), Some(3)),
            bracket(12, Some(2), Some(3)),
        ];
        assert_eq!(matches_to_delete(&existing, &[1, 2]), vec![11, 12]);
    }

    #[test]
    fn undecided_slots_do_not_invalidate() {
        let existing = vec![bracket(10, Some(1), None), bracket(11, None, None)];
        assert!(matches_to_delete(&existing, &[1]).is_empty());
        assert_eq!(matches_to_delete(&existing, &[2]), vec![10]);
    }

    #[test]
    fn swapping_a_participant_replaces_their_matches() {
        // A=1, B=2, C=3, D=4
        let existing = vec![
            bracket(10, Some(1), Some(2)),
            bracket(11, Some(1), Some(3)),
            bracket(12, Some(2), Some(3)),
        ];
        let plan = plan(&existing, &[1, 2, 4]);

        assert_eq!(plan.deleted, vec![11, 12]);
        assert_eq!(sides(&plan.created), vec![(1, 4), (2, 4)]);
    }

    #[test]
    fn duplicate_ids_are_ignored() {
        let plan = plan(&[], &[1, 2, 1]);
        assert_eq!(sides(&plan.created), vec![(1, 2)]);
    }

    type TestEngine = Engine<MemoryDatabase, MemoryObjectStore>;

    async fn setup(names: &[&str]) -> (TestEngine, Vec<ParticipantId>) {
        let engine = Engine::new(
            MemoryDatabase::new(),
            MemoryObjectStore::new(),
            EngineConfig::default(),
        );
        let mut ids = Vec::new();
        for name in names {
            ids.push(
                engine
                    .database()
                    .create_participant(name)
                    .await
                    .unwrap()
                    .participant_id,
            );
        }
        (engine, ids)
    }

    fn pairs_of(matches: &[Match]) -> HashSet<Pair<ParticipantId>> {
        existing_pairs(matches).into_iter().collect()
    }

    #[tokio::test]
    async fn group_membership_changes_are_reconciled() {
        let (engine, ids) = setup(&["A", "B", "C", "D"]).await;
        let (a, b, c, d) = (ids[0], ids[1], ids[2], ids[3]);

        let (group, outcome) = engine.create_group("Group A", vec![a, b, c]).await.unwrap();
        assert_eq!(outcome.created.len(), 3);
        assert!(outcome.deleted.is_empty());

        let ab = outcome
            .created
            .iter()
            .find(|m| m.involves(a) && m.involves(b))
            .unwrap()
            .match_id;

        let outcome = engine
            .reconcile_group_participants(group.group_id, vec![a, b, d])
            .await
            .unwrap();
        assert_eq!(outcome.deleted.len(), 2);
        assert_eq!(
            pairs_of(&outcome.created),
            [Pair::new(a, d), Pair::new(b, d)].into_iter().collect::<HashSet<_>>()
        );

        let matches = engine
            .database()
            .get_matches_by_group(group.group_id)
            .await
            .unwrap();
        assert_eq!(matches.len(), 3);
        assert!(matches.iter().any(|m| m.match_id == ab));
        assert!(matches.iter().all(|m| !m.involves(c)));

        let members: Vec<ParticipantId> = engine
            .database()
            .get_group_participants(group.group_id)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.participant_id)
            .collect();
        assert_eq!(members, vec![a, b, d]);
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let (engine, ids) = setup(&["A", "B", "C"]).await;
        let (group, _) = engine.create_group("Group A", ids.clone()).await.unwrap();

        let outcome = engine
            .reconcile_group_participants(group.group_id, ids)
            .await
            .unwrap();
        assert!(outcome.created.is_empty());
        assert!(outcome.deleted.is_empty());
    }

    #[tokio::test]
    async fn readding_a_participant_regenerates_their_pairs() {
        let (engine, ids) = setup(&["A", "B", "C"]).await;
        let (a, b, c) = (ids[0], ids[1], ids[2]);
        let (group, _) = engine.create_group("Group A", vec![a, b, c]).await.unwrap();

        let removed = engine
            .reconcile_group_participants(group.group_id, vec![a, b])
            .await
            .unwrap();
        assert_eq!(removed.deleted.len(), 2);
        assert!(removed.created.is_empty());

        let readded = engine
            .reconcile_group_participants(group.group_id, vec![a, b, c])
            .await
            .unwrap();
        assert!(readded.deleted.is_empty());
        assert_eq!(
            pairs_of(&readded.created),
            [Pair::new(a, c), Pair::new(b, c)].into_iter().collect::<HashSet<_>>()
        );
    }

    #[tokio::test]
    async fn unknown_participants_are_rejected_before_any_change() {
        let (engine, ids) = setup(&["A", "B"]).await;
        let (group, _) = engine.create_group("Group A", ids.clone()).await.unwrap();

        let result = engine
            .reconcile_group_participants(group.group_id, vec![ids[0], 999])
            .await;
        assert!(matches!(result, Err(EngineError::NotFound { entity: "Participant", .. })));
        assert_eq!(
            engine
                .database()
                .get_matches_by_group(group.group_id)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn unknown_group_is_not_found() {
        let (engine, ids) = setup(&["A", "B"]).await;
        let result = engine.reconcile_group_participants(42, ids).await;
        assert!(matches!(result, Err(EngineError::NotFound { entity: "Group", .. })));
    }

    #[tokio::test]
    async fn failed_reconciliation_leaves_matches_unchanged() {
        let (engine, ids) = setup(&["A", "B", "C"]).await;
        let (group, _) = engine
            .create_group("Group A", vec![ids[0], ids[1]])
            .await
            .unwrap();
        let before = engine
            .database()
            .get_matches_by_group(group.group_id)
            .await
            .unwrap();

        engine.database().fail_at(FaultPoint::InsertMatch, 0);
        let result = engine
            .reconcile_group_participants(group.group_id, vec![ids[1], ids[2]])
            .await;

        assert!(matches!(result, Err(EngineError::Transaction { .. })));
        assert_eq!(
            engine
                .database()
                .get_matches_by_group(group.group_id)
                .await
                .unwrap(),
            before
        );
    }

    #[tokio::test]
    async fn deleted_matches_take_their_replays_along() {
        let (engine, ids) = setup(&["A", "B", "C"]).await;
        let map = engine.database().add_map("Arabia").await.unwrap();
        let (group, outcome) = engine
            .create_group("Group A", vec![ids[0], ids[1]])
            .await
            .unwrap();
        let match_id = outcome.created[0].match_id;

        let temp_key = engine
            .stage_replay(b"replay".to_vec(), Some("final.aoe2record"))
            .await
            .unwrap();
        let recorded = engine
            .record_games(
                match_id,
                vec![GameSubmission {
                    map_id: map.map_id,
                    replay_key: Some(temp_key),
                    participants: vec![GameParticipant {
                        participant_id: ids[0],
                        civilization: None,
                        is_winner: true,
                    }],
                }],
                false,
                Vec::new(),
            )
            .await
            .unwrap();
        let permanent_key = recorded.games[0].replay_key.clone().unwrap();
        assert!(engine.storage().exists(&permanent_key).await.unwrap());

        engine
            .reconcile_group_participants(group.group_id, vec![ids[0], ids[2]])
            .await
            .unwrap();

        assert!(!engine.storage().exists(&permanent_key).await.unwrap());
        assert!(engine.database().get_games(match_id).await.unwrap().is_empty());
        assert!(engine.storage().keys().is_empty());
    }

    #[tokio::test]
    async fn reconciliation_waits_for_recording_on_a_deleted_match() {
        let (engine, ids) = setup(&["A", "B"]).await;
        let (group, outcome) = engine.create_group("Group A", ids.clone()).await.unwrap();
        let match_id = outcome.created[0].match_id;

        let recording = engine.match_locks.lock(match_id).await;
        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            engine.reconcile_group_participants(group.group_id, vec![ids[0]]),
        )
        .await;
        assert!(blocked.is_err());
        assert!(engine.database().get_match(match_id).await.unwrap().is_some());

        drop(recording);
        let outcome = engine
            .reconcile_group_participants(group.group_id, vec![ids[0]])
            .await
            .unwrap();
        assert_eq!(outcome.deleted, vec![match_id]);
    }

    #[tokio::test]
    async fn recording_and_deleting_one_match_leave_no_replays() {
        let (engine, ids) = setup(&["A", "B", "C"]).await;
        let map = engine.database().add_map("Arabia").await.unwrap();
        let (group, outcome) = engine
            .create_group("Group A", vec![ids[0], ids[1]])
            .await
            .unwrap();
        let match_id = outcome.created[0].match_id;
        let temp_key = engine
            .stage_replay(b"replay".to_vec(), Some("final.mgz"))
            .await
            .unwrap();

        engine.storage().set_latency(Duration::from_millis(30));
        let game = GameSubmission {
            map_id: map.map_id,
            replay_key: Some(temp_key),
            participants: vec![GameParticipant {
                participant_id: ids[0],
                civilization: None,
                is_winner: true,
            }],
        };
        let (recorded, reconciled) = tokio::join!(
            engine.record_games(match_id, vec![game], true, Vec::new()),
            engine.reconcile_group_participants(group.group_id, vec![ids[0], ids[2]]),
        );

        assert!(recorded.is_ok());
        assert_eq!(reconciled.unwrap().deleted, vec![match_id]);
        assert!(engine.database().get_match(match_id).await.unwrap().is_none());
        assert!(engine.storage().keys().is_empty());
    }
}
