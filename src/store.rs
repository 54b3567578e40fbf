//! Case, agent-run and audit persistence.
//!
//! State lives in memory behind an async lock. With a state file configured,
//! the file on disk is the source of truth for every `caseflow` process that
//! points at it:
//!
//! - Writes take an exclusive lock on `<state>.lock`, reload the snapshot,
//!   apply the change to that copy and write it back through a temporary file.
//!   The in-memory state is replaced only after the copy is on disk.
//! - Audit entries live in `<state>.audit.jsonl`, which is only appended to.
//! - Each store holds a lease, a lock file under `<state>.leases/` kept locked
//!   for as long as the store lives. Processing cases and pending runs record
//!   the lease of the process that owns them. They are only reclaimed once
//!   that lease can be taken, which means the owner is gone.
//!
//! The store never deletes anything. Audit entries can only be appended, and
//! agent runs can only move out of `Pending` once.

use crate::error::StoreError;
use crate::models::{
    AgentResult, AgentRun, AgentRunStatus, AgentType, AuditLogEntry, Case, CaseId, CaseStatus,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StoreState {
    #[serde(default)]
    cases: HashMap<CaseId, Case>,
    #[serde(default)]
    agent_runs: Vec<AgentRun>,
    /// Lease of the process driving each `Processing` case.
    #[serde(default)]
    case_owners: HashMap<CaseId, Uuid>,
    /// Lease of the process that began each pending run.
    #[serde(default)]
    run_owners: HashMap<Uuid, Uuid>,
    #[serde(skip)]
    audit_log: Vec<AuditLogEntry>,
}

/// Final outcome written onto a pending run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: AgentRunStatus,
    pub output: Option<Value>,
    pub confidence: Option<f64>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl<T: Serialize> From<&AgentResult<T>> for RunOutcome {
    fn from(result: &AgentResult<T>) -> Self {
        if result.success {
            Self {
                status: AgentRunStatus::Completed,
                output: result
                    .data
                    .as_ref()
                    .and_then(|d| serde_json::to_value(d).ok()),
                confidence: Some(result.confidence),
                error: None,
                duration_ms: result.duration_ms,
            }
        } else {
            Self {
                status: AgentRunStatus::Failed,
                output: None,
                confidence: None,
                error: result.error.clone(),
                duration_ms: result.duration_ms,
            }
        }
    }
}

pub struct CaseStore {
    state: RwLock<StoreState>,
    disk: Option<StateFile>,
    /// Recorded as owner of the cases and runs this store starts.
    token: Uuid,
}

impl CaseStore {
    /// A store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            disk: None,
            token: Uuid::new_v4(),
        }
    }

    /// Open a store backed by a JSON snapshot, creating it on first write.
    ///
    /// Opening never rewrites the snapshot. Records abandoned by a crashed process
    /// are reclaimed by the next write.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let disk = StateFile::open(path)?;
        let state = disk.load_shared()?;
        debug!(
            "Opened {} with {} cases under lease {}",
            path.display(),
            state.cases.len(),
            disk.lease.token
        );

        Ok(Self {
            state: RwLock::new(state),
            token: disk.lease.token,
            disk: Some(disk),
        })
    }

    /// Apply a change to a fresh copy of the state and install the copy once
    /// it is durable. With a state file this runs under the exclusive lock.
    async fn commit<R, F>(&self, apply: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut StoreState) -> Result<R, StoreError>,
    {
        let mut state = self.state.write().await;

        let Some(disk) = &self.disk else {
            let mut next = state.clone();
            let out = apply(&mut next)?;
            *state = next;
            return Ok(out);
        };

        let mut lock = disk.lock_file()?;
        let _guard = lock.write()?;

        let mut next = disk.load()?;
        disk.recover_orphans(&mut next);
        let journaled = next.audit_log.len();

        let out = apply(&mut next)?;
        disk.write_snapshot(&next)?;
        for entry in &next.audit_log[journaled..] {
            disk.append_journal(entry)?;
        }

        *state = next;
        Ok(out)
    }

    /// Read the latest state. With a state file the snapshot is reloaded under
    /// a shared lock, falling back to the cached copy if that fails.
    async fn view<R>(&self, read: impl FnOnce(&StoreState) -> R) -> R {
        let mut state = self.state.write().await;
        if let Some(disk) = &self.disk {
            match disk.load_shared() {
                Ok(fresh) => *state = fresh,
                Err(e) => warn!("Reload of {} failed, using cached state: {}", disk.path.display(), e),
            }
        }
        read(&state)
    }

    pub async fn insert_case(&self, case: Case) -> Result<Case, StoreError> {
        self.commit(|state| {
            state.cases.insert(case.id, case.clone());
            Ok(case)
        })
        .await
    }

    pub async fn get_case(&self, case_id: CaseId) -> Result<Case, StoreError> {
        self.view(|state| {
            state
                .cases
                .get(&case_id)
                .cloned()
                .ok_or(StoreError::CaseNotFound(case_id))
        })
        .await
    }

    /// All cases, oldest first.
    pub async fn list_cases(&self) -> Vec<Case> {
        self.view(|state| {
            let mut cases: Vec<Case> = state.cases.values().cloned().collect();
            cases.sort_by_key(|c| c.created_at);
            cases
        })
        .await
    }

    /// Apply a mutation to a case atomically. The closure may veto the write.
    pub async fn update_case<F>(&self, case_id: CaseId, mutate: F) -> Result<Case, StoreError>
    where
        F: FnOnce(&mut Case) -> Result<(), StoreError>,
    {
        let owner = self.token;
        self.commit(move |state| {
            let case = state
                .cases
                .get_mut(&case_id)
                .ok_or(StoreError::CaseNotFound(case_id))?;

            let before = case.status;
            mutate(case)?;
            case.updated_at = Utc::now();
            let updated = case.clone();

            if updated.status != CaseStatus::Processing {
                state.case_owners.remove(&case_id);
            } else if before != CaseStatus::Processing {
                state.case_owners.insert(case_id, owner);
            }
            Ok(updated)
        })
        .await
    }

    /// Compare-and-set on the case status.
    ///
    /// This is the case-level mutual exclusion: only one caller, in any
    /// process sharing the state file, can move a case from `Pending` into
    /// `Processing`.
    pub async fn transition_status(
        &self,
        case_id: CaseId,
        allowed_from: &[CaseStatus],
        to: CaseStatus,
    ) -> Result<Case, StoreError> {
        self.update_case(case_id, |case| {
            if !allowed_from.contains(&case.status) {
                return Err(StoreError::InvalidTransition {
                    case_id,
                    from: case.status,
                    to,
                });
            }
            case.status = to;
            Ok(())
        })
        .await
    }

    /// Insert a pending run. At most one run per (case, agent type) may be pending.
    pub async fn begin_run(
        &self,
        case_id: CaseId,
        agent_type: AgentType,
        input: Value,
    ) -> Result<AgentRun, StoreError> {
        let owner = self.token;
        self.commit(move |state| {
            if !state.cases.contains_key(&case_id) {
                return Err(StoreError::CaseNotFound(case_id));
            }

            let already_pending = state.agent_runs.iter().any(|r| {
                r.case_id == case_id
                    && r.agent_type == agent_type
                    && r.status == AgentRunStatus::Pending
            });
            if already_pending {
                return Err(StoreError::DuplicatePendingRun {
                    case_id,
                    agent_type,
                });
            }

            let run = AgentRun {
                id: Uuid::new_v4(),
                case_id,
                agent_type,
                status: AgentRunStatus::Pending,
                input,
                output: None,
                confidence: None,
                error: None,
                duration_ms: None,
                started_at: Utc::now(),
                completed_at: None,
            };
            state.run_owners.insert(run.id, owner);
            state.agent_runs.push(run.clone());
            Ok(run)
        })
        .await
    }

    /// Finalise a pending run. Finalised runs are immutable.
    pub async fn finish_run(
        &self,
        run_id: Uuid,
        outcome: RunOutcome,
    ) -> Result<AgentRun, StoreError> {
        self.commit(move |state| {
            let run = state
                .agent_runs
                .iter_mut()
                .find(|r| r.id == run_id)
                .ok_or(StoreError::RunNotFound(run_id))?;

            if run.status != AgentRunStatus::Pending {
                return Err(StoreError::RunAlreadyFinalised(run_id));
            }

            run.status = outcome.status;
            run.output = outcome.output;
            run.confidence = outcome.confidence;
            run.error = outcome.error;
            run.duration_ms = Some(outcome.duration_ms);
            run.completed_at = Some(Utc::now());
            let finished = run.clone();

            state.run_owners.remove(&run_id);
            Ok(finished)
        })
        .await
    }

    /// The authoritative run for downstream stages: the most recently
    /// completed run of this type for this case.
    pub async fn latest_completed(&self, case_id: CaseId, agent_type: AgentType) -> Option<AgentRun> {
        self.view(|state| {
            state
                .agent_runs
                .iter()
                .filter(|r| {
                    r.case_id == case_id
                        && r.agent_type == agent_type
                        && r.status == AgentRunStatus::Completed
                })
                .max_by_key(|r| r.completed_at)
                .cloned()
        })
        .await
    }

    /// Every run for a case in insertion order.
    pub async fn runs_for_case(&self, case_id: CaseId) -> Vec<AgentRun> {
        self.view(|state| {
            state
                .agent_runs
                .iter()
                .filter(|r| r.case_id == case_id)
                .cloned()
                .collect()
        })
        .await
    }

    pub async fn append_audit(&self, entry: AuditLogEntry) -> Result<(), StoreError> {
        self.commit(move |state| {
            if !state.cases.contains_key(&entry.case_id) {
                return Err(StoreError::CaseNotFound(entry.case_id));
            }
            state.audit_log.push(entry);
            Ok(())
        })
        .await
    }

    /// Audit entries for a case, `created_at` ascending with insertion order
    /// breaking ties.
    pub async fn audit_entries(&self, case_id: CaseId) -> Vec<AuditLogEntry> {
        self.view(|state| {
            let mut entries: Vec<AuditLogEntry> = state
                .audit_log
                .iter()
                .filter(|e| e.case_id == case_id)
                .cloned()
                .collect();
            entries.sort_by_key(|e| e.created_at);
            entries
        })
        .await
    }
}

/// The on-disk side of a persistent store.
struct StateFile {
    path: PathBuf,
    journal: PathBuf,
    lock: PathBuf,
    leases: PathBuf,
    lease: Lease,
}

impl StateFile {
    fn open(path: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(parent_dir(path))?;
        let leases = sibling(path, ".leases");
        let lease = Lease::acquire(&leases)?;

        Ok(Self {
            path: path.to_path_buf(),
            journal: sibling(path, ".audit.jsonl"),
            lock: sibling(path, ".lock"),
            leases,
            lease,
        })
    }

    fn lock_file(&self) -> Result<fd_lock::RwLock<File>, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock)?;
        Ok(fd_lock::RwLock::new(file))
    }

    fn load_shared(&self) -> Result<StoreState, StoreError> {
        let lock = self.lock_file()?;
        let _guard = lock.read()?;
        self.load()
    }

    /// Read the snapshot and the audit journal. The caller holds the lock.
    fn load(&self) -> Result<StoreState, StoreError> {
        let mut state: StoreState = match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == ErrorKind::NotFound => StoreState::default(),
            Err(e) => return Err(e.into()),
        };
        state.audit_log = self.read_journal()?;
        Ok(state)
    }

    fn read_journal(&self) -> Result<Vec<AuditLogEntry>, StoreError> {
        let content = match std::fs::read_to_string(&self.journal) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                // A torn final line from a crash mid-append.
                Err(e) => warn!(
                    "Skipping unreadable audit line {} in {}: {}",
                    index + 1,
                    self.journal.display(),
                    e
                ),
            }
        }
        Ok(entries)
    }

    fn append_journal(&self, entry: &AuditLogEntry) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.journal)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    fn write_snapshot(&self, state: &StoreState) -> Result<(), StoreError> {
        let mut tmp = tempfile::NamedTempFile::new_in(parent_dir(&self.path))?;
        serde_json::to_writer_pretty(&mut tmp, state)?;
        tmp.flush()?;
        tmp.persist(&self.path)?;

        debug!("Snapshot written to {}", self.path.display());
        Ok(())
    }

    /// Fail pending runs and release processing cases whose owner is gone.
    fn recover_orphans(&self, state: &mut StoreState) -> usize {
        let now = Utc::now();
        let mut checked: HashMap<Uuid, bool> = HashMap::new();
        let mut owner_alive = |owner: Option<Uuid>| match owner {
            Some(token) => *checked
                .entry(token)
                .or_insert_with(|| self.lease_is_live(token)),
            None => false,
        };

        let mut recovered = 0;

        for run in state
            .agent_runs
            .iter_mut()
            .filter(|r| r.status == AgentRunStatus::Pending)
        {
            if owner_alive(state.run_owners.get(&run.id).copied()) {
                continue;
            }
            run.status = AgentRunStatus::Failed;
            run.error = Some("interrupted before completion".to_string());
            run.completed_at = Some(now);
            state.run_owners.remove(&run.id);
            recovered += 1;
        }

        for case in state
            .cases
            .values_mut()
            .filter(|c| c.status == CaseStatus::Processing)
        {
            if owner_alive(state.case_owners.get(&case.id).copied()) {
                continue;
            }
            case.status = CaseStatus::Review;
            case.updated_at = now;
            state.case_owners.remove(&case.id);
            recovered += 1;
        }

        if recovered > 0 {
            warn!(
                "Recovered {} records abandoned by an interrupted process in {}",
                recovered,
                self.path.display()
            );
        }
        recovered
    }

    fn lease_is_live(&self, token: Uuid) -> bool {
        if token == self.lease.token {
            return true;
        }

        let path = lease_path(&self.leases, token);
        let Ok(file) = OpenOptions::new().read(true).write(true).open(&path) else {
            return false;
        };

        let mut lock = fd_lock::RwLock::new(file);
        let live = match lock.try_write() {
            Ok(_) => false,
            Err(e) if e.kind() == ErrorKind::WouldBlock => true,
            Err(e) => {
                warn!("Cannot probe lease {}: {}", path.display(), e);
                true
            }
        };

        if !live {
            let _ = std::fs::remove_file(&path);
        }
        live
    }
}

/// An exclusive lock on a per-store file, held by a parked thread until the
/// store is dropped. The OS releases it if the process dies.
struct Lease {
    token: Uuid,
    path: PathBuf,
    release: Option<mpsc::Sender<()>>,
    holder: Option<thread::JoinHandle<()>>,
}

impl Lease {
    fn acquire(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        let token = Uuid::new_v4();
        let path = lease_path(dir, token);
        let file = File::create(&path)?;

        let (ready_tx, ready_rx) = mpsc::channel::<io::Result<()>>();
        let (release, released) = mpsc::channel::<()>();

        let holder = thread::Builder::new()
            .name("caseflow-lease".to_string())
            .spawn(move || {
                let mut lock = fd_lock::RwLock::new(file);
                match lock.write() {
                    Ok(_guard) => {
                        let _ = ready_tx.send(Ok(()));
                        // Parked until the sender is dropped.
                        let _ = released.recv();
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                };
            })?;

        ready_rx
            .recv()
            .map_err(|_| io::Error::other("lease holder exited early"))??;

        Ok(Self {
            token,
            path,
            release: Some(release),
            holder: Some(holder),
        })
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        drop(self.release.take());
        if let Some(holder) = self.holder.take() {
            let _ = holder.join();
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

fn lease_path(dir: &Path, token: Uuid) -> PathBuf {
    dir.join(format!("{}.lock", token))
}

/// `state.json` + `.lock` gives `state.json.lock`.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActorType, Applicant, Document};
    use serde_json::json;

    fn new_case() -> Case {
        Case::new(
            Applicant {
                full_name: "Jane Doe".to_string(),
                date_of_birth: None,
                nationality: None,
            },
            vec![Document::new("passport.pdf", 1024)],
        )
    }

    fn completed(confidence: f64) -> RunOutcome {
        RunOutcome {
            status: AgentRunStatus::Completed,
            output: Some(json!({ "confidence": confidence })),
            confidence: Some(confidence),
            error: None,
            duration_ms: 5,
        }
    }

    #[tokio::test]
    async fn test_case_not_found() {
        let store = CaseStore::in_memory();
        let id = Uuid::new_v4();
        assert!(matches!(
            store.get_case(id).await,
            Err(StoreError::CaseNotFound(found)) if found == id
        ));
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let store = CaseStore::in_memory();
        let case = store.insert_case(new_case()).await.unwrap();

        let updated = store
            .transition_status(case.id, &[CaseStatus::Pending], CaseStatus::Processing)
            .await
            .unwrap();
        assert_eq!(updated.status, CaseStatus::Processing);

        let err = store
            .transition_status(case.id, &[CaseStatus::Pending], CaseStatus::Processing)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                from: CaseStatus::Processing,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_single_pending_run_per_agent() {
        let store = CaseStore::in_memory();
        let case = store.insert_case(new_case()).await.unwrap();

        let run = store
            .begin_run(case.id, AgentType::RiskScorer, json!({}))
            .await
            .unwrap();
        let dup = store
            .begin_run(case.id, AgentType::RiskScorer, json!({}))
            .await;
        assert!(matches!(dup, Err(StoreError::DuplicatePendingRun { .. })));

        // A different agent type is independent.
        store
            .begin_run(case.id, AgentType::CaseNarrator, json!({}))
            .await
            .unwrap();

        store.finish_run(run.id, completed(0.8)).await.unwrap();
        store
            .begin_run(case.id, AgentType::RiskScorer, json!({}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_finalised_runs_are_immutable() {
        let store = CaseStore::in_memory();
        let case = store.insert_case(new_case()).await.unwrap();
        let run = store
            .begin_run(case.id, AgentType::IdentityVerifier, json!({}))
            .await
            .unwrap();

        let finished = store.finish_run(run.id, completed(0.7)).await.unwrap();
        assert_eq!(finished.status, AgentRunStatus::Completed);
        assert!(finished.completed_at.is_some());

        let again = store.finish_run(run.id, completed(0.1)).await;
        assert!(matches!(again, Err(StoreError::RunAlreadyFinalised(id)) if id == run.id));

        let runs = store.runs_for_case(case.id).await;
        assert_eq!(runs[0].confidence, Some(0.7));
    }

    #[tokio::test]
    async fn test_latest_completed_wins() {
        let store = CaseStore::in_memory();
        let case = store.insert_case(new_case()).await.unwrap();

        assert!(store
            .latest_completed(case.id, AgentType::SanctionsScreener)
            .await
            .is_none());

        let first = store
            .begin_run(case.id, AgentType::SanctionsScreener, json!({}))
            .await
            .unwrap();
        store.finish_run(first.id, completed(0.6)).await.unwrap();

        let second = store
            .begin_run(case.id, AgentType::SanctionsScreener, json!({}))
            .await
            .unwrap();
        store.finish_run(second.id, completed(0.9)).await.unwrap();

        let failed = store
            .begin_run(case.id, AgentType::SanctionsScreener, json!({}))
            .await
            .unwrap();
        store
            .finish_run(
                failed.id,
                RunOutcome {
                    status: AgentRunStatus::Failed,
                    output: None,
                    confidence: None,
                    error: Some("boom".to_string()),
                    duration_ms: 1,
                },
            )
            .await
            .unwrap();

        let latest = store
            .latest_completed(case.id, AgentType::SanctionsScreener)
            .await
            .unwrap();
        assert_eq!(latest.id, second.id);
        assert_eq!(store.runs_for_case(case.id).await.len(), 3);
    }

    #[tokio::test]
    async fn test_audit_requires_case() {
        let store = CaseStore::in_memory();
        let entry = audit_entry(Uuid::new_v4(), "noop");
        assert!(store.append_audit(entry).await.is_err());
    }

    fn audit_entry(case_id: CaseId, action: &str) -> AuditLogEntry {
        AuditLogEntry {
            id: Uuid::new_v4(),
            case_id,
            actor_type: ActorType::System,
            actor_id: "system".to_string(),
            action: action.to_string(),
            details: json!({}),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_snapshot_and_journal_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let case_id = {
            let store = CaseStore::open(&path).unwrap();
            let case = store.insert_case(new_case()).await.unwrap();
            let run = store
                .begin_run(case.id, AgentType::DocumentProcessor, json!({}))
                .await
                .unwrap();
            store.finish_run(run.id, completed(0.9)).await.unwrap();
            store
                .append_audit(audit_entry(case.id, "case_created"))
                .await
                .unwrap();
            case.id
        };
        assert!(path.exists());

        let journal = std::fs::read_to_string(sibling(&path, ".audit.jsonl")).unwrap();
        assert_eq!(journal.lines().count(), 1);
        assert!(!std::fs::read_to_string(&path).unwrap().contains("case_created"));

        let reopened = CaseStore::open(&path).unwrap();
        assert_eq!(reopened.get_case(case_id).await.unwrap().status, CaseStatus::Pending);
        let runs = reopened.runs_for_case(case_id).await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, AgentRunStatus::Completed);
        assert_eq!(reopened.audit_entries(case_id).await[0].action, "case_created");
    }

    #[tokio::test]
    async fn test_stores_sharing_a_file_share_the_case_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let a = CaseStore::open(&path).unwrap();
        let b = CaseStore::open(&path).unwrap();

        let case = a.insert_case(new_case()).await.unwrap();
        assert_eq!(b.get_case(case.id).await.unwrap().status, CaseStatus::Pending);

        a.transition_status(case.id, &[CaseStatus::Pending], CaseStatus::Processing)
            .await
            .unwrap();
        let err = b
            .transition_status(case.id, &[CaseStatus::Pending], CaseStatus::Processing)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                from: CaseStatus::Processing,
                ..
            }
        ));

        a.begin_run(case.id, AgentType::DocumentProcessor, json!({}))
            .await
            .unwrap();
        let dup = b
            .begin_run(case.id, AgentType::DocumentProcessor, json!({}))
            .await;
        assert!(matches!(dup, Err(StoreError::DuplicatePendingRun { .. })));

        // Neither store's write may drop the other's entries.
        b.append_audit(audit_entry(case.id, "human_decision"))
            .await
            .unwrap();
        a.append_audit(audit_entry(case.id, "pipeline_started"))
            .await
            .unwrap();

        let reopened = CaseStore::open(&path).unwrap();
        let actions: Vec<String> = reopened
            .audit_entries(case.id)
            .await
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(actions, vec!["human_decision", "pipeline_started"]);
        assert_eq!(reopened.runs_for_case(case.id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_live_owner_is_not_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let runner = CaseStore::open(&path).unwrap();
        let case = runner.insert_case(new_case()).await.unwrap();
        runner
            .transition_status(case.id, &[CaseStatus::Pending], CaseStatus::Processing)
            .await
            .unwrap();
        let run = runner
            .begin_run(case.id, AgentType::DocumentProcessor, json!({}))
            .await
            .unwrap();

        let observer = CaseStore::open(&path).unwrap();
        assert_eq!(
            observer.get_case(case.id).await.unwrap().status,
            CaseStatus::Processing
        );
        assert_eq!(
            observer.runs_for_case(case.id).await[0].status,
            AgentRunStatus::Pending
        );

        // A write from another store leaves the live pipeline alone.
        let err = observer
            .transition_status(case.id, &[CaseStatus::Review], CaseStatus::Pending)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        runner.finish_run(run.id, completed(0.8)).await.unwrap();
        runner
            .begin_run(case.id, AgentType::IdentityVerifier, json!({}))
            .await
            .unwrap();

        // The owner goes away mid-run.
        drop(runner);

        let retried = observer
            .transition_status(case.id, &[CaseStatus::Review], CaseStatus::Pending)
            .await
            .unwrap();
        assert_eq!(retried.status, CaseStatus::Pending);

        let runs = observer.runs_for_case(case.id).await;
        assert_eq!(runs[0].status, AgentRunStatus::Completed);
        assert_eq!(runs[1].status, AgentRunStatus::Failed);
        assert_eq!(runs[1].error.as_deref(), Some("interrupted before completion"));
    }

    #[tokio::test]
    async fn test_failed_write_leaves_memory_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");
        let path = state_dir.join("state.json");

        let store = CaseStore::open(&path).unwrap();
        let case = store.insert_case(new_case()).await.unwrap();

        std::fs::remove_dir_all(&state_dir).unwrap();
        std::fs::write(&state_dir, b"not a directory").unwrap();

        assert!(store
            .transition_status(case.id, &[CaseStatus::Pending], CaseStatus::Processing)
            .await
            .is_err());
        assert!(store
            .begin_run(case.id, AgentType::RiskScorer, json!({}))
            .await
            .is_err());

        assert_eq!(store.get_case(case.id).await.unwrap().status, CaseStatus::Pending);
        assert!(store.runs_for_case(case.id).await.is_empty());
    }
}
