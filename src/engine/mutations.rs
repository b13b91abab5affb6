use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;
use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::CONFLICTS_TOTAL;

use super::conflict::{
    check_batch_conflict, check_conflict, validate_session, Conflict, ConflictResult, ConflictWith,
};
use super::queries::overlap_pool;
use super::{DayLocks, Engine, EngineError, WalCommand};

/// Upper bound on re-locking when a session moves days between the index
/// lookup and the lock acquisition.
const MAX_RELOCK_ATTEMPTS: usize = 8;

/// Turn a validator hit into the generic client error, recording the rule
/// and the blocking session for operators.
fn reject(conflict: Conflict, candidates: &[SessionId]) -> EngineError {
    let with = match conflict.with {
        ConflictWith::Session(id) => id,
        ConflictWith::Candidate(i) => candidates.get(i).copied().unwrap_or(Ulid::nil()),
    };
    let candidate = candidates
        .get(conflict.candidate)
        .copied()
        .unwrap_or(Ulid::nil());
    metrics::counter!(CONFLICTS_TOTAL, "rule" => conflict.reason.as_str()).increment(1);
    tracing::warn!(
        "session {candidate} rejected: {} conflict with {with}",
        conflict.reason.as_str()
    );
    EngineError::Conflict {
        with,
        reason: conflict.reason,
    }
}

fn check_day_capacity(days: &DayLocks<'_>, date: NaiveDate, adding: usize) -> Result<(), EngineError> {
    let current = days.day(date).map_or(0, |d| d.len());
    if current + adding > MAX_SESSIONS_PER_DAY {
        return Err(EngineError::LimitExceeded("too many sessions on one day"));
    }
    Ok(())
}

impl Engine {
    // ── Directory ────────────────────────────────────────

    pub async fn register_professional(
        &self,
        id: ProfessionalId,
        name: Option<String>,
    ) -> Result<(), EngineError> {
        self.register(ResourceKind::Professional, id, name).await
    }

    pub async fn register_local(&self, id: LocalId, name: Option<String>) -> Result<(), EngineError> {
        self.register(ResourceKind::Local, id, name).await
    }

    async fn register(
        &self,
        kind: ResourceKind,
        id: Ulid,
        name: Option<String>,
    ) -> Result<(), EngineError> {
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("name too long"));
        }
        let mut directory = self.directory.write().await;
        if directory.len() >= MAX_DIRECTORY_ENTRIES {
            return Err(EngineError::LimitExceeded("too many professionals and locals"));
        }
        if directory.contains(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let event = match kind {
            ResourceKind::Professional => Event::ProfessionalRegistered { id, name },
            ResourceKind::Local => Event::LocalRegistered { id, name },
        };
        self.persist_and_apply_directory(&mut directory, &event).await?;
        tracing::debug!("registered {} {id}", kind.as_str());
        Ok(())
    }

    pub async fn remove_professional(&self, id: ProfessionalId) -> Result<(), EngineError> {
        self.remove(ResourceKind::Professional, id).await
    }

    pub async fn remove_local(&self, id: LocalId) -> Result<(), EngineError> {
        self.remove(ResourceKind::Local, id).await
    }

    /// Refuses while any session, cancelled or not, still references `id`.
    async fn remove(&self, kind: ResourceKind, id: Ulid) -> Result<(), EngineError> {
        // Exclusive: no session write can add a reference during the scan.
        let mut directory = self.directory.write().await;
        let event = match kind {
            ResourceKind::Professional => {
                if !directory.professionals.contains_key(&id) {
                    return Err(EngineError::ProfessionalNotFound(id));
                }
                Event::ProfessionalRemoved { id }
            }
            ResourceKind::Local => {
                if !directory.locals.contains_key(&id) {
                    return Err(EngineError::LocalNotFound(id));
                }
                Event::LocalRemoved { id }
            }
        };
        if self.is_referenced(kind, id).await {
            return Err(EngineError::InUse(id));
        }
        self.persist_and_apply_directory(&mut directory, &event).await
    }

    async fn is_referenced(&self, kind: ResourceKind, id: Ulid) -> bool {
        let handles: Vec<_> = self.days.iter().map(|e| e.value().clone()).collect();
        for handle in handles {
            let day = handle.read().await;
            let found = day.sessions.iter().any(|s| match kind {
                ResourceKind::Professional => s.professional_id == id,
                ResourceKind::Local => s.local_id == Some(id),
            });
            if found {
                return true;
            }
        }
        false
    }

    // ── Sessions ─────────────────────────────────────────

    pub async fn create_session(&self, new: NewSession) -> Result<Session, EngineError> {
        let session = new.into_session();
        validate_session(&session)?;
        let candidate = session.candidate();

        let directory = self.directory.read().await;
        directory.check_refs(&candidate)?;

        let mut days = self.lock_days([session.date]).await;
        if self.session_index.contains_key(&session.id) {
            return Err(EngineError::AlreadyExists(session.id));
        }
        check_day_capacity(&days, session.date, 1)?;

        let pool = days
            .day(session.date)
            .map(|d| overlap_pool(d, &candidate))
            .unwrap_or_default();
        if let ConflictResult::Conflict(c) = check_conflict(&candidate, &pool, None) {
            return Err(reject(c, &[session.id]));
        }

        let event = Event::SessionCreated {
            session: session.clone(),
        };
        self.persist_and_apply(&mut days, &event).await?;
        drop(directory);
        tracing::debug!("created session {} on {}", session.id, session.date);
        Ok(session)
    }

    /// All-or-nothing: every candidate is validated against the persisted
    /// days and against the earlier candidates before anything is written.
    pub async fn batch_create_sessions(
        &self,
        news: Vec<NewSession>,
    ) -> Result<Vec<Session>, EngineError> {
        if news.is_empty() {
            return Ok(Vec::new());
        }
        if news.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }

        let sessions: Vec<Session> = news.into_iter().map(NewSession::into_session).collect();
        let mut seen = HashSet::with_capacity(sessions.len());
        for s in &sessions {
            validate_session(s)?;
            if !seen.insert(s.id) {
                return Err(EngineError::AlreadyExists(s.id));
            }
        }
        let ids: Vec<SessionId> = sessions.iter().map(|s| s.id).collect();
        let candidates: Vec<SessionCandidate> = sessions.iter().map(Session::candidate).collect();

        let directory = self.directory.read().await;
        for c in &candidates {
            directory.check_refs(c)?;
        }

        // Phase 1: lock every day of the batch and validate.
        let mut days = self.lock_days(sessions.iter().map(|s| s.date)).await;
        if let Some(id) = ids.iter().find(|id| self.session_index.contains_key(*id)) {
            return Err(EngineError::AlreadyExists(*id));
        }
        let mut per_day: HashMap<NaiveDate, usize> = HashMap::new();
        for s in &sessions {
            *per_day.entry(s.date).or_default() += 1;
        }
        for (date, adding) in per_day {
            check_day_capacity(&days, date, adding)?;
        }

        let pool = days.pool();
        if let ConflictResult::Conflict(c) = check_batch_conflict(&candidates, &pool) {
            return Err(reject(c, &ids));
        }

        // Phase 2: commit as one WAL record.
        let event = Event::SessionsCreated {
            sessions: sessions.clone(),
        };
        self.persist_and_apply(&mut days, &event).await?;
        drop(days);
        drop(directory);
        tracing::debug!("bulk-created {} sessions", sessions.len());
        Ok(sessions)
    }

    /// Lock the day holding `id` plus `extra`, retrying if the session moves
    /// in between. Returns the locks and the current record.
    async fn lock_session(
        &self,
        id: SessionId,
        extra: Option<NaiveDate>,
    ) -> Result<(DayLocks<'_>, Session), EngineError> {
        for _ in 0..MAX_RELOCK_ATTEMPTS {
            let date = self.session_date(&id).ok_or(EngineError::SessionNotFound(id))?;
            let days = self.lock_days(std::iter::once(date).chain(extra)).await;
            if let Some(current) = days.day(date).and_then(|d| d.get(id)).cloned() {
                return Ok((days, current));
            }
        }
        Err(EngineError::SessionNotFound(id))
    }

    /// Merge `patch` into the session and re-validate. The session's own
    /// record is excluded from the conflict pool. Cancelled results skip the
    /// conflict check entirely.
    pub async fn update_session(
        &self,
        id: SessionId,
        patch: SessionPatch,
    ) -> Result<Session, EngineError> {
        let directory = self.directory.read().await;
        let (mut days, current) = self.lock_session(id, patch.date).await?;

        let next = patch.apply(&current);
        validate_session(&next)?;
        if patch.professional_id.is_some() || patch.local_id.is_some() {
            directory.check_refs(&next.candidate())?;
        }
        if next.date != current.date {
            check_day_capacity(&days, next.date, 1)?;
        }

        if next.state.counts_toward_conflicts() && patch.touches_schedule() {
            let candidate = next.candidate();
            let pool = days
                .day(next.date)
                .map(|d| overlap_pool(d, &candidate))
                .unwrap_or_default();
            if let ConflictResult::Conflict(c) = check_conflict(&candidate, &pool, Some(id)) {
                return Err(reject(c, &[id]));
            }
        }

        let event = Event::SessionUpdated {
            previous_date: current.date,
            session: next.clone(),
        };
        self.persist_and_apply(&mut days, &event).await?;
        drop(directory);
        tracing::debug!("updated session {id}");
        Ok(next)
    }

    pub async fn set_session_state(
        &self,
        id: SessionId,
        state: SessionState,
    ) -> Result<Session, EngineError> {
        self.update_session(id, SessionPatch::state(state)).await
    }

    pub async fn delete_session(&self, id: SessionId) -> Result<(), EngineError> {
        let _directory = self.directory.read().await;
        let (mut days, current) = self.lock_session(id, None).await?;
        let event = Event::SessionDeleted {
            id,
            date: current.date,
        };
        self.persist_and_apply(&mut days, &event).await
    }

    /// All-or-nothing: any unknown id fails the whole request.
    pub async fn batch_delete_sessions(&self, ids: Vec<SessionId>) -> Result<usize, EngineError> {
        if ids.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        let mut unique: Vec<SessionId> = Vec::with_capacity(ids.len());
        let mut seen = HashSet::with_capacity(ids.len());
        for id in ids {
            if seen.insert(id) {
                unique.push(id);
            }
        }
        if unique.is_empty() {
            return Ok(0);
        }

        let _directory = self.directory.read().await;
        for _ in 0..MAX_RELOCK_ATTEMPTS {
            let mut located = Vec::with_capacity(unique.len());
            for id in &unique {
                let date = self.session_date(id).ok_or(EngineError::SessionNotFound(*id))?;
                located.push((*id, date));
            }
            let mut days = self.lock_days(located.iter().map(|(_, d)| *d)).await;
            let still_there = located
                .iter()
                .all(|(id, date)| days.day(*date).is_some_and(|d| d.get(*id).is_some()));
            if !still_there {
                continue;
            }
            let removed = located.len();
            let event = Event::SessionsDeleted { ids: located };
            self.persist_and_apply(&mut days, &event).await?;
            return Ok(removed);
        }
        Err(EngineError::SessionNotFound(unique[0]))
    }

    // ── WAL maintenance ──────────────────────────────────

    /// Rewrite the WAL as the minimal event set recreating the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Every write holds the directory lock, so this freezes the store.
        let directory = self.directory.write().await;
        let mut events = Vec::with_capacity(directory.len());
        for (id, name) in &directory.professionals {
            events.push(Event::ProfessionalRegistered {
                id: *id,
                name: name.clone(),
            });
        }
        for (id, name) in &directory.locals {
            events.push(Event::LocalRegistered {
                id: *id,
                name: name.clone(),
            });
        }

        let mut handles: Vec<_> = self
            .days
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        handles.sort_by_key(|(date, _)| *date);
        for (_, handle) in handles {
            let day = handle.read().await;
            events.extend(day.sessions.iter().map(|s| Event::SessionCreated {
                session: s.clone(),
            }));
        }

        let count = events.len();
        self.wal_compact(events).await?;
        drop(directory);
        tracing::info!("compacted WAL to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
