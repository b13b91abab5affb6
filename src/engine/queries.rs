use chrono::NaiveDate;

use crate::limits::*;
use crate::model::*;

use super::availability::day_availability;
use super::conflict::{find_conflicts, validate_candidate};
use super::{Engine, EngineError};

fn shares_resource(
    session: &Session,
    professional_id: Option<ProfessionalId>,
    local_id: Option<LocalId>,
) -> bool {
    professional_id == Some(session.professional_id)
        || (local_id.is_some() && local_id == session.local_id)
}

/// Non-cancelled sessions of one day. With a professional and/or local
/// given, only sessions sharing either of them.
pub(super) fn candidate_pool(
    day: &DaySchedule,
    professional_id: Option<ProfessionalId>,
    local_id: Option<LocalId>,
) -> Vec<Session> {
    let narrowed = professional_id.is_some() || local_id.is_some();
    day.sessions
        .iter()
        .filter(|s| s.state.counts_toward_conflicts())
        .filter(|s| !narrowed || shares_resource(s, professional_id, local_id))
        .cloned()
        .collect()
}

/// The candidate pool restricted to sessions overlapping the proposal in
/// time. Keeps start order, so the first hit matches the full pool's.
pub(super) fn overlap_pool(day: &DaySchedule, candidate: &SessionCandidate) -> Vec<Session> {
    day.overlapping(&candidate.span)
        .filter(|s| s.state.counts_toward_conflicts())
        .filter(|s| shares_resource(s, Some(candidate.professional_id), candidate.local_id))
        .cloned()
        .collect()
}

impl Engine {
    async fn day_snapshot(&self, date: NaiveDate) -> Option<DaySchedule> {
        let handle = self.days.get(&date).map(|e| e.value().clone())?;
        let guard = handle.read().await;
        Some(guard.clone())
    }

    pub async fn get_session(&self, id: SessionId) -> Result<Session, EngineError> {
        let date = self.session_date(&id).ok_or(EngineError::SessionNotFound(id))?;
        self.day_snapshot(date)
            .await
            .and_then(|d| d.get(id).cloned())
            .ok_or(EngineError::SessionNotFound(id))
    }

    /// Sessions matching `filter`, ordered by date then start time.
    pub async fn fetch_sessions(&self, filter: &SessionFilter) -> Result<Vec<Session>, EngineError> {
        if filter.professional_ids.len() > MAX_IN_LIST || filter.local_ids.len() > MAX_IN_LIST {
            return Err(EngineError::LimitExceeded("too many ids in filter"));
        }
        let mut handles: Vec<_> = match filter.date {
            Some(date) => self
                .days
                .get(&date)
                .map(|e| vec![(date, e.value().clone())])
                .unwrap_or_default(),
            None => self
                .days
                .iter()
                .map(|e| (*e.key(), e.value().clone()))
                .collect(),
        };
        handles.sort_by_key(|(date, _)| *date);

        let mut out = Vec::new();
        for (_, handle) in handles {
            let day = handle.read().await;
            out.extend(day.sessions.iter().filter(|s| filter.matches(s)).cloned());
        }
        Ok(out)
    }

    /// The sessions a proposal on `date` has to be checked against.
    pub async fn fetch_candidate_pool(
        &self,
        date: NaiveDate,
        professional_id: Option<ProfessionalId>,
        local_id: Option<LocalId>,
    ) -> Vec<Session> {
        match self.day_snapshot(date).await {
            Some(day) => candidate_pool(&day, professional_id, local_id),
            None => Vec::new(),
        }
    }

    /// Read-only conflict diagnostic. Nothing is locked beyond the read, so
    /// a clean report does not guarantee a later create succeeds.
    pub async fn check_conflicts(
        &self,
        request: &CheckConflictRequest,
    ) -> Result<ConflictReport, EngineError> {
        let candidate = &request.candidate;
        validate_candidate(candidate)?;
        let pool = self
            .day_snapshot(candidate.date)
            .await
            .map(|day| overlap_pool(&day, candidate))
            .unwrap_or_default();
        Ok(find_conflicts(candidate, &pool, request.exclude_id))
    }

    /// Busy slots and free gaps for a professional and/or local on one day.
    /// `window` defaults to the whole day.
    pub async fn day_availability(
        &self,
        date: NaiveDate,
        professional_id: Option<ProfessionalId>,
        local_id: Option<LocalId>,
        window: Option<Span>,
    ) -> Result<DayAvailability, EngineError> {
        let window = window.unwrap_or_else(Span::whole_day);
        if window.is_empty() {
            return Err(EngineError::InvalidTimeRange);
        }
        let sessions = self
            .day_snapshot(date)
            .await
            .map(|d| d.sessions)
            .unwrap_or_default();
        Ok(day_availability(&sessions, date, professional_id, local_id, window))
    }

    pub async fn list_professionals(&self) -> Vec<DirectoryEntry> {
        let directory = self.directory.read().await;
        let mut out: Vec<_> = directory
            .professionals
            .iter()
            .map(|(id, name)| DirectoryEntry {
                id: *id,
                kind: ResourceKind::Professional,
                name: name.clone(),
            })
            .collect();
        out.sort_by_key(|e| e.id);
        out
    }

    pub async fn list_locals(&self) -> Vec<DirectoryEntry> {
        let directory = self.directory.read().await;
        let mut out: Vec<_> = directory
            .locals
            .iter()
            .map(|(id, name)| DirectoryEntry {
                id: *id,
                kind: ResourceKind::Local,
                name: name.clone(),
            })
            .collect();
        out.sort_by_key(|e| e.id);
        out
    }
}

#[cfg(test)]
mod tests {
    use ulid::Ulid;

    use super::*;
    use crate::model::fixtures::*;

    #[test]
    fn pool_drops_cancelled_and_narrows() {
        let d = day(2024, 12, 31);
        let (p1, l1) = (Ulid::new(), Ulid::new());
        let mut schedule = DaySchedule::new(d);
        let mine = session(d, span((8, 0), (9, 0)), p1, None);
        let at_local = session(d, span((9, 0), (10, 0)), Ulid::new(), Some(l1));
        let unrelated = session(d, span((10, 0), (11, 0)), Ulid::new(), Some(Ulid::new()));
        let mut cancelled = session(d, span((11, 0), (12, 0)), p1, Some(l1));
        cancelled.state = SessionState::Cancelled;
        for s in [&mine, &at_local, &unrelated, &cancelled] {
            schedule.insert_session(s.clone());
        }

        let ids = |pool: Vec<Session>| pool.into_iter().map(|s| s.id).collect::<Vec<_>>();
        assert_eq!(ids(candidate_pool(&schedule, Some(p1), Some(l1))), vec![mine.id, at_local.id]);
        assert_eq!(ids(candidate_pool(&schedule, None, Some(l1))), vec![at_local.id]);
        assert_eq!(candidate_pool(&schedule, None, None).len(), 3);
    }

    #[test]
    fn overlap_pool_keeps_only_overlapping_in_start_order() {
        let d = day(2024, 12, 31);
        let (p1, l1) = (Ulid::new(), Ulid::new());
        let mut schedule = DaySchedule::new(d);
        let before = session(d, span((8, 0), (9, 0)), p1, Some(l1));
        let early = session(d, span((9, 30), (10, 30)), Ulid::new(), Some(l1));
        let long = session(d, span((6, 0), (22, 0)), p1, None);
        let after = session(d, span((11, 0), (12, 0)), p1, Some(l1));
        let elsewhere = session(d, span((10, 0), (11, 0)), Ulid::new(), Some(Ulid::new()));
        for s in [&before, &early, &long, &after, &elsewhere] {
            schedule.insert_session(s.clone());
        }

        let candidate = SessionCandidate {
            date: d,
            span: span((10, 0), (11, 0)),
            professional_id: p1,
            local_id: Some(l1),
            community_service_id: None,
        };
        let ids: Vec<_> = overlap_pool(&schedule, &candidate).into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![long.id, early.id]);
    }
}
