use crate::model::*;

use super::EngineError;

/// What a proposed session collided with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictWith {
    /// A persisted session.
    Session(SessionId),
    /// An earlier candidate of the same batch, by index.
    Candidate(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conflict {
    pub reason: ConflictReason,
    /// Index of the offending candidate (always 0 for single checks).
    pub candidate: usize,
    pub with: ConflictWith,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResult {
    NoConflict,
    Conflict(Conflict),
}

/// Same day and overlapping window, then professional exclusivity,
/// then venue exclusivity. Venue exclusivity ignores the activity and
/// never applies when either side is virtual.
fn rule_between(proposed: &SessionCandidate, other: &SessionCandidate) -> Option<ConflictReason> {
    if proposed.date != other.date || !proposed.span.overlaps(&other.span) {
        return None;
    }
    if proposed.professional_id == other.professional_id {
        return Some(ConflictReason::Professional);
    }
    if let (Some(a), Some(b)) = (proposed.local_id, other.local_id)
        && a == b
    {
        return Some(ConflictReason::Local);
    }
    None
}

fn participates(existing: &Session, exclude_id: Option<SessionId>) -> bool {
    existing.state.counts_toward_conflicts() && Some(existing.id) != exclude_id
}

/// Check one proposal against a pool of persisted sessions. The first pool
/// entry (in pool order) that violates a rule wins.
///
/// Pure: the caller must already have rejected empty spans.
pub fn check_conflict(
    proposed: &SessionCandidate,
    existing: &[Session],
    exclude_id: Option<SessionId>,
) -> ConflictResult {
    for e in existing {
        if !participates(e, exclude_id) {
            continue;
        }
        if let Some(reason) = rule_between(proposed, &e.candidate()) {
            return ConflictResult::Conflict(Conflict {
                reason,
                candidate: 0,
                with: ConflictWith::Session(e.id),
            });
        }
    }
    ConflictResult::NoConflict
}

/// Check a batch. Candidate `j` is tested against the persisted pool first,
/// then against candidates `0..j`. The first hit decides the result.
pub fn check_batch_conflict(proposed: &[SessionCandidate], existing: &[Session]) -> ConflictResult {
    for (j, candidate) in proposed.iter().enumerate() {
        if let ConflictResult::Conflict(mut c) = check_conflict(candidate, existing, None) {
            c.candidate = j;
            return ConflictResult::Conflict(c);
        }
        for (i, sibling) in proposed[..j].iter().enumerate() {
            if let Some(reason) = rule_between(candidate, sibling) {
                return ConflictResult::Conflict(Conflict {
                    reason,
                    candidate: j,
                    with: ConflictWith::Candidate(i),
                });
            }
        }
    }
    ConflictResult::NoConflict
}

/// Every pool session that would collide with the proposal, split by rule.
/// Unlike `check_conflict` the two rules are evaluated independently, so
/// a session booked by the same professional in the same local shows up twice.
pub fn find_conflicts(
    proposed: &SessionCandidate,
    existing: &[Session],
    exclude_id: Option<SessionId>,
) -> ConflictReport {
    let mut report = ConflictReport::default();
    for e in existing {
        if !participates(e, exclude_id)
            || e.date != proposed.date
            || !e.span.overlaps(&proposed.span)
        {
            continue;
        }
        if e.professional_id == proposed.professional_id {
            report.professional_conflicts.push(e.clone());
        }
        if let (Some(a), Some(b)) = (proposed.local_id, e.local_id)
            && a == b
        {
            report.local_conflicts.push(e.clone());
        }
    }
    report
}

pub(crate) fn validate_candidate(candidate: &SessionCandidate) -> Result<(), EngineError> {
    if candidate.span.is_empty() {
        return Err(EngineError::InvalidTimeRange);
    }
    Ok(())
}

/// Field-level checks shared by create and update.
pub(crate) fn validate_session(session: &Session) -> Result<(), EngineError> {
    use crate::limits::*;
    validate_candidate(&session.candidate())?;
    if session.title.len() > MAX_TITLE_LEN {
        return Err(EngineError::LimitExceeded("title too long"));
    }
    if let Some(link) = &session.session_link
        && link.len() > MAX_LINK_LEN
    {
        return Err(EngineError::LimitExceeded("session link too long"));
    }
    if session.registered_count > session.capacity {
        return Err(EngineError::OverCapacity {
            registered: session.registered_count,
            capacity: session.capacity,
        });
    }
    Ok(())
}
