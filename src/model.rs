use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub type SessionId = Ulid;
pub type ProfessionalId = Ulid;
pub type LocalId = Ulid;
pub type ServiceId = Ulid;

/// Half-open time-of-day interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl Span {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Zero or negative length. Such spans are rejected before conflict checks.
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Back-to-back spans (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// The widest span a day can express: midnight up to the last nanosecond.
    pub fn whole_day() -> Self {
        Self {
            start: NaiveTime::MIN,
            end: NaiveTime::from_hms_nano_opt(23, 59, 59, 999_999_999).unwrap_or(NaiveTime::MIN),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Scheduled,
    Ongoing,
    Completed,
    Cancelled,
    Rescheduled,
}

impl SessionState {
    pub const ALL: [SessionState; 5] = [
        SessionState::Scheduled,
        SessionState::Ongoing,
        SessionState::Completed,
        SessionState::Cancelled,
        SessionState::Rescheduled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Scheduled => "SCHEDULED",
            SessionState::Ongoing => "ONGOING",
            SessionState::Completed => "COMPLETED",
            SessionState::Cancelled => "CANCELLED",
            SessionState::Rescheduled => "RESCHEDULED",
        }
    }

    /// Cancelled sessions stay persisted but never occupy a professional or a local.
    pub fn counts_toward_conflicts(&self) -> bool {
        !matches!(self, SessionState::Cancelled)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        SessionState::ALL
            .into_iter()
            .find(|state| state.as_str() == upper)
            .ok_or_else(|| format!("unknown session state: {s}"))
    }
}

/// A persisted session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub title: String,
    pub date: NaiveDate,
    pub span: Span,
    pub state: SessionState,
    pub capacity: u32,
    pub registered_count: u32,
    pub session_link: Option<String>,
    pub professional_id: ProfessionalId,
    /// `None` marks a virtual session.
    pub local_id: Option<LocalId>,
    pub community_service_id: Option<ServiceId>,
}

impl Session {
    pub fn candidate(&self) -> SessionCandidate {
        SessionCandidate {
            date: self.date,
            span: self.span,
            professional_id: self.professional_id,
            local_id: self.local_id,
            community_service_id: self.community_service_id,
        }
    }
}

/// The scheduling-relevant projection of a session: when, who, and where.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionCandidate {
    pub date: NaiveDate,
    pub span: Span,
    pub professional_id: ProfessionalId,
    pub local_id: Option<LocalId>,
    pub community_service_id: Option<ServiceId>,
}

/// Creation request. New sessions start `SCHEDULED` with nobody registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSession {
    pub id: SessionId,
    pub title: String,
    pub date: NaiveDate,
    pub span: Span,
    pub capacity: u32,
    pub session_link: Option<String>,
    pub professional_id: ProfessionalId,
    pub local_id: Option<LocalId>,
    pub community_service_id: Option<ServiceId>,
}

impl NewSession {
    pub fn into_session(self) -> Session {
        Session {
            id: self.id,
            title: self.title,
            date: self.date,
            span: self.span,
            state: SessionState::Scheduled,
            capacity: self.capacity,
            registered_count: 0,
            session_link: self.session_link,
            professional_id: self.professional_id,
            local_id: self.local_id,
            community_service_id: self.community_service_id,
        }
    }
}

/// Partial update. `None` leaves a field untouched; for nullable columns
/// `Some(None)` clears the value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionPatch {
    pub title: Option<String>,
    pub date: Option<NaiveDate>,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub state: Option<SessionState>,
    pub capacity: Option<u32>,
    pub registered_count: Option<u32>,
    pub session_link: Option<Option<String>>,
    pub professional_id: Option<ProfessionalId>,
    pub local_id: Option<Option<LocalId>>,
    pub community_service_id: Option<Option<ServiceId>>,
}

impl SessionPatch {
    pub fn state(state: SessionState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    /// Produce the merged session. Validation happens afterwards on the result.
    pub fn apply(&self, current: &Session) -> Session {
        let mut next = current.clone();
        if let Some(title) = &self.title {
            next.title = title.clone();
        }
        if let Some(date) = self.date {
            next.date = date;
        }
        if let Some(start) = self.start_time {
            next.span.start = start;
        }
        if let Some(end) = self.end_time {
            next.span.end = end;
        }
        if let Some(state) = self.state {
            next.state = state;
        }
        if let Some(capacity) = self.capacity {
            next.capacity = capacity;
        }
        if let Some(registered) = self.registered_count {
            next.registered_count = registered;
        }
        if let Some(link) = &self.session_link {
            next.session_link = link.clone();
        }
        if let Some(pid) = self.professional_id {
            next.professional_id = pid;
        }
        if let Some(lid) = self.local_id {
            next.local_id = lid;
        }
        if let Some(sid) = self.community_service_id {
            next.community_service_id = sid;
        }
        next
    }

    /// Whether applying this patch can change the session's conflict footprint.
    pub fn touches_schedule(&self) -> bool {
        self.date.is_some()
            || self.start_time.is_some()
            || self.end_time.is_some()
            || self.state.is_some()
            || self.professional_id.is_some()
            || self.local_id.is_some()
    }
}

/// Filters for listing sessions. Empty lists match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionFilter {
    pub professional_ids: Vec<ProfessionalId>,
    pub local_ids: Vec<LocalId>,
    pub states: Vec<SessionState>,
    pub date: Option<NaiveDate>,
}

impl SessionFilter {
    pub fn matches(&self, session: &Session) -> bool {
        if !self.professional_ids.is_empty()
            && !self.professional_ids.contains(&session.professional_id)
        {
            return false;
        }
        if !self.local_ids.is_empty() {
            match session.local_id {
                Some(lid) if self.local_ids.contains(&lid) => {}
                _ => return false,
            }
        }
        if !self.states.is_empty() && !self.states.contains(&session.state) {
            return false;
        }
        if let Some(date) = self.date
            && session.date != date
        {
            return false;
        }
        true
    }
}

/// All sessions of one calendar day. Sessions on different days never
/// conflict, so a day is the unit of locking and of conflict scope.
#[derive(Debug, Clone)]
pub struct DaySchedule {
    pub date: NaiveDate,
    /// Sorted by `span.start`.
    pub sessions: Vec<Session>,
}

impl DaySchedule {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            sessions: Vec::new(),
        }
    }

    /// Insert keeping sort order by start time.
    pub fn insert_session(&mut self, session: Session) {
        let pos = self
            .sessions
            .partition_point(|s| s.span.start <= session.span.start);
        self.sessions.insert(pos, session);
    }

    pub fn remove_session(&mut self, id: SessionId) -> Option<Session> {
        let pos = self.sessions.iter().position(|s| s.id == id)?;
        Some(self.sessions.remove(pos))
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }

    /// Sessions whose span overlaps the query window, in start order.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Session> {
        // Everything at index >= right_bound starts at or after query.end.
        let right_bound = self
            .sessions
            .partition_point(|s| s.span.start < query.end);
        self.sessions[..right_bound]
            .iter()
            .filter(move |s| s.span.end > query.start)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Professional,
    Local,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Professional => "professional",
            ResourceKind::Local => "local",
        }
    }
}

/// A professional or a local known to the store. Sessions may only
/// reference registered entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub id: Ulid,
    pub kind: ResourceKind,
    pub name: Option<String>,
}

/// WAL record format. Flat, one variant per mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ProfessionalRegistered {
        id: ProfessionalId,
        name: Option<String>,
    },
    ProfessionalRemoved {
        id: ProfessionalId,
    },
    LocalRegistered {
        id: LocalId,
        name: Option<String>,
    },
    LocalRemoved {
        id: LocalId,
    },
    SessionCreated {
        session: Session,
    },
    /// `previous_date` differs from `session.date` when the session moved days.
    SessionUpdated {
        previous_date: NaiveDate,
        session: Session,
    },
    SessionDeleted {
        id: SessionId,
        date: NaiveDate,
    },
    /// A bulk create. Replayed whole or not at all.
    SessionsCreated {
        sessions: Vec<Session>,
    },
    /// A bulk delete, each id paired with the day holding it.
    SessionsDeleted {
        ids: Vec<(SessionId, NaiveDate)>,
    },
}

// ── Query result types ───────────────────────────────────────────

/// Which exclusivity rule a conflict violates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictReason {
    /// The professional would run two overlapping sessions.
    Professional,
    /// The local would host two overlapping sessions.
    Local,
}

impl ConflictReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictReason::Professional => "professional",
            ConflictReason::Local => "local",
        }
    }
}

/// Diagnostic conflict query. `exclude_id` is the session being edited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckConflictRequest {
    pub candidate: SessionCandidate,
    pub exclude_id: Option<SessionId>,
}

/// Every session a candidate would collide with, per rule.
/// A session can appear in both lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictReport {
    pub professional_conflicts: Vec<Session>,
    pub local_conflicts: Vec<Session>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusySlot {
    pub session_id: SessionId,
    pub span: Span,
    pub title: String,
    pub kind: ResourceKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayAvailability {
    pub date: NaiveDate,
    pub is_available: bool,
    pub busy_slots: Vec<BusySlot>,
    /// Gaps inside the queried window where neither resource is busy.
    pub free: Vec<Span>,
}
