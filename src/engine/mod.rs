mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use availability::{day_availability, merge_overlapping, subtract_intervals};
pub use conflict::{
    check_batch_conflict, check_conflict, find_conflicts, Conflict, ConflictResult, ConflictWith,
};
pub use error::EngineError;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedDay = Arc<RwLock<DaySchedule>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Takes one append, drains whatever else is already queued,
/// and fsyncs the whole batch once before answering every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::error!("WAL flush failed: {e}");
        }
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        // Compaction must observe every append queued before it.
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let append_result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so stale bytes never leak into the next batch.
    let flush_result = wal.flush_sync();
    append_result.and(flush_result)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let result = wal.append_buffered(&event).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
    }
}

// ── Directory ────────────────────────────────────────────

/// Registered professionals and locals, keyed by id, with optional names.
#[derive(Debug, Default)]
pub struct Directory {
    pub professionals: HashMap<ProfessionalId, Option<String>>,
    pub locals: HashMap<LocalId, Option<String>>,
}

impl Directory {
    pub fn len(&self) -> usize {
        self.professionals.len() + self.locals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains(&self, id: &Ulid) -> bool {
        self.professionals.contains_key(id) || self.locals.contains_key(id)
    }

    /// Referential check for a session about to be written.
    pub(super) fn check_refs(&self, candidate: &SessionCandidate) -> Result<(), EngineError> {
        if !self.professionals.contains_key(&candidate.professional_id) {
            return Err(EngineError::ProfessionalNotFound(candidate.professional_id));
        }
        if let Some(lid) = candidate.local_id
            && !self.locals.contains_key(&lid)
        {
            return Err(EngineError::LocalNotFound(lid));
        }
        Ok(())
    }

    fn apply(&mut self, event: &Event) {
        match event {
            Event::ProfessionalRegistered { id, name } => {
                self.professionals.insert(*id, name.clone());
            }
            Event::ProfessionalRemoved { id } => {
                self.professionals.remove(id);
            }
            Event::LocalRegistered { id, name } => {
                self.locals.insert(*id, name.clone());
            }
            Event::LocalRemoved { id } => {
                self.locals.remove(id);
            }
            Event::SessionCreated { .. }
            | Event::SessionUpdated { .. }
            | Event::SessionDeleted { .. }
            | Event::SessionsCreated { .. }
            | Event::SessionsDeleted { .. } => {}
        }
    }
}

// ── Day partitions ───────────────────────────────────────

/// Mutable access to day schedules, either owned (replay) or locked (live writes).
trait DayAccess {
    fn day_mut(&mut self, date: NaiveDate) -> Option<&mut DaySchedule>;
}

impl DayAccess for BTreeMap<NaiveDate, DaySchedule> {
    fn day_mut(&mut self, date: NaiveDate) -> Option<&mut DaySchedule> {
        Some(self.entry(date).or_insert_with(|| DaySchedule::new(date)))
    }
}

/// Write guards over a set of days, acquired in ascending date order.
/// Days left empty are dropped from the partition map on release.
pub(super) struct DayLocks<'a> {
    partitions: &'a DashMap<NaiveDate, SharedDay>,
    guards: BTreeMap<NaiveDate, OwnedRwLockWriteGuard<DaySchedule>>,
}

impl DayLocks<'_> {
    pub(super) fn day(&self, date: NaiveDate) -> Option<&DaySchedule> {
        self.guards.get(&date).map(|g| &**g)
    }

    /// Every session on the locked days, in date then start order.
    pub(super) fn pool(&self) -> Vec<Session> {
        self.guards
            .values()
            .flat_map(|g| g.sessions.iter().cloned())
            .collect()
    }
}

impl DayAccess for DayLocks<'_> {
    fn day_mut(&mut self, date: NaiveDate) -> Option<&mut DaySchedule> {
        self.guards.get_mut(&date).map(|g| &mut **g)
    }
}

impl Drop for DayLocks<'_> {
    fn drop(&mut self) {
        for (date, guard) in std::mem::take(&mut self.guards) {
            if !guard.is_empty() {
                continue;
            }
            // Two owners: the map and this guard. Any other holder is a task
            // waiting on or reading the day, which must not be orphaned.
            self.partitions
                .remove_if(&date, |_, handle| Arc::strong_count(handle) == 2);
        }
    }
}

/// Apply a session event. The caller holds every day the event touches.
fn apply_session_event(
    days: &mut impl DayAccess,
    index: &DashMap<SessionId, NaiveDate>,
    event: &Event,
) {
    match event {
        Event::SessionCreated { session } => {
            if let Some(day) = days.day_mut(session.date) {
                day.insert_session(session.clone());
                index.insert(session.id, session.date);
            }
        }
        Event::SessionUpdated {
            previous_date,
            session,
        } => {
            if let Some(day) = days.day_mut(*previous_date) {
                day.remove_session(session.id);
            }
            if let Some(day) = days.day_mut(session.date) {
                day.insert_session(session.clone());
                index.insert(session.id, session.date);
            }
        }
        Event::SessionDeleted { id, date } => {
            if let Some(day) = days.day_mut(*date) {
                day.remove_session(*id);
            }
            index.remove(id);
        }
        Event::SessionsCreated { sessions } => {
            for session in sessions {
                if let Some(day) = days.day_mut(session.date) {
                    day.insert_session(session.clone());
                    index.insert(session.id, session.date);
                }
            }
        }
        Event::SessionsDeleted { ids } => {
            for (id, date) in ids {
                if let Some(day) = days.day_mut(*date) {
                    day.remove_session(*id);
                }
                index.remove(id);
            }
        }
        Event::ProfessionalRegistered { .. }
        | Event::ProfessionalRemoved { .. }
        | Event::LocalRegistered { .. }
        | Event::LocalRemoved { .. } => {}
    }
}

/// The session store. Sessions are partitioned by calendar day; every
/// write holds the write lock of each day it reads or touches from the
/// pool fetch through the WAL append and apply.
pub struct Engine {
    pub(super) days: DashMap<NaiveDate, SharedDay>,
    /// Session id → the day partition currently holding it.
    pub(super) session_index: DashMap<SessionId, NaiveDate>,
    /// Shared by session writes, exclusive for directory mutations.
    pub(super) directory: RwLock<Directory>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start the group-commit writer.
    /// Must be called from within a tokio runtime.
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let session_index = DashMap::new();
        let mut directory = Directory::default();
        let mut days: BTreeMap<NaiveDate, DaySchedule> = BTreeMap::new();
        for event in &events {
            directory.apply(event);
            apply_session_event(&mut days, &session_index, event);
        }
        tracing::info!(
            "replayed {} events: {} sessions, {} directory entries",
            events.len(),
            session_index.len(),
            directory.len()
        );

        Ok(Self {
            days: days
                .into_iter()
                .filter(|(_, day)| !day.is_empty())
                .map(|(date, day)| (date, Arc::new(RwLock::new(day))))
                .collect(),
            session_index,
            directory: RwLock::new(directory),
            wal_tx,
        })
    }

    async fn wal_request<T>(
        &self,
        cmd: WalCommand,
        rx: oneshot::Receiver<io::Result<T>>,
    ) -> Result<T, EngineError> {
        self.wal_tx
            .send(cmd)
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))
    }

    /// Durably append one event through the group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        let cmd = WalCommand::Append {
            event: event.clone(),
            response: tx,
        };
        self.wal_request(cmd, rx).await
    }

    pub(super) async fn wal_compact(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_request(WalCommand::Compact { events, response: tx }, rx)
            .await
    }

    pub(super) fn day_handle(&self, date: NaiveDate) -> SharedDay {
        self.days
            .entry(date)
            .or_insert_with(|| Arc::new(RwLock::new(DaySchedule::new(date))))
            .clone()
    }

    /// Lock days for writing in ascending date order.
    pub(super) async fn lock_days(
        &self,
        dates: impl IntoIterator<Item = NaiveDate>,
    ) -> DayLocks<'_> {
        let dates: BTreeSet<NaiveDate> = dates.into_iter().collect();
        let mut guards = BTreeMap::new();
        for date in dates {
            guards.insert(date, self.day_handle(date).write_owned().await);
        }
        DayLocks {
            partitions: &self.days,
            guards,
        }
    }

    /// WAL-append, then apply to the locked days.
    pub(super) async fn persist_and_apply(
        &self,
        days: &mut DayLocks<'_>,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_session_event(days, &self.session_index, event);
        Ok(())
    }

    /// Directory counterpart of `persist_and_apply`.
    pub(super) async fn persist_and_apply_directory(
        &self,
        directory: &mut Directory,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        directory.apply(event);
        Ok(())
    }

    pub(super) fn session_date(&self, id: &SessionId) -> Option<NaiveDate> {
        self.session_index.get(id).map(|e| *e.value())
    }
}
