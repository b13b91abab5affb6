use chrono::NaiveDate;

use crate::model::*;

// ── Day availability ─────────────────────────────────────────────

/// Busy slots of a professional and/or local on one day, clipped to
/// `window`, plus the free gaps that remain inside the window.
///
/// A session matching both the professional and the local is reported once,
/// as a professional slot. With neither id given nothing is busy.
pub fn day_availability(
    sessions: &[Session],
    date: NaiveDate,
    professional_id: Option<ProfessionalId>,
    local_id: Option<LocalId>,
    window: Span,
) -> DayAvailability {
    let mut busy_slots = Vec::new();
    for s in sessions {
        if s.date != date || !s.state.counts_toward_conflicts() || !s.span.overlaps(&window) {
            continue;
        }
        let kind = if professional_id == Some(s.professional_id) {
            ResourceKind::Professional
        } else if local_id.is_some() && local_id == s.local_id {
            ResourceKind::Local
        } else {
            continue;
        };
        busy_slots.push(BusySlot {
            session_id: s.id,
            span: s.span,
            title: s.title.clone(),
            kind,
        });
    }
    busy_slots.sort_by_key(|b| (b.span.start, b.span.end));

    let mut clipped: Vec<Span> = busy_slots
        .iter()
        .map(|b| Span::new(b.span.start.max(window.start), b.span.end.min(window.end)))
        .collect();
    clipped.sort_by_key(|s| s.start);
    let merged = merge_overlapping(&clipped);
    let free = subtract_intervals(&[window], &merged);

    DayAvailability {
        date,
        is_available: busy_slots.is_empty(),
        busy_slots,
        free,
    }
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`. Both inputs sorted by start, `to_remove` disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}
