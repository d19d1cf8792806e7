use chrono::NaiveDate;

use crate::calendar::{utc_midnight, week_day};
use crate::model::*;

// ── Slot Algorithm ────────────────────────────────────────────────

/// `[midnight, midnight + DAY_MS)` of the UTC date `day`. Slots for `day` start here.
pub fn day_span(day: NaiveDate) -> Span {
    let midnight = utc_midnight(day);
    Span::new(midnight, midnight + DAY_MS)
}

/// Open windows that apply to the UTC date `day`, with their concrete spans.
///
/// Recurring: active windows whose `week_day` matches, anchored on `day`'s midnight.
/// Once: active windows overlapping `day`, clipped to start no earlier than
/// midnight and to end no later than the next day's end, so a slot starting
/// late on `day` may still run to the window's end. Blackouts never open time.
pub fn open_windows_on(
    windows: &[AvailabilityWindow],
    day: NaiveDate,
) -> impl Iterator<Item = (&AvailabilityWindow, Span)> {
    let bounds = day_span(day);
    let wd = week_day(day);
    windows.iter().filter_map(move |w| {
        if !w.active {
            return None;
        }
        match w.schedule {
            WindowSchedule::Recurring { week_day, .. } if week_day == wd => {
                Some((w, w.span_on(bounds.start)))
            }
            WindowSchedule::Once { span } if span.overlaps(&bounds) => Some((
                w,
                Span::new(span.start.max(bounds.start), span.end.min(bounds.end + DAY_MS)),
            )),
            _ => None,
        }
    })
}

/// Union of the open windows for `day` as sorted, disjoint spans.
pub fn open_spans(windows: &[AvailabilityWindow], day: NaiveDate) -> Vec<Span> {
    let mut spans: Vec<Span> = open_windows_on(windows, day).map(|(_, s)| s).collect();
    spans.sort_by_key(|s| s.start);
    merge_overlapping(&spans)
}

/// Blackout spans, sorted by start.
pub fn blackout_spans(windows: &[AvailabilityWindow]) -> Vec<Span> {
    let mut spans: Vec<Span> = windows
        .iter()
        .filter(|w| w.is_blackout())
        .map(|w| w.span_on(0))
        .collect();
    spans.sort_by_key(|s| s.start);
    spans
}

/// Step through each open span in `step` increments from its start; keep every
/// `t` with `t + step <= span.end`. Spans shorter than `step` yield nothing.
pub fn discretize(open: &[Span], step: Ms) -> Vec<Ms> {
    if step <= 0 {
        return Vec::new();
    }
    let mut starts = Vec::new();
    for span in open {
        let mut t = span.start;
        while t + step <= span.end {
            starts.push(t);
            t += step;
        }
    }
    starts
}

/// Drop every candidate whose `[t, t + duration)` strictly overlaps a closed span.
pub fn remove_conflicting(candidates: &[Ms], duration: Ms, closed: &[Span]) -> Vec<Ms> {
    let mut sorted = closed.to_vec();
    sorted.sort_by_key(|s| s.start);
    let merged = merge_overlapping(&sorted);

    candidates
        .iter()
        .copied()
        .filter(|&t| {
            let cand = Span::new(t, t + duration);
            // Merged spans are disjoint with increasing ends, so only the last
            // one starting before cand.end can reach back into cand.
            let right = merged.partition_point(|c| c.start < cand.end);
            right == 0 || merged[right - 1].end <= cand.start
        })
        .collect()
}

/// Bookable start instants on `day`.
///
/// `busy` holds every occupied span to avoid (provider bookings and, when known,
/// the caller's own bookings). Only starts strictly after `now` survive.
/// Output is strictly increasing.
pub fn candidate_starts(
    windows: &[AvailabilityWindow],
    day: NaiveDate,
    duration: Ms,
    busy: &[Span],
    now: Ms,
) -> Vec<Ms> {
    let open = open_spans(windows, day);
    if open.is_empty() {
        return Vec::new();
    }
    let bounds = day_span(day);
    let mut grid = discretize(&open, duration);
    grid.retain(|&t| bounds.contains_instant(t));

    let mut closed = blackout_spans(windows);
    closed.extend_from_slice(busy);
    let mut free = remove_conflicting(&grid, duration, &closed);

    free.retain(|&t| t > now);
    free
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`. Both sorted by start; `base` disjoint.
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

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    const H: Ms = HOUR_MS;
    const M: Ms = MINUTE_MS;

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    fn at(day: NaiveDate, offset: Ms) -> Ms {
        utc_midnight(day) + offset
    }

    fn provider() -> Ulid {
        Ulid::new()
    }

    // ── subtract_intervals ────────────────────────────────

    #[test]
    fn subtract_no_overlap() {
        let base = vec![Span::new(100, 200), Span::new(300, 400)];
        let remove = vec![Span::new(200, 300)];
        assert_eq!(subtract_intervals(&base, &remove), base);
    }

    #[test]
    fn subtract_full_overlap() {
        let base = vec![Span::new(100, 200)];
        let remove = vec![Span::new(50, 250)];
        assert!(subtract_intervals(&base, &remove).is_empty());
    }

    #[test]
    fn subtract_middle_punch() {
        let base = vec![Span::new(100, 300)];
        let remove = vec![Span::new(150, 200)];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![Span::new(100, 150), Span::new(200, 300)]
        );
    }

    // ── merge_overlapping ────────────────────────────────

    #[test]
    fn merge_overlapping_basic() {
        let spans = vec![Span::new(100, 300), Span::new(200, 400), Span::new(500, 600)];
        assert_eq!(
            merge_overlapping(&spans),
            vec![Span::new(100, 400), Span::new(500, 600)]
        );
    }

    #[test]
    fn merge_overlapping_adjacent() {
        let spans = vec![Span::new(100, 200), Span::new(200, 300)];
        assert_eq!(merge_overlapping(&spans), vec![Span::new(100, 300)]);
    }

    // ── discretize / remove_conflicting ──────────────────

    #[test]
    fn discretize_stops_before_overrun() {
        let starts = discretize(&[Span::new(0, 250)], 100);
        assert_eq!(starts, vec![0, 100]);
    }

    #[test]
    fn discretize_drops_short_spans() {
        assert!(discretize(&[Span::new(0, 50)], 100).is_empty());
        assert!(discretize(&[Span::new(0, 50)], 0).is_empty());
    }

    #[test]
    fn conflicting_candidates_removed_strictly() {
        let cands = vec![0, 100, 200, 300];
        // [150, 200) touches candidate 100 ([100, 200)) but not 200.
        let free = remove_conflicting(&cands, 100, &[Span::new(150, 200)]);
        assert_eq!(free, vec![0, 200, 300]);
    }

    #[test]
    fn conflicting_with_unsorted_overlapping_closed() {
        let cands = vec![0, 100, 200, 300, 400];
        let closed = vec![Span::new(350, 360), Span::new(50, 120), Span::new(100, 110)];
        let free = remove_conflicting(&cands, 100, &closed);
        assert_eq!(free, vec![200, 400]);
    }

    // ── window selection ─────────────────────────────────

    #[test]
    fn recurring_only_on_matching_weekday() {
        let p = provider();
        let windows = vec![
            AvailabilityWindow::recurring(p, 1, 9 * H, 12 * H),
            AvailabilityWindow::recurring(p, 2, 13 * H, 17 * H),
        ];
        let day = monday();
        assert_eq!(
            open_spans(&windows, day),
            vec![Span::new(at(day, 9 * H), at(day, 12 * H))]
        );
    }

    #[test]
    fn inactive_recurring_ignored() {
        let p = provider();
        let mut w = AvailabilityWindow::recurring(p, 1, 9 * H, 12 * H);
        w.active = false;
        assert!(open_spans(&[w], monday()).is_empty());
    }

    #[test]
    fn once_window_only_on_its_date() {
        let p = provider();
        let day = monday();
        let tomorrow = day.succ_opt().unwrap();
        let w = AvailabilityWindow::once(p, Span::new(at(tomorrow, 8 * H), at(tomorrow, 10 * H)));
        assert!(open_spans(std::slice::from_ref(&w), day).is_empty());
        assert_eq!(open_spans(&[w], tomorrow).len(), 1);
    }

    #[test]
    fn multi_day_once_window_clipped_to_each_day() {
        let p = provider();
        let day = monday();
        let tuesday = day.succ_opt().unwrap();
        let wednesday = tuesday.succ_opt().unwrap();
        let w = AvailabilityWindow::once(p, Span::new(at(day, 9 * H), at(wednesday, 9 * H)));
        let windows = std::slice::from_ref(&w);

        let monday_starts = candidate_starts(windows, day, 60 * M, &[], 0);
        assert_eq!(monday_starts.len(), 15);
        assert_eq!(monday_starts.first(), Some(&at(day, 9 * H)));
        assert_eq!(monday_starts.last(), Some(&at(day, 23 * H)));

        let tuesday_starts = candidate_starts(windows, tuesday, 60 * M, &[], 0);
        assert_eq!(tuesday_starts.len(), 24);
        assert_eq!(tuesday_starts.first(), Some(&at(tuesday, 0)));

        let wednesday_starts = candidate_starts(windows, wednesday, 60 * M, &[], 0);
        assert_eq!(wednesday_starts.len(), 9);
        assert_eq!(wednesday_starts.last(), Some(&at(wednesday, 8 * H)));
    }

    #[test]
    fn late_slot_may_run_past_midnight() {
        let p = provider();
        let day = monday();
        let tuesday = day.succ_opt().unwrap();
        let w = AvailabilityWindow::once(p, Span::new(at(day, 22 * H), at(tuesday, 2 * H)));
        let windows = std::slice::from_ref(&w);
        assert_eq!(
            candidate_starts(windows, day, 90 * M, &[], 0),
            vec![at(day, 22 * H), at(day, 23 * H + 30 * M)]
        );
        assert_eq!(candidate_starts(windows, tuesday, 90 * M, &[], 0), vec![at(tuesday, 0)]);
    }

    #[test]
    fn overlapping_windows_are_unioned() {
        let p = provider();
        let day = monday();
        let windows = vec![
            AvailabilityWindow::recurring(p, 1, 9 * H, 12 * H),
            AvailabilityWindow::once(p, Span::new(at(day, 11 * H), at(day, 14 * H))),
            AvailabilityWindow::recurring(p, 1, 16 * H, 18 * H),
        ];
        assert_eq!(
            open_spans(&windows, day),
            vec![
                Span::new(at(day, 9 * H), at(day, 14 * H)),
                Span::new(at(day, 16 * H), at(day, 18 * H)),
            ]
        );
    }

    // ── candidate_starts ─────────────────────────────────

    #[test]
    fn full_day_hourly() {
        let p = provider();
        let day = monday();
        let windows = vec![AvailabilityWindow::recurring(p, 1, 9 * H, 17 * H)];
        let starts = candidate_starts(&windows, day, 60 * M, &[], 0);
        let expected: Vec<Ms> = (9..17).map(|h| at(day, h * H)).collect();
        assert_eq!(starts, expected);
    }

    #[test]
    fn blackout_removes_exactly_its_slot() {
        let p = provider();
        let day = monday();
        let windows = vec![
            AvailabilityWindow::recurring(p, 1, 9 * H, 17 * H),
            AvailabilityWindow::blackout(p, Span::new(at(day, 14 * H), at(day, 15 * H))),
        ];
        let starts = candidate_starts(&windows, day, 60 * M, &[], 0);
        assert!(starts.contains(&at(day, 13 * H)));
        assert!(!starts.contains(&at(day, 14 * H)));
        assert!(starts.contains(&at(day, 15 * H)));
        assert_eq!(starts.len(), 7);
    }

    #[test]
    fn blackout_without_open_window_is_noop() {
        let p = provider();
        let day = monday();
        let windows = vec![AvailabilityWindow::blackout(
            p,
            Span::new(at(day, 14 * H), at(day, 15 * H)),
        )];
        assert!(candidate_starts(&windows, day, 60 * M, &[], 0).is_empty());
    }

    #[test]
    fn busy_span_removes_overlapping_candidates() {
        let p = provider();
        let day = monday();
        let windows = vec![AvailabilityWindow::recurring(p, 1, 9 * H, 12 * H)];
        // A 30-minute booking at 10:15 knocks out 10:00 only.
        let busy = vec![Span::new(at(day, 10 * H + 15 * M), at(day, 10 * H + 45 * M))];
        let starts = candidate_starts(&windows, day, 60 * M, &busy, 0);
        assert_eq!(starts, vec![at(day, 9 * H), at(day, 11 * H)]);
    }

    #[test]
    fn past_candidates_dropped() {
        let p = provider();
        let day = monday();
        let windows = vec![AvailabilityWindow::recurring(p, 1, 9 * H, 13 * H)];
        // now == 10:00 exactly: 10:00 is not strictly in the future.
        let starts = candidate_starts(&windows, day, 60 * M, &[], at(day, 10 * H));
        assert_eq!(starts, vec![at(day, 11 * H), at(day, 12 * H)]);
    }

    #[test]
    fn short_service_produces_denser_grid() {
        let p = provider();
        let day = monday();
        let windows = vec![AvailabilityWindow::recurring(p, 1, 9 * H, 10 * H)];
        let starts = candidate_starts(&windows, day, 20 * M, &[], 0);
        assert_eq!(
            starts,
            vec![at(day, 9 * H), at(day, 9 * H + 20 * M), at(day, 9 * H + 40 * M)]
        );
    }

    #[test]
    fn window_shorter_than_service_yields_nothing() {
        let p = provider();
        let day = monday();
        let windows = vec![AvailabilityWindow::recurring(p, 1, 9 * H, 9 * H + 30 * M)];
        assert!(candidate_starts(&windows, day, 60 * M, &[], 0).is_empty());
    }
}
