use chrono::NaiveDate;

use crate::model::{RoomState, StaySpan};

// ── Availability algorithms ───────────────────────────────────────

/// Merge sorted spans into disjoint spans. Adjacent spans coalesce (a stay
/// ending on a date and another starting on it leave no gap between them).
pub fn merge_overlapping(sorted: &[StaySpan]) -> Vec<StaySpan> {
    let mut merged: Vec<StaySpan> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.check_in <= last.check_out {
                last.check_out = last.check_out.max(span.check_out);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`. Both inputs sorted by check-in; `to_remove`
/// must additionally be disjoint (run it through `merge_overlapping`).
pub fn subtract_spans(base: &[StaySpan], to_remove: &[StaySpan]) -> Vec<StaySpan> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.check_in;
        let current_end = b.check_out;

        while ri < to_remove.len() && to_remove[ri].check_out <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].check_in < current_end {
            let r = &to_remove[j];
            if r.check_in > current_start {
                result.push(StaySpan::new(current_start, r.check_in));
            }
            current_start = current_start.max(r.check_out);
            j += 1;
        }

        if current_start < current_end {
            result.push(StaySpan::new(current_start, current_end));
        }
    }

    result
}

/// Free sub-spans of `window` for one room: the window minus every
/// room-holding reservation, clamped to the window.
pub fn free_spans(room: &RoomState, window: &StaySpan) -> Vec<StaySpan> {
    let mut busy: Vec<StaySpan> = room
        .overlapping(window)
        .filter(|r| r.status.holds_room())
        .map(|r| r.stay.clamped_to(window))
        .collect();
    busy.sort_by_key(|s| s.check_in);
    let busy = merge_overlapping(&busy);
    subtract_spans(&[*window], &busy)
}

/// Sweep line over per-room busy spans: date ranges where the number of
/// simultaneously taken rooms reaches `total_rooms` (the property is sold
/// out). Each inner slice is one room's merged busy spans.
pub fn sold_out_spans(busy_per_room: &[Vec<StaySpan>], total_rooms: u32) -> Vec<StaySpan> {
    if total_rooms == 0 || busy_per_room.is_empty() {
        return Vec::new();
    }

    let mut events: Vec<(NaiveDate, i32)> = Vec::new();
    for room_busy in busy_per_room {
        for span in room_busy {
            events.push((span.check_in, 1));
            events.push((span.check_out, -1));
        }
    }
    // Decrements sort before increments on the same date, so a check-out
    // meeting a check-in does not bridge two sold-out ranges.
    events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut result = Vec::new();
    let mut count: i32 = 0;
    let mut sold_out_start: Option<NaiveDate> = None;
    let threshold = total_rooms as i32;

    for (date, delta) in &events {
        count += delta;
        if count >= threshold && sold_out_start.is_none() {
            sold_out_start = Some(*date);
        } else if count < threshold
            && let Some(start) = sold_out_start.take()
            && *date > start {
                result.push(StaySpan::new(start, *date));
            }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Reservation, ReservationStatus};
    use ulid::Ulid;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, d).unwrap()
    }

    fn span(a: u32, b: u32) -> StaySpan {
        StaySpan::new(day(a), day(b))
    }

    fn room_with(stays: Vec<(u32, u32, ReservationStatus)>) -> RoomState {
        let mut room = RoomState::new(Ulid::new(), Ulid::new(), None, 2, 10_000);
        for (a, b, status) in stays {
            room.insert_reservation(Reservation {
                id: Ulid::new(),
                code: "AB12CD34".into(),
                guest_id: Ulid::new(),
                room_id: room.id,
                stay: span(a, b),
                guests: 1,
                nightly_rate: 10_000,
                total_price: 10_000 * span(a, b).nights(),
                status,
                notes: None,
                cancel_reason: None,
                cancelled_at: None,
                created_at: 0,
            });
        }
        room
    }

    // ── subtract_spans ───────────────────────────────────

    #[test]
    fn subtract_no_overlap() {
        let base = vec![span(1, 5), span(10, 15)];
        let remove = vec![span(5, 10)];
        assert_eq!(subtract_spans(&base, &remove), base);
    }

    #[test]
    fn subtract_full_cover() {
        let base = vec![span(5, 10)];
        let remove = vec![span(1, 15)];
        assert!(subtract_spans(&base, &remove).is_empty());
    }

    #[test]
    fn subtract_left_edge() {
        let base = vec![span(5, 15)];
        let remove = vec![span(1, 10)];
        assert_eq!(subtract_spans(&base, &remove), vec![span(10, 15)]);
    }

    #[test]
    fn subtract_right_edge() {
        let base = vec![span(5, 15)];
        let remove = vec![span(10, 20)];
        assert_eq!(subtract_spans(&base, &remove), vec![span(5, 10)]);
    }

    #[test]
    fn subtract_middle_punch() {
        let base = vec![span(1, 28)];
        let remove = vec![span(10, 15)];
        assert_eq!(subtract_spans(&base, &remove), vec![span(1, 10), span(15, 28)]);
    }

    #[test]
    fn subtract_multiple_punches() {
        let base = vec![span(1, 28)];
        let remove = vec![span(3, 5), span(10, 12), span(20, 25)];
        assert_eq!(
            subtract_spans(&base, &remove),
            vec![span(1, 3), span(5, 10), span(12, 20), span(25, 28)]
        );
    }

    // ── merge_overlapping ────────────────────────────────

    #[test]
    fn merge_basic() {
        let spans = vec![span(1, 10), span(5, 15), span(20, 25)];
        assert_eq!(merge_overlapping(&spans), vec![span(1, 15), span(20, 25)]);
    }

    #[test]
    fn merge_adjacent() {
        let spans = vec![span(1, 5), span(5, 10)];
        assert_eq!(merge_overlapping(&spans), vec![span(1, 10)]);
    }

    // ── free_spans ───────────────────────────────────────

    #[test]
    fn free_spans_punches_out_holds() {
        let room = room_with(vec![
            (5, 8, ReservationStatus::Confirmed),
            (12, 14, ReservationStatus::Pending),
        ]);
        let free = free_spans(&room, &span(1, 20));
        assert_eq!(free, vec![span(1, 5), span(8, 12), span(14, 20)]);
    }

    #[test]
    fn free_spans_ignore_cancelled_and_checked_out() {
        let room = room_with(vec![
            (5, 8, ReservationStatus::Cancelled),
            (10, 12, ReservationStatus::CheckedOut),
        ]);
        let free = free_spans(&room, &span(1, 20));
        assert_eq!(free, vec![span(1, 20)]);
    }

    #[test]
    fn free_spans_clamps_to_window() {
        let room = room_with(vec![(1, 10, ReservationStatus::Confirmed)]);
        let free = free_spans(&room, &span(5, 15));
        assert_eq!(free, vec![span(10, 15)]);
    }

    #[test]
    fn free_spans_empty_room() {
        let room = room_with(vec![]);
        assert_eq!(free_spans(&room, &span(1, 5)), vec![span(1, 5)]);
    }

    #[test]
    fn free_spans_fully_booked() {
        let room = room_with(vec![(1, 10, ReservationStatus::CheckedIn)]);
        assert!(free_spans(&room, &span(2, 8)).is_empty());
    }

    // ── sold_out_spans ───────────────────────────────────

    #[test]
    fn sold_out_two_rooms_overlap() {
        let busy = vec![vec![span(1, 10)], vec![span(5, 15)]];
        assert_eq!(sold_out_spans(&busy, 2), vec![span(5, 10)]);
    }

    #[test]
    fn sold_out_disjoint_rooms() {
        let busy = vec![vec![span(1, 10)], vec![span(10, 20)]];
        assert!(sold_out_spans(&busy, 2).is_empty());
    }

    #[test]
    fn sold_out_single_room() {
        let busy = vec![vec![span(1, 10), span(20, 25)]];
        assert_eq!(sold_out_spans(&busy, 1), vec![span(1, 10), span(20, 25)]);
    }

    #[test]
    fn sold_out_three_rooms() {
        let busy = vec![
            vec![span(1, 10)],
            vec![span(3, 8)],
            vec![span(5, 15)],
        ];
        assert_eq!(sold_out_spans(&busy, 3), vec![span(5, 8)]);
    }

    #[test]
    fn sold_out_empty() {
        assert!(sold_out_spans(&[], 5).is_empty());
    }
}
