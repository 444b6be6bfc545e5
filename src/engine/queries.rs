use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

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

impl Engine {
    pub async fn list_rooms(&self) -> Vec<RoomInfo> {
        let arcs: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut rooms = Vec::with_capacity(arcs.len());
        for arc in arcs {
            let guard = arc.read().await;
            rooms.push(RoomInfo {
                id: guard.id,
                name: guard.name.clone(),
                location: guard.location.clone(),
                capacity: guard.capacity,
                features: guard.features,
            });
        }
        rooms.sort_by_key(|r| r.id);
        rooms
    }

    /// Denormalized reservations, filtered by room and/or user. A user filter
    /// matches both owned reservations and ones the user participates in.
    pub async fn list_reservations(
        &self,
        room_id: Option<RoomId>,
        user_id: Option<UserId>,
    ) -> Vec<ReservationSnapshot> {
        let arcs: Vec<_> = match room_id {
            Some(rid) => self.get_room(&rid).into_iter().collect(),
            None => self.rooms.iter().map(|e| e.value().clone()).collect(),
        };
        let mut out = Vec::new();
        for arc in arcs {
            let guard = arc.read().await;
            for r in &guard.reservations {
                if let Some(uid) = user_id
                    && r.user_id != uid
                    && !r.participants.contains(&uid)
                {
                    continue;
                }
                out.push(self.snapshot(&guard, r));
            }
        }
        out.sort_by_key(|s| (s.span.start, s.room_id));
        out
    }

    /// A user's pending queue entries across all rooms, oldest first.
    pub async fn list_waitlist(&self, user_id: UserId) -> Vec<WaitlistInfo> {
        let arcs: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for arc in arcs {
            let guard = arc.read().await;
            for e in &guard.waitlist {
                if e.status != WaitlistStatus::Waiting || e.user_id != user_id {
                    continue;
                }
                out.push(WaitlistInfo {
                    id: e.id,
                    room_id: guard.id,
                    room_name: guard.name.clone(),
                    user_id: e.user_id,
                    span: e.span,
                    position: e.position,
                    submitted_at: e.submitted_at,
                });
            }
        }
        out.sort_by_key(|w| (w.submitted_at, w.position));
        out
    }

    /// Active reservations overlapping a window, for a room's schedule view.
    pub async fn room_timeline(
        &self,
        room_id: RoomId,
        window: Span,
    ) -> Result<Vec<ReservationSnapshot>, EngineError> {
        check_window_width(&window)?;
        let arc = match self.get_room(&room_id) {
            Some(r) => r,
            None => return Ok(Vec::new()),
        };
        let guard = arc.read().await;
        Ok(guard
            .overlapping(&window)
            .map(|r| self.snapshot(&guard, r))
            .collect())
    }

    /// Unreserved time in a room over a window, as maximal disjoint spans.
    pub async fn free_slots(
        &self,
        room_id: RoomId,
        window: Span,
    ) -> Result<Vec<Span>, EngineError> {
        check_window_width(&window)?;
        let arc = match self.get_room(&room_id) {
            Some(r) => r,
            None => return Ok(Vec::new()),
        };
        let guard = arc.read().await;
        let occupied: Vec<Span> = guard
            .overlapping(&window)
            .map(|r| {
                Span::new(
                    r.span.start.max(window.start),
                    r.span.end.min(window.end),
                )
            })
            .collect();
        // overlapping() yields in start order, so occupied is already sorted
        let merged = merge_overlapping(&occupied);
        Ok(subtract_intervals(&[window], &merged))
    }
}

fn check_window_width(window: &Span) -> Result<(), EngineError> {
    if window.start >= window.end {
        return Err(EngineError::InvalidInterval {
            start: window.start,
            end: window.end,
        });
    }
    if window.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_adjacent_and_overlapping() {
        let spans = vec![
            Span::new(0, 100),
            Span::new(100, 200),
            Span::new(150, 300),
            Span::new(500, 600),
        ];
        let merged = merge_overlapping(&spans);
        assert_eq!(merged, vec![Span::new(0, 300), Span::new(500, 600)]);
    }

    #[test]
    fn subtract_punches_holes() {
        let base = vec![Span::new(0, 1000)];
        let holes = vec![Span::new(100, 200), Span::new(500, 700)];
        let free = subtract_intervals(&base, &holes);
        assert_eq!(
            free,
            vec![Span::new(0, 100), Span::new(200, 500), Span::new(700, 1000)]
        );
    }

    #[test]
    fn subtract_full_coverage() {
        let base = vec![Span::new(100, 200)];
        let holes = vec![Span::new(0, 300)];
        assert!(subtract_intervals(&base, &holes).is_empty());
    }

    #[test]
    fn subtract_nothing() {
        let base = vec![Span::new(100, 200)];
        assert_eq!(subtract_intervals(&base, &[]), base);
    }
}
