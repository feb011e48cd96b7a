use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;
use crate::model::Ms;

fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// Background task that expires pending reservations nobody confirmed
/// within the TTL, freeing their dates.
pub async fn run_reaper(engine: Arc<Engine>, pending_ttl_ms: i64) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;
        let now = now_ms();
        for id in engine.collect_expired_pending(now, pending_ttl_ms) {
            match engine.expire_pending(id).await {
                Ok(()) => info!("expired pending reservation {id}"),
                Err(e) => {
                    // May have been confirmed or cancelled since the scan
                    tracing::debug!("reaper skip {id}: {e}");
                }
            }
        }
    }
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => tracing::warn!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::Collaborators;
    use crate::engine::NewReservation;
    use crate::model::StaySpan;
    use crate::notify::NotifyHub;
    use chrono::NaiveDate;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("vacancy_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn stay(a: u32, b: u32) -> StaySpan {
        StaySpan::new(
            NaiveDate::from_ymd_opt(2025, 6, a).unwrap(),
            NaiveDate::from_ymd_opt(2025, 6, b).unwrap(),
        )
    }

    #[tokio::test]
    async fn reaper_expires_stale_pending() {
        let path = test_wal_path("expire_pending.wal");
        let engine = Arc::new(
            Engine::new(path, Arc::new(NotifyHub::new()), Collaborators::noop()).unwrap(),
        );

        let property = Ulid::new();
        engine
            .register_property(property, "Seaside".into())
            .await
            .unwrap();
        let room = Ulid::new();
        engine
            .register_room(room, property, None, 2, 10_000)
            .await
            .unwrap();

        let reservation = engine
            .create_reservation(NewReservation {
                guest_id: Ulid::new(),
                room_id: room,
                stay: stay(1, 3),
                guests: 1,
                notes: None,
            })
            .await
            .unwrap();

        // Not yet expired at creation time
        let ttl = 60_000;
        assert!(
            engine
                .collect_expired_pending(reservation.created_at, ttl)
                .is_empty()
        );

        // Expired once the TTL has elapsed
        let later = reservation.created_at + ttl + 1;
        let expired = engine.collect_expired_pending(later, ttl);
        assert_eq!(expired, vec![reservation.id]);

        engine.expire_pending(reservation.id).await.unwrap();
        assert!(engine.collect_expired_pending(later, ttl).is_empty());

        // A second expiry attempt is refused — it's already cancelled
        assert!(engine.expire_pending(reservation.id).await.is_err());
    }

    #[tokio::test]
    async fn confirmed_reservations_are_not_reaped() {
        let path = test_wal_path("confirmed_kept.wal");
        let engine = Arc::new(
            Engine::new(path, Arc::new(NotifyHub::new()), Collaborators::noop()).unwrap(),
        );

        let property = Ulid::new();
        engine
            .register_property(property, "Seaside".into())
            .await
            .unwrap();
        let room = Ulid::new();
        engine
            .register_room(room, property, None, 2, 10_000)
            .await
            .unwrap();

        let reservation = engine
            .create_reservation(NewReservation {
                guest_id: Ulid::new(),
                room_id: room,
                stay: stay(1, 3),
                guests: 1,
                notes: None,
            })
            .await
            .unwrap();
        engine
            .set_reservation_status(
                reservation.id,
                crate::model::ReservationStatus::Confirmed,
                None,
            )
            .await
            .unwrap();

        let far_future = reservation.created_at + 1_000_000_000;
        assert!(engine.collect_expired_pending(far_future, 1).is_empty());
    }
}
