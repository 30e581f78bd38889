use pretty_assertions::assert_eq;
use rusqlite::Connection;
use time::macros::datetime;
use time::OffsetDateTime;

use orbcomm_core::db;
use orbcomm_core::domain::RawEmail;
use orbcomm_core::metrics::{compute_stats, save_stats_snapshot};
use orbcomm_core::repo;
use orbcomm_core::sync::{run_sync, SyncRequest};

fn email(id: &str, subject: &str, body: &str, at: OffsetDateTime) -> RawEmail {
    RawEmail {
        message_id: id.to_string(),
        subject: subject.to_string(),
        body: body.to_string(),
        received_at: at,
        source_mailbox: "noc@example.com".to_string(),
    }
}

fn seeded() -> Connection {
    let mut conn = db::open_in_memory().unwrap();
    db::migrate(&mut conn).unwrap();
    let emails = vec![
        // A-000001: opened, continued, resolved after 2h; outage 90m.
        email("1", "ORBCOMM Service Notification: A-000001 Open", "Platform: IDP\nEvent: Service Disruption", datetime!(2025-01-10 08:00 UTC)),
        email("2", "ORBCOMM Service Notification: A-000001 Continuing", "Platform: IDP\nEvent: Service Disruption", datetime!(2025-01-10 09:00 UTC)),
        email(
            "3",
            "ORBCOMM Service Notification: A-000001 Resolved",
            "Platform: IDP\nEvent: Service Disruption\nStart Time: 2025-01-10 07:45 GMT\nEnd Time: 2025-01-10 09:15 GMT",
            datetime!(2025-01-10 10:00 UTC),
        ),
        // A-000002: still open, with a Continuing update.
        email("4", "ORBCOMM Service Notification: A-000002 Open", "Platform: OGx\nEvent: Scheduled Maintenance", datetime!(2025-06-01 08:00 UTC)),
        email("5", "ORBCOMM Service Notification: A-000002 Continuing", "Platform: OGx\nEvent: Scheduled Maintenance", datetime!(2025-06-01 12:00 UTC)),
        // A-000003: resolved, legacy body without incident times, opened 30m earlier.
        email("6", "ORBCOMM Service Notification: A-000003 Open", "Platform: OGx\nEvent: Service Disruption", datetime!(2025-06-02 08:00 UTC)),
        email("7", "ORBCOMM Service Notification: A-000003 Resolved", "Platform: OGx\nEvent: Service Disruption", datetime!(2025-06-02 08:30 UTC)),
    ];
    run_sync(&mut conn, &SyncRequest::new("noc@example.com"), &emails).unwrap();
    conn
}

#[test]
fn stats_count_truly_open_incidents_and_average_known_durations() {
    let conn = seeded();
    let stats = compute_stats(&conn, false).unwrap();

    assert_eq!(stats.total_notifications, 7);
    assert_eq!(stats.open_count, 1);
    assert_eq!(stats.resolved_count, 2);
    assert_eq!(stats.continuing_count, 2);
    assert_eq!(stats.platform_breakdown.get("IDP"), Some(&3));
    assert_eq!(stats.platform_breakdown.get("OGx"), Some(&4));
    assert_eq!(stats.event_type_breakdown.get("Scheduled Maintenance"), Some(&2));
    // (120 + 30) / 2
    assert_eq!(stats.avg_time_to_resolve_minutes, Some(75.0));
    // Only A-000001 states its outage window.
    assert_eq!(stats.avg_incident_duration_minutes, Some(90.0));
    let idp = stats.platform_incident_stats.get("IDP").expect("IDP stats");
    assert_eq!((idp.count, idp.total_duration_minutes), (1, 90));
    assert!(stats.platform_incident_stats.get("OGx").is_none());
}

#[test]
fn archived_records_leave_default_views_but_keep_pairing() {
    let conn = seeded();
    let archived = repo::archive_older_than(&conn, datetime!(2025-03-01 00:00 UTC)).unwrap();
    assert_eq!(archived, 3);
    assert_eq!(repo::archive_older_than(&conn, datetime!(2025-03-01 00:00 UTC)).unwrap(), 0);

    assert_eq!(repo::list_records(&conn, false).unwrap().len(), 4);
    assert_eq!(repo::list_records(&conn, true).unwrap().len(), 7);

    let stats = compute_stats(&conn, false).unwrap();
    assert_eq!(stats.total_notifications, 4);
    assert_eq!(stats.avg_time_to_resolve_minutes, Some(30.0));
    assert_eq!(stats.avg_incident_duration_minutes, None);

    let all = compute_stats(&conn, true).unwrap();
    assert_eq!(all.total_notifications, 7);

    let detail = repo::get_pair_detail(&conn, "A-000001").unwrap();
    assert_eq!(detail.pair.time_to_resolve_minutes, Some(120));
    assert!(detail.open.map(|r| r.is_archived).unwrap_or(false));
}

#[test]
fn snapshot_persists_current_stats() {
    let conn = seeded();
    let snap = save_stats_snapshot(&conn).unwrap();

    let (total, open, breakdown): (i64, i64, String) = conn
        .query_row(
            "SELECT total_notifications, open_count, platform_breakdown_json FROM stats_snapshots WHERE id = ?1",
            [snap.id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .unwrap();
    assert_eq!(total, 7);
    assert_eq!(open, 1);
    assert_eq!(breakdown, r#"{"IDP":3,"OGx":4}"#);
}
