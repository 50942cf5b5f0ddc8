use shared::domain::{Coordinate, RecordId, Score, SessionRecord, TargetArtifact, UserId};
use storage::Storage;

fn record(coordinate: &str, timestamp: &str, score: i64) -> SessionRecord {
    SessionRecord {
        id: RecordId::random(),
        coordinate: Coordinate::new(coordinate),
        timestamp: timestamp.parse().expect("timestamp"),
        target: TargetArtifact {
            mime_type: "image/jpeg".into(),
            image_b64: "dGFyZ2V0".into(),
            display_handle: "https://picsum.test/seed/7/800/600".into(),
        },
        sketch: None,
        notes: String::new(),
        score: Score::new(score).expect("score"),
        feedback: "ok".into(),
        duration_seconds: 30,
    }
}

#[tokio::test]
async fn history_survives_reopening_the_database() {
    let dir = tempfile::tempdir().expect("tempdir");
    let database_url = format!(
        "sqlite://{}",
        dir.path().join("history.db").to_string_lossy().replace('\\', "/")
    );
    let user = UserId::new("viewer-1");

    {
        let storage = Storage::new(&database_url).await.expect("open");
        storage
            .append_session_record(&user, &record("1111-2222", "2025-02-01T08:00:00Z", 35))
            .await
            .expect("first");
        storage
            .append_session_record(&user, &record("3333-4444", "2025-02-02T08:00:00Z", 71))
            .await
            .expect("second");
    }

    let reopened = Storage::new(&database_url).await.expect("reopen");
    let history = reopened.list_session_records(&user).await.expect("list");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].coordinate.as_str(), "1111-2222");
    assert_eq!(history[1].score.value(), 71);
}
