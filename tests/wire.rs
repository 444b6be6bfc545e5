use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls};
use ulid::Ulid;

use slotd::engine::ParticipantPolicy;
use slotd::tenant::TenantManager;
use slotd::wire;

const HOUR: i64 = 3_600_000;
const DAY: i64 = 86_400_000;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("slotd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000, ParticipantPolicy::Drop));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "slotd".to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

/// Connect as a given user. The startup user field carries the acting
/// user id for statements that act on someone's behalf.
async fn connect_as(addr: SocketAddr, user: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("test")
        .user(user)
        .password("slotd");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

/// An on-hour slot safely inside the booking window: noon UTC, three
/// days out, shifted by `offset` hours.
fn slot(offset: i64) -> (i64, i64) {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64;
    let start = (now.div_euclid(DAY) + 3) * DAY + 12 * HOUR + offset * HOUR;
    (start, start + HOUR)
}

fn count_rows(messages: &[tokio_postgres::SimpleQueryMessage]) -> usize {
    messages
        .iter()
        .filter(|m| matches!(m, tokio_postgres::SimpleQueryMessage::Row(_)))
        .count()
}

async fn seed(client: &Client) {
    for (id, sid, name) in [(1, "1000001", "Ana"), (2, "1000002", "Ben")] {
        client
            .batch_execute(&format!(
                "INSERT INTO users (id, student_id, name) VALUES ({id}, '{sid}', '{name}')"
            ))
            .await
            .unwrap();
    }
    client
        .batch_execute(
            "INSERT INTO rooms (id, name, location, capacity, projector, whiteboard) \
             VALUES (1, 'A101', 'north wing', 4, true, false)",
        )
        .await
        .unwrap();
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn connect_and_query() {
    let (addr, _tm) = start_test_server().await;
    let client = connect_as(addr, "1").await;
    seed(&client).await;

    let rows = client.simple_query("SELECT * FROM rooms").await.unwrap();
    assert_eq!(count_rows(&rows), 1);
}

#[tokio::test]
async fn reservation_lifecycle() {
    let (addr, _tm) = start_test_server().await;
    let client = connect_as(addr, "1").await;
    seed(&client).await;

    let (start, end) = slot(0);
    let rid = Ulid::new();
    client
        .batch_execute(&format!(
            r#"INSERT INTO reservations (id, room_id, start, "end") VALUES ('{rid}', 1, {start}, {end})"#
        ))
        .await
        .unwrap();

    let rows = client
        .simple_query("SELECT * FROM reservations WHERE room_id = 1")
        .await
        .unwrap();
    assert_eq!(count_rows(&rows), 1);

    client
        .batch_execute(&format!("DELETE FROM reservations WHERE id = '{rid}'"))
        .await
        .unwrap();

    let rows = client
        .simple_query("SELECT * FROM reservations WHERE room_id = 1")
        .await
        .unwrap();
    assert_eq!(count_rows(&rows), 0);
}

#[tokio::test]
async fn overlap_rejected_over_wire() {
    let (addr, _tm) = start_test_server().await;
    let client = connect_as(addr, "1").await;
    seed(&client).await;

    let (start, end) = slot(0);
    client
        .batch_execute(&format!(
            r#"INSERT INTO reservations (id, room_id, start, "end") VALUES ('{}', 1, {start}, {end})"#,
            Ulid::new()
        ))
        .await
        .unwrap();

    let err = client
        .batch_execute(&format!(
            r#"INSERT INTO reservations (id, room_id, start, "end") VALUES ('{}', 1, {start}, {end})"#,
            Ulid::new()
        ))
        .await
        .unwrap_err();
    let db_err = err.as_db_error().expect("expected db error");
    assert_eq!(db_err.code().code(), "P0001");
}

#[tokio::test]
async fn inverted_interval_rejected_over_wire() {
    let (addr, _tm) = start_test_server().await;
    let client = connect_as(addr, "1").await;
    seed(&client).await;

    // end before start must come back as a validation error, not kill
    // the connection
    let (start, end) = slot(0);
    let err = client
        .batch_execute(&format!(
            r#"INSERT INTO reservations (id, room_id, start, "end") VALUES ('{}', 1, {end}, {start})"#,
            Ulid::new()
        ))
        .await
        .unwrap_err();
    let db_err = err.as_db_error().expect("expected db error");
    assert_eq!(db_err.code().code(), "22023");

    let rows = client.simple_query("SELECT * FROM rooms").await.unwrap();
    assert_eq!(count_rows(&rows), 1);
}

#[tokio::test]
async fn mutations_require_numeric_user() {
    let (addr, _tm) = start_test_server().await;
    let admin = connect_as(addr, "1").await;
    seed(&admin).await;

    // Non-numeric user can still read
    let guest = connect_as(addr, "guest").await;
    let rows = guest.simple_query("SELECT * FROM rooms").await.unwrap();
    assert_eq!(count_rows(&rows), 1);

    // ...but cannot book
    let (start, end) = slot(0);
    let err = guest
        .batch_execute(&format!(
            r#"INSERT INTO reservations (id, room_id, start, "end") VALUES ('{}', 1, {start}, {end})"#,
            Ulid::new()
        ))
        .await
        .unwrap_err();
    let db_err = err.as_db_error().expect("expected db error");
    assert_eq!(db_err.code().code(), "28000");
}

#[tokio::test]
async fn cancel_requires_ownership_over_wire() {
    let (addr, _tm) = start_test_server().await;
    let owner = connect_as(addr, "1").await;
    seed(&owner).await;

    let (start, end) = slot(0);
    let rid = Ulid::new();
    owner
        .batch_execute(&format!(
            r#"INSERT INTO reservations (id, room_id, start, "end") VALUES ('{rid}', 1, {start}, {end})"#
        ))
        .await
        .unwrap();

    let other = connect_as(addr, "2").await;
    let err = other
        .batch_execute(&format!("DELETE FROM reservations WHERE id = '{rid}'"))
        .await
        .unwrap_err();
    let db_err = err.as_db_error().expect("expected db error");
    assert_eq!(db_err.code().code(), "42501");
}

#[tokio::test]
async fn cancellation_promotes_waitlisted_user() {
    let (addr, _tm) = start_test_server().await;
    let owner = connect_as(addr, "1").await;
    seed(&owner).await;

    let (start, end) = slot(0);
    let rid = Ulid::new();
    owner
        .batch_execute(&format!(
            r#"INSERT INTO reservations (id, room_id, start, "end") VALUES ('{rid}', 1, {start}, {end})"#
        ))
        .await
        .unwrap();

    // Second user queues for the same slot
    let other = connect_as(addr, "2").await;
    other
        .batch_execute(&format!(
            r#"INSERT INTO waitlist (id, room_id, start, "end") VALUES ('{}', 1, {start}, {end})"#,
            Ulid::new()
        ))
        .await
        .unwrap();
    let rows = other.simple_query("SELECT * FROM waitlist").await.unwrap();
    assert_eq!(count_rows(&rows), 1);

    // Owner cancels; the queued entry takes over the slot
    owner
        .batch_execute(&format!("DELETE FROM reservations WHERE id = '{rid}'"))
        .await
        .unwrap();

    let rows = other.simple_query("SELECT * FROM waitlist").await.unwrap();
    assert_eq!(count_rows(&rows), 0);
    let rows = other
        .simple_query("SELECT * FROM reservations WHERE user_id = 2")
        .await
        .unwrap();
    assert_eq!(count_rows(&rows), 1);
}

#[tokio::test]
async fn free_slots_over_wire() {
    let (addr, _tm) = start_test_server().await;
    let client = connect_as(addr, "1").await;
    seed(&client).await;

    let (start, end) = slot(0);
    client
        .batch_execute(&format!(
            r#"INSERT INTO reservations (id, room_id, start, "end") VALUES ('{}', 1, {start}, {end})"#,
            Ulid::new()
        ))
        .await
        .unwrap();

    // Window of three hours around the booked one: two free spans
    let w_start = start - HOUR;
    let w_end = end + HOUR;
    let rows = client
        .simple_query(&format!(
            r#"SELECT * FROM free_slots WHERE room_id = 1 AND start >= {w_start} AND "end" <= {w_end}"#
        ))
        .await
        .unwrap();
    assert_eq!(count_rows(&rows), 2);
}

#[tokio::test]
async fn extended_protocol_with_params() {
    let (addr, _tm) = start_test_server().await;
    let client = connect_as(addr, "1").await;
    seed(&client).await;

    let (start, end) = slot(0);
    client
        .batch_execute(&format!(
            r#"INSERT INTO reservations (id, room_id, start, "end") VALUES ('{}', 1, {start}, {end})"#,
            Ulid::new()
        ))
        .await
        .unwrap();

    let rows = client
        .query("SELECT * FROM reservations WHERE room_id = $1", &[&"1"])
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn tenants_are_isolated_over_wire() {
    let (addr, _tm) = start_test_server().await;
    let client = connect_as(addr, "1").await;
    seed(&client).await;

    // Same server, different database: sees nothing
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("other")
        .user("1")
        .password("slotd");
    let (other, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });

    let rows = other.simple_query("SELECT * FROM rooms").await.unwrap();
    assert_eq!(count_rows(&rows), 0);
}
