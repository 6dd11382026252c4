use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use courtside::engine::{BookingEngine, Policy};
use courtside::queue::LocalDelayQueue;
use courtside::ratelimit::RateLimiter;
use courtside::store::JournaledStore;
use courtside::wire::{self, Access, CourtsideFactory};

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server(policy: Policy) -> SocketAddr {
    start_server(policy, RateLimiter::unlimited()).await
}

/// Users: `alice` and the admin `ops` have their own passwords; anyone
/// else logs in with "courtside".
async fn start_server(policy: Policy, booking_limit: RateLimiter) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("courtside_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let store = JournaledStore::open(&dir.join("courtside.journal")).unwrap();
    let queue = LocalDelayQueue::new();
    let engine = Arc::new(BookingEngine::new(
        Arc::new(store),
        Arc::new(queue.clone()),
        policy,
    ));
    queue.on_fire(Arc::new(engine.reclaimer()));

    let access = Access {
        password: "courtside".into(),
        users: HashMap::from([
            ("alice".to_string(), "alice-pw".to_string()),
            ("ops".to_string(), "ops-pw".to_string()),
        ]),
        admins: HashSet::from(["ops".to_string()]),
        booking_limit,
    };
    let factory = Arc::new(CourtsideFactory::new(engine, access));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let factory = factory.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, factory, None).await;
            });
        }
    });

    addr
}

async fn connect_as(addr: SocketAddr, user: &str, password: &str) -> Result<Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("courtside")
        .user(user)
        .password(password);

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn connect(addr: SocketAddr) -> Client {
    connect_as(addr, "bob", "courtside").await.unwrap()
}

async fn connect_admin(addr: SocketAddr) -> Client {
    connect_as(addr, "ops", "ops-pw").await.unwrap()
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(r) => Some(r),
            _ => None,
        })
        .collect()
}

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.code().map(|c| c.code().to_string()).unwrap_or_default()
}

async fn create_court(addr: SocketAddr, name: &str, price: i64) -> Ulid {
    let id = Ulid::new();
    connect_admin(addr)
        .await
        .batch_execute(&format!(
            "INSERT INTO courts (id, name, kind, unit_price) VALUES ('{id}', '{name}', 'double', {price})"
        ))
        .await
        .unwrap();
    id
}

async fn book(client: &Client, court: Ulid, start: &str, end: &str) -> SimpleQueryRow {
    let mut out = rows(
        client,
        &format!("INSERT INTO bookings (court_id, start_time, end_time) VALUES ('{court}', '{start}', '{end}')"),
    )
    .await;
    assert_eq!(out.len(), 1);
    out.remove(0)
}

// ── Booking flow ─────────────────────────────────────────────

#[tokio::test]
async fn booking_is_priced_and_pending() {
    let addr = start_test_server(Policy::default()).await;
    let client = connect(addr).await;
    let court = create_court(addr, "Court A", 60_000).await;

    let row = book(
        &client,
        court,
        "2030-01-07T06:00:00+07:00",
        "2030-01-07T08:00:00+07:00",
    )
    .await;
    assert_eq!(row.get("principal"), Some("bob"));
    assert_eq!(row.get("court_id"), Some(court.to_string().as_str()));
    assert_eq!(row.get("duration_minutes"), Some("120"));
    assert_eq!(row.get("total_price"), Some("120000"));
    assert_eq!(row.get("status"), Some("PENDING_PAYMENT"));
    assert_eq!(row.get("start_time"), Some("2030-01-07T06:00:00+07:00"));
    assert!(row.get("expires_at").is_some());
}

#[tokio::test]
async fn overlapping_booking_is_a_conflict() {
    let addr = start_test_server(Policy::default()).await;
    let client = connect(addr).await;
    let court = create_court(addr, "Court A", 60_000).await;

    book(&client, court, "2030-01-07T06:00:00+07:00", "2030-01-07T08:00:00+07:00").await;

    let state = sqlstate(
        &client,
        &format!(
            "INSERT INTO bookings VALUES ('{court}', '2030-01-07T07:00:00+07:00', '2030-01-07T09:00:00+07:00')"
        ),
    )
    .await;
    assert_eq!(state, "23P01");

    // back-to-back is fine
    let row = book(&client, court, "2030-01-07T08:00:00+07:00", "2030-01-07T09:00:00+07:00").await;
    assert_eq!(row.get("status"), Some("PENDING_PAYMENT"));
}

#[tokio::test]
async fn invalid_requests_map_to_sqlstates() {
    let addr = start_test_server(Policy::default()).await;
    let client = connect(addr).await;
    let court = create_court(addr, "Court A", 60_000).await;

    // off-grid start
    let state = sqlstate(
        &client,
        &format!(
            "INSERT INTO bookings VALUES ('{court}', '2030-01-07T06:15:00+07:00', '2030-01-07T08:00:00+07:00')"
        ),
    )
    .await;
    assert_eq!(state, "22023");

    // reversed window
    let state = sqlstate(
        &client,
        &format!(
            "INSERT INTO bookings VALUES ('{court}', '2030-01-07T08:00:00+07:00', '2030-01-07T06:00:00+07:00')"
        ),
    )
    .await;
    assert_eq!(state, "22023");

    let unknown = Ulid::new();
    let state = sqlstate(
        &client,
        &format!(
            "INSERT INTO bookings VALUES ('{unknown}', '2030-01-07T06:00:00+07:00', '2030-01-07T08:00:00+07:00')"
        ),
    )
    .await;
    assert_eq!(state, "P0002");

    assert_eq!(sqlstate(&client, "SELECT * FROM bookings").await, "42601");
    assert_eq!(sqlstate(&client, "DROP TABLE courts").await, "42601");
}

#[tokio::test]
async fn availability_lists_free_courts_with_quote() {
    let addr = start_test_server(Policy::default()).await;
    let client = connect(addr).await;
    let a = create_court(addr, "Court A", 60_000).await;
    let b = create_court(addr, "Court B", 90_000).await;

    book(&client, a, "2030-01-07T06:00:00+07:00", "2030-01-07T08:00:00+07:00").await;

    let free = rows(
        &client,
        "SELECT * FROM available_courts WHERE date = '2030-01-07' AND start_time = '07:00' AND end_time = '08:30'",
    )
    .await;
    assert_eq!(free.len(), 1);
    assert_eq!(free[0].get("id"), Some(b.to_string().as_str()));
    assert_eq!(free[0].get("duration_minutes"), Some("90"));
    assert_eq!(free[0].get("total_price"), Some("135000"));

    let free = rows(
        &client,
        "SELECT * FROM available_courts WHERE date = '2030-01-07' AND start_time = '08:00' AND end_time = '09:00'",
    )
    .await;
    let names: Vec<_> = free.iter().map(|r| r.get("name").unwrap().to_string()).collect();
    assert_eq!(names, ["Court A", "Court B"]);

    let state = sqlstate(
        &client,
        "SELECT * FROM available_courts WHERE date = '2030-01-07' AND start_time = '05:00' AND end_time = '07:00'",
    )
    .await;
    assert_eq!(state, "22023");
}

#[tokio::test]
async fn payment_and_cancellation() {
    let addr = start_test_server(Policy::default()).await;
    let client = connect(addr).await;
    let court = create_court(addr, "Court A", 60_000).await;

    let row = book(&client, court, "2030-01-07T06:00:00+07:00", "2030-01-07T08:00:00+07:00").await;
    let id = row.get("id").unwrap().to_string();

    let paid = rows(&client, &format!("INSERT INTO payments (booking_id) VALUES ('{id}')")).await;
    assert_eq!(paid[0].get("status"), Some("PAID"));

    // paying twice is an invalid transition
    let state = sqlstate(&client, &format!("INSERT INTO payments VALUES ('{id}')")).await;
    assert_eq!(state, "55000");

    let cancelled = rows(&client, &format!("DELETE FROM bookings WHERE id = '{id}'")).await;
    assert_eq!(cancelled[0].get("status"), Some("CANCELLED"));

    // the slot is free again
    let row = book(&client, court, "2030-01-07T06:00:00+07:00", "2030-01-07T08:00:00+07:00").await;
    assert_eq!(row.get("status"), Some("PENDING_PAYMENT"));

    let history = rows(&client, &format!("SELECT * FROM bookings WHERE court_id = '{court}'")).await;
    assert_eq!(history.len(), 2);
}

#[tokio::test]
async fn unpaid_booking_expires_and_frees_slot() {
    let policy = Policy {
        grace: Duration::from_millis(200),
        ..Policy::default()
    };
    let addr = start_test_server(policy).await;
    let client = connect(addr).await;
    let court = create_court(addr, "Court A", 60_000).await;

    let row = book(&client, court, "2030-01-07T06:00:00+07:00", "2030-01-07T08:00:00+07:00").await;
    let id = row.get("id").unwrap().to_string();

    let mut status = String::new();
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let found = rows(&client, &format!("SELECT * FROM bookings WHERE id = '{id}'")).await;
        status = found[0].get("status").unwrap().to_string();
        if status == "EXPIRED" {
            break;
        }
    }
    assert_eq!(status, "EXPIRED");

    let state = sqlstate(&client, &format!("INSERT INTO payments VALUES ('{id}')")).await;
    assert_eq!(state, "55000");

    let row = book(&client, court, "2030-01-07T06:00:00+07:00", "2030-01-07T08:00:00+07:00").await;
    assert_eq!(row.get("status"), Some("PENDING_PAYMENT"));
}

// ── Courts and auth ──────────────────────────────────────────

#[tokio::test]
async fn court_upsert_and_deactivate() {
    let addr = start_test_server(Policy::default()).await;
    let client = connect(addr).await;
    let admin = connect_admin(addr).await;
    let court = create_court(addr, "Court A", 60_000).await;

    admin
        .batch_execute(&format!(
            "INSERT INTO courts VALUES ('{court}', 'Center Court', 'single', 80000)"
        ))
        .await
        .unwrap();
    let courts = rows(&client, "SELECT * FROM courts").await;
    assert_eq!(courts.len(), 1);
    assert_eq!(courts[0].get("name"), Some("Center Court"));
    assert_eq!(courts[0].get("kind"), Some("SINGLE"));
    assert_eq!(courts[0].get("unit_price"), Some("80000"));

    admin
        .batch_execute(&format!("DELETE FROM courts WHERE id = '{court}'"))
        .await
        .unwrap();
    assert!(rows(&client, "SELECT * FROM courts").await.is_empty());

    let state = sqlstate(
        &client,
        &format!(
            "INSERT INTO bookings VALUES ('{court}', '2030-01-07T06:00:00+07:00', '2030-01-07T08:00:00+07:00')"
        ),
    )
    .await;
    assert_eq!(state, "P0002");
}

#[tokio::test]
async fn extended_protocol_books_with_parameters() {
    let addr = start_test_server(Policy::default()).await;
    let client = connect(addr).await;
    let court = create_court(addr, "Court A", 60_000).await;

    client
        .execute(
            "INSERT INTO bookings (court_id, start_time, end_time) VALUES ($1, $2, $3)",
            &[
                &court.to_string(),
                &"2030-01-07T06:00:00+07:00",
                &"2030-01-07T07:00:00+07:00",
            ],
        )
        .await
        .unwrap();

    let booked = rows(&client, &format!("SELECT * FROM bookings WHERE court_id = '{court}'")).await;
    assert_eq!(booked.len(), 1);
    assert_eq!(booked[0].get("status"), Some("PENDING_PAYMENT"));
    assert_eq!(booked[0].get("total_price"), Some("60000"));
}

#[tokio::test]
async fn login_user_is_the_principal() {
    let addr = start_test_server(Policy::default()).await;

    assert!(connect_as(addr, "alice", "courtside").await.is_err());
    let alice = connect_as(addr, "alice", "alice-pw").await.unwrap();

    let court = create_court(addr, "Court A", 60_000).await;
    let row = book(&alice, court, "2030-01-07T06:00:00+07:00", "2030-01-07T07:00:00+07:00").await;
    assert_eq!(row.get("principal"), Some("alice"));
}

#[tokio::test]
async fn customers_cannot_touch_other_bookings_or_courts() {
    let addr = start_test_server(Policy::default()).await;
    let alice = connect_as(addr, "alice", "alice-pw").await.unwrap();
    let mallory = connect_as(addr, "mallory", "courtside").await.unwrap();
    let court = create_court(addr, "Court A", 60_000).await;

    let row = book(&alice, court, "2030-01-07T06:00:00+07:00", "2030-01-07T08:00:00+07:00").await;
    let id = row.get("id").unwrap().to_string();

    for sql in [
        format!("DELETE FROM bookings WHERE id = '{id}'"),
        format!("INSERT INTO payments VALUES ('{id}')"),
        format!("SELECT * FROM bookings WHERE id = '{id}'"),
    ] {
        assert_eq!(sqlstate(&mallory, &sql).await, "P0002", "{sql}");
    }
    assert!(rows(&mallory, &format!("SELECT * FROM bookings WHERE court_id = '{court}'"))
        .await
        .is_empty());

    assert_eq!(
        sqlstate(&mallory, &format!("DELETE FROM courts WHERE id = '{court}'")).await,
        "42501"
    );
    assert_eq!(
        sqlstate(
            &mallory,
            &format!("INSERT INTO courts VALUES ('{court}', 'Cheap Court', 'single', 1)")
        )
        .await,
        "42501"
    );
    let courts = rows(&alice, "SELECT * FROM courts").await;
    assert_eq!(courts.len(), 1);
    assert_eq!(courts[0].get("unit_price"), Some("60000"));

    let mine = rows(&alice, &format!("SELECT * FROM bookings WHERE id = '{id}'")).await;
    assert_eq!(mine[0].get("status"), Some("PENDING_PAYMENT"));

    let admin = connect_admin(addr).await;
    let cancelled = rows(&admin, &format!("DELETE FROM bookings WHERE id = '{id}'")).await;
    assert_eq!(cancelled[0].get("status"), Some("CANCELLED"));
    assert_eq!(cancelled[0].get("principal"), Some("alice"));
}

#[tokio::test]
async fn booking_attempts_are_rate_limited_per_user() {
    let addr = start_server(Policy::default(), RateLimiter::new(2, Duration::from_secs(600))).await;
    let client = connect(addr).await;
    let court = create_court(addr, "Court A", 60_000).await;

    book(&client, court, "2030-01-07T06:00:00+07:00", "2030-01-07T07:00:00+07:00").await;
    book(&client, court, "2030-01-07T07:00:00+07:00", "2030-01-07T08:00:00+07:00").await;
    let state = sqlstate(
        &client,
        &format!(
            "INSERT INTO bookings VALUES ('{court}', '2030-01-07T08:00:00+07:00', '2030-01-07T09:00:00+07:00')"
        ),
    )
    .await;
    assert_eq!(state, "53400");

    // reads are not limited, and other users have their own budget
    assert_eq!(rows(&client, "SELECT * FROM courts").await.len(), 1);
    let alice = connect_as(addr, "alice", "alice-pw").await.unwrap();
    let row = book(&alice, court, "2030-01-07T08:00:00+07:00", "2030-01-07T09:00:00+07:00").await;
    assert_eq!(row.get("principal"), Some("alice"));
}
