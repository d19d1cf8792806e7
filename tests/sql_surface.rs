use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Days, NaiveDate, Utc};
use futures::{stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, Config, NoTls, Notification, SimpleQueryMessage};
use ulid::Ulid;

use slotguard::config::EngineConfig;
use slotguard::tenant::TenantManager;
use slotguard::wire;

const HOUR: i64 = 3_600_000;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("slotguard_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000, EngineConfig::default()));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "slotguard".to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

async fn connect(
    addr: SocketAddr,
) -> (
    tokio_postgres::Client,
    mpsc::UnboundedReceiver<Notification>,
) {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("test")
        .user("slotguard")
        .password("slotguard");

    let (client, mut connection) = config.connect(NoTls).await.unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let stream = stream::poll_fn(move |cx| connection.poll_message(cx));
        futures::pin_mut!(stream);
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(AsyncMessage::Notification(n)) => {
                    let _ = tx.send(n);
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    (client, rx)
}

/// Wait for a notification with timeout.
async fn recv_notification(
    rx: &mut mpsc::UnboundedReceiver<Notification>,
    timeout: Duration,
) -> Option<Notification> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

fn data_rows(messages: &[SimpleQueryMessage]) -> Vec<&tokio_postgres::SimpleQueryRow> {
    messages
        .iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn sqlstate(err: &tokio_postgres::Error) -> Option<&str> {
    err.as_db_error().map(|db| db.code().code())
}

/// A provider open all day tomorrow (UTC) with a 60-minute service.
struct Shop {
    provider: Ulid,
    service: Ulid,
    date: NaiveDate,
}

impl Shop {
    fn at(&self, hour: i64) -> i64 {
        let midnight = self.date.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp_millis();
        midnight + hour * HOUR
    }
}

async fn open_shop(client: &tokio_postgres::Client) -> Shop {
    let provider = Ulid::new();
    let service = Ulid::new();
    let window = Ulid::new();
    let date = Utc::now().date_naive().checked_add_days(Days::new(1)).unwrap();
    let week_day = date.weekday().num_days_from_sunday();

    client
        .batch_execute(&format!(
            "INSERT INTO services (id, provider_id, duration_minutes, price) VALUES ('{service}', '{provider}', 60, 2500)"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO recurring_windows (id, provider_id, week_day, start_time, end_time) VALUES ('{window}', '{provider}', {week_day}, '00:00', '24:00')"
        ))
        .await
        .unwrap();

    Shop { provider, service, date }
}

async fn reserve(
    client: &tokio_postgres::Client,
    shop: &Shop,
    customer: Ulid,
    start: i64,
) -> Result<Ulid, tokio_postgres::Error> {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO bookings (id, provider_id, service_id, customer_id, start) VALUES ('{id}', '{}', '{}', '{customer}', {start})",
            shop.provider, shop.service
        ))
        .await?;
    Ok(id)
}

async fn slot_labels(client: &tokio_postgres::Client, shop: &Shop, extra: &str) -> Vec<String> {
    let rows = client
        .simple_query(&format!(
            "SELECT * FROM slots WHERE service_id = '{}' AND date = '{}' AND tz = 'UTC'{extra}",
            shop.service, shop.date
        ))
        .await
        .unwrap();
    data_rows(&rows)
        .iter()
        .map(|r| r.get("time").unwrap().to_string())
        .collect()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn services_round_trip_over_sql() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let shop = open_shop(&client).await;

    let rows = client
        .simple_query(&format!("SELECT * FROM services WHERE provider_id = '{}'", shop.provider))
        .await
        .unwrap();
    let rows = data_rows(&rows);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("duration_minutes"), Some("60"));
    assert_eq!(rows[0].get("price"), Some("2500"));

    let windows = client
        .simple_query(&format!("SELECT * FROM windows WHERE provider_id = '{}'", shop.provider))
        .await
        .unwrap();
    let windows = data_rows(&windows);
    assert_eq!(windows.len(), 1);
    assert_eq!(windows[0].get("start_time"), Some("00:00"));
    assert_eq!(windows[0].get("end_time"), Some("24:00"));
}

#[tokio::test]
async fn booking_removes_slot() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let shop = open_shop(&client).await;

    let before = slot_labels(&client, &shop, "").await;
    assert_eq!(before.len(), 24);
    assert!(before.contains(&"10:00".to_string()));

    reserve(&client, &shop, Ulid::new(), shop.at(10)).await.unwrap();

    let after = slot_labels(&client, &shop, "").await;
    assert_eq!(after.len(), 23);
    assert!(!after.contains(&"10:00".to_string()));
}

#[tokio::test]
async fn customer_slots_exclude_own_bookings_elsewhere() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let shop_a = open_shop(&client).await;
    let shop_b = open_shop(&client).await;
    let customer = Ulid::new();

    reserve(&client, &shop_a, customer, shop_a.at(14)).await.unwrap();

    let anonymous = slot_labels(&client, &shop_b, "").await;
    assert!(anonymous.contains(&"14:00".to_string()));
    let own = slot_labels(&client, &shop_b, &format!(" AND customer_id = '{customer}'")).await;
    assert!(!own.contains(&"14:00".to_string()));
    assert_eq!(own.len(), 23);
}

#[tokio::test]
async fn concurrent_reservations_have_one_winner() {
    let (addr, _tm) = start_test_server().await;
    let (setup, _rx) = connect(addr).await;
    let shop = Arc::new(open_shop(&setup).await);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let shop = shop.clone();
        handles.push(tokio::spawn(async move {
            let (client, _rx) = connect(addr).await;
            reserve(&client, &shop, Ulid::new(), shop.at(9))
                .await
                .map_err(|e| sqlstate(&e).map(str::to_string))
        }));
    }

    let mut winners = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => winners += 1,
            Err(code) => assert_eq!(code.as_deref(), Some("23P01")),
        }
    }
    assert_eq!(winners, 1);

    let rows = setup
        .simple_query(&format!("SELECT * FROM bookings WHERE provider_id = '{}'", shop.provider))
        .await
        .unwrap();
    assert_eq!(data_rows(&rows).len(), 1);
}

#[tokio::test]
async fn transitions_and_cancellation_free_the_slot() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let shop = open_shop(&client).await;
    let customer = Ulid::new();

    let booking = reserve(&client, &shop, customer, shop.at(11)).await.unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO booking_transitions (booking_id, status, actor) VALUES ('{booking}', 'confirmed', 'provider')"
        ))
        .await
        .unwrap();

    // Customers may not confirm or complete.
    let err = client
        .batch_execute(&format!(
            "INSERT INTO booking_transitions (booking_id, status, actor) VALUES ('{booking}', 'completed', 'customer')"
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("42501"));

    client
        .batch_execute(&format!(
            "INSERT INTO booking_transitions (booking_id, status, actor) VALUES ('{booking}', 'cancelled', 'customer')"
        ))
        .await
        .unwrap();

    let rows = client
        .simple_query(&format!("SELECT * FROM bookings WHERE customer_id = '{customer}'"))
        .await
        .unwrap();
    let rows = data_rows(&rows);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("status"), Some("cancelled"));
    assert_eq!(rows[0].get("version"), Some("2"));

    assert!(slot_labels(&client, &shop, "").await.contains(&"11:00".to_string()));

    // Terminal state.
    let err = client
        .batch_execute(&format!(
            "INSERT INTO booking_transitions (booking_id, status, actor) VALUES ('{booking}', 'confirmed', 'admin')"
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("22023"));
}

#[tokio::test]
async fn errors_carry_sqlstates() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let shop = open_shop(&client).await;

    let past = Utc::now().timestamp_millis() - HOUR;
    let err = reserve(&client, &shop, Ulid::new(), past).await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("22023"));

    let err = client
        .simple_query(&format!(
            "SELECT * FROM slots WHERE service_id = '{}' AND date = '{}' AND tz = 'Mars/Olympus'",
            shop.service, shop.date
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("22023"));

    let err = client
        .simple_query(&format!(
            "SELECT * FROM slots WHERE service_id = '{}' AND date = '{}' AND tz = 'UTC'",
            Ulid::new(),
            shop.date
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("P0002"));

    let err = client.batch_execute("SELECT * FROM nowhere WHERE id = '1'").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("42601"));
}

#[tokio::test]
async fn inverted_once_window_is_rejected_and_connection_survives() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let shop = open_shop(&client).await;

    let err = client
        .batch_execute(&format!(
            r#"INSERT INTO once_windows (id, provider_id, start, "end") VALUES ('{}', '{}', {}, {})"#,
            Ulid::new(),
            shop.provider,
            shop.at(12),
            shop.at(10)
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("22023"));
    assert!(!client.is_closed());

    let err = client
        .batch_execute(&format!(
            r#"INSERT INTO once_windows (id, provider_id, start, "end") VALUES ('{}', '{}', {}, {})"#,
            Ulid::new(),
            shop.provider,
            shop.at(10),
            shop.at(10)
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("22023"));

    assert_eq!(slot_labels(&client, &shop, "").await.len(), 24);
}

#[tokio::test]
async fn insert_columns_may_come_in_any_order() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let shop = open_shop(&client).await;

    let booking = Ulid::new();
    let customer = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO bookings (start, customer_id, service_id, provider_id, id) VALUES ({}, '{customer}', '{}', '{}', '{booking}')",
            shop.at(9),
            shop.service,
            shop.provider
        ))
        .await
        .unwrap();

    let rows = client
        .simple_query(&format!("SELECT * FROM bookings WHERE customer_id = '{customer}'"))
        .await
        .unwrap();
    let rows = data_rows(&rows);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("id"), Some(booking.to_string().as_str()));
    assert_eq!(rows[0].get("provider_id"), Some(shop.provider.to_string().as_str()));

    let err = client
        .batch_execute(&format!(
            "INSERT INTO services (id, owner, duration_minutes, price) VALUES ('{}', '{}', 30, 0)",
            Ulid::new(),
            shop.provider
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("42601"));
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let shop = open_shop(&client).await;

    let service = shop.service.to_string();
    let date = shop.date.to_string();
    let rows = client
        .query(
            "SELECT * FROM slots WHERE service_id = $1 AND date = $2 AND tz = $3",
            &[&service, &date, &"UTC"],
        )
        .await
        .unwrap();

    assert_eq!(rows.len(), 24);
    let first_time: String = rows[0].get("time");
    let first_start: i64 = rows[0].get("start");
    assert_eq!(first_time, "00:00");
    assert_eq!(first_start, shop.at(0));
}

#[tokio::test]
async fn listen_receives_json_notification() {
    let (addr, _tm) = start_test_server().await;
    let (listener, mut rx) = connect(addr).await;
    let shop = open_shop(&listener).await;

    listener
        .batch_execute(&format!("LISTEN provider_{}", shop.provider))
        .await
        .unwrap();

    let (client2, _) = connect(addr).await;
    let booking = reserve(&client2, &shop, Ulid::new(), shop.at(8)).await.unwrap();

    // Delivery happens at the listener's next statement boundary.
    listener.batch_execute("UNLISTEN provider_00000000000000000000000000").await.unwrap();

    let notif = recv_notification(&mut rx, Duration::from_secs(5))
        .await
        .expect("expected notification");
    assert_eq!(notif.channel(), format!("provider_{}", shop.provider));

    let parsed: serde_json::Value = serde_json::from_str(notif.payload()).unwrap();
    assert_eq!(parsed["kind"]["type"], "booking_created");
    assert_eq!(parsed["booking"]["id"], booking.to_string());
    assert_eq!(parsed["booking"]["status"], "Pending");
}

#[tokio::test]
async fn notification_only_on_subscribed_provider() {
    let (addr, _tm) = start_test_server().await;
    let (listener, mut rx) = connect(addr).await;
    let shop_a = open_shop(&listener).await;
    let shop_b = open_shop(&listener).await;

    listener
        .batch_execute(&format!("LISTEN provider_{}", shop_a.provider))
        .await
        .unwrap();

    let (client2, _) = connect(addr).await;
    reserve(&client2, &shop_b, Ulid::new(), shop_b.at(8)).await.unwrap();
    slot_labels(&listener, &shop_a, "").await;
    assert!(recv_notification(&mut rx, Duration::from_millis(300)).await.is_none());

    reserve(&client2, &shop_a, Ulid::new(), shop_a.at(8)).await.unwrap();
    slot_labels(&listener, &shop_a, "").await;
    assert!(recv_notification(&mut rx, Duration::from_secs(5)).await.is_some());
}

#[tokio::test]
async fn listen_duplicate_is_idempotent() {
    let (addr, _tm) = start_test_server().await;
    let (listener, mut rx) = connect(addr).await;
    let shop = open_shop(&listener).await;

    for _ in 0..2 {
        listener
            .batch_execute(&format!("LISTEN provider_{}", shop.provider))
            .await
            .unwrap();
    }

    let (client2, _) = connect(addr).await;
    reserve(&client2, &shop, Ulid::new(), shop.at(8)).await.unwrap();
    slot_labels(&listener, &shop, "").await;

    assert!(recv_notification(&mut rx, Duration::from_secs(5)).await.is_some());
    assert!(recv_notification(&mut rx, Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn unlisten_stops_notifications() {
    let (addr, _tm) = start_test_server().await;
    let (listener, mut rx) = connect(addr).await;
    let shop_a = open_shop(&listener).await;
    let shop_b = open_shop(&listener).await;

    listener
        .batch_execute(&format!("LISTEN provider_{}", shop_a.provider))
        .await
        .unwrap();
    listener
        .batch_execute(&format!("LISTEN provider_{}", shop_b.provider))
        .await
        .unwrap();
    listener
        .batch_execute(&format!("UNLISTEN provider_{}", shop_a.provider))
        .await
        .unwrap();

    let (client2, _) = connect(addr).await;
    reserve(&client2, &shop_a, Ulid::new(), shop_a.at(8)).await.unwrap();
    slot_labels(&listener, &shop_a, "").await;
    assert!(recv_notification(&mut rx, Duration::from_millis(300)).await.is_none());

    listener.batch_execute("UNLISTEN *").await.unwrap();
    reserve(&client2, &shop_b, Ulid::new(), shop_b.at(8)).await.unwrap();
    slot_labels(&listener, &shop_b, "").await;
    assert!(recv_notification(&mut rx, Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn listen_rejects_unknown_channel() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    assert!(client.batch_execute("LISTEN resource_abc").await.is_err());
}

#[tokio::test]
async fn disconnect_cleans_up() {
    let (addr, _tm) = start_test_server().await;
    let (client1, rx1) = connect(addr).await;
    let shop = open_shop(&client1).await;

    client1
        .batch_execute(&format!("LISTEN provider_{}", shop.provider))
        .await
        .unwrap();

    drop(client1);
    drop(rx1);
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Server still serves the tenant; the dropped subscription is harmless.
    let (client2, _) = connect(addr).await;
    reserve(&client2, &shop, Ulid::new(), shop.at(8)).await.unwrap();
}
