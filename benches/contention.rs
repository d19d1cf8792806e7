use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Datelike, Days, Utc};
use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

use slotguard::config::EngineConfig;
use slotguard::tenant::TenantManager;
use slotguard::wire;

const HOUR: i64 = 3_600_000;
const QUARTER: i64 = HOUR / 4;

async fn start_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("no local addr");
    let dir = std::env::temp_dir().join(format!("slotguard_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).expect("cannot create data dir");
    let tm = Arc::new(TenantManager::new(dir, 10_000, EngineConfig::default()));

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let tm = tm.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "slotguard".into(), None).await;
            });
        }
    });
    addr
}

async fn connect(addr: SocketAddr, db: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(db)
        .user("slotguard")
        .password("slotguard");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

#[derive(Clone, Copy)]
struct Shop {
    provider: Ulid,
    service: Ulid,
    /// UTC midnight of the bookable day.
    midnight: i64,
    date: chrono::NaiveDate,
}

/// Provider open all of tomorrow with a 15-minute service.
async fn open_shop(client: &tokio_postgres::Client) -> Shop {
    let provider = Ulid::new();
    let service = Ulid::new();
    let date = Utc::now()
        .date_naive()
        .checked_add_days(Days::new(1))
        .expect("date overflow");
    let week_day = date.weekday().num_days_from_sunday();
    client
        .batch_execute(&format!(
            "INSERT INTO services VALUES ('{service}', '{provider}', 15, 0)"
        ))
        .await
        .expect("service insert failed");
    client
        .batch_execute(&format!(
            "INSERT INTO recurring_windows VALUES ('{}', '{provider}', {week_day}, '00:00', '24:00')",
            Ulid::new()
        ))
        .await
        .expect("window insert failed");
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .expect("midnight")
        .and_utc()
        .timestamp_millis();
    Shop { provider, service, midnight, date }
}

async fn book(client: &tokio_postgres::Client, shop: &Shop, start: i64) -> Result<(), tokio_postgres::Error> {
    client
        .batch_execute(&format!(
            "INSERT INTO bookings VALUES ('{}', '{}', '{}', '{}', {start})",
            Ulid::new(),
            shop.provider,
            shop.service,
            Ulid::new()
        ))
        .await
}

async fn phase1_sequential(addr: SocketAddr) {
    let client = connect(addr, &format!("bench_{}", Ulid::new())).await;
    let shop = open_shop(&client).await;

    let n = 96; // every quarter hour of the day
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for i in 0..n {
        let t = Instant::now();
        book(&client, &shop, shop.midnight + i as i64 * QUARTER)
            .await
            .expect("sequential booking failed");
        latencies.push(t.elapsed());
    }
    let elapsed = start.elapsed();
    println!(
        "  {n} bookings in {:.2}s = {:.0} ops/sec",
        elapsed.as_secs_f64(),
        n as f64 / elapsed.as_secs_f64()
    );
    print_latency("reserve latency", &mut latencies);
}

/// Many clients fight over the same few slots; each slot must have one winner.
async fn phase2_contention(addr: SocketAddr) {
    let db = format!("bench_{}", Ulid::new());
    let setup = connect(addr, &db).await;
    let shop = open_shop(&setup).await;

    let n_tasks = 32;
    let slots = 8;
    let winners = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let db = db.clone();
        let winners = winners.clone();
        let conflicts = conflicts.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(addr, &db).await;
            for s in 0..slots {
                match book(&client, &shop, shop.midnight + s * HOUR).await {
                    Ok(()) => winners.fetch_add(1, Ordering::Relaxed),
                    Err(_) => conflicts.fetch_add(1, Ordering::Relaxed),
                };
            }
        }));
    }
    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    println!(
        "  {n_tasks} clients x {slots} slots in {:.2}s: {} won, {} rejected",
        elapsed.as_secs_f64(),
        winners.load(Ordering::Relaxed),
        conflicts.load(Ordering::Relaxed)
    );
    assert_eq!(winners.load(Ordering::Relaxed), slots as usize, "double booking detected");
}

async fn phase3_slots_under_load(addr: SocketAddr) {
    let db = format!("bench_{}", Ulid::new());
    let setup = connect(addr, &db).await;
    let shop = open_shop(&setup).await;

    let writer = {
        let db = db.clone();
        tokio::spawn(async move {
            let client = connect(addr, &db).await;
            for i in 0..96 {
                let _ = book(&client, &shop, shop.midnight + i * QUARTER).await;
            }
        })
    };

    let n_readers = 8;
    let reads_per_reader = 200;
    let mut handles = Vec::new();
    for _ in 0..n_readers {
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(addr, &db).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .simple_query(&format!(
                        "SELECT * FROM slots WHERE service_id = '{}' AND date = '{}' AND tz = 'Europe/Berlin'",
                        shop.service, shop.date
                    ))
                    .await
                    .expect("slot query failed");
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all = Vec::new();
    for h in handles {
        all.extend(h.await.unwrap_or_default());
    }
    let _ = writer.await;
    print_latency("slot query", &mut all);
}

#[tokio::main]
async fn main() {
    println!("=== slotguard contention benchmark ===\n");
    let addr = start_server().await;

    println!("[phase 1] sequential reservations");
    phase1_sequential(addr).await;

    println!("\n[phase 2] contended reservations");
    phase2_contention(addr).await;

    println!("\n[phase 3] slot queries under write load");
    phase3_slots_under_load(addr).await;

    println!("\n=== benchmark complete ===");
}
