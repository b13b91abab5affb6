use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate};
use tokio_postgres::{Client, Config, NoTls};
use ulid::Ulid;

async fn connect(host: &str, port: u16) -> Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("bench")
        .user("sessiond")
        .password(std::env::var("SESSIOND_PASSWORD").unwrap_or_else(|_| "sessiond".into()));

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
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

/// The n-th one-hour slot from 06:00 to 22:00, spilling onto following days.
fn slot(n: usize) -> (NaiveDate, String, String) {
    let base = NaiveDate::from_ymd_opt(2030, 1, 1).unwrap();
    let date = base + Days::new((n / 16) as u64);
    let hour = 6 + n % 16;
    (date, format!("{hour:02}:00"), format!("{:02}:00", hour + 1))
}

async fn register(client: &Client) -> (Ulid, Ulid) {
    let (p, l) = (Ulid::new(), Ulid::new());
    client
        .batch_execute(&format!(
            "INSERT INTO professionals (id, name) VALUES ('{p}', 'bench coach');
             INSERT INTO locals (id, name) VALUES ('{l}', 'bench room');"
        ))
        .await
        .unwrap();
    (p, l)
}

fn insert_sql(p: Ulid, l: Ulid, n: usize) -> String {
    let (date, start, end) = slot(n);
    format!(
        "INSERT INTO sessions (id, title, date, start_time, end_time, professional_id, local_id, capacity) \
         VALUES ('{}', 'bench', '{date}', '{start}', '{end}', '{p}', '{l}', 20)",
        Ulid::new()
    )
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port).await;
    let (p, l) = register(&client).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for i in 0..n {
        let t = Instant::now();
        client.batch_execute(&insert_sql(p, l, i)).await.unwrap();
        latencies.push(t.elapsed());
    }
    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} sessions in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_concurrent(host: &str, port: u16) {
    let n_tasks = 10;
    let n_per_task = 200;

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let host = host.to_string();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            // Own professional and room, so no task conflicts with another.
            let (p, l) = register(&client).await;
            for j in 0..n_per_task {
                client.batch_execute(&insert_sql(p, l, j)).await.unwrap();
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} sessions = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

/// Every task races for the same room slots. Exactly one booking per slot
/// may win; the rest must come back as conflicts.
async fn phase3_contention(host: &str, port: u16) {
    let n_tasks = 20;
    let n_slots = 50;

    let setup = connect(host, port).await;
    let (_, room) = register(&setup).await;
    drop(setup);

    let won = Arc::new(AtomicUsize::new(0));
    let conflicted = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let host = host.to_string();
        let (won, conflicted) = (won.clone(), conflicted.clone());
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let (coach, _) = register(&client).await;
            for n in 0..n_slots {
                match client.batch_execute(&insert_sql(coach, room, n)).await {
                    Ok(()) => {
                        won.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        let code = e.code().map(|c| c.code().to_string());
                        assert_eq!(code.as_deref(), Some("CONFLICT_ERROR_001"), "{e}");
                        conflicted.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let won = won.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} tasks x {n_slots} slots: {won} booked, {} conflicts in {:.2}s",
        conflicted.load(Ordering::Relaxed),
        start.elapsed().as_secs_f64()
    );
    assert_eq!(won, n_slots, "double booking detected");
}

async fn phase4_read_under_load(host: &str, port: u16) {
    let setup = connect(host, port).await;
    let (p, l) = register(&setup).await;
    for i in 0..200 {
        setup.batch_execute(&insert_sql(p, l, i)).await.unwrap();
    }
    drop(setup);

    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for _ in 0..5 {
        let host = host.to_string();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let (wp, wl) = register(&client).await;
            let mut i = 0;
            while !stop.load(Ordering::Relaxed) {
                let _ = client.batch_execute(&insert_sql(wp, wl, i)).await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let host = host.to_string();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let (date, start, end) = slot((r * reads_per_reader + i) % 200);
                let sql = if i % 2 == 0 {
                    format!(
                        "SELECT * FROM availability WHERE date = '{date}' AND professional_id = '{p}' AND local_id = '{l}'"
                    )
                } else {
                    format!(
                        "SELECT * FROM conflicts WHERE date = '{date}' AND start_time = '{start}' \
                         AND end_time = '{end}' AND professional_id = '{p}' AND local_id = '{l}'"
                    )
                };
                let t = Instant::now();
                client.simple_query(&sql).await.unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }
    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("availability/conflict query", &mut all_latencies);
}

#[tokio::main]
async fn main() {
    let host = std::env::var("SESSIOND_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("SESSIOND_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid SESSIOND_PORT");

    println!("=== sessiond stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential create throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] concurrent create throughput");
    phase2_concurrent(&host, port).await;

    println!("\n[phase 3] contended room slots");
    phase3_contention(&host, port).await;

    println!("\n[phase 4] read latency under write load");
    phase4_read_under_load(&host, port).await;

    println!("\n=== benchmark complete ===");
}
