// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! amqrpc-probe - AMQP RPC probe
//!
//! One-shot RPC calls, an echo responder for the other end, and a
//! round-trip latency benchmark over a RabbitMQ broker.

use clap::{Parser, Subcommand};
use colored::*;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use amqrpc::{AmqpConfig, AsyncAmqpRpc, QueueBinding, Request};

/// AMQP RPC probe
#[derive(Parser, Debug)]
#[command(name = "amqrpc-probe")]
#[command(version)]
#[command(about = "Issue, serve and benchmark AMQP RPC calls")]
struct Args {
    #[command(subcommand)]
    mode: Mode,

    /// Broker host
    #[arg(short = 'H', long, default_value = "localhost", global = true)]
    host: String,

    /// Broker port
    #[arg(short, long, default_value = "5672", global = true)]
    port: u16,

    /// Login user name
    #[arg(short, long, default_value = "guest", global = true)]
    user: String,

    /// Login password
    #[arg(long, default_value = "guest", global = true)]
    password: String,

    /// Virtual host
    #[arg(long, default_value = "/", global = true)]
    vhost: String,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Issue a single RPC call and print the reply
    Call {
        /// Target queue (routing key on the default exchange)
        routing_key: String,

        /// Request payload
        #[arg(default_value = "")]
        payload: String,

        /// Call timeout in milliseconds
        #[arg(short, long, default_value = "5000")]
        timeout: u64,
    },
    /// Serve a queue, echoing every request back (run on the remote end)
    Serve {
        /// Queue to consume requests from
        #[arg(default_value = "amqrpc.probe.echo")]
        queue: String,

        /// Quiet mode
        #[arg(long)]
        quiet: bool,
    },
    /// Measure round-trip latency against a responder
    Bench {
        /// Target queue (routing key on the default exchange)
        #[arg(default_value = "amqrpc.probe.echo")]
        routing_key: String,

        /// Payload size in bytes
        #[arg(short = 's', long, default_value = "64")]
        size: usize,

        /// Number of measured calls
        #[arg(short = 'n', long, default_value = "1000")]
        count: u64,

        /// Warmup calls before measurement
        #[arg(short, long, default_value = "10")]
        warmup: u64,

        /// Calls in flight at once
        #[arg(short, long, default_value = "1")]
        concurrency: u64,

        /// Per-call timeout in milliseconds
        #[arg(short, long, default_value = "1000")]
        timeout: u64,

        /// Output JSON results
        #[arg(long)]
        json: bool,

        /// Quiet mode - only output final results
        #[arg(long)]
        quiet: bool,
    },
}

#[tokio::main]
async fn main() {
    // Initialize logger for RUST_LOG-based debug output
    env_logger::init();

    let args = Args::parse();

    if let Err(e) = run(args).await {
        eprintln!("{}: {}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = AmqpConfig::for_host(args.host.clone(), args.port)
        .with_credentials(args.user.clone(), args.password.clone())
        .with_virtualhost(args.vhost.clone());

    match args.mode {
        Mode::Call {
            ref routing_key,
            ref payload,
            timeout,
        } => run_call(config, routing_key, payload, timeout).await,
        Mode::Serve { ref queue, quiet } => run_serve(config, queue, quiet).await,
        Mode::Bench {
            ref routing_key,
            size,
            count,
            warmup,
            concurrency,
            timeout,
            json,
            quiet,
        } => {
            run_bench(
                config,
                routing_key,
                size,
                count,
                warmup,
                concurrency,
                timeout,
                json,
                quiet,
            )
            .await
        }
    }
}

async fn run_call(
    config: AmqpConfig,
    routing_key: &str,
    payload: &str,
    timeout_ms: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let rpc = AsyncAmqpRpc::new(config)?;
    rpc.connect().await?;

    let started = Instant::now();
    let reply = rpc
        .call(
            routing_key,
            payload.as_bytes(),
            Duration::from_millis(timeout_ms),
        )
        .await;
    let elapsed = started.elapsed();

    match reply {
        Ok(bytes) => {
            eprintln!(
                "{} Reply from '{}' in {:.2} ms ({} bytes)",
                ">>>".green().bold(),
                routing_key,
                elapsed.as_secs_f64() * 1000.0,
                bytes.len()
            );
            println!("{}", String::from_utf8_lossy(&bytes));
        }
        Err(e) => {
            rpc.stop().await;
            return Err(e.into());
        }
    }

    rpc.stop().await;
    Ok(())
}

async fn run_serve(
    config: AmqpConfig,
    queue: &str,
    quiet: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if !quiet {
        eprintln!("{} RPC probe (serve mode)", ">>>".green().bold());
        eprintln!("    queue='{}'", queue);
        eprintln!("{}", "    Press Ctrl+C to stop".dimmed());
        eprintln!();
    }

    let rpc = AsyncAmqpRpc::new(config)?;
    rpc.connect().await?;

    let count = Arc::new(AtomicU64::new(0));
    let handler_count = Arc::clone(&count);
    rpc.subscribe(QueueBinding::new(queue), move |req: Request| {
        let count = Arc::clone(&handler_count);
        async move {
            let n = count.fetch_add(1, Ordering::SeqCst) + 1;
            if !quiet && n.is_multiple_of(100) {
                eprint!("\r    Echoed: {} requests", n);
                let _ = io::stderr().flush();
            }
            Some(req.payload)
        }
    })
    .await?;

    tokio::signal::ctrl_c().await?;
    rpc.stop().await;

    if !quiet {
        eprintln!(
            "\n\n{} Echoed {} total requests",
            "---".dimmed(),
            count.load(Ordering::SeqCst)
        );
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_bench(
    config: AmqpConfig,
    routing_key: &str,
    size: usize,
    count: u64,
    warmup: u64,
    concurrency: u64,
    timeout_ms: u64,
    json: bool,
    quiet: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let concurrency = concurrency.max(1);

    if !quiet && !json {
        eprintln!("{} RPC probe (bench mode)", ">>>".green().bold());
        eprintln!(
            "    target='{}', size={} bytes, count={}, warmup={}, concurrency={}",
            routing_key, size, count, warmup, concurrency
        );
        eprintln!("{}", "    Waiting for responder...".dimmed());
    }

    let rpc = Arc::new(AsyncAmqpRpc::new(config)?);
    rpc.connect().await?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            running.store(false, Ordering::SeqCst);
        });
    }

    let timeout = Duration::from_millis(timeout_ms);
    let payload = Arc::new(vec![0u8; size]);

    // Warmup phase; losses here are expected while the responder spins up.
    for _ in 0..warmup {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        let _ = rpc.call(routing_key, &payload, timeout).await;
    }

    let done = Arc::new(AtomicU64::new(0));
    let start_time = Instant::now();

    let mut workers = Vec::new();
    for w in 0..concurrency {
        // Spread the remainder over the first workers.
        let share = count / concurrency + u64::from(w < count % concurrency);
        let rpc = Arc::clone(&rpc);
        let running = Arc::clone(&running);
        let done = Arc::clone(&done);
        let payload = Arc::clone(&payload);
        let routing_key = routing_key.to_string();

        workers.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(share as usize);
            let mut lost = 0u64;

            for _ in 0..share {
                if !running.load(Ordering::SeqCst) {
                    break;
                }

                let send_time = Instant::now();
                match rpc.call(&routing_key, &payload, timeout).await {
                    Ok(_) => latencies.push(send_time.elapsed().as_secs_f64() * 1_000_000.0),
                    Err(_) => lost += 1,
                }

                let n = done.fetch_add(1, Ordering::SeqCst) + 1;
                if !quiet && !json && n.is_multiple_of(100) {
                    eprint!("\r    Progress: {}/{}", n, count);
                    let _ = io::stderr().flush();
                }
            }
            (latencies, lost)
        }));
    }

    let mut latencies = Vec::with_capacity(count as usize);
    let mut lost = 0u64;
    for worker in workers {
        let (worker_latencies, worker_lost) = worker.await?;
        latencies.extend(worker_latencies);
        lost += worker_lost;
    }
    let total_time = start_time.elapsed();

    rpc.stop().await;

    if !quiet && !json {
        eprintln!();
    }

    let stats = calculate_stats(&latencies, lost);
    if json {
        print_json_results(&stats, size, total_time);
    } else {
        print_results(&stats, size, total_time, quiet);
    }
    Ok(())
}

#[derive(Debug)]
struct Stats {
    count: usize,
    lost: u64,
    min: f64,
    max: f64,
    mean: f64,
    stddev: f64,
    p50: f64,
    p90: f64,
    p99: f64,
    p999: f64,
}

fn calculate_stats(latencies: &[f64], lost: u64) -> Stats {
    if latencies.is_empty() {
        return Stats {
            count: 0,
            lost,
            min: 0.0,
            max: 0.0,
            mean: 0.0,
            stddev: 0.0,
            p50: 0.0,
            p90: 0.0,
            p99: 0.0,
            p999: 0.0,
        };
    }

    let mut sorted = latencies.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());

    let n = sorted.len();
    let mean: f64 = latencies.iter().sum::<f64>() / n as f64;
    let variance: f64 = latencies.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;

    let percentile = |p: f64| -> f64 {
        let idx = ((p / 100.0) * (n - 1) as f64).round() as usize;
        sorted[idx.min(n - 1)]
    };

    Stats {
        count: n,
        lost,
        min: sorted[0],
        max: sorted[n - 1],
        mean,
        stddev: variance.sqrt(),
        p50: percentile(50.0),
        p90: percentile(90.0),
        p99: percentile(99.0),
        p999: percentile(99.9),
    }
}

fn print_results(stats: &Stats, size: usize, total_time: Duration, quiet: bool) {
    let loss_pct = if stats.count > 0 || stats.lost > 0 {
        (stats.lost as f64 / (stats.count + stats.lost as usize) as f64) * 100.0
    } else {
        0.0
    };

    if quiet {
        println!(
            "min={:.1} max={:.1} avg={:.1} p99={:.1} us",
            stats.min, stats.max, stats.mean, stats.p99
        );
        return;
    }

    println!();
    println!("{}", "=== AMQP RPC Probe Results ===".bold());
    println!();
    println!("  {} {} bytes", "Payload size:".cyan(), size);
    println!("  {} {}", "Calls:".cyan(), stats.count);
    println!("  {} {} ({:.2}%)", "Lost:".cyan(), stats.lost, loss_pct);
    println!("  {} {:.2}s", "Duration:".cyan(), total_time.as_secs_f64());
    println!();
    println!("{}", "--- Round-trip (microseconds) ---".dimmed());
    println!("  {} {:>10.2} us", "Min:".green(), stats.min);
    println!("  {} {:>10.2} us", "Max:".red(), stats.max);
    println!("  {} {:>10.2} us", "Mean:".yellow(), stats.mean);
    println!("  {} {:>10.2} us", "Stddev:".yellow(), stats.stddev);
    println!();
    println!("{}", "--- Percentiles ---".dimmed());
    println!("  {} {:>10.2} us", "p50:".white(), stats.p50);
    println!("  {} {:>10.2} us", "p90:".white(), stats.p90);
    println!("  {} {:>10.2} us", "p99:".white(), stats.p99);
    println!("  {} {:>10.2} us", "p99.9:".white(), stats.p999);
    println!();

    if stats.count > 0 {
        let throughput = stats.count as f64 / total_time.as_secs_f64();
        println!("  {} {:.0} calls/s", "Throughput:".cyan(), throughput);
    }
    println!();
}

fn print_json_results(stats: &Stats, size: usize, total_time: Duration) {
    println!(
        r#"{{"payload_size":{},"calls":{},"lost":{},"duration_secs":{:.3},"rtt_us":{{"min":{:.2},"max":{:.2},"mean":{:.2},"stddev":{:.2},"p50":{:.2},"p90":{:.2},"p99":{:.2},"p999":{:.2}}}}}"#,
        size,
        stats.count,
        stats.lost,
        total_time.as_secs_f64(),
        stats.min,
        stats.max,
        stats.mean,
        stats.stddev,
        stats.p50,
        stats.p90,
        stats.p99,
        stats.p999
    );
}
