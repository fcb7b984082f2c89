use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use clap::{ArgAction, Parser};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use g1_connpool::param::parse_duration;
use g1_connpool::{Pool, PoolBuilder, Wait};

#[derive(Debug, Parser)]
#[command(about = "Hammer a connection pool from many threads")]
struct Program {
    #[arg(long, short = 'v', action = ArgAction::Count, help = "Make tracing output more verbose")]
    verbose: u8,
    #[arg(long, action = ArgAction::Count, help = "Make tracing output less verbose")]
    silent: u8,

    #[arg(long, default_value_t = 8)]
    threads: usize,
    #[arg(long, default_value_t = 100)]
    iterations: usize,

    #[arg(long, default_value_t = 4)]
    max_active: usize,
    #[arg(long, default_value_t = 1)]
    reserved_idle: usize,
    #[arg(long, default_value = "100ms", value_parser = parse_duration)]
    idle_timeout: Duration,
    #[arg(long, default_value = "1s")]
    wait: Wait,

    #[arg(long, default_value = "5ms", value_parser = parse_duration)]
    connect_delay: Duration,
    #[arg(long, default_value = "1ms", value_parser = parse_duration)]
    hold: Duration,
    #[arg(
        long,
        default_value_t = 0,
        help = "Mark every n-th checked-out connection broken (0 disables)"
    )]
    broken_every: u64,
}

#[derive(Debug, Default)]
struct Counters {
    connect: AtomicU64,
    disconnect: AtomicU64,
    acquired: AtomicU64,
    would_block: AtomicU64,
    failed: AtomicU64,
}

impl Program {
    fn init_tracing(&self) {
        let level = match i16::from(self.verbose) - i16::from(self.silent) {
            level if level <= -3 => LevelFilter::OFF,
            -2 => LevelFilter::ERROR,
            -1 => LevelFilter::WARN,
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        };
        let layer = fmt::layer()
            .compact()
            .with_thread_names(true)
            .with_writer(io::stderr)
            .with_filter(
                EnvFilter::builder()
                    .with_default_directive(level.into())
                    .from_env_lossy(),
            );
        tracing_subscriber::registry().with(layer).init();
    }

    fn new_pool(&self, counters: Arc<Counters>) -> Pool<u64, io::Error> {
        let connect_delay = self.connect_delay;
        let connect_counters = counters.clone();
        PoolBuilder::new()
            .max_active(self.max_active)
            .reserved_idle(self.reserved_idle)
            .idle_timeout(self.idle_timeout)
            .wait(self.wait)
            .build(
                move || {
                    thread::sleep(connect_delay);
                    let id = connect_counters.connect.fetch_add(1, Ordering::SeqCst);
                    Ok((id, id))
                },
                move |_, _| {
                    counters.disconnect.fetch_add(1, Ordering::SeqCst);
                },
            )
    }

    fn run(&self) {
        let counters = Arc::new(Counters::default());
        let pool = Arc::new(self.new_pool(counters.clone()));

        let start = Instant::now();
        let workers: Vec<_> = (0..self.threads)
            .map(|i| {
                let pool = pool.clone();
                let counters = counters.clone();
                let iterations = self.iterations;
                let hold = self.hold;
                let broken_every = self.broken_every;
                thread::Builder::new()
                    .name(format!("worker-{i}"))
                    .spawn(move || {
                        for _ in 0..iterations {
                            let mut conn = match pool.acquire() {
                                Ok(Some(conn)) => conn,
                                Ok(None) => {
                                    counters.would_block.fetch_add(1, Ordering::SeqCst);
                                    thread::sleep(hold);
                                    continue;
                                }
                                Err(error) => {
                                    tracing::warn!(%error, "acquire");
                                    counters.failed.fetch_add(1, Ordering::SeqCst);
                                    continue;
                                }
                            };
                            let n = counters.acquired.fetch_add(1, Ordering::SeqCst) + 1;
                            thread::sleep(hold);
                            if broken_every != 0 && n % broken_every == 0 {
                                conn.mark_broken();
                            }
                            if let Err(error) = pool.release(conn) {
                                tracing::warn!(%error, "release");
                            }
                        }
                    })
                    .expect("spawn worker")
            })
            .collect();
        for worker in workers {
            worker.join().expect("join worker");
        }
        let elapsed = start.elapsed();

        let stats = pool.stats();
        pool.close();
        tracing::info!(?elapsed, ?stats, "done");
        println!(
            "elapsed={:?} acquired={} would_block={} failed={} connect={} disconnect={} \
             active={} idle={} waiting={}",
            elapsed,
            counters.acquired.load(Ordering::SeqCst),
            counters.would_block.load(Ordering::SeqCst),
            counters.failed.load(Ordering::SeqCst),
            counters.connect.load(Ordering::SeqCst),
            counters.disconnect.load(Ordering::SeqCst),
            stats.active,
            stats.idle,
            stats.waiting,
        );
    }
}

fn main() {
    let program = Program::parse();
    program.init_tracing();
    program.run();
}
