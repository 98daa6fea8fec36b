//! Fetch/process demo for the event loop
//!
//! Simulates fetching data (5s), then processing it (2s), while an interval
//! ticks every second. The interval is cancelled once processing finishes,
//! which leaves the loop idle and lets `start` return.
//!
//! Usage:
//!   cargo run --bin fetch_demo                    # realtime
//!   cargo run --bin fetch_demo -- --rate 10       # realtime, 10x faster
//!   cargo run --bin fetch_demo -- --offline       # offline, instant
//!
//! Set RUST_LOG=rust_event_loop=trace to see every timer firing.

use rust_event_loop::{ClockMode, Deferred, EventLoop, LoopConfig, LoopError};
use std::env;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug)]
struct Payload {
    message: String,
}

fn fetch_data(el: &EventLoop) -> Result<Deferred<Payload, String>, LoopError> {
    el.settle_after(5.0, || {
        Ok(Payload {
            message: "Data fetched successfully".to_string(),
        })
    })
}

fn process_data(el: &EventLoop) -> Result<Deferred<Payload, String>, LoopError> {
    el.settle_after(2.0, || {
        Ok(Payload {
            message: "Data processed successfully".to_string(),
        })
    })
}

fn parse_config() -> LoopConfig {
    let args: Vec<String> = env::args().collect();
    let mut config = LoopConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--offline" => config.mode = ClockMode::Offline,
            "--rate" | "-r" => {
                i += 1;
                if let Some(rate) = args.get(i).and_then(|a| a.parse().ok()) {
                    config.rate = rate;
                }
            }
            _ => {}
        }
        i += 1;
    }
    config
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let el = EventLoop::new(parse_config());

    let ticker = el.clone();
    let interval = el.register_interval(move || info!(now = ticker.now(), "interval tick"), 1.0)?;

    let (fetch_loop, done_loop) = (el.clone(), el.clone());
    fetch_data(&el)?
        .and_then(move |data| {
            info!(message = %data.message, "success");
            match process_data(&fetch_loop) {
                Ok(next) => next,
                Err(e) => Deferred::rejected(e.to_string()),
            }
        })
        .then(|data| {
            info!(message = %data.message, "success");
            Ok(())
        })
        .catch(|err| {
            error!(%err, "pipeline failed");
            Ok(())
        })
        .finally(move || done_loop.cancel_interval(interval));

    el.start()?;
    info!(now = el.now(), "done");
    Ok(())
}
