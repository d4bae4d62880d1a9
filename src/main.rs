//! Lumen demo: synthetic capture loop feeding two frame processors.

use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use lumen::{
    Config, ConstraintNegotiator, Dispatcher, FrameError, FrameHandle, FramePool, FrameProcessor,
    ProcessorError, Rotation,
};
use tracing::{info, warn};

/// Fast consumer: averages the frame bytes as a stand-in for a real-time
/// analyzer (exposure probe, QR scan, ...).
struct LumaProbe {
    frames: u64,
}

impl FrameProcessor for LumaProbe {
    fn process(&mut self, frame: &FrameHandle) -> Result<(), ProcessorError> {
        let avg = frame.with_bytes(|data| {
            if data.is_empty() {
                0.0
            } else {
                data.iter().map(|&b| b as u64).sum::<u64>() as f64 / data.len() as f64
            }
        })?;
        self.frames += 1;
        if self.frames % 30 == 0 {
            info!(seq = frame.sequence(), avg_luma = format!("{avg:.1}"), "probe");
        }
        Ok(())
    }
}

/// Slow consumer: freezes the frame and holds its worker for ~5 frame
/// intervals, demonstrating drop-on-busy without stalling the producer.
struct SlowConsumer;

impl FrameProcessor for SlowConsumer {
    fn process(&mut self, frame: &FrameHandle) -> Result<(), ProcessorError> {
        let mut frozen = frame.freeze()?;
        std::thread::sleep(Duration::from_millis(160));
        info!(
            seq = frozen.sequence(),
            bytes = frozen.data()?.len(),
            "slow consumer finished"
        );
        frozen.release()?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter("lumen=debug")
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Lumen launching...");

    // Load configuration (optional lumen.toml plus LUMEN_* env overrides)
    let config: Config = config::Config::builder()
        .add_source(config::File::with_name("lumen").required(false))
        .add_source(config::Environment::with_prefix("LUMEN").separator("__"))
        .build()?
        .try_deserialize()
        .unwrap_or_default();
    lumen::CONFIG.store(Arc::new(config.clone()));

    let negotiator = Arc::new(ConstraintNegotiator::new(&config.constraints)?);
    negotiator.set_max_size(640, 480)?;
    let pool = FramePool::new(&config.pool, negotiator.clone());

    let dispatcher = Dispatcher::new();
    dispatcher.add_processor("luma-probe", LumaProbe { frames: 0 })?;
    dispatcher.add_processor("slow-consumer", SlowConsumer)?;

    // Synthetic 30 fps producer: a moving gradient in the negotiated format.
    let (width, height) = negotiator.max_size();
    let frame_bytes = negotiator.snapshot().buffer_size();
    let mut pattern = vec![0u8; frame_bytes];
    let mut interval = tokio::time::interval(Duration::from_millis(33));

    for tick in 0u64..300 {
        interval.tick().await;
        for (i, px) in pattern.iter_mut().enumerate() {
            *px = ((i as u64 + tick * 7) & 0xff) as u8;
        }

        let mut lease = match pool.acquire() {
            Ok(lease) => lease,
            Err(FrameError::PoolExhausted { capacity }) => {
                warn!(capacity, tick, "skipping capture cycle, pool exhausted");
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        lease.fill_bytes(&pattern, width, height, Rotation::Deg0)?;
        dispatcher.dispatch(lease);
    }

    info!(
        probe_delivered = dispatcher.delivered_count("luma-probe").unwrap_or(0),
        slow_delivered = dispatcher.delivered_count("slow-consumer").unwrap_or(0),
        slow_dropped = dispatcher.drop_count("slow-consumer").unwrap_or(0),
        "producer finished"
    );

    dispatcher.clear_processors();
    info!("Lumen shutting down");
    Ok(())
}
