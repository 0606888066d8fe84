//! Screen-cast session simulation
//!
//! Run with: cargo run --example cast_session [SECONDS]
//!
//! A synthetic encoder produces 30 fps video (a key frame every second) and
//! 50 fps audio. Three readers consume the stream:
//!
//! - `fast`: a LAN sender that keeps up
//! - `slow`: a sender that stalls periodically; the ring grows to hold its backlog
//! - `catchup`: joins late in key-only mode and switches back to full frames
//!   once it reaches the live edge
//!
//! Set `RUST_LOG=cast_buffer=trace` to see every frame.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use cast_buffer::{
    BufferDispatcher, BufferReceiver, DispatchError, DispatcherConfig, DispatcherEvent, MediaType,
    ReadKind, ReceiverListener,
};

const VIDEO_FPS: u64 = 30;
const AUDIO_FPS: u64 = 50;

/// Switches its receiver back to full frames once catch-up is done
struct CatchUp {
    receiver: Weak<BufferReceiver>,
}

impl ReceiverListener for CatchUp {
    fn on_acceleration_done(&self) {
        tracing::info!("catchup reader reached live edge");
        if let Some(receiver) = self.receiver.upgrade() {
            receiver.enable_key_mode(false);
        }
    }

    fn on_key_mode_changed(&self, enabled: bool) {
        tracing::info!(enabled, "catchup reader key-only mode changed");
    }
}

fn produce(dispatcher: Arc<BufferDispatcher>, running: Arc<AtomicBool>) {
    let start = Instant::now();
    let mut video_pts = 0u64;
    let mut audio_pts = 0u64;

    while running.load(Ordering::Relaxed) {
        let now = start.elapsed().as_millis() as u64;

        while audio_pts * 1000 / AUDIO_FPS <= now {
            let mut frame = dispatcher.request_buffer(MediaType::Audio, 256);
            frame.pts = audio_pts * 1000 / AUDIO_FPS;
            frame.payload.extend_from_slice(&[0x21; 256]);
            if let Err(e) = dispatcher.input_data(frame) {
                tracing::warn!(error = %e, "audio write failed");
            }
            audio_pts += 1;
        }

        while video_pts * 1000 / VIDEO_FPS <= now {
            let key = video_pts % VIDEO_FPS == 0;
            let size = if key { 32 * 1024 } else { 4 * 1024 };
            let mut frame = dispatcher.request_buffer(MediaType::Video, size);
            frame.pts = video_pts * 1000 / VIDEO_FPS;
            frame.key_frame = key;
            frame.payload.resize(size, 0x41);
            if let Err(e) = dispatcher.input_data(frame) {
                tracing::warn!(error = %e, "video write failed");
            }
            video_pts += 1;
        }

        thread::sleep(Duration::from_millis(5));
    }
}

fn consume(
    name: &'static str,
    receiver: Arc<BufferReceiver>,
    stall_every: Option<u64>,
    running: Arc<AtomicBool>,
) -> u64 {
    let bytes = AtomicU64::new(0);
    let mut frames = 0u64;

    while running.load(Ordering::Relaxed) {
        let result = receiver.request_read_timeout(ReadKind::Mixed, Duration::from_millis(200), |frame| {
            bytes.fetch_add(frame.size() as u64, Ordering::Relaxed);
            tracing::trace!(reader = name, pts = frame.pts, media = %frame.media_type, "frame");
        });

        match result {
            Ok(()) => frames += 1,
            Err(DispatchError::NoData) => continue,
            Err(e) => {
                tracing::info!(reader = name, error = %e, "reader stopped");
                break;
            }
        }

        if let Some(every) = stall_every {
            if frames % every == 0 {
                thread::sleep(Duration::from_millis(400));
            }
        }
    }

    tracing::info!(
        reader = name,
        frames,
        bytes = bytes.load(Ordering::Relaxed),
        "reader finished"
    );
    frames
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let seconds: u64 = match std::env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => 10,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cast_buffer=debug".parse()?)
                .add_directive("cast_session=debug".parse()?),
        )
        .init();

    let config = DispatcherConfig::default()
        .write_timeout(Duration::from_secs(2))
        .housekeeping_interval(Duration::from_millis(100));
    let dispatcher = BufferDispatcher::new(config)?;
    let running = Arc::new(AtomicBool::new(true));

    let mut events = dispatcher.subscribe_events();
    let event_log = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                DispatcherEvent::CapacityChanged { from, to } => {
                    tracing::info!(from, to, "capacity changed");
                }
                other => tracing::debug!(event = ?other, "dispatcher event"),
            }
        }
    });

    let producer = {
        let dispatcher = Arc::clone(&dispatcher);
        let running = Arc::clone(&running);
        thread::spawn(move || produce(dispatcher, running))
    };

    let mut readers = Vec::new();
    for (name, stall_every) in [("fast", None), ("slow", Some(90))] {
        let receiver = BufferReceiver::new();
        dispatcher.attach(&receiver)?;
        let running = Arc::clone(&running);
        readers.push(thread::spawn(move || consume(name, receiver, stall_every, running)));
    }

    tokio::time::sleep(Duration::from_secs(3)).await;

    let late = BufferReceiver::new();
    let listener: Arc<dyn ReceiverListener> = Arc::new(CatchUp {
        receiver: Arc::downgrade(&late),
    });
    late.set_listener(Arc::downgrade(&listener));
    late.enable_key_mode(true);
    dispatcher.attach(&late)?;
    {
        let running = Arc::clone(&running);
        readers.push(thread::spawn(move || consume("catchup", late, None, running)));
    }

    tokio::time::sleep(Duration::from_secs(seconds.saturating_sub(3))).await;
    running.store(false, Ordering::Relaxed);

    if producer.join().is_err() {
        tracing::error!("producer thread panicked");
    }
    for reader in readers {
        if reader.join().is_err() {
            tracing::error!("reader thread panicked");
        }
    }

    let stats = dispatcher.stats();
    println!();
    println!("=== Session summary ===");
    println!("frames written:    {}", stats.frames_written);
    println!("frames evicted:    {} ({} unread)", stats.frames_evicted, stats.unread_evicted);
    println!("forced evictions:  {}", stats.forced_evictions);
    println!(
        "capacity:          {} (base {}, ceiling {})",
        stats.capacity, stats.base_capacity, stats.double_capacity
    );
    println!("utilization:       {:.1}%", stats.utilization());
    println!(
        "pool:              {} allocated, {} reused",
        stats.pool.allocations, stats.pool.reuses
    );

    dispatcher.stop();
    drop(listener);
    event_log.abort();
    Ok(())
}
