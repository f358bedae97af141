//! Streams from the first camera for a few seconds and reports the frame rate.
//!
//! Usage: `stream [WIDTH HEIGHT FPS]`. Without arguments the device's default format is used.

use std::{
    env,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use uvc_host::{Encoding, HostConfig, StreamConfig, StreamFormatRequest, UvcHost};

const RUN_TIME: Duration = Duration::from_secs(5);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = env::args().skip(1).collect::<Vec<_>>();
    let format = match &args[..] {
        [] => StreamFormatRequest::device_default(),
        [width, height, fps] => {
            StreamFormatRequest::new(width.parse()?, height.parse()?, fps.parse()?, Encoding::Any)
        }
        _ => return Err("usage: stream [WIDTH HEIGHT FPS]".into()),
    };

    let host = UvcHost::usb()?;
    host.install(HostConfig::default().on_driver_event(|event| println!("{:?}", event)))?;

    let frames = Arc::new(AtomicUsize::new(0));
    let bytes = Arc::new(AtomicUsize::new(0));
    let config = {
        let (frames, bytes) = (frames.clone(), bytes.clone());
        StreamConfig::new(format, move |frame| {
            frames.fetch_add(1, Ordering::Relaxed);
            bytes.fetch_add(frame.data().len(), Ordering::Relaxed);
        })
        .on_event(|event| eprintln!("stream event: {:?}", event))
    };
    let stream = host.stream_open(config, Duration::from_secs(5))?;
    println!("stream started: {}", host.stream_format(stream)?);

    let start = Instant::now();
    thread::sleep(RUN_TIME);
    let elapsed = start.elapsed().as_secs_f32();
    host.stream_close(stream)?;
    host.uninstall()?;

    let frames = frames.load(Ordering::Relaxed);
    println!(
        "{} frames ({} bytes) in {:.1}s, {:.1} fps",
        frames,
        bytes.load(Ordering::Relaxed),
        elapsed,
        frames as f32 / elapsed
    );
    Ok(())
}
