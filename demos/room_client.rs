//! Room Signaling Client Example
//!
//! Connects to a room-based media server (Ant Media style WebSocket API),
//! negotiates the streams for the chosen role and prints data channel
//! messages and remote tracks as they arrive.
//!
//! Usage:
//!   cargo run --example room_client -- <wss_url> <channel_id> [sendonly|recvonly|sendrecv] [--multistream] [--audio-only] [--codec VP8|VP9|H264]
//!
//! Examples:
//!   # Publish a stream
//!   cargo run --example room_client -- wss://media.example.com:5443/WebRTCAppEE/websocket stream1
//!
//!   # Join a conference room, publish and play everyone else
//!   cargo run --example room_client -- wss://media.example.com:5443/WebRTCAppEE/websocket room1 sendrecv --multistream

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use room_signaling::{
    init_logging, CodecPreferences, HostCallbacks, Role, SignalingClient, SignalingConfig,
    TrackKind, VideoCodec, WebRtcSessionFactory,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!(
            "Usage: {} <wss_url> <channel_id> [sendonly|recvonly|sendrecv] [--multistream] [--audio-only] [--codec VP8|VP9|H264]",
            args[0]
        );
        std::process::exit(1);
    }

    let url = &args[1];
    let channel_id = &args[2];
    let role: Role = match args.get(3) {
        Some(arg) if !arg.starts_with("--") => arg.parse()?,
        _ => Role::Sendonly,
    };
    let multistream = args.iter().any(|a| a == "--multistream");
    let audio_only = args.iter().any(|a| a == "--audio-only");
    let video_codec: VideoCodec = match args.iter().position(|a| a == "--codec") {
        Some(i) => args.get(i + 1).ok_or("--codec needs a value")?.parse()?,
        None => VideoCodec::default(),
    };

    println!("========================================");
    println!("  Room Signaling Client");
    println!("========================================");
    println!();
    println!("URL:          {}", url);
    println!("Channel:      {}", channel_id);
    println!("Role:         {}", role);
    println!("Multistream:  {}", multistream);
    println!("Audio only:   {}", audio_only);
    println!("Video codec:  {:?}", video_codec);
    println!();

    let codecs = CodecPreferences {
        video: video_codec,
        ..Default::default()
    };
    let config = SignalingConfig::new(url, channel_id)
        .with_role(role)
        .with_multistream(multistream)
        .with_audio_only(audio_only)
        .with_codecs(codecs);

    let factory = Arc::new(WebRtcSessionFactory::from_config(&config)?);

    let callbacks = HostCallbacks {
        on_notify: Some(Arc::new(|stream_id: &str, text: &str| {
            println!("[{}] message: {}", stream_id, text);
        })),
        on_track_added: Some(Arc::new(|stream_id: &str, track_id: &str, kind: TrackKind| {
            println!("[{}] + {:?} track {}", stream_id, kind, track_id);
        })),
        on_track_removed: Some(Arc::new(|stream_id: &str, track_id: &str| {
            println!("[{}] - track {}", stream_id, track_id);
        })),
    };

    let mut client = SignalingClient::connect(config, factory, callbacks).await?;
    println!("[OK] Connected to signaling server");

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    ctrlc::set_handler(move || {
        println!("\nReceived Ctrl+C, shutting down...");
        running_clone.store(false, Ordering::SeqCst);
    })?;

    println!("Press Ctrl+C to stop.");
    println!();

    let mut tick = 0u64;
    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_secs(1)).await;
        tick += 1;

        if multistream && tick % 10 == 0 {
            client.request_room_info(channel_id)?;
        }

        let stats = client.stats();
        let state = client
            .connection_state()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "none".to_string());
        println!(
            "Phase: {} | ICE: {} | Frames in/out: {}/{} | Sessions: +{} -{}",
            client.phase(),
            state,
            stats.frames_received,
            stats.frames_sent,
            stats.sessions_created,
            stats.sessions_removed
        );

        if tick % 30 == 0 {
            for stats in client.get_stats().await? {
                let entries = stats.report.as_object().map(|o| o.len()).unwrap_or(0);
                println!("[{}] {} stats entries", stats.stream_id, entries);
            }
        }

        if client.is_ready() && tick % 5 == 0 {
            client.send_data_message(channel_id, &format!("{{\"tick\":{}}}", tick))?;
        }
    }

    println!();
    println!("Closing...");
    client.close().await?;
    println!("[OK] Closed");

    Ok(())
}
