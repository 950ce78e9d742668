use chrono::Local;
use clap::Parser;
use std::io::BufRead;
use std::sync::Arc;
use tokio::sync::mpsc;
use voxlink::audio::{self, CpalInput};
use voxlink::playback::RodioOutput;
use voxlink::{
    credentials, history, settings, ClientEvent, Role, SessionConfig, SessionController,
    SessionEvent, StartError, TranscriptEntry, WsConnector,
};

#[derive(Parser, Debug)]
#[command(name = "voxlink", version, about = "Talk to a voice agent from the terminal")]
struct Args {
    /// Agent host and port, e.g. localhost:8000
    #[arg(long)]
    host: Option<String>,

    /// Use wss:// and https://
    #[arg(long)]
    secure: bool,

    /// Resume a stored conversation
    #[arg(long)]
    session: Option<String>,

    /// Input device name (see --list-devices)
    #[arg(long)]
    device: Option<String>,

    /// Store a provider key, e.g. --set-key murf_ai=abc123 (repeatable)
    #[arg(long = "set-key", value_name = "NAME=VALUE")]
    set_keys: Vec<String>,

    /// Write --host/--secure/--device into the settings file
    #[arg(long)]
    save: bool,

    #[arg(long)]
    list_devices: bool,

    #[arg(long)]
    list_sessions: bool,
}

fn wall_ts() -> String {
    Local::now().format("%H:%M:%S%.3f").to_string()
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::UserLive => "you ...",
        Role::UserFinal => "you",
        Role::Agent => "agent",
        Role::System => "*",
    }
}

/// Print the entries that changed since the last update.
fn print_transcript(shown: &mut Vec<TranscriptEntry>, entries: Vec<TranscriptEntry>) {
    for (i, entry) in entries.iter().enumerate() {
        if shown.get(i) != Some(entry) {
            println!("[{}] {:>7}: {}", wall_ts(), role_label(entry.role), entry.text);
        }
    }
    *shown = entries;
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    if args.list_devices {
        for name in audio::list_input_devices() {
            println!("{}", name);
        }
        return;
    }

    let mut settings = settings::load();
    if let Some(host) = args.host {
        settings.host = host;
    }
    if args.secure {
        settings.secure = true;
    }
    if let Some(device) = args.device {
        settings.mic_device = device;
    }
    if args.save {
        match settings::save(&settings) {
            Ok(()) => println!("[voxlink] settings saved"),
            Err(e) => eprintln!("[voxlink] could not save settings: {}", e),
        }
    }

    if !args.set_keys.is_empty() {
        if let Err(e) = store_keys(&args.set_keys) {
            eprintln!("[voxlink] {}", e);
            std::process::exit(2);
        }
        println!("[voxlink] {} key(s) stored", args.set_keys.len());
    }

    if args.list_sessions {
        match history::list_sessions(&settings.http_base()).await {
            Ok(sessions) => {
                for s in sessions {
                    println!("{}\t{}", s.id, s.name);
                }
            }
            Err(e) => eprintln!("[voxlink] could not list sessions: {}", e),
        }
        return;
    }

    let credentials = credentials::load();
    let (events_tx, events_rx) = mpsc::unbounded_channel::<SessionEvent>();
    let (client_tx, mut client_rx) = mpsc::unbounded_channel::<ClientEvent>();

    let finished_tx = events_tx.clone();
    let output = RodioOutput::new(settings.playback_sample_rate, move |clip_id| {
        let _ = finished_tx.send(SessionEvent::PlaybackFinished { clip_id });
    });

    let mut controller = SessionController::new(
        SessionConfig::from(&settings),
        credentials,
        Arc::new(WsConnector),
        Box::new(CpalInput::new(settings.mic_device())),
        Box::new(output),
        events_tx.clone(),
        client_tx,
    );
    controller.set_session_id(args.session.clone());

    let mut hydrated = false;
    if let Some(session_id) = args.session.as_deref() {
        match history::fetch_history(&settings.http_base(), session_id).await {
            Ok(turns) if !turns.is_empty() => {
                controller.hydrate(&turns);
                hydrated = true;
            }
            Ok(_) => {}
            Err(e) => log::warn!("[history] {}", e),
        }
    }
    if !hydrated {
        controller.greet(&settings.greeting);
    }
    let missing = controller.missing_credentials();
    if !missing.is_empty() {
        controller.notify_system(&StartError::MissingCredentials(missing).to_string());
    }

    // Printer: the only place that writes to stdout while the session runs.
    tokio::spawn(async move {
        let mut shown: Vec<TranscriptEntry> = Vec::new();
        while let Some(event) = client_rx.recv().await {
            match event {
                ClientEvent::TranscriptUpdated(entries) => print_transcript(&mut shown, entries),
                ClientEvent::StatusChanged(status) => {
                    println!("[{}] -- {}", wall_ts(), status)
                }
                ClientEvent::RecordingChanged(on) => log::debug!("[audio] capturing={}", on),
                ClientEvent::PlaybackStarted => log::debug!("[playback] started"),
                ClientEvent::PlaybackEnded => log::debug!("[playback] ended"),
                ClientEvent::TurnEnded => log::debug!("[session] turn ended"),
            }
        }
    });

    // Keyboard: Enter starts a session, or stops it (connecting or live); "q" quits.
    {
        let events_tx = events_tx.clone();
        std::thread::spawn(move || {
            println!("[voxlink] press Enter to talk, Enter again to stop, q to quit");
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                let event = match line.trim() {
                    "q" | "quit" => SessionEvent::Shutdown,
                    _ => SessionEvent::Toggle,
                };
                let quit = matches!(event, SessionEvent::Shutdown);
                if events_tx.send(event).is_err() || quit {
                    break;
                }
            }
            let _ = events_tx.send(SessionEvent::Shutdown);
        });
    }
    drop(events_tx);

    controller.run(events_rx).await;
}

fn store_keys(pairs: &[String]) -> Result<(), String> {
    let path = credentials::secrets_path()?;
    for pair in pairs {
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("Expected NAME=VALUE, got '{}'", pair))?;
        credentials::store_key(&path, name.trim(), value)?;
    }
    Ok(())
}
