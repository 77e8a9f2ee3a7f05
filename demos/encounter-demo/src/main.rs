//! Runnable demo of the collaboration core: a dungeon master hosts a
//! tabletop encounter over plain WebSockets, and any number of player
//! clients connect, propose actions, and watch the shared initiative
//! tracker update live.
//!
//! ```text
//! encounter-demo host [bind_addr]
//! encounter-demo client <server_url> <client_id>
//! ```

mod commands;

use collab_client::{ClientConfig, ClientRole};
use collab_host::{HostConfig, HostRole};
use collab_protocol::{ClientId, Envelope};
use collab_testkit::{filter_for_client, initial_state, reduce, validate, EncounterAction, EncounterContext, EncounterEvent, EncounterState, DM_CLIENT_ID};
use collab_ws_port::{WsClientConfig, WsClientPort, WsListener};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

type DemoEnvelope = Envelope<EncounterAction, EncounterContext>;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:9000";
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("host") => run_host(args.get(2).cloned().unwrap_or_else(|| DEFAULT_BIND_ADDR.to_owned())).await,
        Some("client") => {
            let Some(server_url) = args.get(2) else {
                eprintln!("FATAL: missing <server_url>\n\nusage: encounter-demo client <server_url> <client_id>");
                std::process::exit(1);
            };
            let Some(client_id) = args.get(3) else {
                eprintln!("FATAL: missing <client_id>\n\nusage: encounter-demo client <server_url> <client_id>");
                std::process::exit(1);
            };
            run_client(server_url.clone(), client_id.clone()).await;
        }
        _ => {
            eprintln!("usage: encounter-demo host [bind_addr]\n       encounter-demo client <server_url> <client_id>");
            std::process::exit(1);
        }
    }
}

async fn run_host(bind_addr: String) {
    let host = Arc::new(
        HostRole::new(
            initial_state(),
            reduce,
            |event: &EncounterEvent, client_id: &ClientId| validate(event, client_id),
            |event: &EncounterEvent, client_id: &ClientId| filter_for_client(event, client_id),
            HostConfig::default(),
        )
        .expect("HostConfig::default always yields a valid snapshot interval"),
    );

    host.subscribe(|state: &EncounterState| {
        tracing::info!(round = state.round, active = ?state.active_combatant, combatants = state.combatants.len(), "encounter state advanced");
    })
    .await;

    let listener = match WsListener::bind(&bind_addr, HEARTBEAT_INTERVAL).await {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("FATAL: failed to bind {bind_addr}: {err}");
            std::process::exit(1);
        }
    };
    tracing::info!(addr = %bind_addr, "encounter-demo host listening");

    loop {
        match listener.accept_next::<DemoEnvelope>().await {
            Ok((client_id, port)) => {
                tracing::info!(%client_id, "player connected");
                host.add_client(client_id, Arc::new(port)).await;
            }
            Err(err) => tracing::warn!(error = %err, "rejected an incoming connection"),
        }
    }
}

async fn run_client(server_url: String, client_id: String) {
    let port = WsClientPort::<DemoEnvelope>::connect(server_url.clone(), client_id.clone(), WsClientConfig::default());
    let client = ClientRole::new(client_id.clone(), initial_state(), reduce, Arc::new(port), ClientConfig::default())
        .expect("ClientConfig::default always yields a valid snapshot interval");

    client
        .subscribe(move |state: &EncounterState| {
            println!("--- round {} (active: {}) ---", state.round, state.active_combatant.as_deref().unwrap_or("-"));
            for combatant in &state.combatants {
                println!("  [{}] {} {}/{} hp (init {})", combatant.id, combatant.name, combatant.hp, combatant.max_hp, combatant.initiative);
            }
        })
        .await;

    tracing::info!(%server_url, %client_id, "connecting, type commands at the prompt (add/remove/damage/heal/initiative/start/next, quit to exit)");
    if client_id == DM_CLIENT_ID {
        tracing::info!("connected as the DM client: dm-only rulings will be visible here");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let Ok(Some(line)) = lines.next_line().await else {
            break;
        };
        let trimmed = line.trim();
        if trimmed == "quit" || trimmed == "exit" {
            break;
        }
        match commands::parse(trimmed) {
            Ok(Some(action)) => match client.propose(action, None).await {
                Ok(_event_id) => {}
                Err(err) => eprintln!("rejected locally: {err}"),
            },
            Ok(None) => {}
            Err(message) => eprintln!("{message}"),
        }
    }
}
