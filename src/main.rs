use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use arena_bot_ai::ai::character::CharacterProfile;
use arena_bot_ai::ai::{AiManager, BotEvent, ClientId};
use arena_bot_ai::config::AiConfig;
use arena_bot_ai::metrics::AiMetrics;
use arena_bot_ai::world::sim::ArenaSim;
use arena_bot_ai::world::{Team, UserCmd, World};

/// Simulation step of the headless runner
const FRAME_TIME: f32 = 0.05;

/// How often team scores are pushed to the coordinators
const SCORE_INTERVAL: f32 = 1.0;

struct MatchResult {
    frames: u64,
    duration: f32,
    scores: HashMap<Team, i32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Arena Bot AI v{}", env!("CARGO_PKG_VERSION"));

    let config = AiConfig::load_or_default();
    config.validate()?;
    info!(
        "Configuration loaded: bots={}, skill={}, learning={}, teamplay={}, think={}ms",
        config.bot_count, config.skill, config.learning, config.teamplay, config.think_time_ms
    );

    let metrics = Arc::new(AiMetrics::new());

    #[cfg(feature = "metrics_server")]
    {
        let metrics_clone = metrics.clone();
        let port = config.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = arena_bot_ai::metrics::start_metrics_server(metrics_clone, port).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let stop = Arc::new(AtomicBool::new(false));
    let runner_stop = stop.clone();
    let mut runner = tokio::task::spawn_blocking(move || run_match(config, metrics, &runner_stop));

    let result = tokio::select! {
        result = &mut runner => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            stop.store(true, Ordering::Relaxed);
            runner.await
        }
    };

    match result {
        Ok(Ok(summary)) => {
            info!(
                "Match finished after {:.1}s ({} frames): red={} blue={}",
                summary.duration,
                summary.frames,
                summary.scores.get(&Team::Red).copied().unwrap_or(0),
                summary.scores.get(&Team::Blue).copied().unwrap_or(0),
            );
        }
        Ok(Err(e)) => error!("Match aborted: {}", e),
        Err(e) => error!("Match runner panicked: {}", e),
    }

    Ok(())
}

/// Run one match on the demo arena until time runs out or `stop` is set
fn run_match(config: AiConfig, metrics: Arc<AiMetrics>, stop: &AtomicBool) -> anyhow::Result<MatchResult> {
    let mut sim = ArenaSim::demo(config.seed);
    let mut manager = AiManager::new(config.clone()).with_metrics(metrics);

    let points = manager.load_map(&sim.world);
    info!("Map analyzed: {} cover points", points);

    let mut clients = Vec::with_capacity(config.bot_count);
    for i in 0..config.bot_count {
        let team = if i % 2 == 0 { Team::Red } else { Team::Blue };
        let roster = CharacterProfile::roster(i, config.skill);
        // A character file with the roster name replaces the built-in
        let character = match config.character_dir.as_deref() {
            Some(dir) if CharacterProfile::file_path(dir, &roster.name).exists() => {
                CharacterProfile::load_or_default(Some(dir), &roster.name, config.skill)
            }
            _ => roster,
        };
        clients.push(manager.spawn_character(i, character, team)?);
        sim.spawn_player(i, team);
    }

    let mut scores: HashMap<Team, i32> = HashMap::new();
    let mut frames = 0u64;
    let mut next_score_push = 0.0;

    while sim.world.time() < config.match_seconds && !stop.load(Ordering::Relaxed) {
        sim.step(FRAME_TIME);
        let now = sim.world.time();
        manager.frame(&sim.world, now);
        frames += 1;

        // Bots that did not think this frame keep their last command
        let commands: Vec<(ClientId, UserCmd)> = manager.bots().map(|b| (b.client(), *b.last_cmd())).collect();
        for (client, cmd) in commands {
            for event in sim.apply_command(client.entity(), &cmd, FRAME_TIME) {
                if let BotEvent::Kill { killer: Some(killer), victim } = event {
                    if let Some(team) = sim.world.entity(killer).map(|e| e.team) {
                        let own_goal = sim.world.entity(victim).is_some_and(|v| v.team == team);
                        *scores.entry(team).or_default() += if own_goal { -1 } else { 1 };
                    }
                }
                manager.record_event(event, now);
            }
        }

        if now >= next_score_push {
            next_score_push = now + SCORE_INTERVAL;
            let red = scores.get(&Team::Red).copied().unwrap_or(0);
            let blue = scores.get(&Team::Blue).copied().unwrap_or(0);
            let remaining = config.match_seconds - now;
            manager.set_match_info(Team::Red, red, blue, remaining);
            manager.set_match_info(Team::Blue, blue, red, remaining);
        }
    }

    let red = scores.get(&Team::Red).copied().unwrap_or(0);
    let blue = scores.get(&Team::Blue).copied().unwrap_or(0);
    let winner = match red.cmp(&blue) {
        std::cmp::Ordering::Greater => Some(Team::Red),
        std::cmp::Ordering::Less => Some(Team::Blue),
        std::cmp::Ordering::Equal => None,
    };
    let now = sim.world.time();
    manager.record_event(BotEvent::RoundEnd { winner }, now);

    for client in clients {
        if let Err(e) = manager.save_bot(client) {
            warn!("Failed to save {}: {}", client, e);
        }
    }

    Ok(MatchResult {
        frames,
        duration: now,
        scores,
    })
}
