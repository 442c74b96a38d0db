//! Prometheus-compatible metrics endpoint
//!
//! Exposes bot AI counters in Prometheus text format.
//! Default endpoint: http://localhost:9090/metrics

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// Frames of think time kept for percentiles
const THINK_HISTORY: usize = 1000;

/// Metrics registry for the bot AI
#[derive(Debug)]
pub struct AiMetrics {
    // Bots
    pub bots_active: AtomicU64,
    pub bots_alive: AtomicU64,
    pub thinks: AtomicU64,
    pub frames: AtomicU64,

    // Perception
    pub perception_scans: AtomicU64,
    pub visible_entities: AtomicU64,

    // Cover
    pub cover_points: AtomicU64,
    pub cover_claims: AtomicU64,

    // Planning and teams
    pub plans_created: AtomicU64,
    pub replans: AtomicU64,
    pub messages_dropped: AtomicU64,

    // Learning
    pub ppo_updates: AtomicU64,
    pub difficulty_adjustments: AtomicU64,

    // Frame think time (microseconds)
    pub think_time_us: AtomicU64,
    pub think_time_p95_us: AtomicU64,
    pub think_time_max_us: AtomicU64,

    start_time: Instant,

    think_history: RwLock<VecDeque<u64>>,
}

impl AiMetrics {
    pub fn new() -> Self {
        Self {
            bots_active: AtomicU64::new(0),
            bots_alive: AtomicU64::new(0),
            thinks: AtomicU64::new(0),
            frames: AtomicU64::new(0),
            perception_scans: AtomicU64::new(0),
            visible_entities: AtomicU64::new(0),
            cover_points: AtomicU64::new(0),
            cover_claims: AtomicU64::new(0),
            plans_created: AtomicU64::new(0),
            replans: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            ppo_updates: AtomicU64::new(0),
            difficulty_adjustments: AtomicU64::new(0),
            think_time_us: AtomicU64::new(0),
            think_time_p95_us: AtomicU64::new(0),
            think_time_max_us: AtomicU64::new(0),
            start_time: Instant::now(),
            think_history: RwLock::new(VecDeque::with_capacity(THINK_HISTORY)),
        }
    }

    /// Record one frame's think time and update percentiles
    pub fn record_frame_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.think_time_us.store(us, Ordering::Relaxed);
        self.frames.fetch_add(1, Ordering::Relaxed);

        let mut history = self.think_history.write();
        history.push_back(us);
        while history.len() > THINK_HISTORY {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();
            let p95_idx = (sorted.len() as f32 * 0.95) as usize;
            self.think_time_p95_us.store(sorted[p95_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.think_time_max_us.store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(2048);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        metric!("bot_ai_bots_active", "Bots under AI control", "gauge",
            self.bots_active.load(Ordering::Relaxed));
        metric!("bot_ai_bots_alive", "Bots currently alive", "gauge",
            self.bots_alive.load(Ordering::Relaxed));
        metric!("bot_ai_thinks_total", "Bot think cycles run", "counter",
            self.thinks.load(Ordering::Relaxed));
        metric!("bot_ai_frames_total", "AI frames processed", "counter",
            self.frames.load(Ordering::Relaxed));

        metric!("bot_ai_perception_scans_total", "Vision scans across all bots", "counter",
            self.perception_scans.load(Ordering::Relaxed));
        metric!("bot_ai_visible_entities", "Entities visible to bots this frame", "gauge",
            self.visible_entities.load(Ordering::Relaxed));

        metric!("bot_ai_cover_points", "Cover points from map analysis", "gauge",
            self.cover_points.load(Ordering::Relaxed));
        metric!("bot_ai_cover_claims_total", "Cover points claimed", "counter",
            self.cover_claims.load(Ordering::Relaxed));

        metric!("bot_ai_plans_created_total", "Strategic plans created", "counter",
            self.plans_created.load(Ordering::Relaxed));
        metric!("bot_ai_replans_total", "Team replanning passes", "counter",
            self.replans.load(Ordering::Relaxed));
        metric!("bot_ai_team_messages_dropped_total", "Team messages dropped from full queues", "counter",
            self.messages_dropped.load(Ordering::Relaxed));

        metric!("bot_ai_ppo_updates_total", "Policy training passes", "counter",
            self.ppo_updates.load(Ordering::Relaxed));
        metric!("bot_ai_difficulty_adjustments_total", "Skill difficulty adjustments", "counter",
            self.difficulty_adjustments.load(Ordering::Relaxed));

        metric!("bot_ai_think_time_microseconds", "Last frame think time", "gauge",
            self.think_time_us.load(Ordering::Relaxed));
        metric!("bot_ai_think_time_p95_microseconds", "95th percentile frame think time", "gauge",
            self.think_time_p95_us.load(Ordering::Relaxed));
        metric!("bot_ai_think_time_max_microseconds", "Maximum frame think time", "gauge",
            self.think_time_max_us.load(Ordering::Relaxed));
        metric!("bot_ai_uptime_seconds", "Process uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }
}

impl Default for AiMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server
#[cfg(feature = "metrics_server")]
pub async fn start_metrics_server(metrics: std::sync::Arc<AiMetrics>, port: u16) -> anyhow::Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tracing::{debug, info};

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);

                    let response = if request.starts_with("GET /metrics") {
                        let body = metrics.to_prometheus();
                        format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        )
                    } else if request.starts_with("GET /health") || request.starts_with("GET /") {
                        let body = "OK";
                        format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        )
                    } else {
                        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
                    };

                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Failed to read from metrics socket {}: {}", peer, e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = AiMetrics::new();
        assert_eq!(metrics.bots_active.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.frames.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_record_frame_time() {
        let metrics = AiMetrics::new();
        for i in 0..100 {
            metrics.record_frame_time(Duration::from_micros(100 + i * 10));
        }
        assert_eq!(metrics.frames.load(Ordering::Relaxed), 100);
        assert!(metrics.think_time_p95_us.load(Ordering::Relaxed) >= 1000);
        assert_eq!(metrics.think_time_max_us.load(Ordering::Relaxed), 1090);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = AiMetrics::new();
        metrics.bots_active.store(6, Ordering::Relaxed);
        metrics.cover_points.store(120, Ordering::Relaxed);

        let output = metrics.to_prometheus();

        assert!(output.contains("bot_ai_bots_active 6"));
        assert!(output.contains("bot_ai_cover_points 120"));
        assert!(output.contains("# TYPE bot_ai_thinks_total counter"));
    }
}
