//! Load-adaptive inference rate
//!
//! One sampler measures system CPU for all cameras; each camera's
//! controller steps its inference rate down under load and back up when the
//! machine is idle, within the camera's fps bounds.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::sync::watch;
use tracing::debug;

use crate::config::LoadSettings;

/// Sample average CPU usage every `interval` until `shutdown` is set
pub fn spawn_cpu_sampler(interval: Duration, shutdown: Arc<AtomicBool>) -> watch::Receiver<f32> {
    let (tx, rx) = watch::channel(0.0f32);
    let interval = interval.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);

    tokio::spawn(async move {
        let mut sys = System::new();
        let mut ticker = tokio::time::interval(interval);

        while !shutdown.load(Ordering::SeqCst) {
            ticker.tick().await;
            sys.refresh_cpu();

            let cpus = sys.cpus();
            let usage = if cpus.is_empty() {
                0.0
            } else {
                cpus.iter().map(|c| c.cpu_usage()).sum::<f32>() / cpus.len() as f32
            };

            if tx.send(usage).is_err() {
                break;
            }
        }
        debug!("cpu sampler stopped");
    });

    rx
}

#[derive(Debug, Clone)]
pub struct RateController {
    min_fps: f32,
    max_fps: f32,
    current: f32,
    step: f32,
    high_cpu: f32,
    low_cpu: f32,
}

impl RateController {
    pub fn new(target_fps: f32, min_fps: f32, max_fps: f32, load: &LoadSettings) -> Self {
        let min_fps = min_fps.max(0.01);
        let max_fps = max_fps.max(min_fps);
        Self {
            min_fps,
            max_fps,
            current: target_fps.clamp(min_fps, max_fps),
            step: load.fps_step.max(0.01),
            high_cpu: load.high_cpu,
            low_cpu: load.low_cpu,
        }
    }

    /// New bounds keep the current rate if it still fits
    pub fn set_bounds(&mut self, min_fps: f32, max_fps: f32) {
        self.min_fps = min_fps.max(0.01);
        self.max_fps = max_fps.max(self.min_fps);
        self.current = self.current.clamp(self.min_fps, self.max_fps);
    }

    /// Step the rate for a measured CPU percentage; returns the new rate
    pub fn adjust(&mut self, cpu_percent: f32) -> f32 {
        if cpu_percent > self.high_cpu {
            self.current = (self.current - self.step).max(self.min_fps);
        } else if cpu_percent < self.low_cpu {
            self.current = (self.current + self.step).min(self.max_fps);
        }
        self.current
    }

    pub fn fps(&self) -> f32 {
        self.current
    }

    /// Pause between samples at the current rate
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f32(1.0 / self.current)
    }
}
