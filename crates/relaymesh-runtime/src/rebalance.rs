//! Moving-average load sampling and busiest/quietest worker selection,
//! per §4.4's rebalancing description. Pure bookkeeping: the worker
//! loop feeds samples in and asks this module what to do once a
//! window's worth have accumulated.

use std::collections::VecDeque;

/// One worker's rolling load sample, in sessions (or any caller-chosen
/// load unit — the runtime uses active-session count).
struct LoadSampler {
    samples: VecDeque<f64>,
    window: usize,
}

impl LoadSampler {
    fn new(window: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(window),
            window,
        }
    }

    fn push(&mut self, value: f64) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }
}

/// A move instruction the coordinator hands to the busiest worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebalanceCommand {
    /// The worker the command is delivered to, i.e. the one asked to
    /// give up sessions.
    pub source: usize,
    pub destination: usize,
    pub move_count: usize,
}

/// Tracks per-worker load over `rebalance_window` one-second samples and
/// decides whether to rebalance.
pub struct RebalanceCoordinator {
    samplers: Vec<LoadSampler>,
    threshold: f64,
}

impl RebalanceCoordinator {
    pub fn new(worker_count: usize, rebalance_window: usize, rebalance_threshold: f64) -> Self {
        Self {
            samplers: (0..worker_count).map(|_| LoadSampler::new(rebalance_window)).collect(),
            threshold: rebalance_threshold,
        }
    }

    /// Record one worker's current load. Called once per worker per
    /// sampling tick (one sample/second from the main tick).
    pub fn record(&mut self, worker_id: usize, load: f64) {
        if let Some(sampler) = self.samplers.get_mut(worker_id) {
            sampler.push(load);
        }
    }

    /// If the busiest/quietest moving averages differ by more than the
    /// configured threshold, return a command to move one session from
    /// the busiest worker to the quietest.
    pub fn decide(&self) -> Option<RebalanceCommand> {
        let mut averages: Vec<(usize, f64)> =
            self.samplers.iter().enumerate().map(|(id, s)| (id, s.average())).collect();
        if averages.len() < 2 {
            return None;
        }
        averages.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        let (quietest, min) = averages[0];
        let (busiest, max) = *averages.last().unwrap();
        if busiest == quietest || max - min <= self.threshold {
            return None;
        }
        Some(RebalanceCommand {
            source: busiest,
            destination: quietest,
            move_count: 1,
        })
    }
}
