use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::time::{Duration, Instant};


/// Верхняя граница числа образцов в скользящем окне
const MAX_WINDOW_SAMPLES: usize = 65_536;

/// Накопитель сводной статистики без хранения самих образцов
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsAccumulator {
    n: u64,
    sum: f64,
    sum_of_squares: f64,
    min: f64,
    max: f64,
}

impl StatsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: f64) {
        if self.n == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.n += 1;
        self.sum += value;
        self.sum_of_squares += value * value;
    }

    pub fn merge(&mut self, other: &StatsAccumulator) {
        if other.n == 0 {
            return;
        }
        if self.n == 0 {
            *self = *other;
            return;
        }
        self.n += other.n;
        self.sum += other.sum;
        self.sum_of_squares += other.sum_of_squares;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    #[inline]
    pub fn n(&self) -> u64 {
        self.n
    }

    #[inline]
    pub fn sum(&self) -> f64 {
        self.sum
    }

    #[inline]
    pub fn min(&self) -> f64 {
        self.min
    }

    #[inline]
    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn mean(&self) -> f64 {
        if self.n == 0 {
            return 0.0;
        }
        self.sum / self.n as f64
    }

    pub fn variance(&self) -> f64 {
        if self.n < 2 {
            return 0.0;
        }
        let n = self.n as f64;
        ((self.sum_of_squares - self.sum * self.sum / n) / (n - 1.0)).max(0.0)
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// Статистика по образцам за последний интервал времени
#[derive(Debug, Clone)]
pub struct WindowedStats {
    window: Duration,
    samples: VecDeque<(Instant, f64)>,
}

impl WindowedStats {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    #[inline]
    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn add(&mut self, value: f64) {
        self.add_at(Instant::now(), value);
    }

    pub fn add_at(&mut self, at: Instant, value: f64) {
        self.samples.push_back((at, value));
        if self.samples.len() > MAX_WINDOW_SAMPLES {
            self.samples.pop_front();
        }
        self.prune(at);
    }

    pub fn summary(&mut self) -> StatsAccumulator {
        self.summary_at(Instant::now())
    }

    pub fn summary_at(&mut self, now: Instant) -> StatsAccumulator {
        self.prune(now);
        let mut stats = StatsAccumulator::new();
        for (_, value) in &self.samples {
            stats.add(*value);
        }
        stats
    }

    fn prune(&mut self, now: Instant) {
        while let Some((at, _)) = self.samples.front() {
            if now.saturating_duration_since(*at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}
