use super::stats::StatsAccumulator;
use serde::Serialize;
use std::time::Duration;


/// Снимок состояния пула для мониторинга
#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    pub pool_id: String,
    pub num_workers: usize,
    pub running_tasks: usize,
    pub queued_tasks: usize,
    pub max_queue_size: usize,
    pub num_run: u64,
    pub num_errors: usize,
    pub max_errors: usize,
    pub is_up: bool,
    pub accepting_work: bool,
    pub transferring_work: bool,
    pub uptime: Duration,
    /// Время выполнения задач (мс) за всё время
    pub op_times: StatsAccumulator,
    /// Время выполнения задач (мс) в скользящем окне
    pub recent_op_times: StatsAccumulator,
}

impl PoolMetrics {
    pub fn utilization(&self) -> f64 {
        if self.num_workers == 0 {
            return 0.0;
        }
        self.running_tasks as f64 / self.num_workers as f64
    }

    pub fn queue_pressure(&self) -> f64 {
        if self.max_queue_size == 0 {
            return 0.0;
        }
        self.queued_tasks as f64 / self.max_queue_size as f64
    }

    pub fn success_rate(&self) -> f64 {
        if self.num_run == 0 {
            return 1.0;
        }
        let failed = (self.num_errors as u64).min(self.num_run);
        (self.num_run - failed) as f64 / self.num_run as f64
    }

    /// Единиц работы в секунду с момента старта
    pub fn rate(&self) -> f64 {
        let secs = self.uptime.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.num_run as f64 / secs
    }
}

const UNITS: [&str; 5] = ["d", "h", "min", "sec", "ms"];

/// Человекочитаемая длительность.
///
/// `break_apart = true`: `1h 02min 03sec 004ms`, иначе `1:02:03.004 h`.
pub fn time_string(duration: Duration, break_apart: bool) -> String {
    let millis = duration.as_millis() as u64;
    if millis == 0 {
        return if break_apart { "0ms".to_string() } else { "0 ms".to_string() };
    }

    let parts = [
        millis / 86_400_000,
        millis / 3_600_000 % 24,
        millis / 60_000 % 60,
        millis / 1_000 % 60,
        millis % 1_000,
    ];
    let first = parts.iter().position(|v| *v > 0).unwrap_or(UNITS.len() - 1);

    let mut out = String::new();
    for (i, value) in parts.iter().enumerate().skip(first) {
        let piece = match (i == first, i) {
            (true, _) => value.to_string(),
            (false, 4) => format!("{:03}", value),
            (false, _) => format!("{:02}", value),
        };
        if break_apart {
            if i > first {
                out.push(' ');
            }
            out.push_str(&piece);
            out.push_str(UNITS[i]);
        } else {
            if i > first {
                out.push(if i == 4 { '.' } else { ':' });
            }
            out.push_str(&piece);
        }
    }
    if !break_apart {
        out.push(' ');
        out.push_str(UNITS[first]);
    }
    out
}

pub fn rate_string(rate_per_sec: f64) -> String {
    format!("{:.2} units/sec", rate_per_sec)
}
