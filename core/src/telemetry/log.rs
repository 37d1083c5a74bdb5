use log::info;
use std::sync::Mutex;
use std::time::Instant;

/// Progress logger for one worker. Only the root worker emits messages so a
/// group of workers reports each step once.
pub struct LogManager {
    rank: usize,
    started: Mutex<Instant>,
}

impl LogManager {
    pub fn new() -> Self {
        Self::for_rank(0)
    }

    pub fn for_rank(rank: usize) -> Self {
        Self {
            rank,
            started: Mutex::new(Instant::now()),
        }
    }

    pub fn is_root(&self) -> bool {
        self.rank == 0
    }

    pub fn record(&self, message: &str) {
        if self.is_root() {
            info!("{}", message);
        }
    }

    /// Logs `message` with the time elapsed since the previous report and
    /// restarts the clock.
    pub fn report_clear(&self, message: &str) {
        let elapsed = match self.started.lock() {
            Ok(mut started) => {
                let elapsed = started.elapsed();
                *started = Instant::now();
                elapsed.as_secs_f64()
            }
            Err(_) => 0.0,
        };
        self.record(&format!("{}: {:.2} s", message, elapsed));
    }
}

impl Default for LogManager {
    fn default() -> Self {
        Self::new()
    }
}
