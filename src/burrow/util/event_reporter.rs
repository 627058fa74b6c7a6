use std::sync::Mutex;
use std::time::{Duration, Instant};

struct State {
    last_report: Option<Instant>,
    pending: u64,
    total: u64,
}

/// Rate-limited log sink. The first event after an idle period logs
/// immediately; events inside the window are coalesced and reported with a
/// count at the next raise outside it.
pub struct EventReporter {
    name: &'static str,
    period: Duration,
    state: Mutex<State>,
}

impl EventReporter {
    pub fn new(name: &'static str, period: Duration) -> Self {
        Self {
            name,
            period,
            state: Mutex::new(State {
                last_report: None,
                pending: 0,
                total: 0,
            }),
        }
    }

    pub fn total(&self) -> u64 {
        self.state.lock().unwrap().total
    }

    pub fn raise(&self, message: &str) {
        let mut st = self.state.lock().unwrap();
        st.total += 1;
        match st.last_report {
            Some(at) if at.elapsed() < self.period => {
                st.pending += 1;
            }
            _ => {
                let coalesced = st.pending;
                st.pending = 0;
                st.last_report = Some(Instant::now());
                let total = st.total;
                drop(st);
                if coalesced > 0 {
                    tracing::info!(
                        event = self.name,
                        coalesced,
                        total,
                        "{message}"
                    );
                } else {
                    tracing::info!(event = self.name, total, "{message}");
                }
            }
        }
    }
}
