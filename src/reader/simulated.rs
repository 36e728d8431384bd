use async_trait::async_trait;
use chrono::Utc;
use rand::{rngs::StdRng, Rng, SeedableRng};

use super::{ConnectionConfig, SessionError, SessionState, TagSource};

const DEFAULT_POPULATION: usize = 24;
const MAX_TAGS_PER_POLL: usize = 6;

/// In-process stand-in for a reader.
///
/// Draws from a fixed population of EPCs so repeated polls produce duplicates,
/// and scatters positions around a home coordinate.
pub struct SimulatedReader {
    rng: StdRng,
    population: Vec<String>,
    home: (f64, f64),
    state: SessionState,
}

impl SimulatedReader {
    pub fn new(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let population = (0..DEFAULT_POPULATION)
            .map(|_| format!("E200{:020X}", rng.gen::<u64>()))
            .collect();

        Self {
            rng,
            population,
            home: (36.9685, -86.4708),
            state: SessionState::Closed,
        }
    }

    pub fn with_home(mut self, latitude: f64, longitude: f64) -> Self {
        self.home = (latitude, longitude);
        self
    }

    fn render_tag_list(&mut self) -> String {
        let count = self.rng.gen_range(0..=MAX_TAGS_PER_POLL);
        if count == 0 {
            return "(No Tags)".to_string();
        }

        let now = Utc::now().format("%Y/%m/%d %H:%M:%S%.3f");
        (0..count)
            .map(|_| {
                let epc = &self.population[self.rng.gen_range(0..self.population.len())];
                let longitude = self.home.1 + self.rng.gen_range(-0.001..0.001);
                let latitude = self.home.0 + self.rng.gen_range(-0.001..0.001);
                format!("{epc},{now},{longitude:.6},{latitude:.6}")
            })
            .collect::<Vec<_>>()
            .join("\r\n")
    }
}

#[async_trait]
impl TagSource for SimulatedReader {
    fn state(&self) -> SessionState {
        self.state
    }

    async fn open(&mut self) -> Result<(), SessionError> {
        self.state = SessionState::Open;
        Ok(())
    }

    async fn poll(&mut self) -> Result<String, SessionError> {
        if self.state != SessionState::Open {
            return Err(SessionError::NotOpen(self.state));
        }
        Ok(self.render_tag_list())
    }

    async fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    fn reconfigure(&mut self, _config: ConnectionConfig) -> anyhow::Result<()> {
        Ok(())
    }
}
