use super::{EnvFactory, Environment, Observation, StepOutcome};
use crate::config::EnvConfig;
use anyhow::{anyhow, Result};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// noop, up, down, left, right
pub const PIXEL_CHASE_ACTIONS: usize = 5;

const AGENT_PIXEL: f64 = 1.0;
const TARGET_PIXEL: f64 = 0.5;
const TARGET_MOVE_CHANCE: f64 = 0.25;

/// Grid game: steer the agent pixel onto the target pixel. Each catch scores
/// one point and respawns the target somewhere else.
#[derive(Clone, Debug)]
pub struct PixelChase {
    width: usize,
    height: usize,
    max_ticks: usize,
    max_catches: usize,
    rng: ChaCha8Rng,
    agent: (usize, usize),
    target: (usize, usize),
    tick: usize,
    catches: usize,
    reset_obs: Option<Observation>,
}

impl PixelChase {
    pub fn new(cfg: &EnvConfig) -> Self {
        Self {
            width: cfg.width,
            height: cfg.height,
            max_ticks: cfg.max_ticks,
            max_catches: cfg.max_catches,
            rng: ChaCha8Rng::seed_from_u64(cfg.seed),
            agent: (cfg.width / 2, cfg.height / 2),
            target: (0, 0),
            tick: 0,
            catches: 0,
            reset_obs: None,
        }
    }

    pub fn catches(&self) -> usize {
        self.catches
    }

    fn frame(&self) -> Observation {
        let mut frame = vec![0.0; self.width * self.height];
        frame[self.target.1 * self.width + self.target.0] = TARGET_PIXEL;
        frame[self.agent.1 * self.width + self.agent.0] = AGENT_PIXEL;
        frame
    }

    fn respawn_target(&mut self) {
        if self.width * self.height < 2 {
            self.target = self.agent;
            return;
        }
        loop {
            let cell = (
                self.rng.gen_range(0..self.width),
                self.rng.gen_range(0..self.height),
            );
            if cell != self.agent {
                self.target = cell;
                return;
            }
        }
    }

    fn shifted(&self, pos: (usize, usize), action: usize) -> (usize, usize) {
        let (x, y) = pos;
        match action {
            1 => (x, y.saturating_sub(1)),
            2 => (x, (y + 1).min(self.height - 1)),
            3 => (x.saturating_sub(1), y),
            4 => ((x + 1).min(self.width - 1), y),
            _ => (x, y),
        }
    }

    fn finished(&self) -> bool {
        self.tick >= self.max_ticks || self.catches >= self.max_catches
    }
}

impl Environment for PixelChase {
    fn reset(&mut self) -> Result<Observation> {
        self.agent = (self.width / 2, self.height / 2);
        self.tick = 0;
        self.catches = 0;
        self.respawn_target();
        let obs = self.frame();
        self.reset_obs = Some(obs.clone());
        Ok(obs)
    }

    fn reset_observation(&self) -> Option<&Observation> {
        self.reset_obs.as_ref()
    }

    fn execute(&mut self, action: usize, repeat_ticks: usize) -> Result<StepOutcome> {
        if action >= PIXEL_CHASE_ACTIONS {
            return Err(anyhow!(
                "action {action} out of range (pixel-chase has {PIXEL_CHASE_ACTIONS})"
            ));
        }
        if self.reset_obs.is_none() {
            return Err(anyhow!("pixel-chase stepped before reset"));
        }

        let mut outcome = StepOutcome::default();
        for _ in 0..repeat_ticks {
            if self.finished() {
                break;
            }
            self.agent = self.shifted(self.agent, action);
            if self.rng.gen::<f64>() < TARGET_MOVE_CHANCE {
                let drift = self.rng.gen_range(1..PIXEL_CHASE_ACTIONS);
                self.target = self.shifted(self.target, drift);
            }
            if self.agent == self.target {
                outcome.reward += 1.0;
                self.catches += 1;
                self.respawn_target();
            }
            self.tick += 1;
            outcome.observations.push(self.frame());
        }

        if outcome.observations.is_empty() {
            outcome.observations.push(self.frame());
        }
        outcome.done = self.finished();
        outcome.info.insert("tick".to_string(), self.tick as f64);
        outcome.info.insert("catches".to_string(), self.catches as f64);
        Ok(outcome)
    }

    fn render(&self) {
        let mut out = String::with_capacity((self.width + 1) * self.height);
        for y in 0..self.height {
            for x in 0..self.width {
                out.push(if (x, y) == self.agent {
                    '@'
                } else if (x, y) == self.target {
                    '*'
                } else {
                    '.'
                });
            }
            out.push('\n');
        }
        eprintln!("tick={} catches={}\n{out}", self.tick, self.catches);
    }

    fn action_count(&self) -> usize {
        PIXEL_CHASE_ACTIONS
    }

    fn observation_len(&self) -> usize {
        self.width * self.height
    }
}

/// Every population index gets a fresh game with the same seed, so all
/// individuals in a generation face the same target sequence.
#[derive(Clone, Debug)]
pub struct PixelChaseFactory {
    pub cfg: EnvConfig,
}

impl EnvFactory for PixelChaseFactory {
    fn make(&self, _index: usize) -> Result<Box<dyn Environment>> {
        Ok(Box::new(PixelChase::new(&self.cfg)))
    }
}
