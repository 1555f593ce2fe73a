use crate::{
    config::PlaybackConfig,
    settings::{key, Persist, SettingsStore},
};

/// Playback clock for a time-varying sequence.
#[derive(Clone, Debug, PartialEq)]
pub struct Playback {
    pub time: f32,
    pub speed: f32,
    pub repeat: bool,
    pub paused: bool,
}

impl Default for Playback {
    fn default() -> Self {
        Self::from_config(&PlaybackConfig::default())
    }
}

impl Playback {
    pub fn from_config(config: &PlaybackConfig) -> Self {
        Self {
            time: 0.0,
            speed: config.speed,
            repeat: config.repeat,
            paused: config.paused,
        }
    }

    /// Advances by `elapsed * speed`. Past the end the clock wraps to 0 when
    /// repeating and stops at the end otherwise.
    pub fn advance(&mut self, elapsed: f32, sequence_length: f32) -> f32 {
        if self.paused || sequence_length <= 0.0 {
            return self.time;
        }
        let next = self.time + elapsed * self.speed;
        self.time = if !next.is_finite() {
            self.time
        } else if next >= sequence_length {
            if self.repeat {
                0.0
            } else {
                sequence_length
            }
        } else {
            next.max(0.0)
        };
        self.time
    }

    pub fn seek(&mut self, time: f32, sequence_length: f32) {
        if time.is_finite() {
            self.time = time.clamp(0.0, sequence_length.max(0.0));
        }
    }
}

impl Persist for Playback {
    fn save_settings(&self, store: &mut SettingsStore, prefix: &str) {
        store.write(key(prefix, "time"), &self.time);
        store.write(key(prefix, "speed"), &self.speed);
        store.write(key(prefix, "repeat"), &self.repeat);
        store.write(key(prefix, "paused"), &self.paused);
    }

    fn load_settings(&mut self, store: &SettingsStore, prefix: &str) {
        store.read(&key(prefix, "time"), &mut self.time);
        store.read(&key(prefix, "speed"), &mut self.speed);
        store.read(&key(prefix, "repeat"), &mut self.repeat);
        store.read(&key(prefix, "paused"), &mut self.paused);
    }
}
