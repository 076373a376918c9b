//! Keyboard trigger backend.
//!
//! Covers scanner interfaces that emulate a USB keyboard and type the sync
//! key on every volume, as well as manual triggering during piloting. The
//! abort key is queried together with the sync keys so a single buffered
//! query cannot swallow it.

use crate::clock::SharedClock;
use crate::config::parse_settings;
use crate::error::{TriggerError, TriggerResult};
use crate::input::SharedKeySource;
use crate::registry::{BackendContext, BackendRegistry};
use crate::trigger::TriggerBackend;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

/// Registry identifier.
pub const PORT_TYPE: &str = "keyboard";

/// Settings of the keyboard backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyboardTriggerConfig {
    /// Keys that count as a trigger; a single string is accepted too.
    #[serde(
        default = "default_keys",
        alias = "keyList",
        alias = "key_list",
        deserialize_with = "one_or_many"
    )]
    pub keys: Vec<String>,
}

fn default_keys() -> Vec<String> {
    vec!["5".to_string()]
}

impl Default for KeyboardTriggerConfig {
    fn default() -> Self {
        Self {
            keys: default_keys(),
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(key) => vec![key],
        OneOrMany::Many(keys) => keys,
    })
}

/// Backend reporting presses of the sync keys.
pub struct KeyboardTrigger {
    keys: Vec<String>,
    esc_key: String,
    query: Vec<String>,
    key_source: SharedKeySource,
    session_clock: SharedClock,
    abort_pending: bool,
}

impl KeyboardTrigger {
    /// Creates the backend. The abort key never counts as a trigger, even if
    /// listed in `config.keys`.
    pub fn new(
        config: KeyboardTriggerConfig,
        esc_key: &str,
        key_source: SharedKeySource,
        session_clock: SharedClock,
    ) -> TriggerResult<Self> {
        let keys: Vec<String> = config
            .keys
            .into_iter()
            .filter(|key| key != esc_key)
            .collect();
        if keys.is_empty() {
            return Err(TriggerError::Configuration(
                "keyboard trigger needs at least one key besides the abort key".to_string(),
            ));
        }
        let mut query = keys.clone();
        query.push(esc_key.to_string());
        Ok(Self {
            keys,
            esc_key: esc_key.to_string(),
            query,
            key_source,
            session_clock,
            abort_pending: false,
        })
    }

    /// Builds the backend from a factory context.
    pub fn from_context(ctx: BackendContext<'_>) -> TriggerResult<Self> {
        Self::new(
            parse_settings(ctx.config)?,
            &ctx.settings.esc_key,
            ctx.keys,
            ctx.session_clock,
        )
    }

    /// Keys that count as a trigger.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

impl TriggerBackend for KeyboardTrigger {
    fn port_type(&self) -> &'static str {
        PORT_TYPE
    }

    fn describe(&self) -> String {
        format!("keys {:?}", self.keys)
    }

    fn settings(&self) -> serde_json::Value {
        json!({ "keys": self.keys, "esc_key": self.esc_key })
    }

    fn open(&mut self) -> TriggerResult<()> {
        Ok(())
    }

    fn close(&mut self) -> TriggerResult<()> {
        Ok(())
    }

    fn poll_edge(&mut self) -> TriggerResult<bool> {
        let presses = self
            .key_source
            .pressed_since(&self.query, self.session_clock.as_ref());
        let mut edge = false;
        for press in presses {
            if press.key == self.esc_key {
                self.abort_pending = true;
            } else {
                debug!("Key '{}' at {:.6}s", press.key, press.time.as_secs_f64());
                edge = true;
            }
        }
        Ok(edge)
    }

    fn take_abort(&mut self) -> bool {
        std::mem::take(&mut self.abort_pending)
    }
}

/// Adds the keyboard backend to `registry`.
pub fn register(registry: &mut BackendRegistry) {
    registry.register(PORT_TYPE, |ctx| {
        Ok(Box::new(KeyboardTrigger::from_context(ctx)?) as Box<dyn TriggerBackend>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;
    use crate::input::KeyQueue;
    use std::sync::Arc;

    fn keyboard(keys: &[&str]) -> (KeyboardTrigger, Arc<KeyQueue>) {
        let queue = KeyQueue::shared();
        let config = KeyboardTriggerConfig {
            keys: keys.iter().map(|k| k.to_string()).collect(),
        };
        let trigger =
            KeyboardTrigger::new(config, "escape", queue.clone(), MonotonicClock::shared())
                .expect("keyboard");
        (trigger, queue)
    }

    #[test]
    fn test_key_list_forms() {
        let config: KeyboardTriggerConfig =
            parse_settings(&toml::from_str::<toml::Value>("keys = 't'").expect("toml"))
                .expect("parse");
        assert_eq!(config.keys, vec!["t"]);
        let config: KeyboardTriggerConfig =
            parse_settings(&toml::from_str::<toml::Value>("keyList = ['5', 't']").expect("toml"))
                .expect("parse");
        assert_eq!(config.keys, vec!["5", "t"]);
        let config: KeyboardTriggerConfig =
            parse_settings(&toml::Value::Table(toml::Table::new())).expect("parse");
        assert_eq!(config.keys, vec!["5"]);
    }

    #[test]
    fn test_only_sync_keys_are_edges() {
        let (mut trigger, queue) = keyboard(&["5", "t"]);
        assert!(!trigger.poll_edge().expect("poll"));
        queue.push("a");
        assert!(!trigger.poll_edge().expect("poll"));
        queue.push("t");
        assert!(trigger.poll_edge().expect("poll"));
        assert!(!trigger.poll_edge().expect("poll"));
        // unrelated keys stay buffered for the application
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_escape_is_reported_once() {
        let (mut trigger, queue) = keyboard(&["5"]);
        queue.push("escape");
        assert!(!trigger.poll_edge().expect("poll"));
        assert!(trigger.take_abort());
        assert!(!trigger.take_abort());
    }

    #[test]
    fn test_escape_never_counts_as_edge() {
        let (mut trigger, queue) = keyboard(&["5", "escape"]);
        assert_eq!(trigger.keys().to_vec(), vec!["5"]);
        queue.push("escape");
        assert!(!trigger.poll_edge().expect("poll"));
        assert!(trigger.take_abort());
    }

    #[test]
    fn test_only_escape_is_rejected() {
        let result = KeyboardTrigger::new(
            KeyboardTriggerConfig {
                keys: vec!["escape".to_string()],
            },
            "escape",
            KeyQueue::shared(),
            MonotonicClock::shared(),
        );
        assert!(matches!(result, Err(TriggerError::Configuration(_))));
    }
}
