//! Animated changes between paint values

use crate::style::function::{PropertyType, PropertyValue};
use crate::tile::data::Properties;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};

/// How long a property change animates, and after what delay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransitionOptions {
    pub duration: Option<Duration>,
    pub delay: Option<Duration>,
}

impl TransitionOptions {
    pub fn new(duration: Duration, delay: Duration) -> Self {
        Self {
            duration: Some(duration),
            delay: Some(delay),
        }
    }

    pub fn is_defined(&self) -> bool {
        self.duration.is_some() || self.delay.is_some()
    }

    /// Parses `{"duration": ms, "delay": ms}`
    pub fn parse(value: &Value) -> Result<Self, String> {
        let object = value
            .as_object()
            .ok_or_else(|| format!("transition must be an object, got {}", value))?;
        let millis = |name: &str| -> Result<Option<Duration>, String> {
            match object.get(name) {
                None => Ok(None),
                Some(v) => v
                    .as_u64()
                    .map(|ms| Some(Duration::from_millis(ms)))
                    .ok_or_else(|| format!("transition {} must be a non-negative integer", name)),
            }
        };
        Ok(Self {
            duration: millis("duration")?,
            delay: millis("delay")?,
        })
    }

    /// Per-property options fall back to the style-wide ones
    pub fn reverse_merge(&self, defaults: &TransitionOptions) -> TransitionOptions {
        TransitionOptions {
            duration: self.duration.or(defaults.duration),
            delay: self.delay.or(defaults.delay),
        }
    }
}

/// What a paint evaluation depends on besides the feature
#[derive(Debug, Clone, Copy)]
pub struct PropertyEvaluationParameters {
    pub zoom: f64,
    pub now: Instant,
}

impl PropertyEvaluationParameters {
    pub fn new(zoom: f64, now: Instant) -> Self {
        Self { zoom, now }
    }
}

/// A property value together with the value it is transitioning away from
#[derive(Debug, Clone, PartialEq)]
pub struct Transitioning<T> {
    value: PropertyValue<T>,
    prior: Option<Box<Transitioning<T>>>,
    begin: Instant,
    end: Instant,
}

impl<T: PropertyType> Transitioning<T> {
    /// A value with nothing to animate from
    pub fn settled(value: PropertyValue<T>, now: Instant) -> Self {
        Self {
            value,
            prior: None,
            begin: now,
            end: now,
        }
    }

    /// Starts a transition from `prior` to `value` at `now`. Without any
    /// transition options the prior value is discarded and the change is
    /// immediate; data-driven targets also snap.
    pub fn new(
        value: PropertyValue<T>,
        prior: Transitioning<T>,
        options: TransitionOptions,
        now: Instant,
    ) -> Self {
        let begin = now + options.delay.unwrap_or(Duration::ZERO);
        let end = begin + options.duration.unwrap_or(Duration::ZERO);
        let keep_prior = options.is_defined() && !value.is_data_driven();
        Self {
            value,
            prior: keep_prior.then(|| Box::new(prior)),
            begin,
            end,
        }
    }

    pub fn value(&self) -> &PropertyValue<T> {
        &self.value
    }

    /// Whether the value is still animating at `now`
    pub fn has_transition(&self, now: Instant) -> bool {
        self.prior.is_some() && now < self.end
    }

    pub fn evaluate(
        &self,
        params: &PropertyEvaluationParameters,
        properties: Option<&Properties>,
        fallback: &T,
    ) -> T {
        let final_value = self.value.evaluate(params.zoom, properties, fallback);
        let Some(prior) = &self.prior else {
            return final_value;
        };
        if params.now >= self.end {
            final_value
        } else if params.now < self.begin {
            prior.evaluate(params, properties, fallback)
        } else {
            let span = (self.end - self.begin).as_secs_f64();
            let t = (params.now - self.begin).as_secs_f64() / span;
            prior
                .evaluate(params, properties, fallback)
                .lerp(&final_value, t)
        }
    }

    /// Drops finished priors so chains of past transitions do not pile up
    pub fn prune(&mut self, now: Instant) {
        if now >= self.end {
            self.prior = None;
        } else if let Some(prior) = &mut self.prior {
            prior.prune(now);
        }
    }
}
