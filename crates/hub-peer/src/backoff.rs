use std::time::Duration;

/// Deterministic exponential backoff: `initial`, `initial * factor`, ... capped at `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    current: Duration,
    attempts: u32,
}

impl ExponentialBackoff {
    /// Creates a new `ExponentialBackoff` with the given parameters.
    ///
    /// # Examples
    ///
    /// ```
    /// use hub_peer::backoff::ExponentialBackoff;
    /// use std::time::Duration;
    /// let mut backoff = ExponentialBackoff::new(
    ///     Duration::from_secs(1),
    ///     Duration::from_secs(30),
    ///     2.0,
    /// );
    /// assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    /// assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    /// assert_eq!(backoff.next_delay(), Duration::from_secs(4));
    /// ```
    #[must_use]
    pub const fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        Self {
            initial,
            max,
            factor,
            current: initial,
            attempts: 0,
        }
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    /// Return the delay for this attempt and advance the internal state.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.max);

        let current_ms = delay.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let next_ms = (current_ms as f64 * self.factor).min(max_ms as f64) as u64;
        self.current = Duration::from_millis(next_ms);
        self.attempts = self.attempts.saturating_add(1);

        delay
    }

    /// Reset the backoff to its initial delay.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }

    /// Number of delays handed out since the last reset.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }
}
