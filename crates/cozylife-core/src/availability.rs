#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Availability {
    consecutive_failures: u32,
    threshold: u32,
}

impl Availability {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive_failures: 0,
            threshold: threshold.max(1),
        }
    }

    pub fn is_available(&self) -> bool {
        self.consecutive_failures < self.threshold
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    // True on recovery.
    pub fn record_success(&mut self) -> bool {
        let was_available = self.is_available();
        self.consecutive_failures = 0;
        !was_available
    }

    pub fn record_failure(&mut self) -> bool {
        let was_available = self.is_available();
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        was_available && !self.is_available()
    }
}
