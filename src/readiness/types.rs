use crate::error::StackError;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeTarget {
    Tcp { host: String, port: u16 },
    Http { url: String },
}

impl fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Self::Http { url } => write!(f, "{url}"),
        }
    }
}

/// Whether a failed check fails the stack or is only reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckPolicy {
    Required,
    Tolerated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheck {
    pub service: String,
    pub target: ProbeTarget,
    pub policy: CheckPolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ready {
    pub target: String,
    pub attempts: u32,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct CheckOutcome {
    pub check: HealthCheck,
    pub result: Result<Ready, StackError>,
}

impl CheckOutcome {
    pub fn is_ready(&self) -> bool {
        self.result.is_ok()
    }
}

/// Outcome of every check run against the stack.
#[derive(Debug, Default)]
pub struct HealthReport {
    pub outcomes: Vec<CheckOutcome>,
}

impl HealthReport {
    /// Healthy when every Required check succeeded; Tolerated failures do not count.
    pub fn is_healthy(&self) -> bool {
        self.required_failures().next().is_none()
    }

    pub fn required_failures(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.check.policy == CheckPolicy::Required && !o.is_ready())
    }

    pub fn tolerated_failures(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.check.policy == CheckPolicy::Tolerated && !o.is_ready())
    }

    /// Consume the report, returning the first Required failure as an error.
    pub fn into_result(self) -> Result<Self, StackError> {
        let position = self
            .outcomes
            .iter()
            .position(|o| o.check.policy == CheckPolicy::Required && !o.is_ready());
        match position {
            None => Ok(self),
            Some(index) => {
                let mut outcomes = self.outcomes;
                match outcomes.swap_remove(index).result {
                    Err(e) => Err(e),
                    Ok(_) => Err(StackError::Process("inconsistent health report".into())),
                }
            }
        }
    }
}
