use serde::{ Deserialize, Serialize };
use std::fmt;
use std::str::FromStr;

/// How the browser shim loads the widget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    Sdk,
    Iframe,
}

impl TransportMode {
    pub fn other(self) -> Self {
        match self {
            TransportMode::Sdk => TransportMode::Iframe,
            TransportMode::Iframe => TransportMode::Sdk,
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportMode::Sdk => write!(f, "sdk"),
            TransportMode::Iframe => write!(f, "iframe"),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseTransportModeError {
    message: String,
}

impl fmt::Display for ParseTransportModeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParseTransportModeError {}

impl FromStr for TransportMode {
    type Err = ParseTransportModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sdk" | "script" => Ok(TransportMode::Sdk),
            "iframe" => Ok(TransportMode::Iframe),
            _ =>
                Err(ParseTransportModeError {
                    message: format!("Invalid transport mode: '{}'", s),
                }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportDecision {
    SwitchTo(TransportMode),
    GiveUp,
}

/// Primary → fallback selector. A failure in fallback gives up; nothing here
/// ever moves back to the primary on its own, only `reset` does.
#[derive(Debug, Clone)]
pub struct TransportSelector {
    preferred: TransportMode,
    on_fallback: bool,
    exhausted: bool,
}

impl TransportSelector {
    pub fn new(preferred: TransportMode) -> Self {
        Self { preferred, on_fallback: false, exhausted: false }
    }

    pub fn current(&self) -> TransportMode {
        if self.on_fallback { self.preferred.other() } else { self.preferred }
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn report_failure(&mut self) -> TransportDecision {
        if self.on_fallback {
            self.exhausted = true;
            TransportDecision::GiveUp
        } else {
            self.on_fallback = true;
            TransportDecision::SwitchTo(self.current())
        }
    }

    pub fn reset(&mut self) -> TransportMode {
        self.on_fallback = false;
        self.exhausted = false;
        self.preferred
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_once_then_gives_up() {
        let mut selector = TransportSelector::new(TransportMode::Sdk);
        assert_eq!(selector.current(), TransportMode::Sdk);
        assert_eq!(selector.report_failure(), TransportDecision::SwitchTo(TransportMode::Iframe));
        assert_eq!(selector.current(), TransportMode::Iframe);
        assert_eq!(selector.report_failure(), TransportDecision::GiveUp);
        assert!(selector.is_exhausted());
        assert_eq!(selector.report_failure(), TransportDecision::GiveUp);
        assert_eq!(selector.current(), TransportMode::Iframe);
    }

    #[test]
    fn only_reset_returns_to_primary() {
        let mut selector = TransportSelector::new(TransportMode::Iframe);
        selector.report_failure();
        assert_eq!(selector.current(), TransportMode::Sdk);
        assert_eq!(selector.reset(), TransportMode::Iframe);
        assert_eq!(selector.current(), TransportMode::Iframe);
        assert!(!selector.is_exhausted());
    }

    #[test]
    fn parses_modes() {
        assert_eq!("SDK".parse::<TransportMode>().unwrap(), TransportMode::Sdk);
        assert_eq!("iframe".parse::<TransportMode>().unwrap(), TransportMode::Iframe);
        assert!("carrier-pigeon".parse::<TransportMode>().is_err());
    }
}
