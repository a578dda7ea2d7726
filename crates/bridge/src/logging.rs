//! Logging Setup

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use crate::BridgeError;

/// Install the global tracing subscriber
///
/// Call once at startup, before the real-time thread starts.
pub fn init_logging(level: &str, json: bool) -> Result<(), BridgeError> {
    let level = Level::from_str(level)
        .map_err(|_| BridgeError::InvalidConfig(format!("unknown log level {level:?}")))?;

    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_names(true);

    let result = if json {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };

    result.map_err(|e| BridgeError::Logging(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_level_rejected() {
        assert!(matches!(
            init_logging("loud", false),
            Err(BridgeError::InvalidConfig(_))
        ));
    }
}
