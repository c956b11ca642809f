//! Operator actions typed at the console.

use super::reconciler::{CommandSink, HostReconciler};
use crate::config::{parse_flag, ConfigError, LogVerbosity};
use crate::session::PortTarget;

#[derive(Debug, Clone, PartialEq)]
pub enum OperatorAction {
    Resume,
    Floor(u16),
    Threshold(u16),
    UpperThreshold(u16),
    Reverse(bool),
    Override(bool),
    Factor(f64),
    Verbosity(LogVerbosity),
    /// Switch port; `None` disconnects
    Port(Option<String>),
    Status,
    History,
    Quit,
}

impl std::str::FromStr for OperatorAction {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_whitespace();
        let verb = words.next().unwrap_or_default().to_lowercase();
        let arg = words.next();

        let required = |key: &str| {
            arg.ok_or_else(|| ConfigError::InvalidValue {
                key: key.to_string(),
                message: "missing value".to_string(),
            })
        };
        let number = |key: &str| -> Result<u16, ConfigError> {
            let raw = required(key)?;
            raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{raw}' is not a number"),
            })
        };

        match verb.as_str() {
            "resume" | "r" => Ok(OperatorAction::Resume),
            "floor" => Ok(OperatorAction::Floor(number("floor")?)),
            "thr" | "threshold" => Ok(OperatorAction::Threshold(number("threshold")?)),
            "upper" => Ok(OperatorAction::UpperThreshold(number("upper")?)),
            "reverse" => Ok(OperatorAction::Reverse(parse_flag("reverse", required("reverse")?)?)),
            "override" => Ok(OperatorAction::Override(parse_flag(
                "override",
                required("override")?,
            )?)),
            "factor" => {
                let raw = required("factor")?;
                raw.parse()
                    .map(OperatorAction::Factor)
                    .map_err(|_| ConfigError::InvalidValue {
                        key: "factor".to_string(),
                        message: format!("'{raw}' is not a number"),
                    })
            }
            "verbosity" => Ok(OperatorAction::Verbosity(required("verbosity")?.parse()?)),
            "port" => Ok(OperatorAction::Port(
                arg.filter(|p| !matches!(*p, "none" | "-")).map(str::to_string),
            )),
            "status" | "s" => Ok(OperatorAction::Status),
            "history" | "h" => Ok(OperatorAction::History),
            "quit" | "exit" | "q" => Ok(OperatorAction::Quit),
            other => Err(ConfigError::UnknownKey(other.to_string())),
        }
    }
}

impl OperatorAction {
    /// Apply an action that changes device or host state.
    ///
    /// `Status`, `History` and `Quit` are left to the caller.
    pub fn apply<S: CommandSink>(&self, host: &mut HostReconciler<S>) -> Result<(), ConfigError> {
        let mut device = host.config().device();
        let factor = host.config().factor;

        match self {
            OperatorAction::Resume => return host.resume().map_err(ConfigError::from),
            OperatorAction::Floor(v) => device.floor_value = *v,
            OperatorAction::Threshold(v) => device.card_threshold = *v,
            OperatorAction::UpperThreshold(v) => device.card_upper_threshold = *v,
            OperatorAction::Reverse(on) => device.reverse_sensor = *on,
            OperatorAction::Override(on) => device.system_override = *on,
            OperatorAction::Factor(f) => return host.save_config(device, *f),
            OperatorAction::Verbosity(v) => return host.set_verbosity(*v),
            OperatorAction::Port(path) => {
                let baud_rate = host.config().baud_rate;
                let target = path.as_ref().map(|p| PortTarget::new(p.as_str(), baud_rate));
                return host.set_target(target);
            }
            OperatorAction::Status | OperatorAction::History | OperatorAction::Quit => {
                return Ok(())
            }
        }
        host.save_config(device, factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_actions() {
        assert_eq!("resume".parse::<OperatorAction>().unwrap(), OperatorAction::Resume);
        assert_eq!(
            "thr 200".parse::<OperatorAction>().unwrap(),
            OperatorAction::Threshold(200)
        );
        assert_eq!(
            "reverse on".parse::<OperatorAction>().unwrap(),
            OperatorAction::Reverse(true)
        );
        assert_eq!(
            "port /dev/ttyACM0".parse::<OperatorAction>().unwrap(),
            OperatorAction::Port(Some("/dev/ttyACM0".to_string()))
        );
        assert_eq!("port".parse::<OperatorAction>().unwrap(), OperatorAction::Port(None));
        assert_eq!(
            "verbosity info".parse::<OperatorAction>().unwrap(),
            OperatorAction::Verbosity(LogVerbosity::Info)
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!("floor".parse::<OperatorAction>().is_err());
        assert!("floor abc".parse::<OperatorAction>().is_err());
        assert!("override maybe".parse::<OperatorAction>().is_err());
        assert!(matches!(
            "launch".parse::<OperatorAction>(),
            Err(ConfigError::UnknownKey(_))
        ));
    }
}
