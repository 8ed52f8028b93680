use std::{
  env, fmt,
  fmt::{Display, Formatter},
  path::PathBuf,
};

/// Environment variable naming the output-path template. Setting it turns
/// on the auto-start policy at init time.
pub const PROFILE_PATH_ENV: &str = "STACKTALLY_PROFILE";

/// Environment variable selecting the toggle signal number (1-64). When
/// set, sampling is started and stopped by that signal instead of
/// auto-starting, writing to sequentially numbered output files.
pub const TOGGLE_SIGNAL_ENV: &str = "STACKTALLY_SIGNAL";

/// Errors from parsing the profiling environment.
///
/// These indicate irrecoverable environment misconfiguration; callers are
/// expected to treat them as fatal at startup.
#[derive(Debug)]
pub enum ConfigError {
  /// The toggle signal is not a number in the range 1-64.
  InvalidSignal(String),
}

impl Display for ConfigError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Self::InvalidSignal(raw) => {
        write!(f, "signal number {raw:?} is invalid (expected 1-64)")
      }
    }
  }
}

impl std::error::Error for ConfigError {}

/// Profiling policy read from the environment.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProfileEnv {
  /// Output-path template; `None` leaves the profiler dormant.
  pub path: Option<PathBuf>,
  /// Toggle signal number, already validated to 1-64.
  pub toggle_signal: Option<i32>,
}

impl ProfileEnv {
  /// Read [`PROFILE_PATH_ENV`] and [`TOGGLE_SIGNAL_ENV`] from the process
  /// environment.
  ///
  /// # Errors
  ///
  /// Returns [`ConfigError::InvalidSignal`] if the toggle signal variable
  /// is set but out of range or unparsable.
  pub fn from_env() -> Result<Self, ConfigError> {
    Self::from_vars(
      env::var(PROFILE_PATH_ENV).ok().as_deref(),
      env::var(TOGGLE_SIGNAL_ENV).ok().as_deref(),
    )
  }

  /// Build the policy from raw variable values.
  ///
  /// # Errors
  ///
  /// Returns [`ConfigError::InvalidSignal`] for a toggle signal outside
  /// 1-64 or one that does not parse as a number.
  pub fn from_vars(
    path: Option<&str>,
    signal: Option<&str>,
  ) -> Result<Self, ConfigError> {
    let path = path.filter(|raw| !raw.is_empty()).map(PathBuf::from);

    let toggle_signal = match signal {
      None => None,
      Some(raw) => match raw.trim().parse::<i32>() {
        Ok(number) if (1..=64).contains(&number) => Some(number),
        _ => return Err(ConfigError::InvalidSignal(raw.to_string())),
      },
    };

    Ok(Self {
      path,
      toggle_signal,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn unset_variables_leave_the_profiler_dormant() {
    let env = ProfileEnv::from_vars(None, None).expect("empty env parses");
    assert_eq!(env, ProfileEnv::default());
  }

  #[test]
  fn path_and_signal_parse_together() {
    let env = ProfileEnv::from_vars(Some("/tmp/prof"), Some("12"))
      .expect("valid env parses");
    assert_eq!(env.path.as_deref(), Some(std::path::Path::new("/tmp/prof")));
    assert_eq!(env.toggle_signal, Some(12));
  }

  #[test]
  fn out_of_range_signal_is_fatal() {
    assert!(ProfileEnv::from_vars(Some("/tmp/prof"), Some("99")).is_err());
    assert!(ProfileEnv::from_vars(Some("/tmp/prof"), Some("0")).is_err());
    assert!(ProfileEnv::from_vars(Some("/tmp/prof"), Some("-3")).is_err());
    assert!(ProfileEnv::from_vars(Some("/tmp/prof"), Some("high")).is_err());
  }

  #[test]
  fn empty_path_counts_as_unset() {
    let env = ProfileEnv::from_vars(Some(""), None).expect("parses");
    assert_eq!(env.path, None);
  }
}
