pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("`rate` must be a positive, finite number of messages per second")]
    InvalidRate,

    #[error("`rate` is too low: each worker would wait more than one day between messages")]
    RateTooLow,

    #[error("`workers` must be a positive integer")]
    InvalidWorkers,

    #[error("worker index {index} is out of range for {count} workers")]
    WorkerIndexOutOfRange { index: u64, count: u64 },

    #[error("`duration` must be a positive duration")]
    InvalidDuration,

    #[error("`jitter` must be a fraction in [0, 1)")]
    InvalidJitter,

    #[error("`grace_period` must be a positive duration")]
    InvalidGracePeriod,

    #[error("`progress_interval` must be a positive duration")]
    InvalidProgressInterval,

    #[error("`max_transient_errors` must be a positive integer")]
    InvalidMaxTransientErrors,

    #[error("`burn_in` plus `duration` plus `grace_period` must not exceed 365 days")]
    RunTooLong,

    #[error("failed to construct task for worker {worker_id}: {message}")]
    TaskConstruction { worker_id: u64, message: String },

    #[error("report sink error: {0}")]
    Sink(String),

}

impl Error {
    /// True for errors raised while validating options, before any worker exists.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidRate
                | Self::RateTooLow
                | Self::InvalidWorkers
                | Self::WorkerIndexOutOfRange { .. }
                | Self::InvalidDuration
                | Self::InvalidJitter
                | Self::InvalidGracePeriod
                | Self::InvalidProgressInterval
                | Self::InvalidMaxTransientErrors
                | Self::RunTooLong
        )
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            _ if self.is_configuration() => ErrorClass::Configuration,
            Self::TaskConstruction { .. } => ErrorClass::TaskConstruction,
            _ => ErrorClass::Runtime,
        }
    }
}

/// Reason classes as they appear in reports and logs.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorClass {
    Configuration,
    TaskConstruction,
    Transient,
    RepeatedTransient,
    Fatal,
    Panicked,
    Runtime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_are_classified() {
        assert!(Error::InvalidRate.is_configuration());
        assert!(Error::InvalidJitter.is_configuration());
        assert!(Error::RateTooLow.is_configuration());
        assert!(Error::RunTooLong.is_configuration());
        assert_eq!(Error::InvalidWorkers.class(), ErrorClass::Configuration);

        let err = Error::TaskConstruction {
            worker_id: 3,
            message: "boom".to_string(),
        };
        assert!(!err.is_configuration());
        assert_eq!(err.class(), ErrorClass::TaskConstruction);
        assert_eq!(
            err.to_string(),
            "failed to construct task for worker 3: boom"
        );
        assert_eq!(Error::Sink("x".to_string()).class(), ErrorClass::Runtime);
    }

    #[test]
    fn error_class_names_are_snake_case() {
        assert_eq!(ErrorClass::RepeatedTransient.to_string(), "repeated_transient");
        assert_eq!("panicked".parse::<ErrorClass>().ok(), Some(ErrorClass::Panicked));
    }
}
