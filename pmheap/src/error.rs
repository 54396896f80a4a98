use std::fmt;

/// Logs `msg` and aborts the process.
///
/// Used for every violated invariant of the persistent region. Never
/// unwinds.
#[cold]
#[inline(never)]
pub fn fatal(msg: fmt::Arguments<'_>) -> ! {
    log::error!("pmheap fatal: {msg}");
    eprintln!("pmheap fatal: {msg}");
    std::process::abort()
}

#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::error::fatal(format_args!($($arg)*))
    };
}

/// Why a heap could not be brought up over a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupError {
    /// The region carries no initialization marker.
    NotInitialized,
    /// The region was not closed cleanly; run offline recovery first.
    Inconsistent,
    /// A collection was interrupted; run offline recovery and collect.
    MandatoryGc,
    /// The extent source could not supply the initial heap.
    OutOfSpace,
    InvalidSettings(&'static str),
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInitialized => {
                write!(f, "region holds no initialized heap")
            }
            Self::Inconsistent => write!(
                f,
                "region was not closed cleanly, offline recovery required"
            ),
            Self::MandatoryGc => write!(
                f,
                "a collection was interrupted, offline collection required"
            ),
            Self::OutOfSpace => {
                write!(f, "extent source could not supply the initial heap")
            }
            Self::InvalidSettings(reason) => {
                write!(f, "invalid heap settings: {reason}")
            }
        }
    }
}

impl std::error::Error for StartupError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_mentions_recovery() {
        let text = StartupError::Inconsistent.to_string();
        assert!(text.contains("offline recovery"));
        let text = StartupError::InvalidSettings("bad").to_string();
        assert!(text.ends_with("bad"));
    }
}
